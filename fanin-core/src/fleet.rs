//! Starts `parallelism` workers over one endpoint list, all feeding a single downstream channel.

use fanin_queue::Connector;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Error;
use crate::Result;
use crate::spout::SpoutBuilder;
use crate::worker::{self, Delivery};

/// Capacity of the channel every worker of a fleet delivers into.
pub const DOWNSTREAM_CHANNEL_CAPACITY: usize = 1024;

/// Running workers of a fleet.
pub struct FleetHandle {
    workers: Vec<JoinHandle<Result<()>>>,
    cancel: CancellationToken,
}

impl FleetHandle {
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Asks every worker to stop after its current tick.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Waits for every worker to stop. Returns the first worker error, after all of them have
    /// been joined.
    pub async fn join(self) -> Result<()> {
        let mut first_error = None;
        for (index, handle) in self.workers.into_iter().enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::Worker(format!("worker {index} panicked: {e}"))),
            };
            if let Err(e) = result {
                error!(worker = index, ?e, "Spout worker failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Opens one spout per configured worker and spawns a driver for each. Fails without starting
/// anything if any worker cannot be opened.
pub fn start<C>(
    builder: SpoutBuilder<C>,
    cancel: CancellationToken,
) -> Result<(mpsc::Receiver<Delivery>, FleetHandle)>
where
    C: Connector + Clone + Send + Sync + 'static,
    C::Client: Send + 'static,
{
    let config = builder.config().clone();
    config.validate()?;
    let worker_count = config.parallelism;

    let spouts = (0..worker_count)
        .map(|index| builder.clone().worker(index, worker_count).open())
        .collect::<Result<Vec<_>>>()?;

    let (downstream, deliveries) = mpsc::channel(DOWNSTREAM_CHANNEL_CAPACITY);
    let workers = spouts
        .into_iter()
        .map(|spout| {
            worker::spawn(
                spout,
                downstream.clone(),
                config.idle_wait(),
                cancel.clone(),
            )
        })
        .collect();
    info!(
        workers = worker_count,
        queue = config.queue_name,
        "Started spout fleet"
    );

    Ok((deliveries, FleetHandle { workers, cancel }))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use fanin_queue::Endpoint;
    use fanin_queue::memory::MemoryBroker;

    use super::*;
    use crate::config::SpoutConfig;
    use crate::deserialize::StringDeserializer;

    const Q: &str = "fleet-q";

    fn seeded(servers: u16, items_per_server: usize) -> (MemoryBroker, Vec<Endpoint>) {
        let broker = MemoryBroker::new();
        let endpoints: Vec<Endpoint> = (0..servers)
            .map(|i| Endpoint::new(format!("fleet-{i}"), 2229))
            .collect();
        for ep in &endpoints {
            broker.add_server(ep);
            for i in 0..items_per_server {
                broker.push(ep, Q, format!("{ep}/{i}")).unwrap();
            }
        }
        (broker, endpoints)
    }

    async fn consume(rx: &mut mpsc::Receiver<Delivery>, count: usize) -> HashSet<usize> {
        let mut workers = HashSet::new();
        for _ in 0..count {
            let delivery = rx.recv().await.unwrap();
            workers.insert(delivery.worker());
            delivery.ack().await.unwrap();
        }
        workers
    }

    #[tokio::test]
    async fn test_more_workers_than_endpoints() {
        let (broker, endpoints) = seeded(2, 30);
        let mut config = SpoutConfig::new(endpoints, Q);
        config.parallelism = 3;
        config.batch_size = 5;
        let builder = SpoutBuilder::new(config, broker.clone(), Arc::new(StringDeserializer));

        let cancel = CancellationToken::new();
        let (mut rx, fleet) = start(builder, cancel.clone()).unwrap();
        assert_eq!(fleet.workers(), 3);

        let workers = tokio::time::timeout(std::time::Duration::from_secs(10), consume(&mut rx, 60))
            .await
            .unwrap();
        assert!(!workers.is_empty());
        assert!(broker.is_drained(Q));

        fleet.shutdown();
        fleet.join().await.unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_single_worker_polls_every_endpoint() {
        let (broker, endpoints) = seeded(3, 4);
        let config = SpoutConfig::new(endpoints, Q);
        let builder = SpoutBuilder::new(config, broker.clone(), Arc::new(StringDeserializer));

        let cancel = CancellationToken::new();
        let (mut rx, fleet) = start(builder, cancel.clone()).unwrap();
        let workers = tokio::time::timeout(std::time::Duration::from_secs(10), consume(&mut rx, 12))
            .await
            .unwrap();
        assert_eq!(workers, HashSet::from([0]));
        assert!(broker.is_drained(Q));

        cancel.cancel();
        fleet.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_starts_nothing() {
        let (broker, endpoints) = seeded(1, 1);
        let mut config = SpoutConfig::new(endpoints.clone(), Q);
        config.parallelism = 0;
        let builder = SpoutBuilder::new(config, broker.clone(), Arc::new(StringDeserializer));

        let err = start(builder, CancellationToken::new()).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(broker.journal(&endpoints[0]).is_empty());
    }
}
