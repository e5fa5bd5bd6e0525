//! Drives one [Spout] from a single task. Ticks and downstream verdicts are funnelled through
//! that task, so the spout is never touched concurrently:
//!
//! ```text
//!   downstream ---- Delivery{record, acker} <---- [worker task] <---- tick
//!       |                                              ^
//!       +-------- Acker::ack / fail (mpsc) ------------+
//! ```
//!
//! Pending verdicts are served before every tick, while parked after an idle tick, and while
//! waiting for room downstream.

use std::time::Duration;

use fanin_queue::Connector;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Error;
use crate::Result;
use crate::ack::Verdict;
use crate::message::{BufferedRecord, CorrelationId};
use crate::spout::Spout;

const ACK_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug)]
struct AckMessage {
    correlation: CorrelationId,
    verdict: Verdict,
    respond_to: oneshot::Sender<Result<()>>,
}

/// Routes verdicts back to the worker that emitted a record.
#[derive(Debug, Clone)]
pub struct Acker {
    worker: usize,
    sender: mpsc::Sender<AckMessage>,
}

impl Acker {
    pub fn worker(&self) -> usize {
        self.worker
    }

    pub async fn ack(&self, correlation: CorrelationId) -> Result<()> {
        self.send(Verdict::Ack, correlation).await
    }

    pub async fn fail(&self, correlation: CorrelationId) -> Result<()> {
        self.send(Verdict::Fail, correlation).await
    }

    async fn send(&self, verdict: Verdict, correlation: CorrelationId) -> Result<()> {
        let (respond_to, receiver) = oneshot::channel();
        let msg = AckMessage {
            correlation,
            verdict,
            respond_to,
        };
        // Ignore send errors. If send fails, so does the recv.await below. There's no reason
        // to check for the same failure twice.
        let _ = self.sender.send(msg).await;
        receiver
            .await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?
    }
}

/// A record handed downstream, together with the way back to the worker that owns it.
#[derive(Debug)]
pub struct Delivery {
    pub record: BufferedRecord,
    acker: Acker,
}

impl Delivery {
    pub fn correlation(&self) -> CorrelationId {
        self.record.correlation
    }

    /// Index of the worker that emitted the record.
    pub fn worker(&self) -> usize {
        self.acker.worker()
    }

    /// Confirms the transaction the record came from. Fails once the worker has stopped; by
    /// then the server has taken the transaction back.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack(self.record.correlation).await
    }

    /// Aborts the transaction the record came from, so the item is redelivered.
    pub async fn fail(self) -> Result<()> {
        self.acker.fail(self.record.correlation).await
    }
}

/// Owns a [Spout] and runs it until cancelled.
pub struct Worker<C: Connector> {
    spout: Spout<C>,
    acks: mpsc::Receiver<AckMessage>,
    acker: Acker,
    downstream: mpsc::Sender<Delivery>,
    idle_wait: Duration,
    cancel: CancellationToken,
}

impl<C: Connector> Worker<C> {
    pub fn new(
        spout: Spout<C>,
        downstream: mpsc::Sender<Delivery>,
        idle_wait: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (sender, acks) = mpsc::channel(ACK_CHANNEL_CAPACITY);
        let acker = Acker {
            worker: spout.worker_index(),
            sender,
        };
        Self {
            spout,
            acks,
            acker,
            downstream,
            idle_wait,
            cancel,
        }
    }

    /// Ticks until cancelled or until downstream goes away, then serves the verdicts already
    /// queued and closes the spout. Cancellation is only looked at between ticks.
    pub async fn run(mut self) -> Result<()> {
        let worker = self.spout.worker_index();
        info!(worker, "Starting spout worker");

        let mut emitted = Vec::with_capacity(1);
        let result = loop {
            self.drain_acks().await;
            if self.cancel.is_cancelled() {
                break Ok(());
            }

            match self.spout.tick(&mut emitted).await {
                Ok(true) => {
                    let mut delivered = true;
                    for record in emitted.drain(..) {
                        delivered = self.deliver(record).await;
                    }
                    if !delivered {
                        break Ok(());
                    }
                }
                Ok(false) => self.park().await,
                Err(e) => {
                    error!(worker, ?e, "Spout tick failed");
                    break Err(e);
                }
            }
        };

        self.drain_acks().await;
        self.spout.close().await;
        info!(worker, "Stopped spout worker");
        result
    }

    async fn handle(&mut self, msg: AckMessage) {
        let result = match msg.verdict {
            Verdict::Ack => self.spout.ack(msg.correlation).await,
            Verdict::Fail => self.spout.fail(msg.correlation).await,
        };
        let _ = msg.respond_to.send(result);
    }

    async fn drain_acks(&mut self) {
        while let Ok(msg) = self.acks.try_recv() {
            self.handle(msg).await;
        }
    }

    /// Waits out the idle interval after a tick that emitted nothing.
    async fn park(&mut self) {
        let sleep = tokio::time::sleep(self.idle_wait);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                Some(msg) = self.acks.recv() => self.handle(msg).await,
                _ = &mut sleep => return,
            }
        }
    }

    /// Hands the record downstream, serving verdicts while the channel is full. Returns false
    /// when the record could not be delivered; its transaction is then released by close.
    async fn deliver(&mut self, record: BufferedRecord) -> bool {
        let delivery = Delivery {
            record,
            acker: self.acker.clone(),
        };
        let downstream = self.downstream.clone();
        loop {
            tokio::select! {
                biased;
                permit = downstream.reserve() => {
                    return match permit {
                        Ok(permit) => {
                            permit.send(delivery);
                            true
                        }
                        Err(_) => {
                            info!(worker = self.spout.worker_index(), "Downstream closed");
                            false
                        }
                    };
                }
                Some(msg) = self.acks.recv() => self.handle(msg).await,
                _ = self.cancel.cancelled() => {
                    debug!(
                        worker = self.spout.worker_index(),
                        correlation = %delivery.correlation(),
                        "Cancelled while waiting for downstream"
                    );
                    return false;
                }
            }
        }
    }
}

/// Spawns a [Worker] for the spout onto the runtime.
pub fn spawn<C>(
    spout: Spout<C>,
    downstream: mpsc::Sender<Delivery>,
    idle_wait: Duration,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>>
where
    C: Connector + Send + Sync + 'static,
    C::Client: Send + 'static,
{
    let worker = Worker::new(spout, downstream, idle_wait, cancel);
    tokio::spawn(worker.run())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fanin_queue::Endpoint;
    use fanin_queue::memory::{Call, MemoryBroker};

    use super::*;
    use crate::config::SpoutConfig;
    use crate::deserialize::StringDeserializer;
    use crate::message::Value;
    use crate::spout::SpoutBuilder;

    const Q: &str = "worker-q";

    fn spout(broker: &MemoryBroker, endpoints: &[Endpoint]) -> Spout<MemoryBroker> {
        let mut config = SpoutConfig::new(endpoints.to_vec(), Q);
        config.batch_size = 2;
        SpoutBuilder::new(config, broker.clone(), Arc::new(StringDeserializer))
            .open()
            .unwrap()
    }

    fn broker(items: &[&'static str]) -> (MemoryBroker, Endpoint) {
        let broker = MemoryBroker::new();
        let ep = Endpoint::new("worker-host", 2229);
        broker.add_server(&ep);
        for item in items {
            broker.push(&ep, Q, *item).unwrap();
        }
        (broker, ep)
    }

    #[tokio::test]
    async fn test_deliver_and_ack() {
        let (broker, ep) = broker(&["a", "b", "c"]);
        let (tx, mut rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let handle = spawn(
            spout(&broker, std::slice::from_ref(&ep)),
            tx,
            Duration::from_millis(1),
            cancel.clone(),
        );

        let mut seen = vec![];
        for _ in 0..3 {
            let delivery = rx.recv().await.unwrap();
            assert_eq!(delivery.worker(), 0);
            seen.push(delivery.record.fields[0].clone());
            delivery.ack().await.unwrap();
        }
        assert_eq!(seen, vec![Value::from("a"), Value::from("b"), Value::from("c")]);
        assert!(broker.is_drained(Q));

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(broker.journal(&ep).last(), Some(&Call::Close));
    }

    #[tokio::test]
    async fn test_fail_redelivers() {
        let (broker, ep) = broker(&["once-more"]);
        let (tx, mut rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let handle = spawn(
            spout(&broker, std::slice::from_ref(&ep)),
            tx,
            Duration::from_millis(1),
            cancel.clone(),
        );

        let first = rx.recv().await.unwrap();
        let first_correlation = first.correlation();
        first.fail().await.unwrap();

        let second = rx.recv().await.unwrap();
        assert_eq!(second.record.fields, vec![Value::from("once-more")]);
        assert_ne!(second.correlation(), first_correlation);
        second.ack().await.unwrap();
        assert!(broker.is_drained(Q));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_releases_unacked_and_late_ack_errors() {
        let (broker, ep) = broker(&["held"]);
        let (tx, mut rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let handle = spawn(
            spout(&broker, std::slice::from_ref(&ep)),
            tx,
            Duration::from_millis(1),
            cancel.clone(),
        );

        let delivery = rx.recv().await.unwrap();
        assert_eq!(broker.open_transactions(&ep), 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        // closing the connection gave the item back to the server
        assert_eq!(broker.open_transactions(&ep), 0);
        assert_eq!(broker.depth(&ep, Q), 1);

        let err = delivery.ack().await.unwrap_err();
        assert!(matches!(err, Error::ActorPatternRecv(_)));
    }

    #[tokio::test]
    async fn test_verdicts_served_while_idle() {
        let (broker, ep) = broker(&["only"]);
        let (tx, mut rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        // a long idle wait: the ack must not wait for it to run out
        let handle = spawn(
            spout(&broker, std::slice::from_ref(&ep)),
            tx,
            Duration::from_secs(3600),
            cancel.clone(),
        );

        let delivery = rx.recv().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), delivery.ack())
            .await
            .unwrap()
            .unwrap();
        assert!(broker.is_drained(Q));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shared_full_downstream_does_not_deadlock() {
        let broker = MemoryBroker::new();
        let endpoints: Vec<Endpoint> = (0..2)
            .map(|i| Endpoint::new(format!("full-{i}"), 2229))
            .collect();
        for ep in &endpoints {
            broker.add_server(ep);
            for i in 0..20 {
                broker.push(ep, Q, format!("{ep}-{i}")).unwrap();
            }
        }

        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let mut config = SpoutConfig::new(endpoints.clone(), Q);
        config.batch_size = 2;
        let handles: Vec<_> = (0..2)
            .map(|w| {
                let spout = SpoutBuilder::new(
                    config.clone(),
                    broker.clone(),
                    Arc::new(StringDeserializer),
                )
                .worker(w, 2)
                .open()
                .unwrap();
                spawn(spout, tx.clone(), Duration::from_millis(1), cancel.clone())
            })
            .collect();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(10), async {
            for _ in 0..40 {
                let delivery = rx.recv().await.unwrap();
                delivery.ack().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(broker.is_drained(Q));

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_stops_when_downstream_dropped() {
        let (broker, ep) = broker(&["a", "b"]);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = spawn(
            spout(&broker, std::slice::from_ref(&ep)),
            tx,
            Duration::from_millis(1),
            CancellationToken::new(),
        );
        handle.await.unwrap().unwrap();
        assert_eq!(broker.depth(&ep, Q), 2);
        assert_eq!(broker.open_transactions(&ep), 0);
    }
}
