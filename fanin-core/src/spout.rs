//! The [Spout] is one worker of the fan-in consumer. It owns a fixed set of endpoints, a local
//! buffer and a round-robin cursor, and is driven from a single context:
//!
//! ```text
//!                 +---------------- tick ----------------+
//!                 |                                      |
//!  (endpoints) --fetch--> (deserializer) --> [buffer] --emit--> downstream
//!       ^                                                            |
//!       +------------------ ack/fail (confirm/abort) ----------------+
//! ```
//!
//! Each tick emits at most one record. Fetching only happens when the buffer is empty, and walks
//! the owned endpoints round-robin until one of them returns items.
//!
//! Lifecycle: a [SpoutBuilder] is the not yet opened worker, [SpoutBuilder::open] yields a ready
//! [Spout], and [Spout::close] ends it for good.

use std::sync::Arc;

use fanin_queue::{Connector, Endpoint};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::Error;
use crate::Result;
use crate::ack::{self, Verdict};
use crate::assign::assign;
use crate::buffer::LocalBuffer;
use crate::config::SpoutConfig;
use crate::deserialize::Deserializer;
use crate::endpoint::{BlacklistPolicy, EndpointState};
use crate::fetcher::Fetcher;
use crate::gate::PollGate;
use crate::history::HistoryRecorder;
use crate::message::{BufferedRecord, CorrelationId};
use crate::metrics::{endpoint_metric_labels, spout_metrics};

/// Downstream side of a tick.
#[trait_variant::make(Send)]
pub trait Emitter {
    async fn emit(&mut self, record: BufferedRecord) -> Result<()>;
}

impl Emitter for Vec<BufferedRecord> {
    async fn emit(&mut self, record: BufferedRecord) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

impl Emitter for mpsc::Sender<BufferedRecord> {
    async fn emit(&mut self, record: BufferedRecord) -> Result<()> {
        self.send(record)
            .await
            .map_err(|_| Error::Downstream("Downstream receiver dropped".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Ready,
    Closed,
}

/// Everything a worker needs before it opens.
#[derive(Clone)]
pub struct SpoutBuilder<C> {
    config: SpoutConfig,
    connector: C,
    deserializer: Arc<dyn Deserializer>,
    gate: Option<Arc<dyn PollGate>>,
    history: Option<Arc<dyn HistoryRecorder>>,
    worker_index: usize,
    worker_count: usize,
}

impl<C: Connector> SpoutBuilder<C> {
    pub fn new(config: SpoutConfig, connector: C, deserializer: Arc<dyn Deserializer>) -> Self {
        Self {
            config,
            connector,
            deserializer,
            gate: None,
            history: None,
            worker_index: 0,
            worker_count: 1,
        }
    }

    /// This worker is `index` of `count` parallel workers.
    pub fn worker(mut self, index: usize, count: usize) -> Self {
        self.worker_index = index;
        self.worker_count = count;
        self
    }

    pub fn gate(mut self, gate: Arc<dyn PollGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn history(mut self, history: Arc<dyn HistoryRecorder>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn config(&self) -> &SpoutConfig {
        &self.config
    }

    /// Assigns this worker its endpoints and returns the ready spout. No connection is opened
    /// yet; each one is opened by the first fetch that needs it.
    pub fn open(self) -> Result<Spout<C>> {
        self.config.validate()?;
        if self.worker_index >= self.worker_count {
            return Err(Error::Config(format!(
                "Worker index {} is out of range for {} workers",
                self.worker_index, self.worker_count
            )));
        }

        let owned: Vec<Endpoint> =
            assign(&self.config.endpoints, self.worker_count, self.worker_index);
        if owned.is_empty() {
            return Err(Error::Config(
                "At least one queue endpoint must be configured".to_string(),
            ));
        }
        info!(
            worker = self.worker_index,
            workers = self.worker_count,
            queue = self.config.queue_name,
            endpoints = ?owned.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Opening spout"
        );

        let endpoints = owned
            .into_iter()
            .map(|endpoint| {
                let labels = endpoint_metric_labels(&self.config.queue_name, &endpoint);
                EndpointState::new(endpoint, labels)
            })
            .collect();

        Ok(Spout {
            queue: self.config.queue_name.clone(),
            fetcher: Fetcher::new(&self.config),
            policy: BlacklistPolicy::new(self.config.blacklist_cooldown()),
            connector: self.connector,
            endpoints,
            buffer: LocalBuffer::new(),
            cursor: 0,
            deserializer: self.deserializer,
            gate: self.gate,
            history: self.history,
            worker_index: self.worker_index,
            lifecycle: Lifecycle::Ready,
        })
    }
}

/// One worker. All state is mutated through `&mut self`, one call at a time.
pub struct Spout<C: Connector> {
    queue: String,
    fetcher: Fetcher,
    policy: BlacklistPolicy,
    connector: C,
    endpoints: Vec<EndpointState<C::Client>>,
    buffer: LocalBuffer,
    /// owned endpoint the next fetch round starts at
    cursor: usize,
    deserializer: Arc<dyn Deserializer>,
    gate: Option<Arc<dyn PollGate>>,
    history: Option<Arc<dyn HistoryRecorder>>,
    worker_index: usize,
    lifecycle: Lifecycle,
}

impl<C: Connector> Spout<C> {
    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn endpoints(&self) -> &[EndpointState<C::Client>] {
        &self.endpoints
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Runs one scheduling step and returns whether a record was emitted.
    ///
    /// Does nothing while the poll gate is suspended. Otherwise, if the buffer is empty, tries
    /// the owned endpoints round-robin from the cursor until one returns items, then emits the
    /// oldest buffered record, if any.
    pub async fn tick<E: Emitter>(&mut self, emitter: &mut E) -> Result<bool> {
        if self.lifecycle == Lifecycle::Closed {
            return Err(Error::Closed);
        }
        if self.gate.as_ref().is_some_and(|gate| gate.is_suspended()) {
            return Ok(false);
        }

        if self.buffer.is_empty() {
            self.fill_buffer().await;
        }

        let Some(record) = self.buffer.pop() else {
            return Ok(false);
        };
        let endpoint_index = record.correlation.endpoint_index;
        let recorded = self.history.as_ref().map(|_| record.clone());
        emitter.emit(record).await?;

        if let Some(state) = self.endpoints.get(endpoint_index) {
            spout_metrics()
                .emitted
                .get_or_create(&state.metric_labels)
                .inc();
        }
        if let (Some(history), Some(record)) = (&self.history, recorded) {
            history.emitted(&record);
        }
        Ok(true)
    }

    /// One fetch round. The cursor lands on the endpoint that returned items and then always
    /// moves one step, so consecutive rounds start at different endpoints even when every
    /// endpoint is empty.
    async fn fill_buffer(&mut self) {
        let count = self.endpoints.len();
        if count == 0 {
            return;
        }
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            let Some(state) = self.endpoints.get_mut(index) else {
                continue;
            };
            let fetched = self
                .fetcher
                .fetch(
                    index,
                    state,
                    &self.connector,
                    self.deserializer.as_ref(),
                    &mut self.buffer,
                    &self.policy,
                )
                .await;
            if fetched {
                self.cursor = index;
                break;
            }
        }
        self.cursor = (self.cursor + 1) % count;
    }

    /// Confirms the transaction the record came from.
    pub async fn ack(&mut self, correlation: CorrelationId) -> Result<()> {
        if let Some(history) = &self.history {
            history.acked(&correlation);
        }
        self.route(Verdict::Ack, correlation).await
    }

    /// Aborts the transaction the record came from, so the server redelivers it.
    pub async fn fail(&mut self, correlation: CorrelationId) -> Result<()> {
        if let Some(history) = &self.history {
            history.failed(&correlation);
        }
        self.route(Verdict::Fail, correlation).await
    }

    async fn route(&mut self, verdict: Verdict, correlation: CorrelationId) -> Result<()> {
        if self.lifecycle == Lifecycle::Closed {
            debug!(%correlation, ?verdict, "Spout is closed, ignoring verdict");
            return Ok(());
        }
        let state = self
            .endpoints
            .get_mut(correlation.endpoint_index)
            .ok_or(Error::UnknownEndpoint(correlation.endpoint_index))?;
        ack::route(
            verdict,
            correlation,
            &self.queue,
            state,
            &mut self.buffer,
            &self.policy,
        )
        .await;
        Ok(())
    }

    /// Closes every connection and discards the buffer. Transactions still open are left to
    /// server redelivery. Closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }
        self.lifecycle = Lifecycle::Closed;
        for state in self.endpoints.iter_mut() {
            state.disconnect().await;
        }
        let discarded = self.buffer.clear();
        info!(worker = self.worker_index, discarded, "Closed spout");
    }
}
