//! In-process queue servers with reliable-read semantics, for tests and local replay.
//!
//! A [MemoryBroker] holds any number of servers keyed by [Endpoint]. Each server keeps named
//! FIFO queues plus the set of open transactions, every one of them owned by the connection
//! that fetched it. Faults can be injected per server and every call a server receives is
//! written to its [Call] journal.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::{Connector, Endpoint, Error, QueueClient, QueueItem, Result};

const DEFAULT_FIRST_TRANSACTION_ID: i64 = 1;

/// A call received by a server, in arrival order. Calls are journaled even when they fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    Fetch { queue: String, max_items: usize },
    Confirm { queue: String, ids: Vec<i64> },
    Abort { queue: String, ids: Vec<i64> },
    Close,
}

#[derive(Debug)]
struct OpenTransaction {
    connection: u64,
    queue: String,
    payload: Bytes,
    deadline: Instant,
}

#[derive(Debug)]
struct Server {
    queues: HashMap<String, VecDeque<Bytes>>,
    open: BTreeMap<i64, OpenTransaction>,
    next_transaction_id: i64,
    next_connection_id: u64,
    down: bool,
    failures_pending: usize,
    journal: Vec<Call>,
}

impl Server {
    fn new(first_transaction_id: i64) -> Self {
        Self {
            queues: HashMap::new(),
            open: BTreeMap::new(),
            next_transaction_id: first_transaction_id,
            next_connection_id: 0,
            down: false,
            failures_pending: 0,
            journal: vec![],
        }
    }

    /// fails the call if the server is down or a failure was injected for it.
    fn check_faults(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.down {
            return Err(Error::Transport {
                endpoint: endpoint.clone(),
                reason: "server is down".to_string(),
            });
        }
        if self.failures_pending > 0 {
            self.failures_pending -= 1;
            return Err(Error::Transport {
                endpoint: endpoint.clone(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    /// puts every transaction whose visibility deadline passed back at the head of its queue.
    fn redeliver_expired(&mut self, now: Instant) {
        let expired: Vec<i64> = self
            .open
            .iter()
            .filter(|(_, tx)| tx.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        self.requeue(&expired);
    }

    /// returns the given transactions to the head of their queues, lowest id first.
    fn requeue(&mut self, ids: &[i64]) {
        for id in ids.iter().rev() {
            if let Some(tx) = self.open.remove(id) {
                self.queues
                    .entry(tx.queue)
                    .or_default()
                    .push_front(tx.payload);
            }
        }
    }

    fn owned_by(&self, connection: u64, queue: &str, ids: &[i64]) -> Vec<i64> {
        let mut owned: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| {
                self.open.get(id).is_some_and(|tx| {
                    tx.connection == connection && tx.queue == queue
                })
            })
            .collect();
        owned.sort_unstable();
        owned.dedup();
        owned
    }

    fn all_owned_by(&self, connection: u64) -> Vec<i64> {
        self.open
            .iter()
            .filter(|(_, tx)| tx.connection == connection)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Cheaply cloneable handle to a set of in-memory queue servers. It is also the [Connector]
/// for them.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    servers: Arc<Mutex<HashMap<Endpoint, Server>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a server at the endpoint, with transaction ids counting up from 1.
    pub fn add_server(&self, endpoint: &Endpoint) {
        self.add_server_with_first_id(endpoint, DEFAULT_FIRST_TRANSACTION_ID);
    }

    /// Starts a server at the endpoint, with transaction ids counting up from `first_id`.
    pub fn add_server_with_first_id(&self, endpoint: &Endpoint, first_id: i64) {
        self.servers
            .lock()
            .insert(endpoint.clone(), Server::new(first_id));
    }

    /// Appends a payload to a queue on the given server.
    pub fn push(&self, endpoint: &Endpoint, queue: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.with_server(endpoint, |server| {
            server
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(payload.into());
            Ok(())
        })
    }

    /// A down server fails every call until it is brought back up.
    pub fn set_down(&self, endpoint: &Endpoint, down: bool) {
        let _ = self.with_server(endpoint, |server| {
            server.down = down;
            Ok(())
        });
    }

    /// Fails the next `count` calls the server receives.
    pub fn fail_next(&self, endpoint: &Endpoint, count: usize) {
        let _ = self.with_server(endpoint, |server| {
            server.failures_pending = count;
            Ok(())
        });
    }

    /// Calls received by the server so far.
    pub fn journal(&self, endpoint: &Endpoint) -> Vec<Call> {
        self.with_server(endpoint, |server| Ok(server.journal.clone()))
            .unwrap_or_default()
    }

    pub fn clear_journal(&self, endpoint: &Endpoint) {
        let _ = self.with_server(endpoint, |server| {
            server.journal.clear();
            Ok(())
        });
    }

    /// Number of items waiting in the queue, not counting open transactions.
    pub fn depth(&self, endpoint: &Endpoint, queue: &str) -> usize {
        self.with_server(endpoint, |server| {
            Ok(server.queues.get(queue).map_or(0, VecDeque::len))
        })
        .unwrap_or_default()
    }

    /// Number of transactions currently open on the server.
    pub fn open_transactions(&self, endpoint: &Endpoint) -> usize {
        self.with_server(endpoint, |server| Ok(server.open.len()))
            .unwrap_or_default()
    }

    /// True when no server holds a waiting item or an open transaction for the queue.
    pub fn is_drained(&self, queue: &str) -> bool {
        self.servers.lock().values().all(|server| {
            server.queues.get(queue).is_none_or(VecDeque::is_empty)
                && server.open.values().all(|tx| tx.queue != queue)
        })
    }

    fn with_server<T>(
        &self,
        endpoint: &Endpoint,
        f: impl FnOnce(&mut Server) -> Result<T>,
    ) -> Result<T> {
        let mut servers = self.servers.lock();
        match servers.get_mut(endpoint) {
            Some(server) => f(server),
            None => Err(Error::Transport {
                endpoint: endpoint.clone(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}

impl Connector for MemoryBroker {
    type Client = MemoryClient;

    async fn connect(&self, endpoint: &Endpoint) -> Result<MemoryClient> {
        let connection = self.with_server(endpoint, |server| {
            server.journal.push(Call::Connect);
            server.check_faults(endpoint)?;
            server.next_connection_id += 1;
            Ok(server.next_connection_id)
        })?;
        debug!(%endpoint, connection, "Opened in-memory queue connection");
        Ok(MemoryClient {
            broker: self.clone(),
            endpoint: endpoint.clone(),
            connection,
            closed: false,
        })
    }
}

/// A connection to one server of a [MemoryBroker]. Dropping it without [QueueClient::close]
/// behaves like a lost socket: the server aborts the transactions it held.
pub struct MemoryClient {
    broker: MemoryBroker,
    endpoint: Endpoint,
    connection: u64,
    closed: bool,
}

impl MemoryClient {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed(self.endpoint.clone()));
        }
        Ok(())
    }

    fn take(
        &self,
        queue: &str,
        max_items: usize,
        visibility_timeout: Duration,
        journal: bool,
    ) -> Result<Vec<QueueItem>> {
        let connection = self.connection;
        self.broker.with_server(&self.endpoint, |server| {
            if journal {
                server.journal.push(Call::Fetch {
                    queue: queue.to_string(),
                    max_items,
                });
            }
            server.check_faults(&self.endpoint)?;

            let now = Instant::now();
            server.redeliver_expired(now);

            let mut items = Vec::new();
            while items.len() < max_items {
                let Some(payload) = server.queues.get_mut(queue).and_then(VecDeque::pop_front)
                else {
                    break;
                };
                let transaction_id = server.next_transaction_id;
                server.next_transaction_id += 1;
                server.open.insert(
                    transaction_id,
                    OpenTransaction {
                        connection,
                        queue: queue.to_string(),
                        payload: payload.clone(),
                        deadline: now + visibility_timeout,
                    },
                );
                items.push(QueueItem {
                    transaction_id,
                    payload,
                });
            }
            Ok(items)
        })
    }

    fn release_all(&self) {
        let connection = self.connection;
        let _ = self.broker.with_server(&self.endpoint, |server| {
            let held = server.all_owned_by(connection);
            server.requeue(&held);
            Ok(())
        });
    }
}

impl QueueClient for MemoryClient {
    async fn fetch_batch(
        &mut self,
        queue: &str,
        max_items: usize,
        batch_delay: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueItem>> {
        self.ensure_open()?;
        let items = self.take(queue, max_items, visibility_timeout, true)?;
        if !items.is_empty() || batch_delay.is_zero() {
            return Ok(items);
        }
        // nothing yet, give producers one batch delay to show up.
        tokio::time::sleep(batch_delay).await;
        self.take(queue, max_items, visibility_timeout, false)
    }

    async fn confirm(&mut self, queue: &str, transaction_ids: &[i64]) -> Result<()> {
        self.ensure_open()?;
        let connection = self.connection;
        self.broker.with_server(&self.endpoint, |server| {
            server.journal.push(Call::Confirm {
                queue: queue.to_string(),
                ids: transaction_ids.to_vec(),
            });
            server.check_faults(&self.endpoint)?;
            // ids this connection does not hold are ignored, as a real server would
            for id in server.owned_by(connection, queue, transaction_ids) {
                server.open.remove(&id);
            }
            Ok(())
        })
    }

    async fn abort(&mut self, queue: &str, transaction_ids: &[i64]) -> Result<()> {
        self.ensure_open()?;
        let connection = self.connection;
        self.broker.with_server(&self.endpoint, |server| {
            server.journal.push(Call::Abort {
                queue: queue.to_string(),
                ids: transaction_ids.to_vec(),
            });
            server.check_faults(&self.endpoint)?;
            let owned = server.owned_by(connection, queue, transaction_ids);
            server.requeue(&owned);
            Ok(())
        })
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let connection = self.connection;
        self.broker.with_server(&self.endpoint, |server| {
            server.journal.push(Call::Close);
            let held = server.all_owned_by(connection);
            server.requeue(&held);
            Ok(())
        })
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        if !self.closed {
            self.release_all();
        }
    }
}
