//! Client side of the backend queue servers polled by the fan-in consumer.
//!
//! A queue server hands out items under *reliable reads*: every fetched item stays an open
//! transaction on the server until the connection that fetched it either confirms it (consumed)
//! or aborts it (put back for redelivery). Closing a connection aborts whatever it still holds
//! open, and the server redelivers transactions whose visibility timeout elapsed.
//!
//! The wire protocol is not part of this crate. [QueueClient] and [Connector] describe the
//! capability, and [memory::MemoryBroker] implements it in-process.
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

pub mod memory;

/// Errors raised by a queue-server connection.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Transport failure talking to {endpoint} - {reason}")]
    Transport { endpoint: Endpoint, reason: String },

    #[error("Connection to {0} is already closed")]
    Closed(Endpoint),

    #[error("Invalid endpoint '{0}', expected host:port")]
    InvalidEndpoint(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<String> for Error {
    fn from(value: String) -> Self {
        Error::Other(value)
    }
}

/// One backend queue-server process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Deserialize)]
#[serde(try_from = "String")]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let Some((host, port)) = trimmed.rsplit_once(':') else {
            return Err(Error::InvalidEndpoint(s.to_string()));
        };
        if host.is_empty() {
            return Err(Error::InvalidEndpoint(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidEndpoint(s.to_string()))?;
        Ok(Endpoint::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// An item delivered under an open transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Server-assigned id of the open transaction, unique per server while it is open.
    pub transaction_id: i64,
    pub payload: Bytes,
}

impl QueueItem {
    pub fn new(transaction_id: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            transaction_id,
            payload: payload.into(),
        }
    }
}

/// A live connection to one queue server.
#[trait_variant::make(Send)]
pub trait QueueClient {
    /// Reliable read of up to `max_items` items. The server may wait up to `batch_delay` for
    /// items to arrive, and redelivers any returned item that is neither confirmed nor aborted
    /// within `visibility_timeout`.
    async fn fetch_batch(
        &mut self,
        queue: &str,
        max_items: usize,
        batch_delay: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueItem>>;

    /// Marks the given open transactions as consumed.
    async fn confirm(&mut self, queue: &str, transaction_ids: &[i64]) -> Result<()>;

    /// Returns the given open transactions to the queue.
    async fn abort(&mut self, queue: &str, transaction_ids: &[i64]) -> Result<()>;

    /// Closes the connection. The server aborts every transaction still open on it.
    async fn close(&mut self) -> Result<()>;
}

/// Opens connections to queue servers.
#[trait_variant::make(Send)]
pub trait Connector {
    type Client: QueueClient;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Client>;
}
