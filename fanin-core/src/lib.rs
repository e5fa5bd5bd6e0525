//! Reliable fan-in consumer over a set of independent queue servers.
//!
//! A worker ([spout::Spout]) polls its endpoints round-robin, buffers the records each fetched
//! item decodes into, and emits one record per tick. Every record carries the
//! [message::CorrelationId] of the transaction it came from, so a downstream ack or fail lands on
//! exactly that transaction. Endpoints that fail are blacklisted for a flat cooldown.
//!
//! [worker] runs a spout on its own task and [fleet] starts several of them over one endpoint
//! list.

pub use crate::error::{Error, Result};

mod error;

pub mod ack;
pub mod assign;
pub mod buffer;
pub mod config;
pub mod deserialize;
pub mod endpoint;
mod fetcher;
pub mod fleet;
pub mod gate;
pub mod history;
pub mod message;
pub mod metrics;
pub mod spout;
pub mod worker;

pub use fanin_queue::{Connector, Endpoint, QueueClient};
