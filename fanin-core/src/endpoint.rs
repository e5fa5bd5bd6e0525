//! Per-endpoint connection state and the flat-cooldown blacklist.
//!
//! A connection is opened lazily by the first fetch that needs it and is dropped on every
//! transport failure. Dropping it is what makes blacklisting safe: the server aborts whatever
//! the connection still held open, so records buffered from it are purged too and will come back
//! through redelivery.

use std::time::Duration;

use fanin_queue::{Connector, Endpoint, QueueClient};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::buffer::LocalBuffer;
use crate::metrics::spout_metrics;

/// One owned endpoint: its connection handle and blacklist deadline.
pub struct EndpointState<Q> {
    endpoint: Endpoint,
    connection: Option<Q>,
    blacklisted_until: Option<Instant>,
    pub(crate) metric_labels: Vec<(String, String)>,
}

impl<Q> EndpointState<Q> {
    pub(crate) fn new(endpoint: Endpoint, metric_labels: Vec<(String, String)>) -> Self {
        Self {
            endpoint,
            connection: None,
            blacklisted_until: None,
            metric_labels,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn blacklisted_until(&self) -> Option<Instant> {
        self.blacklisted_until
    }

    /// True once the blacklist deadline, if any, has been reached.
    pub fn is_eligible(&self, now: Instant) -> bool {
        self.blacklisted_until.is_none_or(|until| now >= until)
    }

    pub(crate) fn connection_mut(&mut self) -> Option<&mut Q> {
        self.connection.as_mut()
    }
}

impl<Q: QueueClient> EndpointState<Q> {
    /// Returns the live connection, opening one first if there is none.
    pub(crate) async fn connect<C>(&mut self, connector: &C) -> fanin_queue::Result<&mut Q>
    where
        C: Connector<Client = Q>,
    {
        if self.connection.is_none() {
            let client = connector.connect(&self.endpoint).await?;
            debug!(endpoint = %self.endpoint, "Connected to queue server");
            self.connection = Some(client);
        }
        self.connection
            .as_mut()
            .ok_or_else(|| fanin_queue::Error::Closed(self.endpoint.clone()))
    }

    /// Closes the connection if there is one. Failures are logged and otherwise ignored.
    pub(crate) async fn disconnect(&mut self) {
        if let Some(mut client) = self.connection.take() {
            if let Err(e) = client.close().await {
                warn!(endpoint = %self.endpoint, ?e, "Failed to close queue connection");
            }
        }
    }
}

/// Excludes an endpoint from polling for a fixed cooldown after a transport failure. There is no
/// escalation: every failure earns the same window.
#[derive(Debug, Clone, Copy)]
pub struct BlacklistPolicy {
    cooldown: Duration,
}

impl BlacklistPolicy {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Blacklists the endpoint at `endpoint_index` until `now + cooldown`, closes its connection
    /// and purges the records buffered from it.
    pub(crate) async fn blacklist<Q: QueueClient>(
        &self,
        endpoint_index: usize,
        state: &mut EndpointState<Q>,
        buffer: &mut LocalBuffer,
        now: Instant,
        cause: &fanin_queue::Error,
    ) {
        state.blacklisted_until = Some(now + self.cooldown);
        state.disconnect().await;
        let purged = buffer.purge_endpoint(endpoint_index);
        spout_metrics()
            .blacklisted
            .get_or_create(&state.metric_labels)
            .inc();
        warn!(
            endpoint = %state.endpoint,
            cooldown_secs = self.cooldown.as_secs(),
            purged,
            ?cause,
            "Blacklisted queue endpoint"
        );
    }
}
