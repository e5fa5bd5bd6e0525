use std::time::Duration;

use fanin_queue::{Connector, QueueClient, QueueItem};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::buffer::LocalBuffer;
use crate::config::SpoutConfig;
use crate::deserialize::Deserializer;
use crate::endpoint::{BlacklistPolicy, EndpointState};
use crate::message::{BufferedRecord, CorrelationId};
use crate::metrics::spout_metrics;

/// Performs one batch pull from one endpoint and buffers what it decodes to.
pub(crate) struct Fetcher {
    queue: String,
    batch_size: usize,
    batch_delay: Duration,
    visibility_timeout: Duration,
}

impl Fetcher {
    pub(crate) fn new(config: &SpoutConfig) -> Self {
        Self {
            queue: config.queue_name.clone(),
            batch_size: config.batch_size,
            batch_delay: config.batch_delay(),
            visibility_timeout: config.visibility_timeout(),
        }
    }

    /// Pulls a batch from the endpoint at `endpoint_index`, buffering every record the items
    /// decode into and confirming at once the items that decode into nothing. Returns whether
    /// the server returned any item at all.
    ///
    /// A blacklisted endpoint is skipped without a network call. A transport failure blacklists
    /// the endpoint.
    pub(crate) async fn fetch<C: Connector>(
        &self,
        endpoint_index: usize,
        state: &mut EndpointState<C::Client>,
        connector: &C,
        deserializer: &dyn Deserializer,
        buffer: &mut LocalBuffer,
        policy: &BlacklistPolicy,
    ) -> bool {
        if !state.is_eligible(Instant::now()) {
            return false;
        }

        let items = match self.pull(state, connector).await {
            Ok(items) => items,
            Err(e) => {
                policy
                    .blacklist(endpoint_index, state, buffer, Instant::now(), &e)
                    .await;
                return false;
            }
        };

        debug!(
            endpoint = %state.endpoint(),
            count = items.len(),
            requested_count = self.batch_size,
            "Got items from queue server"
        );
        let metrics = spout_metrics();
        metrics
            .fetched
            .get_or_create(&state.metric_labels)
            .inc_by(items.len() as u64);

        let mut discarded = Vec::new();
        for item in &items {
            let records = match deserializer.decode(&item.payload) {
                Ok(records) => records,
                Err(e) => {
                    warn!(
                        endpoint = %state.endpoint(),
                        transaction_id = item.transaction_id,
                        ?e,
                        "Dropping payload that failed to decode"
                    );
                    vec![]
                }
            };
            if records.is_empty() {
                discarded.push(item.transaction_id);
                continue;
            }
            let correlation = CorrelationId::new(endpoint_index, item.transaction_id);
            for fields in records {
                buffer.push(BufferedRecord::new(fields, correlation));
            }
        }

        if !discarded.is_empty() {
            let confirmed = match state.connection_mut() {
                Some(client) => client.confirm(&self.queue, &discarded).await,
                None => Ok(()),
            };
            match confirmed {
                Ok(()) => {
                    metrics
                        .discarded
                        .get_or_create(&state.metric_labels)
                        .inc_by(discarded.len() as u64);
                }
                Err(e) => {
                    policy
                        .blacklist(endpoint_index, state, buffer, Instant::now(), &e)
                        .await
                }
            }
        }

        !items.is_empty()
    }

    async fn pull<C: Connector>(
        &self,
        state: &mut EndpointState<C::Client>,
        connector: &C,
    ) -> fanin_queue::Result<Vec<QueueItem>> {
        let client = state.connect(connector).await?;
        client
            .fetch_batch(
                &self.queue,
                self.batch_size,
                self.batch_delay,
                self.visibility_timeout,
            )
            .await
    }
}
