//! Routes a downstream verdict back to the endpoint and transaction a record came from.

use fanin_queue::QueueClient;
use tokio::time::Instant;
use tracing::debug;

use crate::buffer::LocalBuffer;
use crate::endpoint::{BlacklistPolicy, EndpointState};
use crate::message::CorrelationId;
use crate::metrics::spout_metrics;

/// What downstream decided about a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// processed, confirm the transaction
    Ack,
    /// not processed, abort the transaction so the server redelivers it
    Fail,
}

/// Confirms (ack) or aborts (fail) the correlated transaction on the endpoint's connection.
///
/// Without a connection this is a no-op: the connection that held the transaction is gone, and
/// the server redelivers the item on its own. A transport failure blacklists the endpoint and is
/// not reported to the caller.
pub(crate) async fn route<Q: QueueClient>(
    verdict: Verdict,
    correlation: CorrelationId,
    queue: &str,
    state: &mut EndpointState<Q>,
    buffer: &mut LocalBuffer,
    policy: &BlacklistPolicy,
) {
    let Some(client) = state.connection_mut() else {
        debug!(
            endpoint = %state.endpoint(),
            %correlation,
            ?verdict,
            "No live connection, leaving the transaction to server redelivery"
        );
        return;
    };

    let ids = [correlation.transaction_id];
    let result = match verdict {
        Verdict::Ack => client.confirm(queue, &ids).await,
        Verdict::Fail => client.abort(queue, &ids).await,
    };

    match result {
        Ok(()) => {
            let counter = match verdict {
                Verdict::Ack => &spout_metrics().confirmed,
                Verdict::Fail => &spout_metrics().aborted,
            };
            counter.get_or_create(&state.metric_labels).inc();
        }
        Err(e) => {
            policy
                .blacklist(correlation.endpoint_index, state, buffer, Instant::now(), &e)
                .await
        }
    }
}
