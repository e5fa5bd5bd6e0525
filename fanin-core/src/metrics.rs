//! Counters of the fan-in consumer, kept in one process-wide prometheus registry.

use std::sync::OnceLock;

use fanin_queue::Endpoint;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use tracing::error;

// The top-level metric registry is created with the GLOBAL_PREFIX
const REGISTRY_GLOBAL_PREFIX: &str = "fanin";

const QUEUE_LABEL: &str = "queue";
const ENDPOINT_LABEL: &str = "endpoint";

// counters (the _total suffix is added by the prometheus client library)
const FETCHED_TOTAL: &str = "fetched";
const EMITTED_TOTAL: &str = "emitted";
const CONFIRMED_TOTAL: &str = "confirmed";
const ABORTED_TOTAL: &str = "aborted";
const DISCARDED_TOTAL: &str = "discarded";
const BLACKLISTED_TOTAL: &str = "blacklisted";

/// The global register of all metrics.
struct GlobalRegistry {
    // It is okay to use a sync mutex because we register each metric only one time.
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix(REGISTRY_GLOBAL_PREFIX)),
        }
    }
}

/// GLOBAL_REGISTRY is the static global registry which is initialized only once.
static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// Counters of the spout, each labelled by queue and endpoint.
pub(crate) struct SpoutMetrics {
    /// items returned by batch pulls
    pub(crate) fetched: Family<Vec<(String, String)>, Counter>,
    pub(crate) emitted: Family<Vec<(String, String)>, Counter>,
    pub(crate) confirmed: Family<Vec<(String, String)>, Counter>,
    pub(crate) aborted: Family<Vec<(String, String)>, Counter>,
    /// items that decoded into no record and were confirmed without being emitted
    pub(crate) discarded: Family<Vec<(String, String)>, Counter>,
    pub(crate) blacklisted: Family<Vec<(String, String)>, Counter>,
}

impl SpoutMetrics {
    fn new() -> Self {
        let metrics = Self {
            fetched: Family::<Vec<(String, String)>, Counter>::default(),
            emitted: Family::<Vec<(String, String)>, Counter>::default(),
            confirmed: Family::<Vec<(String, String)>, Counter>::default(),
            aborted: Family::<Vec<(String, String)>, Counter>::default(),
            discarded: Family::<Vec<(String, String)>, Counter>::default(),
            blacklisted: Family::<Vec<(String, String)>, Counter>::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            FETCHED_TOTAL,
            "A Counter to keep track of the total number of items returned by batch pulls",
            metrics.fetched.clone(),
        );
        registry.register(
            EMITTED_TOTAL,
            "A Counter to keep track of the total number of records emitted downstream",
            metrics.emitted.clone(),
        );
        registry.register(
            CONFIRMED_TOTAL,
            "A Counter to keep track of the total number of transactions confirmed on ack",
            metrics.confirmed.clone(),
        );
        registry.register(
            ABORTED_TOTAL,
            "A Counter to keep track of the total number of transactions aborted on fail",
            metrics.aborted.clone(),
        );
        registry.register(
            DISCARDED_TOTAL,
            "A Counter to keep track of the total number of items confirmed without producing a record",
            metrics.discarded.clone(),
        );
        registry.register(
            BLACKLISTED_TOTAL,
            "A Counter to keep track of the total number of times an endpoint was blacklisted",
            metrics.blacklisted.clone(),
        );
        metrics
    }
}

static SPOUT_METRICS: OnceLock<SpoutMetrics> = OnceLock::new();

pub(crate) fn spout_metrics() -> &'static SpoutMetrics {
    SPOUT_METRICS.get_or_init(SpoutMetrics::new)
}

pub(crate) fn endpoint_metric_labels(queue: &str, endpoint: &Endpoint) -> Vec<(String, String)> {
    vec![
        (QUEUE_LABEL.to_string(), queue.to_string()),
        (ENDPOINT_LABEL.to_string(), endpoint.to_string()),
    ]
}

/// Snapshot of every registered metric in the OpenMetrics text format.
pub fn encode_text() -> String {
    // make sure the spout counters are registered even before the first spout opens
    spout_metrics();
    let registry = global_registry().registry.lock();
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &registry) {
        error!(?e, "Failed to encode metrics");
    }
    buffer
}
