//! `fanin replay`: seeds in-memory queue servers from a file and runs a fleet of workers over
//! them until every item has been consumed.

use std::sync::Arc;
use std::time::Duration;

use fanin_core::config::SpoutConfig;
use fanin_core::deserialize::{
    Deserializer, JsonDeserializer, RawDeserializer, StringDeserializer,
};
use fanin_core::fleet;
use fanin_core::spout::SpoutBuilder;
use fanin_core::{Error, Result};
use fanin_queue::memory::MemoryBroker;
use tokio_util::sync::CancellationToken;
use tracing::info;

const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub(crate) struct ReplayArgs {
    pub(crate) input: String,
    pub(crate) config: Option<String>,
    pub(crate) format: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReplaySummary {
    pub(crate) seeded: usize,
    pub(crate) delivered: usize,
}

fn deserializer(format: &str) -> Result<Arc<dyn Deserializer>> {
    match format {
        "raw" => Ok(Arc::new(RawDeserializer)),
        "string" => Ok(Arc::new(StringDeserializer)),
        "json" => Ok(Arc::new(JsonDeserializer::new())),
        "json-split" => Ok(Arc::new(JsonDeserializer::splitting_arrays())),
        other => Err(Error::Config(format!("Unknown payload format '{other}'"))),
    }
}

/// Pushes every non-blank line of the input onto the configured queue, spreading lines over
/// the endpoints round-robin. Returns how many items were pushed.
fn seed(broker: &MemoryBroker, config: &SpoutConfig, input: &str) -> Result<usize> {
    let content = std::fs::read_to_string(input)
        .map_err(|e| Error::Config(format!("Failed to read input {input}: {e}")))?;

    for endpoint in &config.endpoints {
        broker.add_server(endpoint);
    }
    let mut seeded = 0;
    for (line, endpoint) in content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .zip(config.endpoints.iter().cycle())
    {
        broker.push(endpoint, &config.queue_name, line.to_string())?;
        seeded += 1;
    }
    Ok(seeded)
}

pub(crate) async fn run(args: ReplayArgs, cancel: CancellationToken) -> Result<ReplaySummary> {
    let config = match &args.config {
        Some(path) => SpoutConfig::from_file(path)?,
        None => SpoutConfig::load()?,
    };
    let broker = MemoryBroker::new();
    let seeded = seed(&broker, &config, &args.input)?;
    info!(
        seeded,
        endpoints = config.endpoints.len(),
        queue = config.queue_name,
        "Seeded in-memory queue servers"
    );

    let builder = SpoutBuilder::new(config.clone(), broker.clone(), deserializer(&args.format)?);
    let (mut deliveries, fleet) = fleet::start(builder, cancel.clone())?;

    let mut delivered = 0;
    let mut drain_check = tokio::time::interval(DRAIN_CHECK_INTERVAL);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else {
                    break;
                };
                info!(
                    worker = delivery.worker(),
                    correlation = %delivery.correlation(),
                    fields = ?delivery.record.fields,
                    "Received record"
                );
                delivery.ack().await?;
                delivered += 1;
            }
            _ = drain_check.tick() => {
                if broker.is_drained(&config.queue_name) {
                    break;
                }
            }
        }
    }

    fleet.shutdown();
    fleet.join().await?;
    Ok(ReplaySummary { seeded, delivered })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn args(input: &NamedTempFile, config: &NamedTempFile, format: &str) -> ReplayArgs {
        ReplayArgs {
            input: input.path().to_string_lossy().to_string(),
            config: Some(config.path().to_string_lossy().to_string()),
            format: format.to_string(),
        }
    }

    const CONFIG: &str = r#"{
        "endpoints": ["replay-a:2229", "replay-b:2229"],
        "queue_name": "replay",
        "batch_size": 3,
        "parallelism": 2
    }"#;

    #[tokio::test]
    async fn test_replay_consumes_everything() {
        let input = file("one\ntwo\n\nthree\nfour\nfive\n");
        let config = file(CONFIG);

        let summary = run(args(&input, &config, "string"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            summary,
            ReplaySummary {
                seeded: 5,
                delivered: 5
            }
        );
    }

    #[tokio::test]
    async fn test_replay_splits_json_arrays() {
        let input = file("[1, 2, 3]\n{\"a\": 1}\n[]\n");
        let config = file(CONFIG);

        let summary = run(args(&input, &config, "json-split"), CancellationToken::new())
            .await
            .unwrap();
        // the empty array yields no record and is confirmed without delivery
        assert_eq!(summary.seeded, 3);
        assert_eq!(summary.delivered, 4);
    }

    #[tokio::test]
    async fn test_replay_errors() {
        let config = file(CONFIG);
        let missing = ReplayArgs {
            input: "/nonexistent/fanin-input".to_string(),
            config: Some(config.path().to_string_lossy().to_string()),
            format: "string".to_string(),
        };
        assert!(matches!(
            run(missing, CancellationToken::new()).await,
            Err(Error::Config(_))
        ));

        assert!(matches!(deserializer("xml").err(), Some(Error::Config(_))));
    }
}
