use std::env;
use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use fanin_queue::Endpoint;
use serde::Deserialize;

use crate::Error;
use crate::Result;

/// Environment variable holding the base64 encoded JSON [SpoutConfig].
pub const ENV_SPOUT_CONFIG: &str = "FANIN_SPOUT_CONFIG";

const DEFAULT_BATCH_SIZE: usize = 4000;
const DEFAULT_MESSAGE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BLACKLIST_COOLDOWN_SECS: u64 = 60;
const DEFAULT_BATCH_DELAY_MILLIS: u64 = 0;
const DEFAULT_PARALLELISM: usize = 1;
const DEFAULT_IDLE_WAIT_MILLIS: u64 = 1;

/// Settings of a fan-in consumer. One copy is handed to every worker; nothing is read from
/// global state after loading.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpoutConfig {
    /// queue servers to poll, `host:port` each
    pub endpoints: Vec<Endpoint>,
    pub queue_name: String,
    /// maximum items per batch pull
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// how long downstream has to ack or fail a record. Also the visibility timeout of each
    /// batch pull, after which the server redelivers.
    #[serde(default = "default_message_timeout_secs")]
    pub message_timeout_secs: u64,
    #[serde(default = "default_blacklist_cooldown_secs")]
    pub blacklist_cooldown_secs: u64,
    /// how long a server may wait for items before answering an empty batch pull
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// number of workers polling the endpoints
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// pause after a tick that emitted nothing
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_message_timeout_secs() -> u64 {
    DEFAULT_MESSAGE_TIMEOUT_SECS
}

fn default_blacklist_cooldown_secs() -> u64 {
    DEFAULT_BLACKLIST_COOLDOWN_SECS
}

fn default_batch_delay_ms() -> u64 {
    DEFAULT_BATCH_DELAY_MILLIS
}

fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

fn default_idle_wait_ms() -> u64 {
    DEFAULT_IDLE_WAIT_MILLIS
}

impl SpoutConfig {
    /// Config with every optional setting at its default.
    pub fn new(endpoints: Vec<Endpoint>, queue_name: impl Into<String>) -> Self {
        Self {
            endpoints,
            queue_name: queue_name.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            message_timeout_secs: DEFAULT_MESSAGE_TIMEOUT_SECS,
            blacklist_cooldown_secs: DEFAULT_BLACKLIST_COOLDOWN_SECS,
            batch_delay_ms: DEFAULT_BATCH_DELAY_MILLIS,
            parallelism: DEFAULT_PARALLELISM,
            idle_wait_ms: DEFAULT_IDLE_WAIT_MILLIS,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: SpoutConfig = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Parsing spout config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Reading {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Loads the config from [ENV_SPOUT_CONFIG].
    pub fn load() -> Result<Self> {
        let encoded = env::var(ENV_SPOUT_CONFIG)
            .map_err(|_| Error::Config(format!("{ENV_SPOUT_CONFIG} is not set")))?;
        Self::from_base64(&encoded)
    }

    /// Parses base64 encoded JSON, the format of [ENV_SPOUT_CONFIG].
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| Error::Config(format!("Decoding {ENV_SPOUT_CONFIG}: {e}")))?;
        let json = String::from_utf8(decoded)
            .map_err(|e| Error::Config(format!("{ENV_SPOUT_CONFIG} is not UTF-8: {e}")))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::Config(
                "At least one queue endpoint must be configured".to_string(),
            ));
        }
        if self.queue_name.trim().is_empty() {
            return Err(Error::Config("Queue name must not be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("Batch size must be positive".to_string()));
        }
        if self.parallelism == 0 {
            return Err(Error::Config("Parallelism must be positive".to_string()));
        }
        Ok(())
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }

    pub fn blacklist_cooldown(&self) -> Duration {
        Duration::from_secs(self.blacklist_cooldown_secs)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}
