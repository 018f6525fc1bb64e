use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

pub const BLOCK_PERIOD_SECS: u64 = 2;
pub const PRODUCER_COUNT: u64 = 4;

/// Maximum blocks fetched by one downloader call.
pub const BLOCK_LIMIT: u64 = 1_024;
/// Peer attempts before a download gives up.
pub const MAX_DOWNLOAD_ATTEMPTS: usize = 3;
pub const REQUEST_TIMEOUT_MS: u64 = 5_000;
pub const RETRY_BACKOFF_MS: u64 = 250;
pub const SYNC_TICK_INTERVAL_MS: u64 = 1_000;
/// Queued peer gossip events before the oldest are dropped. Finality
/// events are never subject to this bound.
pub const GOSSIP_QUEUE_CAPACITY: usize = 256;
pub const MAX_REORG_RECOVERIES: usize = 3;
pub const FAULT_BACKOFF_MS: u64 = 1_000;
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
pub const BAD_BLOCK_CACHE_SIZE: usize = 1_024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to open config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChainConfig {
    pub block_period_secs: u64,
    pub producer_count: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        DEVNET_CONFIG
    }
}

pub const DEVNET_CONFIG: ChainConfig = ChainConfig {
    block_period_secs: BLOCK_PERIOD_SECS,
    producer_count: PRODUCER_COUNT,
};

/// Operational limits of the sync pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub block_limit: u64,
    pub max_download_attempts: usize,
    pub request_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub tick_interval_ms: u64,
    pub gossip_queue_capacity: usize,
    pub max_reorg_recoveries: usize,
    pub fault_backoff_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub bad_block_cache_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            block_limit: BLOCK_LIMIT,
            max_download_attempts: MAX_DOWNLOAD_ATTEMPTS,
            request_timeout_ms: REQUEST_TIMEOUT_MS,
            retry_backoff_ms: RETRY_BACKOFF_MS,
            tick_interval_ms: SYNC_TICK_INTERVAL_MS,
            gossip_queue_capacity: GOSSIP_QUEUE_CAPACITY,
            max_reorg_recoveries: MAX_REORG_RECOVERIES,
            fault_backoff_ms: FAULT_BACKOFF_MS,
            shutdown_timeout_ms: SHUTDOWN_TIMEOUT_MS,
            bad_block_cache_size: BAD_BLOCK_CACHE_SIZE,
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn fault_backoff(&self) -> Duration {
        Duration::from_millis(self.fault_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_limit == 0 {
            return Err(ConfigError::Invalid("blockLimit must be positive"));
        }
        if self.max_download_attempts == 0 {
            return Err(ConfigError::Invalid("maxDownloadAttempts must be positive"));
        }
        if self.gossip_queue_capacity == 0 {
            return Err(ConfigError::Invalid("gossipQueueCapacity must be positive"));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tickIntervalMs must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeConfig {
    pub chain: ChainConfig,
    pub sync: SyncConfig,
}

impl NodeConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: NodeConfig = serde_yaml::from_reader(reader)?;
        config.sync.validate()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_yaml::from_str(yaml)?;
        config.sync.validate()?;
        Ok(config)
    }
}
