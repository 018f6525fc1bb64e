pub mod config;

pub use config::{ChainConfig, ConfigError, NodeConfig, SyncConfig, DEVNET_CONFIG};
