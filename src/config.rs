//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// The default subject prefix clients discover brokers on.
pub const DEFAULT_DISCOVER_PREFIX: &str = "_STAN.discover";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default)]
    pub rust_log: String,

    /// The ID of the cluster this broker serves.
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,
    /// The subject prefix on which connect requests are discovered.
    #[serde(default = "default_discover_prefix")]
    pub discover_prefix: String,

    /// The maximum number of channels the broker will create.
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
    /// The maximum number of messages retained per channel.
    #[serde(default = "default_max_msgs")]
    pub max_msgs: usize,
    /// The maximum number of bytes retained per channel.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    /// The maximum number of subscriptions per channel.
    #[serde(default = "default_max_subs")]
    pub max_subs: usize,

    /// The interval between heartbeat probes to a client, in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How long to wait for a heartbeat response, in milliseconds.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// How many heartbeats may fail in a row before a client is closed.
    #[serde(default = "default_max_failed_heartbeats")]
    pub max_failed_heartbeats: u32,

    /// The path to the file-backed store on disk; empty selects the
    /// in-memory store.
    #[serde(default)]
    pub storage_data_path: String,
}

fn default_cluster_id() -> String {
    "weir".into()
}

fn default_discover_prefix() -> String {
    DEFAULT_DISCOVER_PREFIX.into()
}

fn default_max_channels() -> usize {
    100
}

fn default_max_msgs() -> usize {
    1_000_000
}

fn default_max_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_max_subs() -> usize {
    1000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_max_failed_heartbeats() -> u32 {
    10
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }

    /// The interval between heartbeat probes to a client.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// How long to wait for a heartbeat response.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Build an instance for use in tests.
    #[cfg(test)]
    pub fn new_test(cluster_id: &str) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            rust_log: "".into(),
            cluster_id: cluster_id.into(),
            discover_prefix: default_discover_prefix(),
            max_channels: default_max_channels(),
            max_msgs: default_max_msgs(),
            max_bytes: default_max_bytes(),
            max_subs: default_max_subs(),
            heartbeat_interval_ms: 250,
            heartbeat_timeout_ms: 250,
            max_failed_heartbeats: 3,
            storage_data_path: "".into(),
        })
    }
}
