//! Node configuration.
//!
//! The core never reads the environment; it accepts a fully-resolved
//! config struct at construction. Durations are plain milliseconds so
//! the struct round-trips through TOML and JSON unchanged.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Isolates load keys and RPC channels between logical pools
    /// sharing one datastore.
    pub pool_id: String,
    /// Load-report period and load-key TTL.
    pub report_interval_ms: u64,
    /// Max concurrent job-creation operations.
    pub concurrency: usize,
    /// Reservation lifetime between match and arrival.
    pub reservation_hold_ms: u64,
    /// Per-RPC-call deadline.
    pub rpc_timeout_ms: u64,
    /// Idle-poll cadence of the auto-destroy capability.
    pub auto_destroy_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            pool_id: "global".to_string(),
            report_interval_ms: 30_000,
            concurrency: 1,
            reservation_hold_ms: 10_000,
            rpc_timeout_ms: 15_000,
            auto_destroy_interval_ms: 10_000,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn reservation_hold(&self) -> Duration {
        Duration::from_millis(self.reservation_hold_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn auto_destroy_interval(&self) -> Duration {
        Duration::from_millis(self.auto_destroy_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = NodeConfig::default();
        assert_eq!(config.pool_id, "global");
        assert_eq!(config.report_interval(), Duration::from_secs(30));
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.reservation_hold(), Duration::from_secs(10));
        assert_eq!(config.rpc_timeout(), Duration::from_secs(15));
        assert_eq!(config.auto_destroy_interval(), Duration::from_secs(10));
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
pool_id = "eu-west"
rpc_timeout_ms = 5000
"#,
        )
        .unwrap();
        assert_eq!(config.pool_id, "eu-west");
        assert_eq!(config.rpc_timeout(), Duration::from_secs(5));
        assert_eq!(config.concurrency, 1);
    }
}
