//! Configuration for the node agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use kvm_id::HostId;

use crate::migration::WatchSettings;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of this host, stamped as migration origin/destination.
    pub host_id: HostId,

    /// Data directory for local state.
    pub data_dir: PathBuf,

    /// Interval between job statistics samples.
    pub poll_interval: Duration,

    /// Absolute lifetime of a migration watch.
    pub watch_timeout: Duration,

    /// Delay before resubscribing after a daemon disconnect.
    pub reconnect_delay: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = var("KVM_NODE_NAME")
            .or_else(|| var("HOSTNAME"))
            .unwrap_or_else(|| "localhost".to_string());
        let host_id = HostId::parse(&host).with_context(|| format!("invalid host name {host:?}"))?;

        let data_dir = var("KVM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/kvm-node-agent"));

        let poll_interval_ms = var("KVM_MIGRATION_POLL_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(1000);

        let watch_timeout_secs = var("KVM_MIGRATION_WATCH_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(60 * 60);

        let reconnect_delay_secs = var("KVM_RECONNECT_DELAY_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let log_level = var("KVM_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            host_id,
            data_dir,
            poll_interval: Duration::from_millis(poll_interval_ms),
            watch_timeout: Duration::from_secs(watch_timeout_secs),
            reconnect_delay: Duration::from_secs(reconnect_delay_secs),
            log_level,
        })
    }

    /// Timing for the migration watch registry.
    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            poll_interval: self.poll_interval,
            max_watch_duration: self.watch_timeout,
            ..WatchSettings::default()
        }
    }

    /// Path of the local migration record database.
    pub fn record_db_path(&self) -> PathBuf {
        self.data_dir.join("migrations.db")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.host_id.as_str(), "localhost");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/kvm-node-agent"));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.watch_timeout, Duration::from_secs(3600));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.log_level, "info");
        assert_eq!(
            config.record_db_path(),
            PathBuf::from("/var/lib/kvm-node-agent/migrations.db")
        );
    }

    #[test]
    fn test_node_name_wins_over_hostname() {
        let config = load(&[("HOSTNAME", "fallback"), ("KVM_NODE_NAME", "Compute-7")]).unwrap();
        assert_eq!(config.host_id.as_str(), "compute-7");

        let config = load(&[("HOSTNAME", "fallback")]).unwrap();
        assert_eq!(config.host_id.as_str(), "fallback");
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let config = load(&[
            ("KVM_MIGRATION_POLL_INTERVAL_MS", "0"),
            ("KVM_MIGRATION_WATCH_TIMEOUT_SECS", "soon"),
        ])
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.watch_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_invalid_host_is_rejected() {
        assert!(load(&[("KVM_NODE_NAME", "   ")]).is_err());
    }

    #[test]
    fn test_watch_settings() {
        let config = load(&[
            ("KVM_MIGRATION_POLL_INTERVAL_MS", "250"),
            ("KVM_MIGRATION_WATCH_TIMEOUT_SECS", "60"),
        ])
        .unwrap();
        let settings = config.watch_settings();
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.max_watch_duration, Duration::from_secs(60));
    }
}
