//! Configuration for the node agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_id::NodeId;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Control plane API URL (event bus and cluster state).
    pub control_plane_url: String,

    /// Data directory for local state.
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Retry and timeout knobs for instance lifecycle operations.
    pub lifecycle: LifecycleConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let node_id = match std::env::var("FLEET_NODE_ID") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid FLEET_NODE_ID: {raw}"))?,
            Err(_) => NodeId::new(),
        };

        let control_plane_url = std::env::var("FLEET_CONTROL_PLANE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

        let data_dir = std::env::var("FLEET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/fleet"));

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let defaults = LifecycleConfig::default();
        let lifecycle = LifecycleConfig {
            max_prepare_retries: env_parse("FLEET_MAX_PREPARE_RETRIES")?
                .unwrap_or(defaults.max_prepare_retries),
            prepare_retry_delay: env_secs("FLEET_PREPARE_RETRY_DELAY_SECS")?
                .unwrap_or(defaults.prepare_retry_delay),
            replication_retry_delay: env_secs("FLEET_REPLICATION_RETRY_DELAY_SECS")?
                .unwrap_or(defaults.replication_retry_delay),
            outbox_retry_delay: env_secs("FLEET_OUTBOX_RETRY_DELAY_SECS")?
                .unwrap_or(defaults.outbox_retry_delay),
            stop_timeout: env_secs("FLEET_STOP_TIMEOUT_SECS")?.unwrap_or(defaults.stop_timeout),
        };

        Ok(Self {
            node_id,
            control_plane_url,
            data_dir,
            log_level,
            lifecycle,
        })
    }

    /// Path of the SQLite database holding instances and their events.
    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("agent.db")
    }
}

/// Lifecycle timings shared by every instance manager.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Preparation attempts before the instance is destroyed.
    pub max_prepare_retries: u32,

    /// Pause between transient preparation failures.
    pub prepare_retry_delay: Duration,

    /// Pause after a failed cluster upsert.
    pub replication_retry_delay: Duration,

    /// Pause before re-publishing an event the bus rejected.
    pub outbox_retry_delay: Duration,

    /// Grace period before a forced stop escalates to SIGKILL.
    pub stop_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_prepare_retries: 3,
            prepare_retry_delay: Duration::from_secs(10),
            replication_retry_delay: Duration::from_secs(5),
            outbox_retry_delay: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {key}: {raw}")),
        Err(_) => Ok(None),
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_defaults() {
        let config = LifecycleConfig::default();
        assert_eq!(config.max_prepare_retries, 3);
        assert_eq!(config.prepare_retry_delay, Duration::from_secs(10));
        assert_eq!(config.replication_retry_delay, Duration::from_secs(5));
        assert_eq!(config.outbox_retry_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_env_parse_missing_is_none() {
        let value: Option<u32> = env_parse("FLEET_TEST_DEFINITELY_UNSET_VARIABLE").unwrap();
        assert!(value.is_none());
    }
}
