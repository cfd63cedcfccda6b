//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use driftsync_common::{Error, Result};

use crate::conflict::ConflictStrategy;
use crate::retry::RetryConfig;

/// What happens to an outbox event after a terminal transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminalFailurePolicy {
    /// Move the event to the dead-letter list.
    #[default]
    DeadLetter,
    /// Delete the event.
    Discard,
}

/// Configuration of the outbox and its outgoing queue.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub terminal_failure_policy: TerminalFailurePolicy,
    /// Backoff applied to retryable transport failures.
    pub retry: RetryConfig,
}

/// Configuration of live queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserveQueryConfig {
    /// Flush a pre-sync batch once it holds this many events.
    pub max_batch_size: usize,
    /// Flush a pre-sync batch this long after its first event.
    pub batch_window: Duration,
    /// Snapshots buffered per subscription before the engine waits.
    pub snapshot_buffer: usize,
}

impl Default for ObserveQueryConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            batch_window: Duration::from_secs(2),
            snapshot_buffer: 64,
        }
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub outbox: OutboxConfig,
    pub observe_query: ObserveQueryConfig,
    /// Capacity of the model change broadcast channel.
    pub change_stream_capacity: usize,
    /// Capacity of the hub broadcast channel.
    pub hub_capacity: usize,
    /// Conflict strategy used when no custom handler is installed.
    pub conflict_strategy: ConflictStrategy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            outbox: OutboxConfig::default(),
            observe_query: ObserveQueryConfig::default(),
            change_stream_capacity: 4096,
            hub_capacity: 256,
            conflict_strategy: ConflictStrategy::default(),
        }
    }
}

impl SyncConfig {
    /// Load a configuration from a JSON file.
    ///
    /// Missing fields take their default value.
    ///
    /// # Errors
    /// - File cannot be read
    /// - Content is not valid JSON or fails validation
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).await.map_err(Error::Io)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("Invalid sync config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.observe_query.max_batch_size == 0 {
            return Err(Error::Configuration(
                "observe_query.max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.observe_query.snapshot_buffer == 0 {
            return Err(Error::Configuration(
                "observe_query.snapshot_buffer must be at least 1".to_string(),
            ));
        }
        if self.change_stream_capacity == 0 || self.hub_capacity == 0 {
            return Err(Error::Configuration(
                "broadcast capacities must be at least 1".to_string(),
            ));
        }
        if self.outbox.retry.backoff_multiplier < 1.0 {
            return Err(Error::Configuration(
                "outbox.retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.observe_query.max_batch_size, 1000);
        assert_eq!(config.observe_query.batch_window, Duration::from_secs(2));
        assert_eq!(
            config.outbox.terminal_failure_policy,
            TerminalFailurePolicy::DeadLetter
        );
        assert_eq!(config.outbox.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(config.outbox.retry.max_delay, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = SyncConfig::default();
        config.outbox.terminal_failure_policy = TerminalFailurePolicy::Discard;
        config.observe_query.max_batch_size = 10;

        let json = config.to_json().unwrap();
        assert!(json.contains("\"discard\""));
        assert_eq!(SyncConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            SyncConfig::from_json(r#"{"outbox":{"terminal_failure_policy":"discard"}}"#).unwrap();
        assert_eq!(
            config.outbox.terminal_failure_policy,
            TerminalFailurePolicy::Discard
        );
        assert_eq!(config.observe_query, ObserveQueryConfig::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = SyncConfig::from_json(r#"{"observe_query":{"max_batch_size":0}}"#);
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert!(SyncConfig::from_json("not json").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sync.json");
        tokio::fs::write(&path, r#"{"hub_capacity":16}"#).await.unwrap();

        let config = SyncConfig::load(&path).await.unwrap();
        assert_eq!(config.hub_capacity, 16);
        assert!(SyncConfig::load(temp.path().join("missing.json")).await.is_err());
    }
}
