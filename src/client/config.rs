//! Client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Job-discovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPattern {
    /// Periodic fetch only.
    Pull,
    /// Notification-driven fetch only.
    Push,
    /// Both; push reacts fast, pull converges.
    #[default]
    Hybrid,
    /// No discovery loops; the client only produces and queries.
    Disabled,
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Stable identity for this worker instance. Must be unique across the
    /// fleet; a random id is generated when unset.
    pub id: Option<String>,
    /// Which job-discovery loops run.
    pub sync_pattern: SyncPattern,
    /// Milliseconds between pull attempts.
    pub pull_interval_ms: u64,
    /// Maximum jobs per fetch call.
    pub batch_size: u32,
    /// Worker-pool size per action.
    pub action_concurrency_limit: usize,
    /// Default group admission limit when the action does not override.
    pub group_concurrency_limit: i64,
    /// Run schema migrations on start.
    pub migrate_on_start: bool,
    /// Recover orphaned jobs on start.
    pub recover_jobs_on_start: bool,
    /// Use ping/pong liveness during recovery instead of assuming every
    /// foreign lease holder is dead.
    pub multi_process_mode: bool,
    /// Ping response deadline in milliseconds.
    pub process_timeout_ms: u64,
    /// Notification outbox poll interval in milliseconds.
    pub notifier_poll_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: None,
            sync_pattern: SyncPattern::Hybrid,
            pull_interval_ms: 5000,
            batch_size: 10,
            action_concurrency_limit: 100,
            group_concurrency_limit: 10,
            migrate_on_start: true,
            recover_jobs_on_start: true,
            multi_process_mode: false,
            process_timeout_ms: 5000,
            notifier_poll_interval_ms: 100,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_sync_pattern(mut self, pattern: SyncPattern) -> Self {
        self.sync_pattern = pattern;
        self
    }

    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_action_concurrency_limit(mut self, limit: usize) -> Self {
        self.action_concurrency_limit = limit;
        self
    }

    pub fn with_group_concurrency_limit(mut self, limit: i64) -> Self {
        self.group_concurrency_limit = limit;
        self
    }

    pub fn with_multi_process_mode(mut self, enabled: bool) -> Self {
        self.multi_process_mode = enabled;
        self
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub(crate) fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_interval_ms)
    }

    pub(crate) fn process_timeout(&self) -> Duration {
        Duration::from_millis(self.process_timeout_ms)
    }

    pub(crate) fn notifier_poll_interval(&self) -> Duration {
        Duration::from_millis(self.notifier_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.sync_pattern, SyncPattern::Hybrid);
        assert_eq!(config.pull_interval_ms, 5000);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.action_concurrency_limit, 100);
        assert_eq!(config.group_concurrency_limit, 10);
        assert!(config.migrate_on_start);
        assert!(config.recover_jobs_on_start);
        assert!(!config.multi_process_mode);
        assert_eq!(config.process_timeout_ms, 5000);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"syncPattern": null}"#).unwrap_or_default();
        assert_eq!(config.sync_pattern, SyncPattern::Hybrid);

        let config: ClientConfig =
            serde_json::from_str(r#"{"sync_pattern": "pull", "batch_size": 3}"#).unwrap();
        assert_eq!(config.sync_pattern, SyncPattern::Pull);
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.pull_interval_ms, 5000);
    }
}
