//! Engine configuration.

use crate::retry::RetryPolicy;
use crate::store::DefaultTaskPolicy;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid relay config: {0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub retry: RetryPolicy,
    /// How long a `Sent` task may wait for confirmation before it times out.
    #[serde(default = "default_confirmation_window_secs")]
    pub confirmation_window_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Pause before re-subscribing to a watch stream that ended without a final event.
    #[serde(default = "default_watch_resubscribe_ms")]
    pub watch_resubscribe_ms: u64,
    /// Upper bound on tasks scanned by one sweep or recovery pass.
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
    #[serde(default)]
    pub default_task: DefaultTaskPolicy,
    /// Dispatch the first submission as soon as a task is opened.
    #[serde(default = "default_auto_submit")]
    pub auto_submit: bool,
}

fn default_confirmation_window_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_watch_resubscribe_ms() -> u64 {
    1_000
}

fn default_scan_limit() -> usize {
    1_000
}

fn default_auto_submit() -> bool {
    true
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            confirmation_window_secs: default_confirmation_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            watch_resubscribe_ms: default_watch_resubscribe_ms(),
            scan_limit: default_scan_limit(),
            default_task: DefaultTaskPolicy::default(),
            auto_submit: default_auto_submit(),
        }
    }
}

impl RelayConfig {
    pub fn confirmation_window(&self) -> Duration {
        Duration::from_secs(self.confirmation_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn watch_resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.watch_resubscribe_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError("retry.max_attempts must be >= 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        // One day keeps every computed deadline well inside chrono's range.
        if self.retry.max_delay_ms > 86_400_000 {
            return Err(ConfigError("retry.max_delay_ms must be <= 86400000".into()));
        }
        if self.confirmation_window_secs == 0 {
            return Err(ConfigError("confirmation_window_secs must be >= 1".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError("sweep_interval_secs must be >= 1".into()));
        }
        if self.scan_limit == 0 {
            return Err(ConfigError("scan_limit must be >= 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;

    #[test]
    fn defaults_are_valid() {
        let cfg = RelayConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.confirmation_window(), Duration::from_secs(600));
        assert_eq!(
            cfg.default_task,
            DefaultTaskPolicy::LatestOfKind(TaskKind::NewPayment)
        );
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: RelayConfig = serde_json::from_value(serde_json::json!({
            "retry": { "max_attempts": 5 },
            "default_task": { "policy": "oldest_unfinished" }
        }))
        .unwrap();
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.base_delay_ms, 1_000);
        assert_eq!(cfg.default_task, DefaultTaskPolicy::OldestUnfinished);
        assert!(cfg.auto_submit);
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut cfg = RelayConfig::default();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }
}
