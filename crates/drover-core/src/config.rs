use std::time::Duration;

use serde::Deserialize;

use crate::message::TaskMessage;

/// Engine tuning shared by every executor spawned from one registry.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// In-flight cap applied when a task does not set one.
    pub default_concurrency: u32,

    /// Per-node timeout applied when a task does not set one.
    pub default_timeout_seconds: u32,

    /// Extra status-channel capacity on top of a task's concurrency.
    pub status_channel_slack: usize,

    /// Cadence of the per-job timeout watchers (supports fractional seconds).
    pub watch_poll_interval_secs: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_concurrency: std::env::var("DROVER_DEFAULT_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            default_timeout_seconds: std::env::var("DROVER_DEFAULT_TIMEOUT_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            status_channel_slack: std::env::var("DROVER_STATUS_CHANNEL_SLACK")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            watch_poll_interval_secs: std::env::var("DROVER_WATCH_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1.0),
        }
    }
}

impl EngineConfig {
    /// Effective in-flight cap for a task; zero in the message means "use default".
    pub fn concurrency_for(&self, task: &TaskMessage) -> usize {
        let concurrency = if task.concurrency == 0 {
            self.default_concurrency
        } else {
            task.concurrency
        };
        concurrency.max(1) as usize
    }

    /// Effective per-node timeout for a task; zero in the message means "use default".
    pub fn timeout_for(&self, task: &TaskMessage) -> Duration {
        let seconds = if task.timeout_seconds == 0 {
            self.default_timeout_seconds
        } else {
            task.timeout_seconds
        };
        Duration::from_secs(u64::from(seconds))
    }

    pub fn status_channel_capacity(&self, concurrency: usize) -> usize {
        concurrency + self.status_channel_slack.max(1)
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.watch_poll_interval_secs.max(0.01))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn sample_task(concurrency: u32, timeout_seconds: u32) -> TaskMessage {
        TaskMessage {
            concurrency,
            timeout_seconds,
            ..TaskMessage::new("upgrade", "job-a")
        }
    }

    #[test]
    fn test_default_config_has_sane_values() {
        let _guard = env_lock().lock().expect("env lock");
        let config = EngineConfig::default();

        assert!(config.default_concurrency >= 1);
        assert!(config.default_timeout_seconds > 0);
        assert!(config.status_channel_slack > 0);
        assert!(config.watch_poll_interval_secs > 0.0);
    }

    #[test]
    fn test_task_defaults_apply_when_message_fields_are_zero() {
        let _guard = env_lock().lock().expect("env lock");
        let config = EngineConfig {
            default_concurrency: 1,
            default_timeout_seconds: 300,
            status_channel_slack: 10,
            watch_poll_interval_secs: 1.0,
        };

        assert_eq!(config.concurrency_for(&sample_task(0, 0)), 1);
        assert_eq!(config.concurrency_for(&sample_task(4, 0)), 4);
        assert_eq!(
            config.timeout_for(&sample_task(0, 0)),
            Duration::from_secs(300)
        );
        assert_eq!(
            config.timeout_for(&sample_task(0, 20)),
            Duration::from_secs(20)
        );
        assert_eq!(config.status_channel_capacity(4), 14);
    }

    #[test]
    fn test_default_config_reads_env_overrides_and_fallbacks() {
        let _guard = env_lock().lock().expect("env lock");
        let previous = [
            (
                "DROVER_DEFAULT_CONCURRENCY",
                std::env::var("DROVER_DEFAULT_CONCURRENCY").ok(),
            ),
            (
                "DROVER_DEFAULT_TIMEOUT_SECONDS",
                std::env::var("DROVER_DEFAULT_TIMEOUT_SECONDS").ok(),
            ),
            (
                "DROVER_STATUS_CHANNEL_SLACK",
                std::env::var("DROVER_STATUS_CHANNEL_SLACK").ok(),
            ),
            (
                "DROVER_WATCH_POLL_INTERVAL_SECS",
                std::env::var("DROVER_WATCH_POLL_INTERVAL_SECS").ok(),
            ),
        ];

        unsafe {
            std::env::set_var("DROVER_DEFAULT_CONCURRENCY", "3");
            std::env::set_var("DROVER_DEFAULT_TIMEOUT_SECONDS", "45");
            std::env::set_var("DROVER_STATUS_CHANNEL_SLACK", "2");
            std::env::set_var("DROVER_WATCH_POLL_INTERVAL_SECS", "0.25");
        }
        let config = EngineConfig::default();
        assert_eq!(config.default_concurrency, 3);
        assert_eq!(config.default_timeout_seconds, 45);
        assert_eq!(config.status_channel_slack, 2);
        assert_eq!(config.watch_poll_interval_secs, 0.25);

        unsafe {
            std::env::set_var("DROVER_DEFAULT_CONCURRENCY", "not-a-number");
            std::env::set_var("DROVER_DEFAULT_TIMEOUT_SECONDS", "bad");
        }
        let fallback = EngineConfig::default();
        assert_eq!(fallback.default_concurrency, 1);
        assert_eq!(fallback.default_timeout_seconds, 300);

        for (key, value) in previous {
            match value {
                Some(v) => unsafe { std::env::set_var(key, v) },
                None => unsafe { std::env::remove_var(key) },
            }
        }
    }
}
