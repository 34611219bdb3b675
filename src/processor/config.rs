//! Processor configuration.
//!
//! Everything has a default; `from_env` overrides from `EVENTHUB_*`
//! variables:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `EVENTHUB_LOAD_BALANCING_INTERVAL_MS` | `load_balancing_interval` | 10000 |
//! | `EVENTHUB_OWNERSHIP_EXPIRATION_MS` | `ownership_expiration` | 30000 |
//! | `EVENTHUB_PREFETCH_COUNT` | `prefetch_count` | 500 |
//! | `EVENTHUB_INITIAL_POSITION` | `initial_position` | `earliest` |
//! | `EVENTHUB_OWNER_LEVEL` | `owner_level` (`none` disables) | 0 |
//! | `EVENTHUB_TRACK_LAST_ENQUEUED` | `track_last_enqueued_event_properties` | false |
//! | `EVENTHUB_CHECKPOINT_EVERY_EVENTS` | `checkpoint_policy` | unset |
//! | `EVENTHUB_CHECKPOINT_INTERVAL_MS` | `checkpoint_policy` | unset |
//! | `EVENTHUB_SHUTDOWN_TIMEOUT_MS` | `shutdown_timeout` | 5000 |

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_LOAD_BALANCING_INTERVAL, DEFAULT_OWNER_LEVEL, DEFAULT_OWNERSHIP_EXPIRATION,
    DEFAULT_PREFETCH_COUNT, DEFAULT_SHUTDOWN_TIMEOUT,
};
use crate::error::{ProcessorError, ProcessorResult};
use crate::types::EventPosition;

use super::transport::ReceiveOptions;

/// When the pump writes checkpoints on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointPolicy {
    /// Only `ProcessorEvent::update_checkpoint` writes checkpoints.
    #[default]
    Manual,
    /// After every n-th successfully processed event.
    EveryEvents(u64),
    /// After a successfully processed event once this much time has passed
    /// since the previous checkpoint.
    Interval(Duration),
}

impl CheckpointPolicy {
    /// Whether a checkpoint is due.
    pub fn is_due(&self, events_since_checkpoint: u64, elapsed_since_checkpoint: Duration) -> bool {
        match self {
            CheckpointPolicy::Manual => false,
            CheckpointPolicy::EveryEvents(n) => *n > 0 && events_since_checkpoint >= *n,
            CheckpointPolicy::Interval(d) => {
                events_since_checkpoint > 0 && elapsed_since_checkpoint >= *d
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    /// Fixed delay between balancing cycles.
    pub load_balancing_interval: Duration,
    /// Records older than this are up for grabs.
    pub ownership_expiration: Duration,
    pub prefetch_count: u32,
    /// Start position when no checkpoint exists and `initialize` does not override it.
    pub initial_position: EventPosition,
    pub checkpoint_policy: CheckpointPolicy,
    pub owner_level: Option<i64>,
    pub track_last_enqueued_event_properties: bool,
    /// Per-pump (and balancing task) wait before aborting on stop.
    pub shutdown_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            load_balancing_interval: DEFAULT_LOAD_BALANCING_INTERVAL,
            ownership_expiration: DEFAULT_OWNERSHIP_EXPIRATION,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            initial_position: EventPosition::Earliest,
            checkpoint_policy: CheckpointPolicy::Manual,
            owner_level: Some(DEFAULT_OWNER_LEVEL),
            track_last_enqueued_event_properties: false,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

fn env_or<T>(key: &str, default: T) -> ProcessorResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ProcessorError::Config(format!("Invalid {}: {}", key, e))),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> ProcessorResult<Duration> {
    env_or(key, default.as_millis() as u64).map(Duration::from_millis)
}

impl ProcessorConfig {
    /// Defaults overridden by `EVENTHUB_*` environment variables.
    pub fn from_env() -> ProcessorResult<Self> {
        let defaults = Self::default();

        let load_balancing_interval = env_millis(
            "EVENTHUB_LOAD_BALANCING_INTERVAL_MS",
            defaults.load_balancing_interval,
        )?;
        let ownership_expiration =
            env_millis("EVENTHUB_OWNERSHIP_EXPIRATION_MS", defaults.ownership_expiration)?;
        let prefetch_count = env_or("EVENTHUB_PREFETCH_COUNT", defaults.prefetch_count)?;
        let initial_position = env_or("EVENTHUB_INITIAL_POSITION", defaults.initial_position)?;
        let track_last_enqueued_event_properties = env_or(
            "EVENTHUB_TRACK_LAST_ENQUEUED",
            defaults.track_last_enqueued_event_properties,
        )?;
        let shutdown_timeout =
            env_millis("EVENTHUB_SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout)?;

        let owner_level = match std::env::var("EVENTHUB_OWNER_LEVEL") {
            Ok(raw) if raw.trim().eq_ignore_ascii_case("none") => None,
            Ok(raw) => Some(raw.trim().parse().map_err(|e| {
                ProcessorError::Config(format!("Invalid EVENTHUB_OWNER_LEVEL: {}", e))
            })?),
            Err(_) => defaults.owner_level,
        };

        let every_events: Option<u64> = match std::env::var("EVENTHUB_CHECKPOINT_EVERY_EVENTS") {
            Ok(_) => Some(env_or("EVENTHUB_CHECKPOINT_EVERY_EVENTS", 0)?),
            Err(_) => None,
        };
        let interval: Option<Duration> = match std::env::var("EVENTHUB_CHECKPOINT_INTERVAL_MS") {
            Ok(_) => Some(env_millis("EVENTHUB_CHECKPOINT_INTERVAL_MS", Duration::ZERO)?),
            Err(_) => None,
        };
        let checkpoint_policy = match (every_events, interval) {
            (Some(_), Some(_)) => {
                return Err(ProcessorError::Config(
                    "EVENTHUB_CHECKPOINT_EVERY_EVENTS and EVENTHUB_CHECKPOINT_INTERVAL_MS \
                     are mutually exclusive"
                        .to_string(),
                ));
            }
            (Some(n), None) => CheckpointPolicy::EveryEvents(n),
            (None, Some(d)) => CheckpointPolicy::Interval(d),
            (None, None) => defaults.checkpoint_policy,
        };

        Ok(Self {
            load_balancing_interval,
            ownership_expiration,
            prefetch_count,
            initial_position,
            checkpoint_policy,
            owner_level,
            track_last_enqueued_event_properties,
            shutdown_timeout,
        })
    }

    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.load_balancing_interval.is_zero() {
            errors.push("load_balancing_interval must be greater than zero".to_string());
        }

        // A healthy owner must get to renew before its record goes stale.
        if self.ownership_expiration <= self.load_balancing_interval {
            errors.push(format!(
                "ownership_expiration ({:?}) must be greater than load_balancing_interval ({:?})",
                self.ownership_expiration, self.load_balancing_interval
            ));
        }

        if self.prefetch_count == 0 {
            errors.push("prefetch_count must be at least 1".to_string());
        }

        if self.shutdown_timeout.is_zero() {
            errors.push("shutdown_timeout must be greater than zero".to_string());
        }

        match self.checkpoint_policy {
            CheckpointPolicy::EveryEvents(0) => {
                errors.push("checkpoint_policy EveryEvents count must be at least 1".to_string());
            }
            CheckpointPolicy::Interval(d) if d.is_zero() => {
                errors.push("checkpoint_policy Interval must be greater than zero".to_string());
            }
            _ => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Receive options every pump link is opened with.
    pub fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            owner_level: self.owner_level,
            track_last_enqueued_event_properties: self.track_last_enqueued_event_properties,
            prefetch_count: self.prefetch_count,
        }
    }

    pub fn with_load_balancing_interval(mut self, interval: Duration) -> Self {
        self.load_balancing_interval = interval;
        self
    }

    pub fn with_ownership_expiration(mut self, expiration: Duration) -> Self {
        self.ownership_expiration = expiration;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u32) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_initial_position(mut self, position: EventPosition) -> Self {
        self.initial_position = position;
        self
    }

    pub fn with_checkpoint_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint_policy = policy;
        self
    }

    pub fn with_owner_level(mut self, owner_level: Option<i64>) -> Self {
        self.owner_level = owner_level;
        self
    }

    pub fn with_track_last_enqueued_event_properties(mut self, track: bool) -> Self {
        self.track_last_enqueued_event_properties = track;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProcessorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.load_balancing_interval, Duration::from_secs(10));
        assert_eq!(config.ownership_expiration, Duration::from_secs(30));
        assert_eq!(config.initial_position, EventPosition::Earliest);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = ProcessorConfig::default()
            .with_load_balancing_interval(Duration::from_secs(30))
            .with_ownership_expiration(Duration::from_secs(30))
            .with_prefetch_count(0)
            .with_checkpoint_policy(CheckpointPolicy::EveryEvents(0));
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("ownership_expiration")));
        assert!(errors.iter().any(|e| e.contains("prefetch_count")));
        assert!(errors.iter().any(|e| e.contains("EveryEvents")));
    }

    #[test]
    fn test_checkpoint_policy_is_due() {
        assert!(!CheckpointPolicy::Manual.is_due(1000, Duration::from_secs(3600)));

        let every = CheckpointPolicy::EveryEvents(3);
        assert!(!every.is_due(2, Duration::ZERO));
        assert!(every.is_due(3, Duration::ZERO));

        let interval = CheckpointPolicy::Interval(Duration::from_secs(5));
        assert!(!interval.is_due(1, Duration::from_secs(4)));
        assert!(interval.is_due(1, Duration::from_secs(5)));
        assert!(!interval.is_due(0, Duration::from_secs(60)));
    }

    #[test]
    fn test_receive_options_follow_config() {
        let options = ProcessorConfig::default()
            .with_prefetch_count(5)
            .with_owner_level(None)
            .with_track_last_enqueued_event_properties(true)
            .receive_options();
        assert_eq!(options.prefetch_count, 5);
        assert_eq!(options.owner_level, None);
        assert!(options.track_last_enqueued_event_properties);
    }
}
