//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SignalResult, ValidationError};

/// Tunables shared by the scheduler, polling sources and notifiers.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Polling intervals below this are raised to it.
    pub min_poll_interval_ms: u64,
    /// Task budget for [`crate::Scheduler::run_until_idle`].
    pub max_turns: usize,
    /// Default buffer size for event streams.
    pub stream_capacity: usize,
    /// Text placed before the detector name in notification messages.
    pub notification_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_poll_interval_ms: 500,
            max_turns: 10_000,
            stream_capacity: 1024,
            notification_prefix: String::new(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a JSON document. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> SignalResult<Self> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values that would stall the engine.
    pub fn validate(&self) -> SignalResult<()> {
        if self.max_turns == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "max_turns must be at least 1".to_string(),
            }
            .into());
        }
        if self.stream_capacity == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "stream_capacity must be at least 1".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Raises `requested` to the configured polling floor.
    #[must_use]
    pub fn clamp_poll_interval(&self, requested: Duration) -> Duration {
        requested.max(Duration::from_millis(self.min_poll_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.min_poll_interval_ms, 500);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = EngineConfig::from_json_str(r#"{"max_turns": 16}"#).unwrap();
        assert_eq!(cfg.max_turns, 16);
        assert_eq!(cfg.stream_capacity, 1024);
    }

    #[test]
    fn zero_turns_rejected() {
        let err = EngineConfig::from_json_str(r#"{"max_turns": 0}"#).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn malformed_json_rejected() {
        let err = EngineConfig::from_json_str("{not json").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn poll_interval_clamped() {
        let cfg = EngineConfig::default();
        assert_eq!(
            cfg.clamp_poll_interval(Duration::from_millis(10)),
            Duration::from_millis(500)
        );
        assert_eq!(
            cfg.clamp_poll_interval(Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }
}
