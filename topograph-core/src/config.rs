use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;

/// Tuning knobs for the discovery protocol, loadable from configuration.
///
/// All durations accept human-readable forms (`"30s"`, `"2m"`) when
/// deserialized. [`DiscoveryConfig::validate`] must pass before a service is
/// constructed; a timeout that does not exceed the heartbeat interval is the
/// one configuration mistake that prevents the protocol from starting at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Stable identifier for the local instance (auto-generated if empty).
    pub instance_id: String,
    /// Cadence of liveness-record writes.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Age at which a peer's heartbeat record is classified as timed out.
    /// Must exceed `heartbeat_interval` by a safety margin.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// Cadence of view checks (classification + voting analysis).
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    /// Minimum spacing between settled topology events, coalescing rapid
    /// membership flapping into one transition.
    #[serde(with = "humantime_serde")]
    pub min_event_delay: Duration,
    /// How long a candidate membership set must stay unchanged before a new
    /// voting may be opened for it.
    #[serde(with = "humantime_serde")]
    pub voting_stability_window: Duration,
    /// Bounded retry count for optimistic-concurrency heartbeat writes.
    pub store_retry_limit: u32,
    /// Instance records older than `heartbeat_timeout` times this factor are
    /// removed from the store. Zero disables removal.
    pub stale_instance_multiplier: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(120),
            check_interval: Duration::from_secs(30),
            min_event_delay: Duration::from_secs(3),
            voting_stability_window: Duration::from_secs(30),
            store_retry_limit: 3,
            stale_instance_multiplier: 3,
        }
    }
}

impl DiscoveryConfig {
    /// Rejects configurations the protocol cannot run with.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.heartbeat_interval.is_zero() {
            return Err(DiscoveryError::Configuration(
                "heartbeat_interval must be non-zero".to_string(),
            ));
        }
        if self.check_interval.is_zero() {
            return Err(DiscoveryError::Configuration(
                "check_interval must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(DiscoveryError::Configuration(format!(
                "heartbeat_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            )));
        }
        Ok(())
    }

    /// Heartbeat timeout in unix milliseconds.
    #[must_use]
    pub fn heartbeat_timeout_ms(&self) -> u64 {
        duration_ms(self.heartbeat_timeout)
    }

    /// Minimum event spacing in unix milliseconds.
    #[must_use]
    pub fn min_event_delay_ms(&self) -> u64 {
        duration_ms(self.min_event_delay)
    }

    /// Voting stability window in unix milliseconds.
    #[must_use]
    pub fn voting_stability_window_ms(&self) -> u64 {
        duration_ms(self.voting_stability_window)
    }

    /// Age beyond which a timed-out instance record is deleted, or zero when
    /// removal is disabled.
    #[must_use]
    pub fn stale_instance_after_ms(&self) -> u64 {
        self.heartbeat_timeout_ms()
            .saturating_mul(u64::from(self.stale_instance_multiplier))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        DiscoveryConfig::default().validate().unwrap();
    }

    #[test]
    fn timeout_must_exceed_interval() {
        let config = DiscoveryConfig {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(30),
            ..DiscoveryConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, DiscoveryError::Configuration(_)));
    }

    #[test]
    fn durations_deserialize_from_humantime() {
        let config: DiscoveryConfig = serde_json::from_value(serde_json::json!({
            "instance_id": "node-a",
            "heartbeat_interval": "15s",
            "heartbeat_timeout": "1m",
            "check_interval": "15s",
        }))
        .unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(config.min_event_delay, Duration::from_secs(3));
        config.validate().unwrap();
    }
}
