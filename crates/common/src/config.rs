//! Coordinator timing configuration.
//!
//! The three phase deadlines (pre-params acquisition, keygen, keysign) are
//! each measured from the moment their phase begins.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::ProtocolKind;

/// Default keygen phase deadline.
pub const DEFAULT_KEYGEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default keysign phase deadline.
pub const DEFAULT_KEYSIGN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for obtaining pre-params.
pub const DEFAULT_PRE_PARAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for every participant to become ready.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between readiness announcements.
pub const DEFAULT_READY_INTERVAL: Duration = Duration::from_millis(500);

/// Default time a terminated session id is remembered to quiet stray traffic.
pub const DEFAULT_SESSION_RETENTION: Duration = Duration::from_secs(10);

/// Default interval of the tombstone cleanup task.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// Serialize durations as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Session timing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TssConfig {
    #[serde(with = "duration_ms", rename = "keygen_timeout_ms")]
    pub keygen_timeout: Duration,
    #[serde(with = "duration_ms", rename = "keysign_timeout_ms")]
    pub keysign_timeout: Duration,
    #[serde(with = "duration_ms", rename = "pre_param_timeout_ms")]
    pub pre_param_timeout: Duration,
    #[serde(with = "duration_ms", rename = "join_timeout_ms")]
    pub join_timeout: Duration,
    #[serde(with = "duration_ms", rename = "ready_interval_ms")]
    pub ready_interval: Duration,
    #[serde(with = "duration_ms", rename = "session_retention_ms")]
    pub session_retention: Duration,
    #[serde(with = "duration_ms", rename = "cleanup_interval_ms")]
    pub cleanup_interval: Duration,
}

impl Default for TssConfig {
    fn default() -> Self {
        Self {
            keygen_timeout: DEFAULT_KEYGEN_TIMEOUT,
            keysign_timeout: DEFAULT_KEYSIGN_TIMEOUT,
            pre_param_timeout: DEFAULT_PRE_PARAM_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            ready_interval: DEFAULT_READY_INTERVAL,
            session_retention: DEFAULT_SESSION_RETENTION,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl TssConfig {
    /// Deadline for the running phase of a protocol.
    pub fn protocol_timeout(&self, kind: ProtocolKind) -> Duration {
        match kind {
            ProtocolKind::Keygen => self.keygen_timeout,
            ProtocolKind::Keysign => self.keysign_timeout,
        }
    }

    /// Reject configurations that would make every session fail.
    pub fn validate(&self) -> Result<(), String> {
        let named = [
            ("keygen_timeout", self.keygen_timeout),
            ("keysign_timeout", self.keysign_timeout),
            ("pre_param_timeout", self.pre_param_timeout),
            ("join_timeout", self.join_timeout),
            ("ready_interval", self.ready_interval),
            ("cleanup_interval", self.cleanup_interval),
        ];
        for (name, value) in named {
            if value.is_zero() {
                return Err(format!("{} must be greater than zero", name));
            }
        }
        if self.ready_interval >= self.join_timeout {
            return Err("ready_interval must be shorter than join_timeout".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TssConfig::default();
        assert_eq!(config.keygen_timeout, Duration::from_secs(30));
        assert_eq!(config.keysign_timeout, Duration::from_secs(30));
        assert_eq!(config.pre_param_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_protocol_timeout_by_kind() {
        let config = TssConfig {
            keygen_timeout: Duration::from_secs(7),
            keysign_timeout: Duration::from_secs(9),
            ..Default::default()
        };
        assert_eq!(
            config.protocol_timeout(ProtocolKind::Keygen),
            Duration::from_secs(7)
        );
        assert_eq!(
            config.protocol_timeout(ProtocolKind::Keysign),
            Duration::from_secs(9)
        );
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = TssConfig {
            join_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("join_timeout"));
    }

    #[test]
    fn test_serialized_as_millis() {
        let config = TssConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["keygen_timeout_ms"], 30_000);

        let parsed: TssConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
