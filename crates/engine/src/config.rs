//! Mount configuration and process settings
//!
//! [`MountConfig`] is the record stored at `config`: the directory settings
//! plus lease TTLs and password generation. [`EngineSettings`] is process
//! level and never stored.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_directory::{DirectoryConfig, SecretString};

use crate::error::{EngineError, Result};
use crate::password;

/// Mount configuration record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Directory connection settings
    #[serde(flatten)]
    pub directory: DirectoryConfig,
    /// Default lease TTL; zero defers to the host
    #[serde(with = "warden_directory::duration")]
    pub ttl: Duration,
    /// Maximum lease TTL; zero defers to the host
    #[serde(with = "warden_directory::duration")]
    pub max_ttl: Duration,
    /// Named password policy; exclusive with `length` and `formatter`
    pub password_policy: String,
    /// Legacy generated password length; zero means the default of 64
    pub length: usize,
    /// Legacy formatter containing exactly one `{{PASSWORD}}`
    pub formatter: String,
    /// Tolerance for comparing rotation timestamps
    ///
    /// Validated and stored so existing mount configurations round-trip;
    /// no rotation or recovery decision reads it.
    #[serde(with = "warden_directory::duration")]
    pub last_rotation_tolerance: Duration,
    /// Default for `skip_import_rotation` on new static roles
    pub skip_static_role_import_rotation: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            directory: DirectoryConfig::default(),
            ttl: Duration::ZERO,
            max_ttl: Duration::ZERO,
            password_policy: String::new(),
            length: 0,
            formatter: String::new(),
            last_rotation_tolerance: Duration::from_secs(5),
            skip_static_role_import_rotation: false,
        }
    }
}

impl MountConfig {
    /// Validate before persisting
    pub fn validate(&self) -> Result<()> {
        self.directory
            .validate()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        if !self.max_ttl.is_zero() && self.ttl > self.max_ttl {
            return Err(EngineError::InvalidConfig(
                "ttl must be smaller than or equal to max_ttl".to_string(),
            ));
        }
        password::validate_settings(self)
    }

    /// Copy safe to return to callers: secrets blanked
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.directory.bindpass = SecretString::default();
        copy.directory.client_tls_key = SecretString::default();
        copy
    }
}

/// Replication role of the node hosting the mount
///
/// Recovery and the rotation ticker only run on the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationState {
    /// Accepts writes and drives rotations
    #[default]
    Primary,
    /// Replicated copy in another cluster
    Secondary,
    /// Standby in the primary's cluster
    Standby,
}

impl ReplicationState {
    /// Whether background rotation runs here
    pub fn is_primary(self) -> bool {
        self == Self::Primary
    }
}

/// Backoff schedule for restoring the old root password
///
/// Attempt `i` (counting from zero) waits `unit * i²` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPolicy {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Base delay
    #[serde(with = "humantime_serde")]
    pub unit: Duration,
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            unit: Duration::from_secs(1),
        }
    }
}

impl RollbackPolicy {
    /// Wait before attempt `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(attempt.saturating_mul(attempt))
    }
}

/// Process-level engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Ticker period
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Time budget for one ticker-driven swap
    #[serde(with = "humantime_serde")]
    pub swap_timeout: Duration,
    /// Delay before a failed rotation is retried
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Credential read cache lifetime
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Root rotation rollback schedule
    pub rollback: RollbackPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            swap_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(10),
            cache_ttl: Duration::from_millis(500),
            rollback: RollbackPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn valid() -> MountConfig {
        MountConfig {
            directory: DirectoryConfig {
                url: "ldap://dc1".to_string(),
                binddn: "cn=admin,dc=example,dc=com".to_string(),
                bindpass: SecretString::new("pw"),
                ..DirectoryConfig::default()
            },
            ..MountConfig::default()
        }
    }

    #[test]
    fn rollback_schedule_is_quadratic() {
        let policy = RollbackPolicy::default();
        let waits: Vec<u64> = (0..policy.max_attempts)
            .map(|i| policy.delay(i).as_secs())
            .collect();
        assert_eq!(waits, vec![0, 1, 4, 9, 16, 25, 36, 49, 64, 81]);
    }

    #[test]
    fn stored_record_is_flat() {
        let json = serde_json::to_value(valid()).unwrap();
        assert_eq!(json["url"], "ldap://dc1");
        assert_eq!(json["bindpass"], "pw");

        let parsed: MountConfig = serde_json::from_str(
            r#"{"url":"ldaps://dc2","binddn":"cn=a","ttl":"1h","max_ttl":7200,"length":20}"#,
        )
        .unwrap();
        assert_eq!(parsed.directory.url, "ldaps://dc2");
        assert_eq!(parsed.ttl, Duration::from_secs(3600));
        assert_eq!(parsed.max_ttl, Duration::from_secs(7200));
        assert_eq!(parsed.length, 20);
    }

    #[test]
    fn rotation_tolerance_is_kept_as_written() {
        let parsed: MountConfig =
            serde_json::from_str(r#"{"url":"ldap://dc1","last_rotation_tolerance":"30s"}"#).unwrap();
        assert_eq!(parsed.last_rotation_tolerance, Duration::from_secs(30));
        let json = serde_json::to_value(&parsed).unwrap();
        assert_eq!(json["last_rotation_tolerance"], "30s");
        assert_eq!(MountConfig::default().last_rotation_tolerance, Duration::from_secs(5));
    }

    #[test]
    fn ttl_ordering_is_checked() {
        let cfg = MountConfig {
            ttl: Duration::from_secs(10),
            max_ttl: Duration::from_secs(5),
            ..valid()
        };
        assert!(cfg.validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn redaction_blanks_secrets() {
        let cfg = valid().redacted();
        assert!(cfg.directory.bindpass.is_empty());
        assert_eq!(cfg.directory.binddn, "cn=admin,dc=example,dc=com");
    }

    #[test]
    fn settings_parse_humantime() {
        let s: EngineSettings =
            serde_json::from_str(r#"{"tick_interval":"1s","rollback":{"max_attempts":3,"unit":"10ms"}}"#)
                .unwrap();
        assert_eq!(s.tick_interval, Duration::from_secs(1));
        assert_eq!(s.rollback.delay(2), Duration::from_millis(40));
        assert_eq!(s.retry_delay, Duration::from_secs(10));
    }
}
