//! Password generation
//!
//! A mount either names a host policy ([`PasswordPolicies`]) or uses the
//! legacy length/formatter pair. Legacy passwords are base62 with the
//! complexity prefix `?@09AZ`, or the random part substituted for the single
//! `{{PASSWORD}}` marker in the formatter.

use async_trait::async_trait;
use warden_directory::SecretString;
use warden_directory::template::random_base62;

use crate::config::MountConfig;
use crate::error::{EngineError, Result};

/// Prefix that satisfies common complexity rules
pub const COMPLEXITY_PREFIX: &str = "?@09AZ";

/// Marker replaced by the random part of a formatted password
pub const PASSWORD_MARKER: &str = "{{PASSWORD}}";

/// Length used when the mount leaves `length` at zero
pub const DEFAULT_LENGTH: usize = 64;

/// Shortest password that will be generated
pub const MIN_LENGTH: usize = 8;

/// Shortest legacy length accepted without a formatter
const MIN_UNFORMATTED_LENGTH: usize = 14;

/// Host-provided policy engine
#[async_trait]
pub trait PasswordPolicies: Send + Sync {
    /// Generate a password that satisfies the named policy
    async fn generate_from_policy(&self, policy: &str) -> Result<SecretString>;
}

/// Policy engine returning a fixed password for every policy
#[derive(Debug, Clone)]
pub struct StaticPasswordPolicies {
    password: SecretString,
}

impl StaticPasswordPolicies {
    /// Always hand out `password`
    pub fn new(password: impl Into<SecretString>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl PasswordPolicies for StaticPasswordPolicies {
    async fn generate_from_policy(&self, _policy: &str) -> Result<SecretString> {
        Ok(self.password.clone())
    }
}

/// Check the password settings of a mount configuration
pub fn validate_settings(config: &MountConfig) -> Result<()> {
    if !config.password_policy.is_empty() {
        if config.length != 0 || !config.formatter.is_empty() {
            return Err(EngineError::InvalidConfig(
                "password_policy cannot be combined with length or formatter".to_string(),
            ));
        }
        return Ok(());
    }
    let length = effective_length(config.length);
    if config.formatter.is_empty() {
        if length < MIN_UNFORMATTED_LENGTH {
            return Err(EngineError::InvalidConfig(format!(
                "length must be at least {MIN_UNFORMATTED_LENGTH}"
            )));
        }
        return Ok(());
    }
    let markers = config.formatter.matches(PASSWORD_MARKER).count();
    if markers != 1 {
        return Err(EngineError::InvalidConfig(format!(
            "formatter must contain exactly one {PASSWORD_MARKER}, found {markers}"
        )));
    }
    random_len(length, &config.formatter).map(|_| ())
}

/// Generate a password for `config`
pub async fn generate(
    config: &MountConfig,
    policies: Option<&dyn PasswordPolicies>,
) -> Result<SecretString> {
    if !config.password_policy.is_empty() {
        let Some(policies) = policies else {
            return Err(EngineError::InvalidConfig(format!(
                "password policy '{}' is configured but no policy engine is available",
                config.password_policy
            )));
        };
        let password = policies.generate_from_policy(&config.password_policy).await?;
        if password.is_empty() {
            return Err(EngineError::Internal(format!(
                "password policy '{}' produced an empty password",
                config.password_policy
            )));
        }
        return Ok(password);
    }
    legacy(effective_length(config.length), &config.formatter)
}

fn effective_length(length: usize) -> usize {
    if length == 0 { DEFAULT_LENGTH } else { length }
}

fn random_len(length: usize, formatter: &str) -> Result<usize> {
    let fixed = formatter.len().saturating_sub(PASSWORD_MARKER.len());
    let random = length.saturating_sub(fixed);
    if random + fixed < MIN_LENGTH || random == 0 {
        return Err(EngineError::InvalidConfig(format!(
            "length {length} leaves no room for a password of at least {MIN_LENGTH} characters in the formatter"
        )));
    }
    Ok(random)
}

fn legacy(length: usize, formatter: &str) -> Result<SecretString> {
    if formatter.is_empty() {
        if length < MIN_LENGTH {
            return Err(EngineError::InvalidConfig(format!(
                "length must be at least {MIN_LENGTH}"
            )));
        }
        let random = random_base62(length - COMPLEXITY_PREFIX.len());
        return Ok(SecretString::new(format!("{COMPLEXITY_PREFIX}{random}")));
    }
    let random = random_base62(random_len(length, formatter)?);
    Ok(SecretString::new(formatter.replacen(PASSWORD_MARKER, &random, 1)))
}
