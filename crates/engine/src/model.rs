//! Stored records and request/response types

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_directory::SecretString;

use crate::error::{EngineError, Result};

/// Shortest accepted static rotation period
pub const MIN_ROTATION_PERIOD: Duration = Duration::from_secs(5);

/// Username template used when a dynamic role does not set one
pub const DEFAULT_USERNAME_TEMPLATE: &str =
    "v_{{.DisplayName}}_{{.RoleName}}_{{random 10}}_{{unix_time}}";

/// Static role record stored at `static-role/<name>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRole {
    /// Role name
    pub name: String,
    /// Directory-side identity
    pub username: String,
    /// Distinguished name; preferred over `username` when set
    #[serde(default)]
    pub dn: String,
    /// Time between rotations
    #[serde(with = "warden_directory::duration")]
    pub rotation_period: Duration,
    /// Last successful rotation by the engine
    #[serde(default)]
    pub last_vault_rotation: Option<DateTime<Utc>>,
    /// Current password
    #[serde(default)]
    pub password: SecretString,
    /// Password before the last rotation
    #[serde(default)]
    pub last_password: SecretString,
}

impl StaticRole {
    /// Unix second at which the role is next due, counting from `now` when
    /// it was never rotated
    pub fn next_rotation(&self, now: DateTime<Utc>) -> i64 {
        let base = self.last_vault_rotation.unwrap_or(now).timestamp();
        base.saturating_add(self.rotation_period.as_secs() as i64)
    }
}

/// Create or update parameters for a static role
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticRoleRequest {
    /// Directory-side identity; required on create and immutable after
    pub username: Option<String>,
    /// Distinguished name
    pub dn: Option<String>,
    /// Rotation period; required on create
    #[serde(with = "optional_duration")]
    pub rotation_period: Option<Duration>,
    /// Skip the initial rotation on create; defaults to the mount setting
    pub skip_import_rotation: Option<bool>,
}

/// Static credentials as returned to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaticCredentials {
    /// Directory-side identity
    pub username: String,
    /// Distinguished name, empty when unset
    pub dn: String,
    /// Current password
    pub password: SecretString,
    /// Previous password
    pub last_password: SecretString,
    /// Last rotation by the engine
    pub last_vault_rotation: DateTime<Utc>,
    /// Rotation period
    #[serde(with = "humantime_serde")]
    pub rotation_period: Duration,
    /// Time left until the next scheduled rotation
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

/// Password record stored at `creds/<role>` and `password/<account>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Current password
    pub current_password: SecretString,
    /// Previous password, if tracked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_password: Option<SecretString>,
}

/// Dynamic role stored at `role/<name>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicRole {
    /// Role name
    #[serde(default)]
    pub name: String,
    /// LDIF template applied on lease creation
    pub creation_ldif: String,
    /// LDIF template applied on revocation
    pub deletion_ldif: String,
    /// LDIF template applied when creation fails part way
    #[serde(default)]
    pub rollback_ldif: String,
    /// Template producing the username
    #[serde(default = "default_username_template")]
    pub username_template: String,
    /// Lease TTL; zero falls back to the mount TTL
    #[serde(default, with = "warden_directory::duration")]
    pub default_ttl: Duration,
    /// Maximum lease TTL; zero falls back to the mount maximum
    #[serde(default, with = "warden_directory::duration")]
    pub max_ttl: Duration,
}

fn default_username_template() -> String {
    DEFAULT_USERNAME_TEMPLATE.to_string()
}

impl DynamicRole {
    /// Role with the default username template and no TTLs
    pub fn new(
        name: impl Into<String>,
        creation_ldif: impl Into<String>,
        deletion_ldif: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            creation_ldif: creation_ldif.into(),
            deletion_ldif: deletion_ldif.into(),
            rollback_ldif: String::new(),
            username_template: default_username_template(),
            default_ttl: Duration::ZERO,
            max_ttl: Duration::ZERO,
        }
    }
}

/// Payload every dynamic LDIF template renders against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateData {
    /// Generated username
    pub username: String,
    /// Generated password
    pub password: SecretString,
    /// Display name of the requesting client
    pub display_name: String,
    /// Dynamic role name
    pub role_name: String,
    /// Issue time, RFC 3339
    pub issue_time: String,
    /// Issue time, unix seconds
    pub issue_time_seconds: i64,
    /// Expiration time, RFC 3339
    pub expiration_time: String,
    /// Expiration time, unix seconds
    pub expiration_time_seconds: i64,
}

impl TemplateData {
    /// Payload for a lease issued at `issued` lasting `ttl`
    pub fn new(
        username: String,
        password: SecretString,
        display_name: &str,
        role_name: &str,
        issued: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let expires = issued + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        Self {
            username,
            password,
            display_name: display_name.to_string(),
            role_name: role_name.to_string(),
            issue_time: issued.to_rfc3339(),
            issue_time_seconds: issued.timestamp(),
            expiration_time: expires.to_rfc3339(),
            expiration_time_seconds: expires.timestamp(),
        }
    }
}

/// Lease timing handed back to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Time to live; zero lets the host decide
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Upper bound across renewals; zero lets the host decide
    #[serde(with = "humantime_serde")]
    pub max_ttl: Duration,
}

/// State kept with a dynamic lease so it can be revoked after the role
/// changes or disappears
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicLeaseState {
    /// Role that issued the lease
    pub name: String,
    /// Deletion template captured at issue time
    pub deletion_ldif: String,
    /// Payload the templates were rendered with
    pub template_data: TemplateData,
}

/// Credentials returned when a dynamic lease is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DynamicCredentials {
    /// Generated username
    pub username: String,
    /// Generated password
    pub password: SecretString,
    /// DNs the creation script touched, in script order
    pub distinguished_names: Vec<String>,
    /// Lease timing
    pub lease: Lease,
    /// State the host must hand back on renew and revoke
    pub state: DynamicLeaseState,
}

/// Check-out library stored at `library/<name>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibrarySet {
    /// Set name
    #[serde(default)]
    pub name: String,
    /// Accounts in check-out order
    pub service_account_names: Vec<String>,
    /// Lease TTL cap; zero means unbounded
    #[serde(default, with = "warden_directory::duration")]
    pub ttl: Duration,
    /// Maximum lease TTL; zero means unbounded
    #[serde(default, with = "warden_directory::duration")]
    pub max_ttl: Duration,
    /// Let anyone check accounts in
    #[serde(default)]
    pub disable_check_in_enforcement: bool,
}

impl LibrarySet {
    /// Set with the given accounts and no TTL limits
    pub fn new<I, S>(name: impl Into<String>, accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            service_account_names: accounts.into_iter().map(Into::into).collect(),
            ttl: Duration::ZERO,
            max_ttl: Duration::ZERO,
            disable_check_in_enforcement: false,
        }
    }

    /// Check structural invariants
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.service_account_names.is_empty() {
            return Err(EngineError::InvalidRequest(
                "service_account_names must not be empty".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for account in &self.service_account_names {
            if account.trim().is_empty() {
                return Err(EngineError::InvalidRequest(
                    "service account names must not be empty".to_string(),
                ));
            }
            if !seen.insert(account.as_str()) {
                return Err(EngineError::InvalidRequest(format!(
                    "service account '{account}' is listed twice"
                )));
            }
        }
        if !self.max_ttl.is_zero() && self.ttl > self.max_ttl {
            return Err(EngineError::InvalidRequest(
                "max_ttl must be greater than or equal to ttl".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `account` belongs to the set
    pub fn contains(&self, account: &str) -> bool {
        self.service_account_names.iter().any(|a| a == account)
    }

    /// Lease TTL for a request asking for `requested`; zero means unbounded
    /// on both sides
    pub fn lease_ttl(&self, requested: Duration) -> Duration {
        match (requested.is_zero(), self.ttl.is_zero()) {
            (true, _) => self.ttl,
            (false, true) => requested,
            (false, false) => requested.min(self.ttl),
        }
    }
}

/// Check-out record stored at `checkout/<account>`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckOut {
    /// Whether the account can be borrowed
    pub is_available: bool,
    /// Entity id of the borrower
    #[serde(default)]
    pub borrower_entity_id: String,
    /// Client token of the borrower
    #[serde(default)]
    pub borrower_client_token: String,
    /// When the current borrower took the account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_out_at: Option<DateTime<Utc>>,
}

impl CheckOut {
    /// Record for an account nobody holds
    pub fn available() -> Self {
        Self {
            is_available: true,
            ..Self::default()
        }
    }
}

/// Identity of a caller borrowing or returning an account
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Borrower {
    /// Entity id
    pub entity_id: String,
    /// Client token
    pub client_token: String,
}

impl Borrower {
    /// Caller with both identifiers
    pub fn new(entity_id: impl Into<String>, client_token: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            client_token: client_token.into(),
        }
    }

    /// Whether this caller borrowed the account behind `record`
    pub fn owns(&self, record: &CheckOut) -> bool {
        (!self.entity_id.is_empty() && self.entity_id == record.borrower_entity_id)
            || (!self.client_token.is_empty() && self.client_token == record.borrower_client_token)
    }
}

/// Credentials returned on check-out
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckedOutCredentials {
    /// Set the account came from
    pub set_name: String,
    /// Borrowed account
    pub service_account_name: String,
    /// Its current password
    pub password: SecretString,
    /// Lease timing
    pub lease: Lease,
}

/// Per-account availability in a library
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountStatus {
    /// Account name
    pub service_account_name: String,
    /// Whether it can be borrowed
    pub available: bool,
    /// Borrower entity id, when held
    #[serde(skip_serializing_if = "String::is_empty")]
    pub borrower_entity_id: String,
    /// Borrower client token, when held
    #[serde(skip_serializing_if = "String::is_empty")]
    pub borrower_client_token: String,
}

/// Reject empty names and names that would escape their namespace
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::InvalidRequest("name must not be empty".to_string()));
    }
    if name.starts_with('/') || name.ends_with('/') || name.split('/').any(str::is_empty) {
        return Err(EngineError::InvalidRequest(format!("invalid name '{name}'")));
    }
    Ok(())
}

mod optional_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => warden_directory::duration::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "warden_directory::duration")] Duration);

        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(d)| d))
    }
}
