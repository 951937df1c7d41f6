//! Error types for directory operations
//!
//! [`DirectoryError`] separates the three things a caller must react to
//! differently:
//! - the directory could not be reached at all ([`DirectoryError::Unavailable`]),
//! - the directory answered with an LDAP result code ([`DirectoryError::Rejected`]),
//! - the request was malformed before anything was sent
//!   ([`DirectoryError::InvalidConfig`], [`DirectoryError::InvalidInput`]).

use std::fmt;

use thiserror::Error;

/// A single failed dial attempt, kept so that the aggregated error can list
/// every URL that was tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialFailure {
    /// URL as written in the configuration
    pub url: String,
    /// Why this URL was skipped
    pub cause: String,
}

impl fmt::Display for DialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.url, self.cause)
    }
}

/// One LDIF entry that failed while applying a change script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdifFailure {
    /// DN of the entry the change targeted
    pub dn: String,
    /// Error reported for that entry
    pub cause: String,
}

/// Errors produced by the directory gateway
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Configuration failed validation
    #[error("invalid directory configuration: {0}")]
    InvalidConfig(String),

    /// Caller-supplied input (DN, filter, LDIF, template) is malformed
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Every configured URL failed to produce a live connection
    #[error("directory unavailable: {}", join_failures(.attempts))]
    Unavailable {
        /// One entry per URL tried, in order
        attempts: Vec<DialFailure>,
    },

    /// The directory answered with a non-success result code
    #[error("directory rejected {operation} (rc={code}): {message}")]
    Rejected {
        /// Operation that was refused (`bind`, `modify`, `add`, ...)
        operation: &'static str,
        /// LDAP result code
        code: u32,
        /// Diagnostic message returned by the server
        message: String,
    },

    /// A bind with an empty password was refused locally
    #[error("refusing to bind as '{0}' with an empty password (deny_null_bind is set)")]
    NullBind(String),

    /// A search that must return exactly one entry returned none
    #[error("no entry matched {filter} under '{base}'")]
    EntryNotFound {
        /// Search base
        base: String,
        /// Rendered filter
        filter: String,
    },

    /// A search that must return exactly one entry returned several
    #[error("{count} entries matched {filter} under '{base}'; expected exactly one")]
    AmbiguousEntry {
        /// Search base
        base: String,
        /// Rendered filter
        filter: String,
        /// Number of entries seen (bounded by the size limit)
        count: usize,
    },

    /// Applying an LDIF script failed for one or more entries
    #[error("LDIF application failed for {}", join_ldif(.failures))]
    LdifApply {
        /// Failed entries in script order
        failures: Vec<LdifFailure>,
    },

    /// Template parsing or rendering failed
    #[error("template error: {0}")]
    Template(String),

    /// TLS material could not be loaded
    #[error("TLS setup failed: {0}")]
    Tls(String),

    /// Transport-level failure on an established connection
    #[error("directory connection error: {0}")]
    Connection(String),

    /// The request did not complete within the configured timeout
    #[error("directory operation timed out")]
    Timeout,
}

impl DirectoryError {
    /// Whether the error means the directory never saw the request
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Connection(_) | Self::Timeout
        )
    }

    pub(crate) fn rejected(operation: &'static str, code: u32, message: impl Into<String>) -> Self {
        Self::Rejected {
            operation,
            code,
            message: message.into(),
        }
    }
}

fn join_failures(attempts: &[DialFailure]) -> String {
    if attempts.is_empty() {
        return "no URLs configured".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_ldif(failures: &[LdifFailure]) -> String {
    let noun = if failures.len() == 1 { "entry" } else { "entries" };
    let detail = failures
        .iter()
        .map(|f| format!("{}: {}", f.dn, f.cause))
        .collect::<Vec<_>>()
        .join("; ");
    format!("{} {noun}: {detail}", failures.len())
}

/// Result alias for directory operations
pub type Result<T> = std::result::Result<T, DirectoryError>;
