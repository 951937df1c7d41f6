//! Engine error types
//!
//! [`EngineError`] is what every public operation returns. Callers that only
//! need to branch on the outcome use [`EngineError::kind`]. Failed swaps are
//! always requeued; [`EngineError::is_retryable`] separates transient
//! failures from ones an operator has to fix.

use std::fmt;

use thiserror::Error;
use warden_directory::DirectoryError;

use crate::queue::QueueError;
use crate::storage::StorageError;

/// Coarse classification of an [`EngineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Configuration failed validation or is missing
    InvalidConfig,
    /// Request parameters are malformed
    InvalidRequest,
    /// Role, set, account or credential not present
    NotFound,
    /// Static role exists but has never been rotated
    NotYetRotated,
    /// Identity already owned by another role or set
    ManagedElsewhere,
    /// Account is held by a borrower
    CheckedOut,
    /// Every account in a set is held
    NoAccountsAvailable,
    /// Account was already returned
    AlreadyCheckedIn,
    /// Caller is not the borrower
    CheckInUnauthorized,
    /// No directory URL produced a usable connection
    DirectoryUnavailable,
    /// Directory answered with an error
    DirectoryRejected,
    /// Storage read or write failed
    StorageFailure,
    /// Root credential rotation already running
    RotationInProgress,
    /// Root credential rollback did not restore the old password
    RollbackFailed,
    /// Caller or engine cancelled the operation
    Canceled,
    /// Operation ran out of time
    Deadline,
    /// Invariant violation inside the engine
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Who currently owns a managed directory identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// A static role
    StaticRole(String),
    /// A check-out library set
    Library(String),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaticRole(name) => write!(f, "static role '{name}'"),
            Self::Library(name) => write!(f, "library set '{name}'"),
        }
    }
}

/// Errors returned by the secrets engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The mount has no configuration yet
    #[error("the directory connection is not configured")]
    NotConfigured,

    /// Request failed validation
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A named object is missing
    #[error("{what} '{name}' not found")]
    NotFound {
        /// Object type (`static role`, `library set`, ...)
        what: &'static str,
        /// Object name
        name: String,
    },

    /// A static role exists but has no rotated password yet
    #[error("static role '{0}' has not been rotated yet")]
    NotYetRotated(String),

    /// The identity is already managed
    #[error("'{username}' is already managed by {owner}")]
    ManagedElsewhere {
        /// Directory identity
        username: String,
        /// Current owner
        owner: Owner,
    },

    /// Account is checked out
    #[error("service account '{0}' is currently checked out")]
    CheckedOut(String),

    /// No available accounts
    #[error("no service accounts available for check-out in set '{0}'")]
    NoAccountsAvailable(String),

    /// Renewal of an account that was already returned
    #[error("service account '{0}' is already checked in")]
    AlreadyCheckedIn(String),

    /// Check-in by someone other than the borrower
    #[error("caller is not authorized to check in '{0}'")]
    CheckInUnauthorized(String),

    /// Directory failure
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Queue invariant violation
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A dynamic lease could not be created and its rollback script failed too
    #[error("{source}; rollback script also failed: {rollback_error}")]
    LeaseRollbackFailed {
        /// Why the creation script failed
        #[source]
        source: DirectoryError,
        /// Why the rollback script failed
        rollback_error: String,
    },

    /// A root rotation is already running
    #[error("a root credential rotation is already in progress")]
    RotationInProgress,

    /// Root rotation failed and the old password could not be restored
    #[error(
        "root credential rotation failed ({cause}) and rollback did not succeed after {attempts} \
         attempt(s) (last error: {last_error}); set a new bind password on the mount manually"
    )]
    RollbackFailed {
        /// Why the rotation had to be rolled back
        cause: String,
        /// Rollback attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: String,
    },

    /// Operation cancelled
    #[error("operation canceled")]
    Canceled,

    /// Operation exceeded its time budget
    #[error("operation exceeded its deadline of {0:?}")]
    Deadline(std::time::Duration),

    /// Internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub(crate) fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            name: name.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) | Self::NotConfigured => ErrorKind::InvalidConfig,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::NotYetRotated(_) => ErrorKind::NotYetRotated,
            Self::ManagedElsewhere { .. } => ErrorKind::ManagedElsewhere,
            Self::CheckedOut(_) => ErrorKind::CheckedOut,
            Self::NoAccountsAvailable(_) => ErrorKind::NoAccountsAvailable,
            Self::AlreadyCheckedIn(_) => ErrorKind::AlreadyCheckedIn,
            Self::CheckInUnauthorized(_) => ErrorKind::CheckInUnauthorized,
            Self::Directory(e) | Self::LeaseRollbackFailed { source: e, .. } => directory_kind(e),
            Self::Storage(_) => ErrorKind::StorageFailure,
            Self::Queue(_) | Self::Internal(_) => ErrorKind::Internal,
            Self::RotationInProgress => ErrorKind::RotationInProgress,
            Self::RollbackFailed { .. } => ErrorKind::RollbackFailed,
            Self::Canceled => ErrorKind::Canceled,
            Self::Deadline(_) => ErrorKind::Deadline,
        }
    }

    /// Whether the failure is expected to clear on its own
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::DirectoryUnavailable
                | ErrorKind::DirectoryRejected
                | ErrorKind::StorageFailure
                | ErrorKind::Deadline
                | ErrorKind::Internal
        )
    }
}

fn directory_kind(err: &DirectoryError) -> ErrorKind {
    match err {
        DirectoryError::InvalidConfig(_) | DirectoryError::Tls(_) => ErrorKind::InvalidConfig,
        DirectoryError::InvalidInput(_) | DirectoryError::Template(_) => ErrorKind::InvalidRequest,
        DirectoryError::EntryNotFound { .. } => ErrorKind::NotFound,
        e if e.is_unavailable() => ErrorKind::DirectoryUnavailable,
        _ => ErrorKind::DirectoryRejected,
    }
}

/// Result alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
