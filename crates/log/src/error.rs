//! Errors raised while installing the subscriber

use thiserror::Error;

/// Logging setup errors
#[derive(Debug, Error)]
pub enum LogError {
    /// The level string is not a valid `EnvFilter` directive
    #[error("invalid log filter '{filter}': {reason}")]
    Filter {
        /// Directive as given
        filter: String,
        /// Parser message
        reason: String,
    },

    /// A global subscriber is already installed
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialised,
}

/// Result alias for logging setup
pub type LogResult<T> = Result<T, LogError>;
