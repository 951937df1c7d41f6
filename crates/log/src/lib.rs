//! Warden Log - logging bootstrap
//!
//! One call wires `tracing` to a `tracing-subscriber` registry with a level
//! filter and one of three output formats.
//!
//! ```no_run
//! use warden_log::LogConfig;
//!
//! let _guard = warden_log::init(&LogConfig::development()).unwrap();
//! tracing::info!(role = "app1", "rotation complete");
//! ```
#![deny(unsafe_code)]
#![forbid(unsafe_code)]

mod builder;
mod config;
mod error;

pub use builder::{LogGuard, LoggerBuilder, init};
pub use config::{LogConfig, LogFormat};
pub use error::{LogError, LogResult};
