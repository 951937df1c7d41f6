//! Subscriber construction

use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{LogConfig, LogFormat};
use crate::error::{LogError, LogResult};

/// Install the global subscriber described by `config`
///
/// # Errors
///
/// Returns [`LogError::Filter`] for an unparsable level and
/// [`LogError::AlreadyInitialised`] when a subscriber is already installed.
pub fn init(config: &LogConfig) -> LogResult<LogGuard> {
    LoggerBuilder::from_config(config.clone()).build()
}

/// Logger builder
#[derive(Debug)]
pub struct LoggerBuilder {
    config: LogConfig,
}

/// Returned by a successful [`init`]; records the effective filter
#[derive(Debug)]
#[must_use]
pub struct LogGuard {
    filter: String,
}

impl LogGuard {
    /// Filter directive in force
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

impl LoggerBuilder {
    /// Create builder from config
    #[must_use]
    pub fn from_config(config: LogConfig) -> Self {
        Self { config }
    }

    /// Build and install the subscriber
    ///
    /// `RUST_LOG`, when set and non-empty, replaces the configured level.
    ///
    /// # Errors
    ///
    /// See [`init`].
    pub fn build(self) -> LogResult<LogGuard> {
        let env = std::env::var("RUST_LOG").ok();
        let directive = effective_directive(&self.config.level, env.as_deref());
        let filter = parse_filter(&directive)?;
        let registry = Registry::default().with(filter);
        let cfg = &self.config;

        let installed = match cfg.format {
            LogFormat::Pretty => registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(cfg.with_target)
                        .with_thread_ids(cfg.with_thread_ids)
                        .with_ansi(cfg.ansi),
                )
                .try_init(),
            LogFormat::Compact => registry
                .with(
                    fmt::layer()
                        .compact()
                        .with_target(cfg.with_target)
                        .with_thread_ids(cfg.with_thread_ids)
                        .with_ansi(cfg.ansi),
                )
                .try_init(),
            LogFormat::Json => registry
                .with(
                    fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_target(cfg.with_target)
                        .with_thread_ids(cfg.with_thread_ids),
                )
                .try_init(),
        };
        installed.map_err(|_| LogError::AlreadyInitialised)?;
        Ok(LogGuard { filter: directive })
    }
}

fn effective_directive(configured: &str, env: Option<&str>) -> String {
    match env {
        Some(value) if !value.trim().is_empty() => value.to_string(),
        _ => configured.to_string(),
    }
}

fn parse_filter(directive: &str) -> LogResult<EnvFilter> {
    EnvFilter::try_new(directive).map_err(|e| LogError::Filter {
        filter: directive.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("info", None, "info")]
    #[case("info", Some(""), "info")]
    #[case("info", Some("warden_engine=trace"), "warden_engine=trace")]
    fn env_overrides_level(
        #[case] configured: &str,
        #[case] env: Option<&str>,
        #[case] expected: &str,
    ) {
        assert_eq!(effective_directive(configured, env), expected);
    }

    #[test]
    fn rejects_bad_directives() {
        assert!(parse_filter("warden_engine=loud").is_err());
        assert!(parse_filter("warden_engine=debug,info").is_ok());
    }

    #[test]
    fn second_init_is_reported() {
        let config = LogConfig {
            level: "off".to_string(),
            ..LogConfig::default()
        };
        let _first = init(&config);
        assert!(matches!(init(&config), Err(LogError::AlreadyInitialised)));
    }
}
