//! Logger configuration and presets

use serde::{Deserialize, Serialize};

/// Output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human oriented
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// One JSON object per event, fields flattened
    Json,
}

/// Logger configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `warden_engine=debug,info`
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Print the event target (module path)
    pub with_target: bool,
    /// Print the thread id
    pub with_thread_ids: bool,
    /// Colourise output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            with_target: true,
            with_thread_ids: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Development configuration (pretty, debug level)
    #[must_use]
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            format: LogFormat::Pretty,
            ..Self::default()
        }
    }

    /// Production configuration (JSON, info level)
    #[must_use]
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            with_thread_ids: true,
            ansi: false,
            ..Self::default()
        }
    }

    /// Configuration with the level and format taken from `WARDEN_LOG` /
    /// `WARDEN_LOG_FORMAT` when present
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(level) = std::env::var("WARDEN_LOG") {
            config.level = level;
        }
        if let Ok(format) = std::env::var("WARDEN_LOG_FORMAT") {
            config.format = match format.to_lowercase().as_str() {
                "pretty" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                _ => LogFormat::Compact,
            };
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn presets() {
        let dev = LogConfig::development();
        assert_eq!(dev.level, "debug");
        assert_eq!(dev.format, LogFormat::Pretty);

        let prod = LogConfig::production();
        assert_eq!(prod.format, LogFormat::Json);
        assert!(!prod.ansi);
    }

    #[test]
    fn deserialises_partial_records() {
        let cfg: LogConfig = serde_json::from_str(r#"{"format":"json"}"#).unwrap();
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.level, "info");
        assert!(serde_json::from_str::<LogConfig>(r#"{"format":"xml"}"#).is_err());
    }
}
