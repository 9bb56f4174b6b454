//! Logging setup for endpoint processes
//!
//! Settings come from the `[logging]` table of the endpoint configuration;
//! the daemon's command line can override each of them. `RUST_LOG`
//! directives are honoured on top of the configured level.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::{EndpointError, Result};

/// `[logging]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// One JSON object per line on stdout
    pub json: bool,
    /// Source file and line on every event
    pub file_info: bool,
    /// Log when each interface and connection span opens and closes
    pub spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
            spans: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.spans = true;
        self
    }

    pub fn level(&self) -> Result<Level> {
        parse_log_level(&self.level)
    }

    /// Span lifecycle events to emit: open and close only
    pub fn span_events(&self) -> FmtSpan {
        if self.spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber
///
/// Fails on an unknown level or if a subscriber is already installed.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level()?.into());

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(config.span_events())
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        subscriber.with_writer(std::io::stdout).json().try_init()
    } else {
        subscriber.try_init()
    };

    installed.map_err(|e| EndpointError::Logging(e.to_string()))
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| EndpointError::config("logging", format!("invalid log level: {}", level)))
}

pub fn log_welcome(app_name: &str, version: &str) {
    tracing::info!("Starting {} v{}", app_name, version);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(matches!(parse_log_level("loud"), Err(EndpointError::ConfigInvalid { .. })));
    }

    #[test]
    fn test_logging_table_defaults() {
        let config: LoggingConfig = toml::from_str("json = true").unwrap();
        assert!(config.json);
        assert_eq!(config.level().unwrap(), Level::INFO);
        assert_eq!(config.span_events(), FmtSpan::NONE);
    }

    #[test]
    fn test_span_events_follow_flag() {
        let config = LoggingConfig::default().with_spans().with_level("trace");
        assert_eq!(config.span_events(), FmtSpan::NEW | FmtSpan::CLOSE);
        assert_eq!(config.level().unwrap(), Level::TRACE);
    }

    #[test]
    fn test_bad_level_fails_setup() {
        let config = LoggingConfig::default().with_level("chatty");
        assert!(matches!(setup_logging(&config), Err(EndpointError::ConfigInvalid { .. })));
    }
}
