//! Tracing setup.
//!
//! Structured logging through `tracing` and `tracing-subscriber`:
//! - pretty output for interactive use
//! - compact output without colours for service logs
//! - JSON lines for log aggregation
//!
//! `RUST_LOG` takes precedence over the configured level when set.
//!
//! # Example
//! ```no_run
//! use spm_sequencer::{config::AppConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!(controller = %config.controller.address(), "Sequencer starting");
//! # Ok(())
//! # }
//! ```

use crate::config::AppConfig;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line with colours
    Pretty,
    /// Single line without colours
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                s
            )),
        }
    }
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to log span open/close
    pub with_span_events: bool,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to include thread names
    pub with_thread_names: bool,
    /// Whether to enable ANSI colours (pretty format only)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: true,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Build from the `[application]` section.
    pub fn from_app_config(config: &AppConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Defaults at the given level.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }
}

/// Initialize tracing from the application configuration.
pub fn init_from_config(config: &AppConfig) -> Result<(), String> {
    init(TracingConfig::from_app_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: a second call (or a subscriber installed elsewhere, as in
/// tests) is not an error.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

fn level_to_filter_string(level: Level) -> String {
    level.as_str().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ApplicationConfig, CommandsConfig, ControllerConfig, ExecutorSettings,
    };

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("Compact".parse::<OutputFormat>(), Ok(OutputFormat::Compact));
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_tracing_config_from_app_config() {
        let config = AppConfig {
            application: ApplicationConfig {
                name: "Test".to_string(),
                log_level: "debug".to_string(),
                log_format: "json".to_string(),
            },
            controller: ControllerConfig {
                host: "localhost".to_string(),
                port: 6501,
                connect_timeout_ms: 5000,
                reply_timeout_ms: 2000,
                line_terminator: "\n".to_string(),
            },
            commands: CommandsConfig::default(),
            executor: ExecutorSettings::default(),
        };

        let tracing_config = TracingConfig::from_app_config(&config).unwrap();
        assert_eq!(tracing_config.level, Level::DEBUG);
        assert_eq!(tracing_config.format, OutputFormat::Json);
    }

    #[test]
    fn test_tracing_config_builder() {
        let config = TracingConfig::new(Level::WARN).with_format(OutputFormat::Compact);

        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, OutputFormat::Compact);
        assert!(!config.with_span_events);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = TracingConfig {
            with_ansi: false,
            ..TracingConfig::new(Level::ERROR)
        };
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}
