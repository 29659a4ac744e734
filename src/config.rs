//! Application configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/spm.toml` by default)
//! 2. environment variables prefixed with `SPM_`, nested keys separated by `__`
//!    (e.g. `SPM_CONTROLLER__PORT=6502`, `SPM_EXECUTOR__MAX_RETRIES=5`)
//!
//! ```toml
//! [application]
//! name = "SPM Sequencer"
//! log_level = "info"
//! log_format = "pretty"
//!
//! [controller]
//! host = "192.168.1.20"
//! port = 6501
//! reply_timeout_ms = 2000
//!
//! [commands]
//! path = "config/commands.json"
//!
//! [executor]
//! max_retries = 2
//! retry_delay_ms = 100
//! ```
//!
//! The command template file named under `[commands]` is a separate JSON
//! document; see [`spm_protocol::template`].

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use spm_core::{RetryPolicy, SpmError, TemplateError};
use spm_experiment::ExecutorConfig;
use spm_protocol::{ChannelConfig, TemplateRegistry};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/spm.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SPM_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Configuration could not be loaded or is invalid.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading or merging the sources failed.
    #[error("failed to load configuration: {0}")]
    Load(Box<figment::Error>),

    /// The configuration loaded but a value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

impl From<ConfigError> for SpmError {
    fn from(err: ConfigError) -> Self {
        SpmError::Configuration(err.to_string())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Controller connection
    pub controller: ControllerConfig,
    /// Command template file
    #[serde(default)]
    pub commands: CommandsConfig,
    /// Retry and polling behaviour
    #[serde(default)]
    pub executor: ExecutorSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Controller connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Hostname or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Per-reply timeout in milliseconds
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,
    /// Appended to every command
    #[serde(default = "default_terminator")]
    pub line_terminator: String,
}

impl ControllerConfig {
    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Command template file location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// JSON file mapping operation names to templates
    #[serde(default = "default_commands_path")]
    pub path: PathBuf,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            path: default_commands_path(),
        }
    }
}

/// Executor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Retries of a step after transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before each retry in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Delay between status polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Progress events buffered per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            poll_interval_ms: default_poll_interval(),
            event_capacity: default_event_capacity(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "SPM Sequencer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_reply_timeout() -> u64 {
    2000
}

fn default_terminator() -> String {
    "\n".to_string()
}

fn default_commands_path() -> PathBuf {
    PathBuf::from("config/commands.json")
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    100
}

fn default_poll_interval() -> u64 {
    500
}

fn default_event_capacity() -> usize {
    1024
}

impl AppConfig {
    /// Load from the default location and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` merged with `SPM_` environment variables, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The merged provider chain, for callers that want to add their own layers.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Serialized::default("application", ApplicationConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        let format = self.application.log_format.to_lowercase();
        if !LOG_FORMATS.contains(&format.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                LOG_FORMATS.join(", ")
            )));
        }

        if self.controller.host.trim().is_empty() {
            return Err(ConfigError::Invalid("controller.host is empty".into()));
        }
        if self.controller.port == 0 {
            return Err(ConfigError::Invalid("controller.port must not be 0".into()));
        }
        if self.controller.reply_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "controller.reply_timeout_ms must be positive".into(),
            ));
        }
        if self.controller.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "controller.connect_timeout_ms must be positive".into(),
            ));
        }
        if self.controller.line_terminator.is_empty() {
            return Err(ConfigError::Invalid(
                "controller.line_terminator must not be empty".into(),
            ));
        }
        if self.executor.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "executor.event_capacity must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Transport settings.
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            reply_timeout: Duration::from_millis(self.controller.reply_timeout_ms),
            connect_timeout: Duration::from_millis(self.controller.connect_timeout_ms),
            terminator: self.controller.line_terminator.clone(),
        }
    }

    /// Executor settings.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            retry: RetryPolicy::new(
                self.executor.max_retries,
                Duration::from_millis(self.executor.retry_delay_ms),
            ),
            poll_interval: Duration::from_millis(self.executor.poll_interval_ms),
        }
    }

    /// Load the command template file. Any structural problem is fatal.
    pub fn load_templates(&self) -> Result<TemplateRegistry, TemplateError> {
        TemplateRegistry::from_path(&self.commands.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn config() -> AppConfig {
        AppConfig {
            application: ApplicationConfig::default(),
            controller: ControllerConfig {
                host: "127.0.0.1".to_string(),
                port: 6501,
                connect_timeout_ms: 5000,
                reply_timeout_ms: 2000,
                line_terminator: "\n".to_string(),
            },
            commands: CommandsConfig::default(),
            executor: ExecutorSettings::default(),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_invalid_values() {
        let mut bad = config();
        bad.application.log_level = "loud".into();
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.application.log_format = "xml".into();
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.controller.port = 0;
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.controller.reply_timeout_ms = 0;
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.controller.line_terminator.clear();
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.executor.event_capacity = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_load_with_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "spm.toml",
                r#"
                [controller]
                host = "10.0.0.5"
                port = 6501
                "#,
            )?;

            let config = AppConfig::load_from("spm.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.controller.address(), "10.0.0.5:6501");
            assert_eq!(config.controller.reply_timeout_ms, 2000);
            assert_eq!(config.application.log_level, "info");
            assert_eq!(config.executor.max_retries, 2);
            assert_eq!(config.commands.path, PathBuf::from("config/commands.json"));

            let executor = config.executor_config();
            assert_eq!(executor.retry.retry_delay, Duration::from_millis(100));
            assert_eq!(executor.poll_interval, Duration::from_millis(500));
            assert_eq!(config.channel_config().terminator, "\n");
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "spm.toml",
                r#"
                [application]
                log_level = "debug"

                [controller]
                host = "10.0.0.5"
                port = 6501

                [executor]
                max_retries = 1
                "#,
            )?;
            jail.set_env("SPM_CONTROLLER__PORT", "7000");
            jail.set_env("SPM_EXECUTOR__MAX_RETRIES", "4");
            jail.set_env("SPM_APPLICATION__LOG_FORMAT", "json");

            let config = AppConfig::load_from("spm.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.controller.port, 7000);
            assert_eq!(config.executor.max_retries, 4);
            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.application.log_format, "json");
            Ok(())
        });
    }

    #[test]
    fn test_missing_controller_section() {
        Jail::expect_with(|jail| {
            jail.create_file("spm.toml", "[application]\nname = \"x\"\n")?;
            let err = AppConfig::load_from("spm.toml").unwrap_err();
            assert!(matches!(err, ConfigError::Load(_)));
            Ok(())
        });
    }

    #[test]
    fn test_invalid_file_value_rejected_at_load() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "spm.toml",
                "[controller]\nhost = \"h\"\nport = 1\nreply_timeout_ms = 0\n",
            )?;
            let err = AppConfig::load_from("spm.toml").unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)));
            Ok(())
        });
    }

    #[test]
    fn test_load_templates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands.json");
        std::fs::write(&path, r#"{"poll_status": "STATUS?"}"#).unwrap();

        let mut config = config();
        config.commands.path = path;
        let registry = config.load_templates().unwrap();
        assert!(registry.contains("poll_status"));

        std::fs::write(&config.commands.path, r#"{"poll_status": 1}"#).unwrap();
        assert!(matches!(
            config.load_templates(),
            Err(TemplateError::MalformedTemplate { .. })
        ));
    }
}
