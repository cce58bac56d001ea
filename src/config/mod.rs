//! Gateway configuration
//!
//! Loaded from YAML or TOML, then overridden from `PROCBATCH_*`
//! environment variables and validated as a whole.

mod command;
mod delimiter;

pub use command::CommandSpec;
pub use delimiter::decode_escapes;

use crate::error::{GatewayError, Result};
use crate::queue::{OverflowStrategy, DEFAULT_ERROR_BUFFER_SIZE};
use crate::scheduler::SchedulerConfig;
use crate::subprocess::{FramerConfig, StdinPolicyKind, TrailingPolicy, DEFAULT_READ_BUFFER_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "PROCBATCH_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Program to run, as a command line or an argument list
    pub command: CommandSpec,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Messages per output unit
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Placed between messages in an output unit. Backslash escapes are decoded.
    #[serde(default = "default_delimiter")]
    pub message_delimiter: String,

    /// Terminates messages on the subprocess's stdout. Must decode to one byte.
    #[serde(default = "default_delimiter")]
    pub input_delimiter: String,

    #[serde(default = "default_true")]
    pub strip_carriage_return: bool,

    #[serde(default)]
    pub overflow_strategy: OverflowStrategy,

    /// How long a blocked reader waits for queue space
    #[serde(with = "humantime_serde", default = "default_block_timeout")]
    pub block_timeout: Duration,

    #[serde(default = "default_error_buffer_size")]
    pub error_buffer_size: usize,

    #[serde(default)]
    pub trailing_partial: TrailingPolicy,

    #[serde(default)]
    pub stdin_policy: StdinPolicyKind,

    #[serde(with = "humantime_serde", default = "default_graceful_timeout")]
    pub graceful_timeout: Duration,

    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl GatewayConfig {
    /// Configuration with every optional setting at its default
    pub fn new(command: impl Into<CommandSpec>) -> Self {
        Self {
            command: command.into(),
            max_queue_size: default_max_queue_size(),
            max_batch_size: default_max_batch_size(),
            message_delimiter: default_delimiter(),
            input_delimiter: default_delimiter(),
            strip_carriage_return: true,
            overflow_strategy: OverflowStrategy::default(),
            block_timeout: default_block_timeout(),
            error_buffer_size: default_error_buffer_size(),
            trailing_partial: TrailingPolicy::default(),
            stdin_policy: StdinPolicyKind::default(),
            graceful_timeout: default_graceful_timeout(),
            read_buffer_size: default_read_buffer_size(),
            scheduler: SchedulerConfig::default(),
            log_level: default_log_level(),
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read a config file, apply environment overrides and validate.
    ///
    /// Files ending in `.toml` are parsed as TOML, anything else as YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            _ => Self::from_yaml_str(&content)?,
        };
        config.apply_env_overrides()?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_with(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps full variable names to values
    pub fn apply_overrides_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        if let Some(command) = var("COMMAND") {
            self.command = CommandSpec::Line(command);
        }
        if let Some(value) = var("MAX_QUEUE_SIZE") {
            self.max_queue_size = parse_count("MAX_QUEUE_SIZE", &value)?;
        }
        if let Some(value) = var("MAX_BATCH_SIZE") {
            self.max_batch_size = parse_count("MAX_BATCH_SIZE", &value)?;
        }
        if let Some(delimiter) = var("MESSAGE_DELIMITER") {
            self.message_delimiter = delimiter;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    /// Check every setting, reporting all problems at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.command.is_empty() {
            errors.push("command must not be empty".to_string());
        }
        if self.max_queue_size == 0 {
            errors.push("max_queue_size must be greater than 0".to_string());
        }
        if self.max_batch_size == 0 {
            errors.push("max_batch_size must be greater than 0".to_string());
        } else if self.max_batch_size > self.max_queue_size {
            errors.push(format!(
                "max_batch_size ({}) cannot exceed max_queue_size ({})",
                self.max_batch_size, self.max_queue_size
            ));
        }
        if self.message_delimiter_bytes().is_empty() {
            errors.push("message_delimiter must not be empty".to_string());
        }
        if let Err(e) = self.input_delimiter_byte() {
            errors.push(e);
        }
        if self.error_buffer_size == 0 {
            errors.push("error_buffer_size must be greater than 0".to_string());
        }
        if self.read_buffer_size == 0 {
            errors.push("read_buffer_size must be greater than 0".to_string());
        }
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            errors.push(format!(
                "log_level '{}' is not one of {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            ));
        }
        errors.extend(self.scheduler.problems());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Config(errors.join("; ")))
        }
    }

    pub fn argv(&self) -> Vec<String> {
        self.command.argv()
    }

    /// Decoded delimiter placed between messages of a batch
    pub fn message_delimiter_bytes(&self) -> Vec<u8> {
        decode_escapes(&self.message_delimiter).into_bytes()
    }

    fn input_delimiter_byte(&self) -> std::result::Result<u8, String> {
        match decode_escapes(&self.input_delimiter).as_bytes() {
            [byte] => Ok(*byte),
            _ => Err(format!(
                "input_delimiter '{}' must decode to exactly one byte",
                self.input_delimiter
            )),
        }
    }

    pub fn framer_config(&self) -> Result<FramerConfig> {
        Ok(FramerConfig {
            delimiter: self.input_delimiter_byte().map_err(GatewayError::Config)?,
            strip_carriage_return: self.strip_carriage_return,
            trailing: self.trailing_partial,
        })
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn parse_count(name: &str, value: &str) -> Result<usize> {
    value.trim().parse::<usize>().map_err(|_| {
        GatewayError::Config(format!(
            "{ENV_PREFIX}{name} must be a non-negative integer, got '{value}'"
        ))
    })
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_max_batch_size() -> usize {
    1
}

fn default_delimiter() -> String {
    "\\n".to_string()
}

fn default_true() -> bool {
    true
}

fn default_block_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_error_buffer_size() -> usize {
    DEFAULT_ERROR_BUFFER_SIZE
}

fn default_graceful_timeout() -> Duration {
    crate::subprocess::DEFAULT_GRACEFUL_TIMEOUT
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = GatewayConfig::from_yaml_str("command: python3 printer.py").unwrap();

        assert_eq!(config, GatewayConfig::new("python3 printer.py"));
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.max_batch_size, 1);
        assert_eq!(config.message_delimiter_bytes(), b"\n");
        assert_eq!(config.graceful_timeout, Duration::from_secs(3));
        assert_eq!(config.overflow_strategy, OverflowStrategy::DropNewest);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
command: [sh, -c, "echo hi"]
max_queue_size: 50
max_batch_size: 3
message_delimiter: "[s]"
input_delimiter: "\\t"
overflow_strategy: block
block_timeout: 250ms
trailing_partial: flush
stdin_policy: close_on_stderr
graceful_timeout: 10s
scheduler:
  tick_interval: 100ms
  max_backoff: 1m
log_level: debug
"#;
        let config = GatewayConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.argv(), vec!["sh", "-c", "echo hi"]);
        assert_eq!(config.message_delimiter_bytes(), b"[s]");
        assert_eq!(config.overflow_strategy, OverflowStrategy::Block);
        assert_eq!(config.block_timeout, Duration::from_millis(250));
        assert_eq!(config.stdin_policy, StdinPolicyKind::CloseOnStderr);
        assert_eq!(config.graceful_timeout, Duration::from_secs(10));
        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(100));
        assert_eq!(config.scheduler.max_backoff, Duration::from_secs(60));

        let framer = config.framer_config().unwrap();
        assert_eq!(framer.delimiter, b'\t');
        assert_eq!(framer.trailing, TrailingPolicy::Flush);
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_file_is_loaded_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "command = \"cat\"\nmax_batch_size = 2\n\n[scheduler]\ntick_interval = \"2s\""
        )
        .unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.max_batch_size, 2);
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_yaml_file_is_default_format() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "command: cat\nmax_queue_size: 10").unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.max_queue_size, 10);
    }

    #[test]
    fn test_missing_command_is_parse_error() {
        let err = GatewayConfig::from_yaml_str("max_queue_size: 5").unwrap_err();
        assert!(matches!(err, GatewayError::Yaml(_)));
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = GatewayConfig::new("  ");
        config.max_queue_size = 0;
        config.input_delimiter = "ab".into();
        config.log_level = "loud".into();

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("command must not be empty"));
        assert!(message.contains("max_queue_size must be greater than 0"));
        assert!(message.contains("cannot exceed max_queue_size"));
        assert!(message.contains("exactly one byte"));
        assert!(message.contains("log_level 'loud'"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<String, String> = [
            ("PROCBATCH_COMMAND", "cat -u"),
            ("PROCBATCH_MAX_QUEUE_SIZE", "20"),
            ("PROCBATCH_MAX_BATCH_SIZE", "4"),
            ("PROCBATCH_MESSAGE_DELIMITER", "\\r\\n"),
            ("PROCBATCH_LOG_LEVEL", "warn"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut config = GatewayConfig::new("python3 printer.py");
        config
            .apply_overrides_with(|name| env.get(name).cloned())
            .unwrap();

        assert_eq!(config.argv(), vec!["cat", "-u"]);
        assert_eq!(config.max_queue_size, 20);
        assert_eq!(config.max_batch_size, 4);
        assert_eq!(config.message_delimiter_bytes(), b"\r\n");
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = GatewayConfig::new("cat");
        let err = config
            .apply_overrides_with(|name| {
                (name == "PROCBATCH_MAX_BATCH_SIZE").then(|| "lots".to_string())
            })
            .unwrap_err();
        assert!(err.to_string().contains("PROCBATCH_MAX_BATCH_SIZE"));
    }

    #[test]
    fn test_yaml_output_round_trips() {
        let mut config = GatewayConfig::new("cat");
        config.block_timeout = Duration::from_millis(1500);
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("block_timeout: 1s 500ms"));
        assert_eq!(GatewayConfig::from_yaml_str(&yaml).unwrap(), config);
    }
}
