use crate::batch::SinkError;
use crate::subprocess::ProcessError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to start subprocess: {0}")]
    Spawn(#[from] ProcessError),

    #[error(transparent)]
    Tick(#[from] TickFailure),

    #[error("Output error: {0}")]
    Sink(#[from] SinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl GatewayError {
    /// Tick failures are expected while a subprocess runs and are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Tick(_))
    }
}

/// A trigger saw stderr output or a dead subprocess
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Error while running sub-process: {message}")]
pub struct TickFailure {
    message: String,
    units_emitted: usize,
}

impl TickFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            units_emitted: 0,
        }
    }

    /// Record how many units the failed tick forwarded before failing
    pub fn with_units_emitted(mut self, units_emitted: usize) -> Self {
        self.units_emitted = units_emitted;
        self
    }

    pub fn units_emitted(&self) -> usize {
        self.units_emitted
    }

    /// The collected error text, without the fixed prefix
    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
