use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Permission denied executing: {0}")]
    PermissionDenied(String),

    #[error("Failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Command line is empty")]
    EmptyCommand,

    #[error("Subprocess already started")]
    AlreadyStarted,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ProcessError {
    /// Map a spawn failure onto the variant describing why the program could not run
    pub fn from_spawn(command: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::CommandNotFound(command.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(command.to_string()),
            _ => Self::SpawnFailed {
                command: command.to_string(),
                source: err,
            },
        }
    }

    /// Whether the subprocess could not be started at all
    pub fn is_spawn_error(&self) -> bool {
        matches!(
            self,
            Self::CommandNotFound(_)
                | Self::PermissionDenied(_)
                | Self::SpawnFailed { .. }
                | Self::EmptyCommand
        )
    }
}
