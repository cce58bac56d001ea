//! Decides whether stderr output should end the subprocess's input

use serde::{Deserialize, Serialize};
use std::fmt;

/// What the stderr reader should do with the subprocess's stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinAction {
    Keep,
    Close,
}

/// Consulted by the stderr reader for every fragment it receives
pub trait StdinPolicy: Send + Sync + fmt::Debug {
    fn on_stderr(&self, fragment: &[u8]) -> StdinAction;
}

/// Never closes stdin because of stderr output
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepStdinOpen;

impl StdinPolicy for KeepStdinOpen {
    fn on_stderr(&self, _fragment: &[u8]) -> StdinAction {
        StdinAction::Keep
    }
}

/// Treats any stderr output as the end of the conversation.
///
/// Suits simple line-printing programs that report completion on stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseStdinOnStderr;

impl StdinPolicy for CloseStdinOnStderr {
    fn on_stderr(&self, fragment: &[u8]) -> StdinAction {
        if fragment.is_empty() {
            StdinAction::Keep
        } else {
            StdinAction::Close
        }
    }
}

/// Configuration name of a built-in policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdinPolicyKind {
    #[default]
    KeepOpen,
    CloseOnStderr,
}

impl StdinPolicyKind {
    pub fn build(self) -> Box<dyn StdinPolicy> {
        match self {
            Self::KeepOpen => Box::new(KeepStdinOpen),
            Self::CloseOnStderr => Box::new(CloseStdinOnStderr),
        }
    }
}
