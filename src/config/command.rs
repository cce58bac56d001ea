use serde::{Deserialize, Serialize};
use std::fmt;

/// How the subprocess is invoked.
///
/// A single string is split on runs of whitespace with no quoting support.
/// A list is used as the argument vector unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Line(String),
    Args(Vec<String>),
}

impl CommandSpec {
    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            Self::Args(args) => args.clone(),
        }
    }

    /// True when there is no program to run
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Line(line) => line.trim().is_empty(),
            Self::Args(args) => !matches!(args.first(), Some(program) if !program.is_empty()),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line(line) => f.write_str(line),
            Self::Args(args) => f.write_str(&args.join(" ")),
        }
    }
}

impl From<&str> for CommandSpec {
    fn from(line: &str) -> Self {
        Self::Line(line.to_string())
    }
}

impl From<String> for CommandSpec {
    fn from(line: String) -> Self {
        Self::Line(line)
    }
}

impl From<Vec<String>> for CommandSpec {
    fn from(args: Vec<String>) -> Self {
        Self::Args(args)
    }
}
