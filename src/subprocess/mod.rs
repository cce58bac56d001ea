//! Subprocess side of the gateway
//!
//! [`ProcessSupervisor`] owns the child process. Its reader tasks turn
//! stdout into framed [`Message`]s and stderr into raw fragments.

pub mod error;
pub mod framer;
pub mod policy;
pub mod reader;
pub mod supervisor;

pub use error::ProcessError;
pub use framer::{
    fragment, FramerConfig, Frames, Message, RawChunk, StreamFramer, TrailingPolicy,
    DEFAULT_DELIMITER,
};
pub use policy::{CloseStdinOnStderr, KeepStdinOpen, StdinAction, StdinPolicy, StdinPolicyKind};
pub use reader::{pump_stderr, pump_stdout, ReaderStats, DEFAULT_READ_BUFFER_SIZE};
pub use supervisor::{
    ProcessExit, ProcessSupervisor, StdinSlot, StopOutcome, StreamWiring, SupervisorState,
    DEFAULT_GRACEFUL_TIMEOUT,
};
