//! # procbatch
//!
//! Bridges a long-running subprocess to a batch-oriented pipeline: the
//! subprocess's stdout is framed into messages, buffered in a bounded
//! queue and emitted as fixed-size, delimiter-joined output units.
//!
//! ## Usage
//!
//! ```bash
//! procbatch run --command "python3 -u printer.py" --batch-size 3 --delimiter "[s]"
//! ```
//!
//! ## Modules
//!
//! - `subprocess` - Supervision of the child process, stream readers and framing
//! - `queue` - Bounded message queue with overflow strategies and the stderr buffer
//! - `batch` - Batch assembly and the output sinks units are forwarded to
//! - `gateway` - One start/trigger/shutdown lifecycle over all of the above
//! - `scheduler` - Timer-driven trigger loop with backoff on failure
//! - `config` - YAML/TOML configuration with environment overrides

pub mod batch;
pub mod config;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod scheduler;
pub mod subprocess;

pub use config::{CommandSpec, GatewayConfig};
pub use error::{GatewayError, Result, TickFailure};
pub use gateway::{Gateway, TickReport, PROCESS_STOPPED_SENTINEL};
pub use scheduler::{LoopExit, LoopSummary, SchedulerConfig, TriggerLoop};
