//! Batch assembly and the output-unit boundary

pub mod assembler;
pub mod sink;

pub use assembler::{join_batch, AssemblyReport, BatchAssembler};
pub use sink::{DirectorySink, MemorySink, OutputSink, WriterSink};

use std::io;

/// Failure while building or forwarding an output unit
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Failed to create output unit: {0}")]
    Create(#[source] io::Error),

    #[error("Failed to write to output unit: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to transfer output unit: {0}")]
    Transfer(#[source] io::Error),
}
