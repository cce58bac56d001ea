//! Drains the message queue into fixed-size output units

use super::sink::OutputSink;
use super::SinkError;
use crate::queue::BoundedMessageQueue;
use crate::subprocess::Message;

/// What one assembly pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    pub units_emitted: usize,
    pub messages_emitted: usize,
    /// Batches given up after a sink failure; their messages are gone
    pub abandoned_batches: usize,
    pub messages_lost: usize,
}

/// Joins exactly `batch_size` messages per unit with a delimiter between them
#[derive(Debug, Clone)]
pub struct BatchAssembler {
    batch_size: usize,
    delimiter: Vec<u8>,
}

impl BatchAssembler {
    /// A batch size of zero is raised to one
    pub fn new(batch_size: usize, delimiter: impl Into<Vec<u8>>) -> Self {
        Self {
            batch_size: batch_size.max(1),
            delimiter: delimiter.into(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Emit one unit per full batch in the queue.
    ///
    /// Never emits a short batch: fewer than `batch_size` messages stay
    /// queued. A sink failure abandons the batch in progress and ends the
    /// pass; units already transferred are unaffected.
    pub async fn assemble<S: OutputSink>(&self, queue: &BoundedMessageQueue, sink: &mut S) -> AssemblyReport {
        let mut report = AssemblyReport::default();

        while queue.len() >= self.batch_size {
            let batch = queue.drain(self.batch_size);
            match self.emit(&batch, sink).await {
                Ok(()) => {
                    report.units_emitted += 1;
                    report.messages_emitted += batch.len();
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        messages = batch.len(),
                        "Failed to write output unit, abandoning batch"
                    );
                    report.abandoned_batches += 1;
                    report.messages_lost += batch.len();
                    break;
                }
            }
        }

        if report.units_emitted > 0 {
            tracing::debug!(
                units = report.units_emitted,
                messages = report.messages_emitted,
                remaining = queue.len(),
                "Emitted output units"
            );
        }
        report
    }

    async fn emit<S: OutputSink>(&self, batch: &[Message], sink: &mut S) -> Result<(), SinkError> {
        let mut unit = sink.create().await?;
        for (i, message) in batch.iter().enumerate() {
            let prefix = (i > 0).then_some(self.delimiter.as_slice());
            if let Err(e) = sink.append(&mut unit, prefix, message.as_bytes()).await {
                sink.discard(unit).await;
                return Err(e);
            }
        }
        sink.transfer(unit).await
    }
}

/// Content of the unit built from `batch`: messages separated by `delimiter`
pub fn join_batch(batch: &[Message], delimiter: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, message) in batch.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(delimiter);
        }
        out.extend_from_slice(message.as_bytes());
    }
    out
}
