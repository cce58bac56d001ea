//! Ties the supervisor, queues and batch assembler together
//!
//! A [`Gateway`] is started once with a [`GatewayConfig`], triggered
//! repeatedly with an output sink, and shut down once.

use crate::batch::{BatchAssembler, OutputSink};
use crate::config::GatewayConfig;
use crate::error::{Result, TickFailure};
use crate::queue::{BoundedMessageQueue, ErrorBuffer};
use crate::subprocess::{ProcessSupervisor, StopOutcome, StreamFramer, StreamWiring};
use std::sync::Arc;
use std::time::Duration;

/// Appended to a tick's error text once the subprocess has exited
pub const PROCESS_STOPPED_SENTINEL: &str = "The sub-process has stopped!";

/// What a successful trigger did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub units_emitted: usize,
    pub messages_remaining: usize,
    pub abandoned_batches: usize,
    /// Nothing was emitted; the caller may delay the next trigger
    pub should_yield: bool,
}

#[derive(Debug)]
pub struct Gateway {
    supervisor: ProcessSupervisor,
    queue: Arc<BoundedMessageQueue>,
    errors: Arc<ErrorBuffer>,
    assembler: BatchAssembler,
    graceful_timeout: Duration,
}

impl Gateway {
    /// Validate `config`, spawn the subprocess and start reading its output.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: &GatewayConfig) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(BoundedMessageQueue::new(
            config.max_queue_size,
            config.overflow_strategy,
            config.block_timeout,
        ));
        let errors = Arc::new(ErrorBuffer::new(config.error_buffer_size));
        let wiring = StreamWiring {
            framer: StreamFramer::new(config.framer_config()?),
            queue: Arc::clone(&queue),
            errors: Arc::clone(&errors),
            stdin_policy: Arc::from(config.stdin_policy.build()),
            read_buffer_size: config.read_buffer_size,
        };

        let supervisor = ProcessSupervisor::new();
        supervisor.start(&config.argv(), wiring)?;

        tracing::info!(
            max_queue_size = config.max_queue_size,
            max_batch_size = config.max_batch_size,
            overflow = ?config.overflow_strategy,
            "Gateway started"
        );

        Ok(Self {
            supervisor,
            queue,
            errors,
            assembler: BatchAssembler::new(config.max_batch_size, config.message_delimiter_bytes()),
            graceful_timeout: config.graceful_timeout,
        })
    }

    /// Run one tick: emit every full batch, then report stderr output or
    /// a dead subprocess as a failure.
    ///
    /// Units forwarded before a failure stay forwarded. Never waits on
    /// subprocess I/O.
    pub async fn on_trigger<S: OutputSink>(&self, sink: &mut S) -> std::result::Result<TickReport, TickFailure> {
        let assembly = self.assembler.assemble(&self.queue, sink).await;

        let mut error_text = self.errors.drain_to_string();
        if !self.supervisor.is_running() {
            error_text.push_str(PROCESS_STOPPED_SENTINEL);
        }

        let report = TickReport {
            units_emitted: assembly.units_emitted,
            messages_remaining: self.queue.len(),
            abandoned_batches: assembly.abandoned_batches,
            should_yield: assembly.units_emitted == 0,
        };
        tracing::trace!(?report, "Tick complete");

        if error_text.is_empty() {
            Ok(report)
        } else {
            Err(TickFailure::new(error_text).with_units_emitted(report.units_emitted))
        }
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    pub fn queued_messages(&self) -> usize {
        self.queue.len()
    }

    /// Messages lost to queue overflow so far
    pub fn dropped_messages(&self) -> u64 {
        self.queue.dropped_count()
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Stop the subprocess using the configured graceful timeout
    pub async fn shutdown(&self) -> StopOutcome {
        let outcome = self.supervisor.stop(self.graceful_timeout).await;
        if !self.queue.is_empty() {
            tracing::info!(
                remaining = self.queue.len(),
                "Discarding messages that never filled a batch"
            );
        }
        outcome
    }
}
