//! Periodic trigger loop standing in for the host pipeline's scheduler

use crate::batch::OutputSink;
use crate::gateway::Gateway;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay between ticks that emitted output
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,

    /// Delay after a tick that had nothing to emit
    #[serde(with = "humantime_serde", default = "default_yield_duration")]
    pub yield_duration: Duration,

    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// End the loop once a tick reports the subprocess has exited
    #[serde(default = "default_true")]
    pub stop_on_process_exit: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            yield_duration: default_yield_duration(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            stop_on_process_exit: true,
        }
    }
}

impl SchedulerConfig {
    pub(crate) fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.tick_interval.is_zero() {
            problems.push("scheduler.tick_interval must be greater than 0".to_string());
        }
        if self.initial_backoff > self.max_backoff {
            problems.push(format!(
                "scheduler.initial_backoff ({:?}) cannot exceed scheduler.max_backoff ({:?})",
                self.initial_backoff, self.max_backoff
            ));
        }
        problems
    }

    /// Delay after the given number of consecutive failures, doubling up to the maximum
    pub fn backoff_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Why a trigger loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    ProcessExited,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub ticks: u64,
    pub units_emitted: u64,
    pub failures: u64,
    pub abandoned_batches: u64,
}

/// Drives [`Gateway::on_trigger`] on a timer.
///
/// Tick failures are logged and followed by exponential backoff rather
/// than ending the loop.
#[derive(Debug)]
pub struct TriggerLoop<'g> {
    gateway: &'g Gateway,
    config: SchedulerConfig,
}

impl<'g> TriggerLoop<'g> {
    pub fn new(gateway: &'g Gateway, config: SchedulerConfig) -> Self {
        Self { gateway, config }
    }

    /// Tick until `shutdown` resolves or, if configured, the subprocess exits
    pub async fn run<S, F>(&self, sink: &mut S, shutdown: F) -> (LoopExit, LoopSummary)
    where
        S: OutputSink,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut summary = LoopSummary::default();
        let mut consecutive_failures = 0u32;

        loop {
            summary.ticks += 1;
            let delay = match self.gateway.on_trigger(sink).await {
                Ok(report) => {
                    consecutive_failures = 0;
                    summary.units_emitted += report.units_emitted as u64;
                    summary.abandoned_batches += report.abandoned_batches as u64;
                    if report.should_yield {
                        self.config.yield_duration
                    } else {
                        self.config.tick_interval
                    }
                }
                Err(failure) => {
                    summary.failures += 1;
                    summary.units_emitted += failure.units_emitted() as u64;
                    if self.config.stop_on_process_exit && !self.gateway.is_running() {
                        tracing::info!(error = %failure, "Subprocess exited, stopping trigger loop");
                        self.flush_after_exit(sink, &mut summary).await;
                        return (LoopExit::ProcessExited, summary);
                    }
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let backoff = self.config.backoff_for(consecutive_failures);
                    tracing::warn!(error = %failure, backoff = ?backoff, "Tick failed");
                    backoff
                }
            };

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::debug!(ticks = summary.ticks, "Trigger loop shutting down");
                    return (LoopExit::Shutdown, summary);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl TriggerLoop<'_> {
    /// Collect output the readers delivered after the exit was noticed
    async fn flush_after_exit<S: OutputSink>(&self, sink: &mut S, summary: &mut LoopSummary) {
        self.gateway.shutdown().await;
        summary.ticks += 1;
        match self.gateway.on_trigger(sink).await {
            Ok(report) => summary.units_emitted += report.units_emitted as u64,
            Err(failure) => summary.units_emitted += failure.units_emitted() as u64,
        }
    }
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_yield_duration() -> Duration {
    Duration::from_secs(1)
}

fn default_initial_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}
