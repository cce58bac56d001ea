//! Common helpers for driving a gateway against real subprocesses

#![allow(dead_code)]

use procbatch::{CommandSpec, Gateway, GatewayConfig};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// A shell command printing `count` numbered lines, then idling for `linger`
/// seconds so the process is still alive while the test triggers.
pub fn printer(count: usize, linger: u32) -> CommandSpec {
    let script = format!(
        "i=0; while [ $i -lt {count} ]; do echo \"Msg $i printed by Python\"; i=$((i+1)); done; sleep {linger}"
    );
    CommandSpec::Args(vec!["sh".into(), "-c".into(), script])
}

pub fn sh(script: &str) -> CommandSpec {
    CommandSpec::Args(vec!["sh".into(), "-c".into(), script.into()])
}

pub fn config(command: CommandSpec, batch_size: usize, delimiter: &str) -> GatewayConfig {
    let mut config = GatewayConfig::new(command);
    config.max_batch_size = batch_size;
    config.message_delimiter = delimiter.to_string();
    config.graceful_timeout = Duration::from_secs(2);
    config
}

/// Poll `condition` every 20ms for up to five seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_queue(gateway: &Gateway, len: usize) {
    assert!(
        eventually(|| gateway.queued_messages() >= len).await,
        "expected {len} queued messages, found {}",
        gateway.queued_messages()
    );
}
