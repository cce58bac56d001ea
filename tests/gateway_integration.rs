//! End-to-end tests of the gateway against real shell subprocesses

#![cfg(unix)]

mod common;

use common::{config, eventually, printer, sh, wait_for_queue};
use procbatch::batch::{DirectorySink, MemorySink};
use procbatch::queue::OverflowStrategy;
use procbatch::subprocess::{StdinPolicyKind, StopOutcome};
use procbatch::{Gateway, GatewayConfig, LoopExit, SchedulerConfig, TriggerLoop};
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_three_messages_one_batch() {
    let gateway = Gateway::start(&config(printer(3, 30), 3, "[s]")).unwrap();
    wait_for_queue(&gateway, 3).await;

    let mut sink = MemorySink::new();
    let report = gateway.on_trigger(&mut sink).await.unwrap();

    assert_eq!(report.units_emitted, 1);
    assert_eq!(report.messages_remaining, 0);
    assert_eq!(
        sink.units_lossy(),
        vec!["Msg 0 printed by Python[s]Msg 1 printed by Python[s]Msg 2 printed by Python"]
    );
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_batch_larger_than_output_emits_nothing() {
    let gateway = Gateway::start(&config(printer(3, 30), 5, "\\n")).unwrap();
    wait_for_queue(&gateway, 3).await;

    let mut sink = MemorySink::new();
    let report = gateway.on_trigger(&mut sink).await.unwrap();

    assert_eq!(report.units_emitted, 0);
    assert!(report.should_yield);
    assert_eq!(gateway.queued_messages(), 3);
    assert!(sink.units().is_empty());
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_batch_of_one_emits_unit_per_message() {
    let gateway = Gateway::start(&config(printer(3, 30), 1, "\\n")).unwrap();
    wait_for_queue(&gateway, 3).await;

    let mut sink = MemorySink::new();
    gateway.on_trigger(&mut sink).await.unwrap();

    assert_eq!(
        sink.units_lossy(),
        vec![
            "Msg 0 printed by Python",
            "Msg 1 printed by Python",
            "Msg 2 printed by Python"
        ]
    );
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_escaped_delimiter_is_decoded() {
    let gateway = Gateway::start(&config(printer(2, 30), 2, "\\t")).unwrap();
    wait_for_queue(&gateway, 2).await;

    let mut sink = MemorySink::new();
    gateway.on_trigger(&mut sink).await.unwrap();

    assert_eq!(
        sink.units_lossy(),
        vec!["Msg 0 printed by Python\tMsg 1 printed by Python"]
    );
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_process_death_fails_tick_after_emitting() {
    let gateway = Gateway::start(&config(printer(2, 0), 2, ",")).unwrap();
    assert!(eventually(|| !gateway.is_running()).await);
    assert!(matches!(gateway.shutdown().await, StopOutcome::Exited(_)));

    let mut sink = MemorySink::new();
    let failure = gateway.on_trigger(&mut sink).await.unwrap_err();

    assert!(failure.message().ends_with("The sub-process has stopped!"));
    assert_eq!(failure.units_emitted(), 1);
    assert_eq!(
        sink.units_lossy(),
        vec!["Msg 0 printed by Python,Msg 1 printed by Python"]
    );
}

#[tokio::test]
async fn test_stderr_and_exit_are_combined() {
    let gateway = Gateway::start(&config(sh("echo 'Traceback: boom' >&2"), 1, ",")).unwrap();
    assert!(eventually(|| !gateway.is_running()).await);
    gateway.shutdown().await;

    let failure = gateway.on_trigger(&mut MemorySink::new()).await.unwrap_err();
    assert_eq!(
        failure.to_string(),
        "Error while running sub-process: Traceback: boom\nThe sub-process has stopped!"
    );

    // Stderr is reported once; the dead process keeps failing ticks
    let failure = gateway.on_trigger(&mut MemorySink::new()).await.unwrap_err();
    assert_eq!(failure.message(), "The sub-process has stopped!");
}

#[tokio::test]
async fn test_missing_binary_fails_at_start() {
    let err = Gateway::start(&GatewayConfig::new("no-such-program-4b1d --flag")).unwrap_err();
    assert!(err.to_string().contains("no-such-program-4b1d"));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_drop_oldest_keeps_latest_messages() {
    let mut config = config(printer(5, 30), 2, ",");
    config.max_queue_size = 2;
    config.overflow_strategy = OverflowStrategy::DropOldest;
    let gateway = Gateway::start(&config).unwrap();
    assert!(eventually(|| gateway.dropped_messages() == 3).await);

    let mut sink = MemorySink::new();
    gateway.on_trigger(&mut sink).await.unwrap();

    assert_eq!(
        sink.units_lossy(),
        vec!["Msg 3 printed by Python,Msg 4 printed by Python"]
    );
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_close_on_stderr_lets_cat_finish() {
    let mut config = config(sh("echo ready >&2; cat"), 1, ",");
    config.stdin_policy = StdinPolicyKind::CloseOnStderr;
    let gateway = Gateway::start(&config).unwrap();

    assert!(eventually(|| !gateway.is_running()).await);
    let failure = gateway.on_trigger(&mut MemorySink::new()).await.unwrap_err();
    assert_eq!(failure.message(), "ready\nThe sub-process has stopped!");
}

#[tokio::test]
async fn test_stdin_is_forwarded_to_subprocess() {
    let gateway = Gateway::start(&config("cat".into(), 2, "|")).unwrap();
    gateway
        .supervisor()
        .write_stdin(b"one\r\ntwo\r\n")
        .await
        .unwrap();
    wait_for_queue(&gateway, 2).await;

    let mut sink = MemorySink::new();
    gateway.on_trigger(&mut sink).await.unwrap();
    assert_eq!(sink.units_lossy(), vec!["one|two"]);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_trigger_loop_writes_files_until_exit() {
    let temp = TempDir::new().unwrap();
    let gateway = Gateway::start(&config(printer(6, 0), 3, "[s]")).unwrap();
    let scheduler = SchedulerConfig {
        tick_interval: Duration::from_millis(10),
        yield_duration: Duration::from_millis(10),
        ..SchedulerConfig::default()
    };
    let mut sink = DirectorySink::new(temp.path()).await.unwrap();

    let (exit, summary) = TriggerLoop::new(&gateway, scheduler)
        .run(&mut sink, std::future::pending::<()>())
        .await;

    assert_eq!(exit, LoopExit::ProcessExited);
    assert_eq!(summary.units_emitted, 2);
    let mut contents: Vec<String> = sink
        .transferred()
        .iter()
        .map(|path| std::fs::read_to_string(path).unwrap())
        .collect();
    contents.sort();
    assert_eq!(
        contents,
        vec![
            "Msg 0 printed by Python[s]Msg 1 printed by Python[s]Msg 2 printed by Python",
            "Msg 3 printed by Python[s]Msg 4 printed by Python[s]Msg 5 printed by Python",
        ]
    );
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let gateway = Gateway::start(&config(printer(1, 30), 1, ",")).unwrap();

    assert!(matches!(gateway.shutdown().await, StopOutcome::Graceful(_)));
    assert_eq!(gateway.shutdown().await, StopOutcome::AlreadyStopped);
    assert!(!gateway.is_running());
}
