//! Ownership of the subprocess: spawn, liveness and two-phase shutdown

use super::error::ProcessError;
use super::framer::StreamFramer;
use super::policy::StdinPolicy;
use super::reader::{pump_stderr, pump_stdout, ReaderStats};
use crate::queue::{BoundedMessageQueue, ErrorBuffer};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;

pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(3);

/// How long `stop` waits for the reader tasks to see end of stream
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// Exit information published once the child has been reaped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// How a call to [`ProcessSupervisor::stop`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Never started, or already stopped by an earlier call
    AlreadyStopped,
    /// The process had exited on its own before stop was requested
    Exited(Option<ProcessExit>),
    /// The process exited within the graceful timeout
    Graceful(Option<ProcessExit>),
    /// The graceful timeout expired and the process was killed
    Forced(Option<ProcessExit>),
}

impl StopOutcome {
    pub fn exit(&self) -> Option<ProcessExit> {
        match self {
            Self::AlreadyStopped => None,
            Self::Exited(exit) | Self::Graceful(exit) | Self::Forced(exit) => *exit,
        }
    }
}

/// Shared handle to the subprocess's stdin.
///
/// Closing drops the pipe, which the child observes as end of input.
/// A write in progress holds the handle outside the slot, so closing
/// never waits for it; the pending write is cancelled instead.
#[derive(Debug, Clone, Default)]
pub struct StdinSlot(Arc<StdinShared>);

#[derive(Debug, Default)]
struct StdinShared {
    state: Mutex<StdinState>,
    closed: Notify,
    writer: tokio::sync::Mutex<()>,
}

#[derive(Debug, Default)]
struct StdinState {
    handle: Option<ChildStdin>,
    open: bool,
}

impl StdinSlot {
    pub fn new(stdin: ChildStdin) -> Self {
        Self(Arc::new(StdinShared {
            state: Mutex::new(StdinState {
                handle: Some(stdin),
                open: true,
            }),
            ..StdinShared::default()
        }))
    }

    fn state(&self) -> MutexGuard<'_, StdinState> {
        self.0
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Close stdin. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        let was_open = {
            let mut state = self.state();
            state.handle = None;
            std::mem::replace(&mut state.open, false)
        };
        if was_open {
            self.0.closed.notify_waiters();
        }
        was_open
    }

    pub async fn write_all(&self, bytes: &[u8]) -> Result<(), ProcessError> {
        let _writer = self.0.writer.lock().await;
        // Registered before the take so a racing close is not missed
        let closed = self.0.closed.notified();

        let mut stdin = self.state().handle.take().ok_or_else(stdin_closed)?;
        let result = tokio::select! {
            result = write_and_flush(&mut stdin, bytes) => result.map_err(ProcessError::from),
            _ = closed => Err(stdin_closed()),
        };

        let mut state = self.state();
        if state.open {
            state.handle = Some(stdin);
        }
        result
    }
}

async fn write_and_flush(stdin: &mut ChildStdin, bytes: &[u8]) -> std::io::Result<()> {
    stdin.write_all(bytes).await?;
    stdin.flush().await
}

fn stdin_closed() -> ProcessError {
    ProcessError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "subprocess stdin is closed",
    ))
}

/// Everything the reader tasks need to deliver output
#[derive(Debug)]
pub struct StreamWiring {
    pub framer: StreamFramer,
    pub queue: Arc<BoundedMessageQueue>,
    pub errors: Arc<ErrorBuffer>,
    pub stdin_policy: Arc<dyn StdinPolicy>,
    pub read_buffer_size: usize,
}

#[derive(Debug)]
struct Inner {
    state: SupervisorState,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: Option<watch::Receiver<Option<ProcessExit>>>,
    readers: Vec<JoinHandle<ReaderStats>>,
    stdin: StdinSlot,
}

/// Owns one subprocess for the lifetime of a gateway.
///
/// A reaper task owns the `Child` and publishes its exit status, so
/// liveness queries never block and never race with the shutdown path.
/// Dropping the supervisor kills a still-running process.
#[derive(Debug)]
pub struct ProcessSupervisor {
    inner: Mutex<Inner>,
    shutdown: tokio::sync::Mutex<()>,
    forced_kills: AtomicU32,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SupervisorState::NotStarted,
                pid: None,
                kill_tx: None,
                exit_rx: None,
                readers: Vec::new(),
                stdin: StdinSlot::default(),
            }),
            shutdown: tokio::sync::Mutex::new(()),
            forced_kills: AtomicU32::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the subprocess and its reader tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, command: &[String], wiring: StreamWiring) -> Result<u32, ProcessError> {
        let (program, args) = command.split_first().ok_or(ProcessError::EmptyCommand)?;

        let mut inner = self.lock();
        if inner.state != SupervisorState::NotStarted {
            return Err(ProcessError::AlreadyStarted);
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so signals reach everything the command starts
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| ProcessError::from_spawn(program, e))?;

        let pid = child.id().unwrap_or_default();
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
        let stdin = child.stdin.take().map(StdinSlot::new).unwrap_or_default();

        let stdout_task = tokio::spawn(pump_stdout(
            stdout,
            wiring.framer,
            wiring.queue,
            Arc::clone(&wiring.errors),
            wiring.read_buffer_size,
        ));
        let stderr_task = tokio::spawn(pump_stderr(
            stderr,
            wiring.errors,
            wiring.stdin_policy,
            stdin.clone(),
            wiring.read_buffer_size,
        ));

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(reap(child, pid, kill_rx, exit_tx));

        inner.state = SupervisorState::Running;
        inner.pid = Some(pid);
        inner.kill_tx = Some(kill_tx);
        inner.exit_rx = Some(exit_rx);
        inner.readers = vec![stdout_task, stderr_task];
        inner.stdin = stdin;

        tracing::info!(pid, command = %command.join(" "), "Started subprocess");
        Ok(pid)
    }

    pub fn state(&self) -> SupervisorState {
        self.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    /// Whether the OS process is still alive
    pub fn is_running(&self) -> bool {
        let inner = self.lock();
        match &inner.exit_rx {
            Some(exit_rx) => exit_rx.borrow().is_none(),
            None => false,
        }
    }

    /// Exit status, once the process has been reaped
    pub fn exit_status(&self) -> Option<ProcessExit> {
        let inner = self.lock();
        inner.exit_rx.as_ref().and_then(|rx| *rx.borrow())
    }

    /// Number of forced kills issued by `stop`
    pub fn forced_kills(&self) -> u32 {
        self.forced_kills.load(Ordering::SeqCst)
    }

    pub async fn write_stdin(&self, bytes: &[u8]) -> Result<(), ProcessError> {
        let stdin = self.lock().stdin.clone();
        stdin.write_all(bytes).await
    }

    /// Close the subprocess's stdin. Returns false if it was already closed.
    pub fn close_stdin(&self) -> bool {
        let stdin = self.lock().stdin.clone();
        stdin.close()
    }

    /// Terminate the subprocess, escalating to a kill after `graceful_timeout`.
    ///
    /// Returns only once the process has been reaped. Concurrent and
    /// repeated calls are safe; only the first one acts.
    pub async fn stop(&self, graceful_timeout: Duration) -> StopOutcome {
        let _guard = self.shutdown.lock().await;

        let (pid, exit_rx, kill_tx, stdin) = {
            let mut inner = self.lock();
            match inner.state {
                SupervisorState::NotStarted | SupervisorState::Stopped => {
                    return StopOutcome::AlreadyStopped;
                }
                SupervisorState::Running | SupervisorState::Stopping => {}
            }
            inner.state = SupervisorState::Stopping;
            (
                inner.pid.unwrap_or_default(),
                inner.exit_rx.clone(),
                inner.kill_tx.take(),
                inner.stdin.clone(),
            )
        };
        let Some(mut exit_rx) = exit_rx else {
            self.lock().state = SupervisorState::Stopped;
            return StopOutcome::AlreadyStopped;
        };

        stdin.close();

        let exited = *exit_rx.borrow();
        let outcome = if let Some(exit) = exited {
            StopOutcome::Exited(Some(exit))
        } else {
            tracing::info!(pid, timeout = ?graceful_timeout, "Stopping subprocess");
            send_terminate(pid);

            match tokio::time::timeout(graceful_timeout, wait_for_exit(&mut exit_rx)).await {
                Ok(exit) => StopOutcome::Graceful(exit),
                Err(_) => {
                    tracing::warn!(
                        pid,
                        timeout = ?graceful_timeout,
                        "Subprocess did not exit within graceful timeout, killing"
                    );
                    if let Some(kill_tx) = kill_tx {
                        self.forced_kills.fetch_add(1, Ordering::SeqCst);
                        let _ = kill_tx.send(());
                    }
                    StopOutcome::Forced(wait_for_exit(&mut exit_rx).await)
                }
            }
        };

        let readers = std::mem::take(&mut self.lock().readers);
        drain_readers(readers).await;
        self.lock().state = SupervisorState::Stopped;

        tracing::info!(pid, exit = ?outcome.exit(), "Subprocess stopped");
        outcome
    }
}

async fn drain_readers(readers: Vec<JoinHandle<ReaderStats>>) {
    for mut reader in readers {
        match tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Stream reader task failed"),
            Err(_) => {
                tracing::debug!("Stream still open after stop, aborting reader");
                reader.abort();
            }
        }
    }
}

fn missing_pipe(name: &str) -> ProcessError {
    ProcessError::Io(std::io::Error::other(format!("subprocess {name} was not captured")))
}

async fn wait_for_exit(exit_rx: &mut watch::Receiver<Option<ProcessExit>>) -> Option<ProcessExit> {
    match exit_rx.wait_for(Option::is_some).await {
        Ok(exit) => *exit,
        // Reaper went away without publishing
        Err(_) => None,
    }
}

/// Waits for the child and publishes its exit. A kill request, or the
/// supervisor being dropped, kills the child first.
async fn reap(
    mut child: Child,
    pid: u32,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            force_kill(&mut child, pid);
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => ProcessExit::from(status),
        Err(e) => {
            tracing::warn!(pid, error = %e, "Failed to wait for subprocess");
            ProcessExit {
                code: None,
                signal: None,
            }
        }
    };
    tracing::debug!(pid, code = ?exit.code, signal = ?exit.signal, "Subprocess exited");
    let _ = exit_tx.send(Some(exit));
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if pid == 0 {
        return;
    }
    // Negative pid addresses the process group
    if let Err(e) = kill(Pid::from_raw(-(pid as i32)), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM not delivered");
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) {}

fn force_kill(child: &mut Child, pid: u32) {
    #[cfg(unix)]
    if pid != 0 {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL) {
            Ok(()) => return,
            Err(e) => tracing::debug!(pid, error = %e, "SIGKILL to process group failed"),
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!(pid, error = %e, "Kill not delivered");
    }
}
