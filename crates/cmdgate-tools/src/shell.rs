//! Child process execution: `sh -c` in its own process group, merged output
//! capture, and a supervisor racing exit, timeout and cancellation.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::executor::{ToolError, ToolEvent, ToolEventTx};

const READ_CHUNK: usize = 4096;
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[cfg(unix)]
const GROUP_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    sealed: bool,
}

/// Output captured from stdout and stderr, in arrival order.
///
/// Once sealed, further appends are dropped so a timed-out or cancelled
/// process reports only what it wrote before the cutoff.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Arc<Mutex<Captured>>);

impl OutputBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Captured> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false, keeping nothing, once the buffer is sealed.
    pub fn append(&self, chunk: &[u8]) -> bool {
        let mut captured = self.lock();
        if captured.sealed {
            return false;
        }
        captured.bytes.extend_from_slice(chunk);
        true
    }

    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().bytes.clone()
    }

    /// Lossy UTF-8 view of the captured bytes.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.lock().bytes).into_owned()
    }

    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.find_from(needle, 0).is_ok()
    }

    /// Search for `needle` at or after byte offset `from`.
    ///
    /// `Ok` is the match position. `Err` is the offset a later search can
    /// resume from without missing a match that straddles new output.
    pub fn find_from(&self, needle: &str, from: usize) -> Result<usize, usize> {
        let captured = self.lock();
        let bytes = &captured.bytes;
        let needle = needle.as_bytes();
        let start = from.min(bytes.len());
        if needle.is_empty() {
            return Ok(start);
        }
        match bytes[start..]
            .windows(needle.len())
            .position(|w| w == needle)
        {
            Some(at) => Ok(start + at),
            None => Err(bytes.len().saturating_sub(needle.len() - 1).max(start)),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Exited { exit_code: Option<i32> },
    TimedOut,
    Cancelled,
}

/// Output of a process that ran to completion.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub output: Vec<u8>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
struct EventSink {
    tx: ToolEventTx,
    tool_id: String,
    invocation_id: String,
}

impl EventSink {
    fn chunk(&self, bytes: &[u8]) {
        let _ = self.tx.send(ToolEvent::OutputChunk {
            tool_id: self.tool_id.clone(),
            invocation_id: self.invocation_id.clone(),
            chunk: String::from_utf8_lossy(bytes).into_owned(),
        });
    }
}

/// Spawns shell commands under a timeout with process-group termination.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    kill_grace: Duration,
    events: Option<EventSink>,
}

impl ProcessExecutor {
    /// `kill_grace` is the delay between SIGTERM and SIGKILL.
    #[must_use]
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            kill_grace,
            events: None,
        }
    }

    /// Stream captured chunks as [`ToolEvent::OutputChunk`].
    #[must_use]
    pub fn with_events(
        mut self,
        tx: ToolEventTx,
        tool_id: impl Into<String>,
        invocation_id: impl Into<String>,
    ) -> Self {
        self.events = Some(EventSink {
            tx,
            tool_id: tool_id.into(),
            invocation_id: invocation_id.into(),
        });
        self
    }

    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        self.kill_grace
    }

    /// Spawn `command` under a supervisor and return immediately.
    ///
    /// # Errors
    ///
    /// Returns `ToolError::Spawn` if `workdir` is not a directory or the shell
    /// cannot be started. No process exists in that case.
    pub fn spawn(
        &self,
        command: &str,
        workdir: &Path,
        env: &BTreeMap<String, String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RunningProcess, ToolError> {
        if !workdir.is_dir() {
            return Err(ToolError::Spawn {
                message: format!(
                    "working directory {} does not exist or is not a directory",
                    workdir.display()
                ),
            });
        }

        let mut cmd = shell_command(command);
        cmd.current_dir(workdir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ToolError::Spawn {
            message: format!("{e}"),
        })?;
        let pid = child.id();
        tracing::info!(pid, command, workdir = %workdir.display(), "spawned");

        let buffer = OutputBuffer::new();
        let readers: Vec<JoinHandle<()>> = [
            spawn_reader(child.stdout.take(), buffer.clone(), self.events.clone()),
            spawn_reader(child.stderr.take(), buffer.clone(), self.events.clone()),
        ]
        .into_iter()
        .flatten()
        .collect();

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let stop = cancel.child_token();
        let started = Instant::now();
        tokio::spawn(supervise(
            child,
            pid,
            buffer.clone(),
            readers,
            Supervision {
                timeout,
                grace: self.kill_grace,
                stop: stop.clone(),
                started,
            },
            outcome_tx,
        ));

        Ok(RunningProcess {
            pid,
            buffer,
            outcome: outcome_rx,
            stop,
            started,
        })
    }

    /// Spawn `command` and wait for it to finish.
    ///
    /// # Errors
    ///
    /// Returns `ToolError::Spawn` before any process exists, `ToolError::Timeout`
    /// or `ToolError::Cancelled` with the output captured up to the cutoff.
    pub async fn run(
        &self,
        command: &str,
        workdir: &Path,
        env: &BTreeMap<String, String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ToolError> {
        let process = self.spawn(command, workdir, env, timeout, cancel)?;
        match process.wait().await {
            ProcessOutcome::Exited { exit_code } => Ok(ProcessOutput {
                exit_code,
                output: process.buffer.snapshot(),
                elapsed: process.elapsed(),
            }),
            ProcessOutcome::TimedOut => Err(ToolError::Timeout {
                timeout,
                output: process.buffer.snapshot(),
            }),
            ProcessOutcome::Cancelled => Err(ToolError::Cancelled {
                output: process.buffer.snapshot(),
            }),
        }
    }
}

/// Handle to a supervised child process.
#[derive(Debug)]
pub struct RunningProcess {
    pid: Option<u32>,
    buffer: OutputBuffer,
    outcome: watch::Receiver<Option<ProcessOutcome>>,
    stop: CancellationToken,
    started: Instant,
}

impl RunningProcess {
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn buffer(&self) -> &OutputBuffer {
        &self.buffer
    }

    /// Final outcome, once the supervisor has finished.
    #[must_use]
    pub fn outcome(&self) -> Option<ProcessOutcome> {
        *self.outcome.borrow()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.outcome().is_none()
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wait until the process has ended and its output is fully drained.
    pub async fn wait(&self) -> ProcessOutcome {
        let mut rx = self.outcome.clone();
        let waited = rx.wait_for(Option::is_some).await.map(|outcome| *outcome);
        // A dropped sender means the supervisor was aborted with the runtime.
        waited
            .ok()
            .flatten()
            .or_else(|| self.outcome())
            .unwrap_or(ProcessOutcome::Cancelled)
    }

    /// Terminate the process group and wait for the supervisor.
    pub async fn stop(&self) -> ProcessOutcome {
        self.stop.cancel();
        self.wait().await
    }
}

struct Supervision {
    timeout: Duration,
    grace: Duration,
    stop: CancellationToken,
    started: Instant,
}

enum Trigger {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    buffer: OutputBuffer,
    readers: Vec<JoinHandle<()>>,
    supervision: Supervision,
    outcome_tx: watch::Sender<Option<ProcessOutcome>>,
) {
    let deadline = tokio::time::Instant::from_std(supervision.started)
        .checked_add(supervision.timeout)
        .unwrap_or_else(|| tokio::time::Instant::now() + FAR_FUTURE);
    let mut trigger = tokio::select! {
        biased;
        status = child.wait() => match status {
            Ok(status) => Trigger::Exited(status.code()),
            Err(e) => {
                tracing::warn!(pid, "failed to wait for child: {e}");
                Trigger::Exited(None)
            }
        },
        () = tokio::time::sleep_until(deadline) => Trigger::TimedOut,
        () = supervision.stop.cancelled() => Trigger::Cancelled,
    };

    // Background jobs stay in the group after the shell exits.
    if matches!(trigger, Trigger::Exited(_))
        && let Some(cutoff) = outlive_leader(pid, deadline, &supervision.stop).await
    {
        trigger = cutoff;
    }

    let outcome = match trigger {
        Trigger::Exited(exit_code) => ProcessOutcome::Exited { exit_code },
        Trigger::TimedOut => {
            tracing::warn!(pid, timeout = ?supervision.timeout, "command timed out");
            buffer.seal();
            terminate(&mut child, pid, supervision.grace).await;
            ProcessOutcome::TimedOut
        }
        Trigger::Cancelled => {
            tracing::info!(pid, "command cancelled");
            buffer.seal();
            terminate(&mut child, pid, supervision.grace).await;
            ProcessOutcome::Cancelled
        }
    };

    // Detached descendants may keep a pipe open after the group is gone.
    let drain_deadline = tokio::time::Instant::now() + supervision.grace;
    for mut reader in readers {
        if tokio::time::timeout_at(drain_deadline, &mut reader)
            .await
            .is_err()
        {
            reader.abort();
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    let elapsed_ms = supervision.started.elapsed().as_millis() as u64;
    tracing::info!(pid, ?outcome, elapsed_ms, "process finished");
    let _ = outcome_tx.send(Some(outcome));
}

#[cfg(unix)]
fn group_id(pid: Option<u32>) -> Option<i32> {
    pid.and_then(|p| i32::try_from(p).ok()).filter(|p| *p > 1)
}

/// Wait for the rest of the group once the leader has exited.
///
/// Returns `None` when the group is gone, or the trigger that cut it short.
#[cfg(unix)]
async fn outlive_leader(
    pid: Option<u32>,
    deadline: tokio::time::Instant,
    stop: &CancellationToken,
) -> Option<Trigger> {
    let pgid = group_id(pid)?;
    let mut ticker = tokio::time::interval(GROUP_POLL);
    loop {
        tokio::select! {
            biased;
            _ = ticker.tick() => {
                if !signal_group(pgid, None) {
                    return None;
                }
            }
            () = tokio::time::sleep_until(deadline) => return Some(Trigger::TimedOut),
            () = stop.cancelled() => return Some(Trigger::Cancelled),
        }
    }
}

#[cfg(not(unix))]
#[allow(clippy::unused_async)]
async fn outlive_leader(
    _pid: Option<u32>,
    _deadline: tokio::time::Instant,
    _stop: &CancellationToken,
) -> Option<Trigger> {
    None
}

#[cfg(unix)]
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    use nix::sys::signal::Signal;

    let Some(pgid) = group_id(pid) else {
        let _ = child.kill().await;
        return;
    };

    signal_group(pgid, Some(Signal::SIGTERM));
    let deadline = Instant::now() + grace;
    loop {
        // Reap the leader so it does not keep the group alive as a zombie.
        let _ = child.try_wait();
        if !signal_group(pgid, None) {
            break;
        }
        if Instant::now() >= deadline {
            tracing::debug!(pgid, "process group survived SIGTERM, sending SIGKILL");
            signal_group(pgid, Some(Signal::SIGKILL));
            break;
        }
        tokio::time::sleep(GROUP_POLL).await;
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, _pid: Option<u32>, _grace: Duration) {
    if let Err(e) = child.kill().await {
        tracing::warn!("failed to kill child: {e}");
    }
}

/// Send `signal` to the process group; `None` probes for existence.
/// Returns false once the group no longer exists.
#[cfg(unix)]
fn signal_group(pgid: i32, signal: Option<nix::sys::signal::Signal>) -> bool {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    match nix::sys::signal::killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::warn!(pgid, ?signal, "failed to signal process group: {e}");
            false
        }
    }
}

fn spawn_reader<R>(
    stream: Option<R>,
    buffer: OutputBuffer,
    events: Option<EventSink>,
) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut stream = stream?;
    Some(tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    if buffer.append(&chunk[..n])
                        && let Some(sink) = &events
                    {
                        sink.chunk(&chunk[..n]);
                    }
                }
                Err(e) => {
                    tracing::debug!("output reader stopped: {e}");
                    break;
                }
            }
        }
    }))
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
