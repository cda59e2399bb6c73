//! Startup readiness for long-running service launches.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use schemars::JsonSchema;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior};

use crate::shell::RunningProcess;

/// Conditions a launched process must satisfy before it counts as ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessCriteria {
    /// Maximum time to wait for the criteria.
    pub deadline: Duration,
    /// TCP port on 127.0.0.1 that must accept connections.
    pub port: Option<u16>,
    /// Text that must appear in the captured output.
    pub keyword: Option<String>,
}

impl ReadinessCriteria {
    /// True when only the deadline is configured.
    #[must_use]
    pub fn is_fixed_delay(&self) -> bool {
        self.port.is_none() && self.keyword.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    Spawned,
    Waiting,
    Ready,
    TimedOut,
    /// The process ended before the criteria were met.
    Exited,
}

impl ReadinessState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::TimedOut | Self::Exited)
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Spawned => "spawned",
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::TimedOut => "timed out",
            Self::Exited => "exited",
        })
    }
}

/// Polls readiness criteria against a running process.
#[derive(Debug, Clone)]
pub struct ReadinessMonitor {
    criteria: ReadinessCriteria,
    poll_interval: Duration,
    state: Arc<Mutex<ReadinessState>>,
}

impl ReadinessMonitor {
    #[must_use]
    pub fn new(criteria: ReadinessCriteria, poll_interval: Duration) -> Self {
        Self {
            criteria,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            state: Arc::new(Mutex::new(ReadinessState::Spawned)),
        }
    }

    #[must_use]
    pub fn state(&self) -> ReadinessState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ReadinessState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Wait until the criteria hold, the deadline passes, or the process exits.
    ///
    /// The process is never stopped here; on `TimedOut` it keeps running.
    pub async fn wait(&self, process: &RunningProcess) -> ReadinessState {
        self.set_state(ReadinessState::Waiting);
        let state = self.poll_until_terminal(process).await;
        self.set_state(state);
        tracing::debug!(pid = process.pid(), %state, "readiness resolved");
        state
    }

    async fn poll_until_terminal(&self, process: &RunningProcess) -> ReadinessState {
        let deadline = Instant::now() + self.criteria.deadline;

        if self.criteria.is_fixed_delay() {
            return tokio::select! {
                biased;
                _ = process.wait() => ReadinessState::Exited,
                () = tokio::time::sleep_until(deadline) => ReadinessState::Ready,
            };
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keyword_seen = self.criteria.keyword.is_none();
        let mut scanned = 0;
        loop {
            ticker.tick().await;
            // Output only grows, so each poll scans just the new tail.
            if !keyword_seen && let Some(keyword) = &self.criteria.keyword {
                match process.buffer().find_from(keyword, scanned) {
                    Ok(_) => keyword_seen = true,
                    Err(resume) => scanned = resume,
                }
            }
            if keyword_seen && self.port_ready().await {
                return ReadinessState::Ready;
            }
            if !process.is_running() {
                return ReadinessState::Exited;
            }
            if Instant::now() >= deadline {
                return ReadinessState::TimedOut;
            }
        }
    }

    async fn port_ready(&self) -> bool {
        match self.criteria.port {
            Some(port) => port_open(port, self.poll_interval).await,
            None => true,
        }
    }
}

async fn port_open(port: u16, within: Duration) -> bool {
    matches!(
        tokio::time::timeout(within, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}
