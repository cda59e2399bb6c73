//! JSON-lines audit trail of gate decisions and executions.

use std::path::Path;

use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::config::AuditConfig;
use crate::executor::ExecutionStatus;
use crate::readiness::ReadinessState;

#[derive(Debug)]
pub struct AuditLogger {
    sink: Sink,
}

#[derive(Debug)]
enum Sink {
    /// Emitted as `tracing` events under the `audit` target.
    Tracing,
    JsonLines(tokio::sync::Mutex<tokio::fs::File>),
}

/// One audited invocation.
#[derive(Debug, Serialize)]
pub struct AuditEntry {
    /// RFC 3339, millisecond precision, UTC.
    pub timestamp: String,
    pub invocation_id: String,
    pub tool: String,
    pub command: String,
    pub result: AuditResult,
    pub duration_ms: u64,
}

impl AuditEntry {
    /// Entry stamped with the current time.
    #[must_use]
    pub fn now(
        invocation_id: &str,
        tool: &str,
        command: &str,
        result: AuditResult,
        duration_ms: u64,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            invocation_id: invocation_id.to_owned(),
            tool: tool.to_owned(),
            command: command.to_owned(),
            result,
            duration_ms,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditResult {
    Success { exit_code: Option<i32> },
    Blocked { pattern: String },
    #[serde(rename = "confirmation")]
    ConfirmationRequired { pattern: String },
    Error { message: String },
    Timeout,
    Cancelled,
    Started { readiness: ReadinessState },
}

impl From<&ExecutionStatus> for AuditResult {
    fn from(status: &ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Completed { exit_code } => Self::Success {
                exit_code: *exit_code,
            },
            ExecutionStatus::TimedOut => Self::Timeout,
            ExecutionStatus::Denied { pattern } => Self::Blocked {
                pattern: pattern.clone(),
            },
            ExecutionStatus::ConfirmationRequired { pattern } => Self::ConfirmationRequired {
                pattern: pattern.clone(),
            },
            ExecutionStatus::Cancelled => Self::Cancelled,
            ExecutionStatus::Started { readiness } => Self::Started {
                readiness: *readiness,
            },
        }
    }
}

impl AuditLogger {
    /// `destination = "stdout"` logs through `tracing`; anything else is a
    /// file path opened for appending.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit file cannot be opened.
    pub async fn from_config(config: &AuditConfig) -> Result<Self, std::io::Error> {
        if config.destination == "stdout" {
            return Ok(Self { sink: Sink::Tracing });
        }
        Self::open(Path::new(&config.destination)).await
    }

    /// Append JSON lines to `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(path: &Path) -> Result<Self, std::io::Error> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            sink: Sink::JsonLines(tokio::sync::Mutex::new(file)),
        })
    }

    /// Write failures are logged and otherwise ignored.
    pub async fn log(&self, entry: &AuditEntry) {
        let mut record = match serde_json::to_string(entry) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(tool = %entry.tool, "unserializable audit entry: {e}");
                return;
            }
        };

        match &self.sink {
            Sink::Tracing => tracing::info!(target: "audit", "{record}"),
            Sink::JsonLines(file) => {
                record.push('\n');
                let mut file = file.lock().await;
                let written = match file.write_all(record.as_bytes()).await {
                    Ok(()) => file.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    tracing::error!(tool = %entry.tool, "audit write failed: {e}");
                }
            }
        }
    }
}
