use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use schemars::JsonSchema;
use serde::Serialize;

use crate::permissions::GateDecision;
use crate::readiness::ReadinessState;

/// Structured tool invocation: tool id plus parameter bindings.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool_id: String,
    pub params: HashMap<String, serde_json::Value>,
}

impl ToolCall {
    #[must_use]
    pub fn new(tool_id: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            params: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// Size of the output before and after filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, JsonSchema)]
pub struct FilterStats {
    pub raw_bytes: usize,
    pub raw_chars: usize,
    pub raw_lines: usize,
    pub filtered_chars: usize,
    pub filtered_lines: usize,
}

impl FilterStats {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn savings_pct(&self) -> f64 {
        if self.raw_chars == 0 {
            return 0.0;
        }
        (1.0 - self.filtered_chars as f64 / self.raw_chars as f64) * 100.0
    }

    #[must_use]
    pub fn format_inline(&self, tool_id: &str) -> String {
        format!(
            "[{tool_id}] {} lines \u{2192} {} lines, {:.1}% filtered",
            self.raw_lines,
            self.filtered_lines,
            self.savings_pct()
        )
    }
}

/// Terminal status of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The process exited. `exit_code` is `None` when it was killed by a signal.
    Completed { exit_code: Option<i32> },
    TimedOut,
    Denied { pattern: String },
    ConfirmationRequired { pattern: String },
    Cancelled,
    /// A long-running service was launched and left running.
    Started { readiness: ReadinessState },
}

impl ExecutionStatus {
    #[must_use]
    pub fn is_success(&self) -> bool {
        match self {
            Self::Completed { exit_code } => *exit_code == Some(0),
            Self::Started { readiness } => *readiness == ReadinessState::Ready,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed {
                exit_code: Some(code),
            } => write!(f, "completed (exit code {code})"),
            Self::Completed { exit_code: None } => f.write_str("completed (killed by signal)"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Denied { pattern } => write!(f, "denied by `{pattern}`"),
            Self::ConfirmationRequired { pattern } => {
                write!(f, "confirmation required by `{pattern}`")
            }
            Self::Cancelled => f.write_str("cancelled"),
            Self::Started { readiness } => write!(f, "service started ({readiness})"),
        }
    }
}

/// Bounded result of one invocation.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ExecutionResult {
    pub invocation_id: String,
    pub tool_id: String,
    /// The rendered command.
    pub command: String,
    pub status: ExecutionStatus,
    /// Filtered output excerpt.
    pub output: String,
    pub stats: FilterStats,
    pub elapsed_ms: u64,
    pub decision: GateDecision,
}

impl ExecutionResult {
    /// Convert a folded status back into the corresponding error, if any.
    #[must_use]
    pub fn error(&self) -> Option<ToolError> {
        match &self.status {
            ExecutionStatus::Denied { pattern } => Some(ToolError::Denied {
                pattern: pattern.clone(),
            }),
            ExecutionStatus::ConfirmationRequired { pattern } => {
                Some(ToolError::ConfirmationRequired {
                    pattern: pattern.clone(),
                })
            }
            ExecutionStatus::Cancelled => Some(ToolError::Cancelled {
                output: self.output.clone().into_bytes(),
            }),
            ExecutionStatus::Completed { .. }
            | ExecutionStatus::TimedOut
            | ExecutionStatus::Started { .. } => None,
        }
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.output)
    }
}

/// Event emitted during tool execution for real-time UI updates.
#[derive(Debug, Clone)]
pub enum ToolEvent {
    Started {
        tool_id: String,
        invocation_id: String,
        command: String,
    },
    OutputChunk {
        tool_id: String,
        invocation_id: String,
        chunk: String,
    },
    Completed {
        tool_id: String,
        invocation_id: String,
        status: ExecutionStatus,
        stats: FilterStats,
    },
}

pub type ToolEventTx = tokio::sync::mpsc::UnboundedSender<ToolEvent>;

/// Errors that can occur during tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {tool_id}")]
    UnknownTool { tool_id: String },

    #[error("invalid tool parameters: {message}")]
    InvalidParams { message: String },

    #[error("failed to spawn command: {message}")]
    Spawn { message: String },

    #[error("command timed out after {timeout:?}")]
    Timeout { timeout: Duration, output: Vec<u8> },

    #[error("command denied by pattern `{pattern}`")]
    Denied { pattern: String },

    #[error("command requires confirmation (pattern `{pattern}`)")]
    ConfirmationRequired { pattern: String },

    #[error("operation cancelled")]
    Cancelled { output: Vec<u8> },
}

/// Async trait for tool execution backends.
pub trait ToolExecutor: Send + Sync {
    fn execute_tool_call(
        &self,
        call: &ToolCall,
    ) -> impl Future<Output = Result<ExecutionResult, ToolError>> + Send;

    /// Execute bypassing `ask_user` confirmation (called after the user approves).
    /// Deny rules still apply.
    fn execute_confirmed(
        &self,
        call: &ToolCall,
    ) -> impl Future<Output = Result<ExecutionResult, ToolError>> + Send;
}
