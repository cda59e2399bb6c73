//! Guarded execution of declarative shell tools: definitions, confirmation
//! gate, supervised processes, readiness probing and output filtering.

pub mod audit;
pub mod config;
pub mod definition;
pub mod executor;
pub mod filter;
pub mod pattern;
pub mod permissions;
pub mod readiness;
pub mod registry;
pub mod runner;
pub mod service;
pub mod shell;

pub use audit::{AuditEntry, AuditLogger, AuditResult};
pub use config::{AuditConfig, HostEnvironment, ToolsConfig};
pub use definition::{
    Availability, ConfigError, OutputFilterConfig, Parameter, RawToolDefinition, ToolDefinition,
    TopOrBottom,
};
pub use executor::{
    ExecutionResult, ExecutionStatus, FilterStats, ToolCall, ToolError, ToolEvent, ToolEventTx,
    ToolExecutor,
};
pub use filter::{FilterResult, OutputFilterPipeline};
pub use pattern::GlobPattern;
pub use permissions::{ConfirmationGate, ConfirmationPolicy, GateDecision};
pub use readiness::{ReadinessCriteria, ReadinessMonitor, ReadinessState};
pub use registry::ToolRegistry;
pub use runner::{Bindings, CheckResult, ToolRunner};
pub use service::{ServiceStatus, ServiceTable};
pub use shell::{OutputBuffer, ProcessExecutor, ProcessOutcome, ProcessOutput, RunningProcess};
