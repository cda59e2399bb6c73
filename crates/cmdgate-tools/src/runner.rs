use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::audit::{AuditEntry, AuditLogger, AuditResult};
use crate::config::ToolsConfig;
use crate::definition::ToolDefinition;
use crate::executor::{
    ExecutionResult, ExecutionStatus, FilterStats, ToolCall, ToolError, ToolEvent, ToolEventTx,
    ToolExecutor,
};
use crate::filter::OutputFilterPipeline;
use crate::permissions::GateDecision;
use crate::readiness::{ReadinessCriteria, ReadinessMonitor, ReadinessState};
use crate::registry::ToolRegistry;
use crate::service::{ServiceEntry, ServiceStatus, ServiceTable};
use crate::shell::{ProcessExecutor, ProcessOutcome};

pub type Bindings = HashMap<String, serde_json::Value>;

/// Rendered command and the gate decision it would receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub command: String,
    pub decision: GateDecision,
}

/// Runs registered tools: render, gate, execute, filter, assemble.
#[derive(Debug)]
pub struct ToolRunner {
    registry: Arc<ToolRegistry>,
    executor: ProcessExecutor,
    poll_interval: Duration,
    services: ServiceTable,
    audit_logger: Option<AuditLogger>,
    tool_event_tx: Option<ToolEventTx>,
}

struct Invocation<'a> {
    id: String,
    definition: &'a Arc<ToolDefinition>,
    command: String,
    decision: GateDecision,
    started: Instant,
}

impl ToolRunner {
    #[must_use]
    pub fn new(registry: impl Into<Arc<ToolRegistry>>, config: &ToolsConfig) -> Self {
        Self {
            registry: registry.into(),
            executor: ProcessExecutor::new(config.kill_grace()),
            poll_interval: config.readiness_poll(),
            services: ServiceTable::new(),
            audit_logger: None,
            tool_event_tx: None,
        }
    }

    #[must_use]
    pub fn with_audit(mut self, logger: AuditLogger) -> Self {
        self.audit_logger = Some(logger);
        self
    }

    #[must_use]
    pub fn with_tool_event_tx(mut self, tx: ToolEventTx) -> Self {
        self.tool_event_tx = Some(tx);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Render the command and evaluate the gate without executing anything.
    ///
    /// # Errors
    ///
    /// Returns `ToolError::UnknownTool` or `ToolError::InvalidParams`.
    pub fn check(&self, tool_id: &str, bindings: &Bindings) -> Result<CheckResult, ToolError> {
        let definition = self.find(tool_id)?;
        let command = definition.render(bindings)?;
        let decision = definition.confirmation.evaluate(&command);
        Ok(CheckResult { command, decision })
    }

    /// Invoke a tool. Commands matching an `ask_user` pattern are not run and
    /// yield `ConfirmationRequired`.
    ///
    /// # Errors
    ///
    /// Returns `ToolError` for an unknown tool, invalid parameters or a spawn failure.
    pub async fn invoke(
        &self,
        tool_id: &str,
        bindings: &Bindings,
    ) -> Result<ExecutionResult, ToolError> {
        self.invoke_with_cancel(tool_id, bindings, false, &CancellationToken::new())
            .await
    }

    /// Invoke after the user approved; `ask_user` is skipped, `deny` is not.
    ///
    /// # Errors
    ///
    /// Returns `ToolError` for an unknown tool, invalid parameters or a spawn failure.
    pub async fn invoke_confirmed(
        &self,
        tool_id: &str,
        bindings: &Bindings,
    ) -> Result<ExecutionResult, ToolError> {
        self.invoke_with_cancel(tool_id, bindings, true, &CancellationToken::new())
            .await
    }

    /// # Errors
    ///
    /// Returns `ToolError` for an unknown tool, invalid parameters or a spawn failure.
    pub async fn invoke_with_cancel(
        &self,
        tool_id: &str,
        bindings: &Bindings,
        confirmed: bool,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ToolError> {
        let definition = self.find(tool_id)?;
        let invocation_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("invoke", tool = %tool_id, invocation_id = %invocation_id);
        self.invoke_inner(&definition, invocation_id, bindings, confirmed, cancel)
            .instrument(span)
            .await
    }

    /// Stop a launched service and return its final filtered output.
    pub async fn stop_service(&self, tool_id: &str) -> Option<ServiceStatus> {
        self.services.stop(tool_id).await
    }

    pub async fn service_status(&self, tool_id: &str) -> Option<ServiceStatus> {
        self.services.status(tool_id).await
    }

    pub async fn running_services(&self) -> Vec<String> {
        self.services.ids().await
    }

    /// Stop every launched service.
    pub async fn shutdown(&self) -> Vec<ServiceStatus> {
        let stopped = self.services.stop_all().await;
        if !stopped.is_empty() {
            tracing::info!(count = stopped.len(), "stopped services on shutdown");
        }
        stopped
    }

    fn find(&self, tool_id: &str) -> Result<Arc<ToolDefinition>, ToolError> {
        self.registry
            .find(tool_id)
            .ok_or_else(|| ToolError::UnknownTool {
                tool_id: tool_id.to_owned(),
            })
    }

    async fn invoke_inner(
        &self,
        definition: &Arc<ToolDefinition>,
        invocation_id: String,
        bindings: &Bindings,
        confirmed: bool,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ToolError> {
        let started = Instant::now();
        let command = definition.render(bindings)?;
        let decision = definition.confirmation.evaluate(&command);
        let inv = Invocation {
            id: invocation_id,
            definition,
            command,
            decision,
            started,
        };

        match &inv.decision {
            GateDecision::Deny { pattern } => {
                tracing::warn!(command = %inv.command, pattern = %pattern, "command denied");
                let status = ExecutionStatus::Denied {
                    pattern: pattern.clone(),
                };
                return Ok(self.finish(&inv, status, &[], None).await);
            }
            GateDecision::RequireConfirmation { pattern } if !confirmed => {
                tracing::info!(command = %inv.command, pattern = %pattern, "confirmation required");
                let status = ExecutionStatus::ConfirmationRequired {
                    pattern: pattern.clone(),
                };
                return Ok(self.finish(&inv, status, &[], None).await);
            }
            _ => {}
        }

        if let Some(tx) = &self.tool_event_tx {
            let _ = tx.send(ToolEvent::Started {
                tool_id: definition.id.clone(),
                invocation_id: inv.id.clone(),
                command: inv.command.clone(),
            });
        }

        let executor = self.executor_for(&inv);
        let pipeline = OutputFilterPipeline::from_optional(definition.output_filter.as_ref());

        if let Some(criteria) = &definition.readiness {
            return self
                .launch_service(&inv, &executor, criteria, &pipeline, cancel)
                .await;
        }

        let workdir = definition.workdir();
        let (status, output) = match executor
            .run(&inv.command, &workdir, &definition.env, definition.timeout, cancel)
            .await
        {
            Ok(out) => (
                ExecutionStatus::Completed {
                    exit_code: out.exit_code,
                },
                out.output,
            ),
            Err(ToolError::Timeout { output, .. }) => (ExecutionStatus::TimedOut, output),
            Err(ToolError::Cancelled { output }) => (ExecutionStatus::Cancelled, output),
            Err(e) => return Err(self.fail(&inv, e).await),
        };
        Ok(self.finish(&inv, status, &output, Some(&pipeline)).await)
    }

    async fn launch_service(
        &self,
        inv: &Invocation<'_>,
        executor: &ProcessExecutor,
        criteria: &ReadinessCriteria,
        pipeline: &OutputFilterPipeline,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ToolError> {
        let definition = inv.definition;
        if self.services.stop(&definition.id).await.is_some() {
            tracing::info!("stopped previous instance before relaunch");
        }

        let process = match executor.spawn(
            &inv.command,
            &definition.workdir(),
            &definition.env,
            definition.timeout,
            cancel,
        ) {
            Ok(process) => process,
            Err(e) => return Err(self.fail(inv, e).await),
        };

        let monitor = ReadinessMonitor::new(criteria.clone(), self.poll_interval);
        let readiness = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            state = monitor.wait(&process) => Some(state),
        };

        let Some(readiness @ (ReadinessState::Ready | ReadinessState::TimedOut)) = readiness else {
            let status = match process.wait().await {
                ProcessOutcome::Exited { exit_code } => ExecutionStatus::Completed { exit_code },
                ProcessOutcome::TimedOut => ExecutionStatus::TimedOut,
                ProcessOutcome::Cancelled => ExecutionStatus::Cancelled,
            };
            let output = process.buffer().snapshot();
            return Ok(self.finish(inv, status, &output, Some(pipeline)).await);
        };

        let output = process.buffer().snapshot();
        self.services
            .insert(
                &definition.id,
                ServiceEntry::new(
                    process,
                    Arc::clone(definition),
                    inv.id.clone(),
                    readiness,
                ),
            )
            .await;
        let status = ExecutionStatus::Started { readiness };
        Ok(self.finish(inv, status, &output, Some(pipeline)).await)
    }

    fn executor_for(&self, inv: &Invocation<'_>) -> ProcessExecutor {
        match &self.tool_event_tx {
            Some(tx) => self.executor.clone().with_events(
                tx.clone(),
                inv.definition.id.clone(),
                inv.id.clone(),
            ),
            None => self.executor.clone(),
        }
    }

    async fn finish(
        &self,
        inv: &Invocation<'_>,
        status: ExecutionStatus,
        raw: &[u8],
        pipeline: Option<&OutputFilterPipeline>,
    ) -> ExecutionResult {
        let (output, stats) = match pipeline {
            Some(pipeline) => {
                let filtered = pipeline.apply(&String::from_utf8_lossy(raw));
                let stats = filtered.stats(raw.len());
                (filtered.output, stats)
            }
            None => (String::new(), FilterStats::default()),
        };
        #[allow(clippy::cast_possible_truncation)]
        let elapsed_ms = inv.started.elapsed().as_millis() as u64;

        tracing::info!(%status, elapsed_ms, "{}", stats.format_inline(&inv.definition.id));
        self.log_audit(inv, AuditResult::from(&status), elapsed_ms)
            .await;
        if let Some(tx) = &self.tool_event_tx {
            let _ = tx.send(ToolEvent::Completed {
                tool_id: inv.definition.id.clone(),
                invocation_id: inv.id.clone(),
                status: status.clone(),
                stats: stats.clone(),
            });
        }

        ExecutionResult {
            invocation_id: inv.id.clone(),
            tool_id: inv.definition.id.clone(),
            command: inv.command.clone(),
            status,
            output,
            stats,
            elapsed_ms,
            decision: inv.decision.clone(),
        }
    }

    async fn fail(&self, inv: &Invocation<'_>, error: ToolError) -> ToolError {
        tracing::warn!(command = %inv.command, "execution failed: {error}");
        #[allow(clippy::cast_possible_truncation)]
        let elapsed_ms = inv.started.elapsed().as_millis() as u64;
        self.log_audit(
            inv,
            AuditResult::Error {
                message: error.to_string(),
            },
            elapsed_ms,
        )
        .await;
        error
    }

    async fn log_audit(&self, inv: &Invocation<'_>, result: AuditResult, duration_ms: u64) {
        if let Some(ref logger) = self.audit_logger {
            let entry = AuditEntry::now(
                &inv.id,
                &inv.definition.id,
                &inv.command,
                result,
                duration_ms,
            );
            logger.log(&entry).await;
        }
    }
}

impl ToolExecutor for ToolRunner {
    async fn execute_tool_call(&self, call: &ToolCall) -> Result<ExecutionResult, ToolError> {
        self.invoke(&call.tool_id, &call.params).await
    }

    async fn execute_confirmed(&self, call: &ToolCall) -> Result<ExecutionResult, ToolError> {
        self.invoke_confirmed(&call.tool_id, &call.params).await
    }
}
