//! Launched long-running processes, keyed by tool id.

use std::collections::HashMap;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::definition::ToolDefinition;
use crate::executor::FilterStats;
use crate::filter::OutputFilterPipeline;
use crate::readiness::ReadinessState;
use crate::shell::{ProcessOutcome, RunningProcess};

/// A launched service and what it was launched from.
#[derive(Debug)]
pub struct ServiceEntry {
    process: RunningProcess,
    definition: Arc<ToolDefinition>,
    invocation_id: String,
    readiness: ReadinessState,
}

impl ServiceEntry {
    #[must_use]
    pub fn new(
        process: RunningProcess,
        definition: Arc<ToolDefinition>,
        invocation_id: String,
        readiness: ReadinessState,
    ) -> Self {
        Self {
            process,
            definition,
            invocation_id,
            readiness,
        }
    }

    fn status(&self) -> ServiceStatus {
        let raw = self.process.buffer().snapshot();
        let filtered = OutputFilterPipeline::from_optional(self.definition.output_filter.as_ref())
            .apply(&String::from_utf8_lossy(&raw));
        let outcome = self.process.outcome();
        #[allow(clippy::cast_possible_truncation)]
        let uptime_ms = self.process.elapsed().as_millis() as u64;
        ServiceStatus {
            tool_id: self.definition.id.clone(),
            invocation_id: self.invocation_id.clone(),
            pid: self.process.pid(),
            running: outcome.is_none(),
            exit_code: match outcome {
                Some(ProcessOutcome::Exited { exit_code }) => exit_code,
                _ => None,
            },
            readiness: self.readiness,
            stats: filtered.stats(raw.len()),
            output: filtered.output,
            uptime_ms,
        }
    }
}

/// Snapshot of a launched service.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ServiceStatus {
    pub tool_id: String,
    pub invocation_id: String,
    pub pid: Option<u32>,
    pub running: bool,
    pub exit_code: Option<i32>,
    pub readiness: ReadinessState,
    /// Filtered output captured so far.
    pub output: String,
    pub stats: FilterStats,
    pub uptime_ms: u64,
}

#[derive(Debug, Default)]
pub struct ServiceTable {
    entries: Mutex<HashMap<String, ServiceEntry>>,
}

impl ServiceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `entry` under `tool_id`, stopping any instance it replaces.
    pub async fn insert(&self, tool_id: &str, entry: ServiceEntry) {
        let previous = self.entries.lock().await.insert(tool_id.to_owned(), entry);
        if let Some(previous) = previous {
            let outcome = previous.process.stop().await;
            tracing::info!(tool = tool_id, ?outcome, "replaced running service");
        }
    }

    /// Stop and forget the service, returning its final status.
    pub async fn stop(&self, tool_id: &str) -> Option<ServiceStatus> {
        let entry = self.entries.lock().await.remove(tool_id)?;
        let outcome = entry.process.stop().await;
        tracing::info!(tool = tool_id, ?outcome, "service stopped");
        Some(entry.status())
    }

    pub async fn status(&self, tool_id: &str) -> Option<ServiceStatus> {
        self.entries.lock().await.get(tool_id).map(ServiceEntry::status)
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every tracked service.
    pub async fn stop_all(&self) -> Vec<ServiceStatus> {
        let entries: Vec<ServiceEntry> = self
            .entries
            .lock()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        let mut stopped = Vec::with_capacity(entries.len());
        for entry in entries {
            entry.process.stop().await;
            stopped.push(entry.status());
        }
        stopped.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));
        stopped
    }
}
