use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    120
}

fn default_kill_grace_ms() -> u64 {
    2000
}

fn default_readiness_poll_ms() -> u64 {
    250
}

fn default_audit_destination() -> String {
    "stdout".into()
}

/// Where the host is running; tools declare in which environments they are offered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostEnvironment {
    #[default]
    Laptop,
    Isolated,
}

impl std::str::FromStr for HostEnvironment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "laptop" => Ok(Self::Laptop),
            "isolated" => Ok(Self::Isolated),
            other => Err(format!("unknown environment `{other}`, expected laptop or isolated")),
        }
    }
}

/// Top-level configuration for tool loading and execution.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub environment: HostEnvironment,
    /// Execution ceiling in seconds for definitions without `timeout`.
    #[serde(default = "default_timeout")]
    pub default_timeout: u64,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    #[serde(default = "default_readiness_poll_ms")]
    pub readiness_poll_ms: u64,
    /// Glob patterns of `<tool_id>.toml` definition files. `~/` is expanded.
    #[serde(default)]
    pub definition_paths: Vec<String>,
    #[serde(default)]
    pub audit: AuditConfig,
    /// Inline `[tools.<id>]` tables, validated one by one when the registry loads.
    #[serde(default)]
    pub tools: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_audit_destination")]
    pub destination: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            environment: HostEnvironment::default(),
            default_timeout: default_timeout(),
            kill_grace_ms: default_kill_grace_ms(),
            readiness_poll_ms: default_readiness_poll_ms(),
            definition_paths: Vec::new(),
            audit: AuditConfig::default(),
            tools: BTreeMap::new(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            destination: default_audit_destination(),
        }
    }
}

impl ToolsConfig {
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout)
    }

    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Readiness polling interval, never zero.
    #[must_use]
    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms.max(1))
    }

    /// Definition files matched by `definition_paths`, sorted and deduplicated.
    /// Malformed patterns and unreadable entries are logged and skipped.
    #[must_use]
    pub fn definition_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for pattern in &self.definition_paths {
            let expanded = expand_home(pattern);
            let entries = match glob::glob(&expanded) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(pattern = %pattern, "invalid definition path pattern: {e}");
                    continue;
                }
            };
            for entry in entries {
                match entry {
                    Ok(path) if path.is_file() => files.push(path),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("skipping definition path: {e}"),
                }
            }
        }
        files.sort();
        files.dedup();
        files
    }
}

fn expand_home(pattern: &str) -> String {
    match (pattern.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).display().to_string(),
        _ => pattern.to_owned(),
    }
}
