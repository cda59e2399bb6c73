use std::path::{Path, PathBuf};

use anyhow::Context;
use cmdgate_tools::{HostEnvironment, ToolsConfig};

/// `--config`, then `CMDGATE_CONFIG`, then `config/default.toml`.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_owned();
    }
    if let Ok(path) = std::env::var("CMDGATE_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("config/default.toml")
}

/// Load the host config, falling back to defaults when the file is absent.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load(path: &Path) -> anyhow::Result<ToolsConfig> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str::<ToolsConfig>(&content).context("failed to parse config file")?
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        ToolsConfig::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut ToolsConfig) {
    if let Ok(v) = std::env::var("CMDGATE_DEFAULT_TIMEOUT") {
        match v.parse::<u64>() {
            Ok(secs) if secs > 0 => config.default_timeout = secs,
            _ => tracing::warn!("ignoring invalid CMDGATE_DEFAULT_TIMEOUT value: {v}"),
        }
    }
    if let Ok(v) = std::env::var("CMDGATE_ENVIRONMENT") {
        match v.parse::<HostEnvironment>() {
            Ok(env) => config.environment = env,
            Err(e) => tracing::warn!("ignoring CMDGATE_ENVIRONMENT: {e}"),
        }
    }
    if let Ok(dir) = std::env::var("CMDGATE_TOOLS_DIR")
        && !dir.trim().is_empty()
    {
        config
            .definition_paths
            .push(format!("{}/*.toml", dir.trim().trim_end_matches('/')));
    }
    if let Ok(dest) = std::env::var("CMDGATE_AUDIT_DESTINATION")
        && !dest.trim().is_empty()
    {
        config.audit.enabled = true;
        config.audit.destination = dest.trim().to_owned();
    }
}
