//! Declarative tool definitions: loading, validation and parameter rendering.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::config::HostEnvironment;
use crate::executor::ToolError;
use crate::permissions::{ConfirmationGate, ConfirmationPolicy};
use crate::readiness::ReadinessCriteria;

/// Execution ceiling applied when a definition leaves `timeout` unset.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Readiness deadline used when a port or keyword is configured without `startup_wait`.
pub const DEFAULT_STARTUP_WAIT: Duration = Duration::from_secs(10);

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%%|%([A-Za-z_][A-Za-z0-9_]*)%").unwrap());

/// Errors raised while loading a tool definition. The tool is unavailable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read tool definition {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse tool definition `{tool}`: {source}")]
    Parse {
        tool: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("tool `{tool}`: `command` must not be empty")]
    EmptyCommand { tool: String },

    #[error("tool `{tool}`: invalid `{field}`: {message}")]
    InvalidField {
        tool: String,
        field: &'static str,
        message: String,
    },

    #[error("tool `{tool}`: invalid regex in `{field}`: {source}")]
    InvalidRegex {
        tool: String,
        field: &'static str,
        #[source]
        source: regex::Error,
    },

    #[error("tool `{tool}`: `%{name}%` is used in `command` but not declared in `parameters`")]
    UndeclaredParameter { tool: String, name: String },

    #[error("tool `{tool}`: parameter `{name}` is declared but never used in `command`")]
    UnusedParameter { tool: String, name: String },

    #[error("tool `{tool}`: parameter `{name}` is declared more than once")]
    DuplicateParameter { tool: String, name: String },
}

/// Number that may be written either as a TOML number or as a string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LooseNumber {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl LooseNumber {
    /// `Ok(None)` for blank strings.
    #[allow(clippy::cast_precision_loss)]
    fn value(&self) -> Result<Option<f64>, String> {
        match self {
            Self::Integer(n) => Ok(Some(*n as f64)),
            Self::Float(f) => Ok(Some(*f)),
            Self::Text(s) if s.trim().is_empty() => Ok(None),
            Self::Text(s) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| format!("`{s}` is not a number")),
        }
    }
}

/// Parameter declaration as written in the source file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawParameter {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

fn default_true() -> bool {
    true
}

/// Output filter section as written in the source file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawOutputFilter {
    #[serde(default)]
    pub limit_lines: Option<LooseNumber>,
    #[serde(default)]
    pub limit_chars: Option<LooseNumber>,
    #[serde(default)]
    pub valuable_top_or_bottom: TopOrBottom,
    #[serde(default)]
    pub grep: Option<String>,
    #[serde(default)]
    pub grep_context_lines: Option<LooseNumber>,
    #[serde(default)]
    pub remove_from_output: Option<String>,
}

/// Unvalidated tool definition, straight from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawToolDefinition {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub command_workdir: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<RawParameter>,
    #[serde(default)]
    pub timeout: Option<LooseNumber>,
    #[serde(default)]
    pub output_filter: Option<RawOutputFilter>,
    #[serde(default)]
    pub startup_wait: Option<LooseNumber>,
    #[serde(default)]
    pub startup_wait_port: Option<LooseNumber>,
    #[serde(default)]
    pub startup_wait_keyword: Option<String>,
    #[serde(default)]
    pub available: Availability,
    #[serde(default)]
    pub confirmation: ConfirmationPolicy,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Which end of the output survives truncation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopOrBottom {
    #[default]
    Top,
    Bottom,
}

/// Host environments in which the tool may be offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Availability {
    #[serde(default = "default_true")]
    pub on_your_laptop: bool,
    #[serde(default = "default_true")]
    pub when_isolated: bool,
}

impl Default for Availability {
    fn default() -> Self {
        Self {
            on_your_laptop: true,
            when_isolated: true,
        }
    }
}

impl Availability {
    #[must_use]
    pub fn allows(&self, environment: HostEnvironment) -> bool {
        match environment {
            HostEnvironment::Laptop => self.on_your_laptop,
            HostEnvironment::Isolated => self.when_isolated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub description: String,
    pub required: bool,
    pub default: Option<String>,
}

/// Validated output filter settings.
#[derive(Debug, Clone, Default)]
pub struct OutputFilterConfig {
    pub limit_lines: Option<usize>,
    pub limit_chars: Option<usize>,
    pub valuable_top_or_bottom: TopOrBottom,
    pub grep: Option<Regex>,
    pub grep_context_lines: usize,
    pub remove_from_output: Option<Regex>,
}

/// Validated, immutable tool definition.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub id: String,
    pub command: String,
    pub command_workdir: Option<PathBuf>,
    pub description: String,
    pub parameters: Vec<Parameter>,
    pub timeout: Duration,
    pub output_filter: Option<OutputFilterConfig>,
    pub readiness: Option<ReadinessCriteria>,
    pub available: Availability,
    pub confirmation: ConfirmationGate,
    pub env: BTreeMap<String, String>,
}

impl ToolDefinition {
    /// Parse a TOML tool definition using [`DEFAULT_TIMEOUT`] when `timeout` is unset.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the text is not valid TOML or fails validation.
    pub fn parse(id: &str, raw: &str) -> Result<Self, ConfigError> {
        Self::parse_with_timeout(id, raw, DEFAULT_TIMEOUT)
    }

    /// # Errors
    ///
    /// Returns `ConfigError` when the text is not valid TOML or fails validation.
    pub fn parse_with_timeout(
        id: &str,
        raw: &str,
        default_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let parsed: RawToolDefinition = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            tool: id.to_owned(),
            source,
        })?;
        Self::from_raw(id, parsed, default_timeout)
    }

    /// Validate an inline `[tools.<id>]` table from the host config.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the table has the wrong shape or fails validation.
    pub fn from_value(
        id: &str,
        value: toml::Value,
        default_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let parsed: RawToolDefinition = value.try_into().map_err(|source| ConfigError::Parse {
            tool: id.to_owned(),
            source,
        })?;
        Self::from_raw(id, parsed, default_timeout)
    }

    /// Load `<dir>/<id>.toml`; the file stem becomes the tool id.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the file cannot be read or fails validation.
    pub fn load_file(path: &Path, default_timeout: Duration) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::parse_with_timeout(&id, &content, default_timeout)
    }

    /// Validate a raw definition.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure found.
    pub fn from_raw(
        id: &str,
        raw: RawToolDefinition,
        default_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let tool = id.to_owned();
        let command = raw.command.trim().to_owned();
        if command.is_empty() {
            return Err(ConfigError::EmptyCommand { tool });
        }

        let parameters = validate_parameters(&tool, &command, raw.parameters)?;

        let timeout = seconds(&tool, "timeout", raw.timeout.as_ref())?.unwrap_or(default_timeout);

        let output_filter = raw
            .output_filter
            .map(|f| validate_filter(&tool, f))
            .transpose()?;

        let startup_wait = seconds(&tool, "startup_wait", raw.startup_wait.as_ref())?;
        let port = match count(&tool, "startup_wait_port", raw.startup_wait_port.as_ref())? {
            None => None,
            Some(p) => match u16::try_from(p) {
                Ok(p) if p > 0 => Some(p),
                _ => {
                    return Err(invalid(
                        &tool,
                        "startup_wait_port",
                        format!("{p} is not a TCP port"),
                    ));
                }
            },
        };
        let keyword = raw.startup_wait_keyword.filter(|k| !k.is_empty());
        let readiness = (startup_wait.is_some() || port.is_some() || keyword.is_some()).then(|| {
            ReadinessCriteria {
                deadline: startup_wait.unwrap_or(DEFAULT_STARTUP_WAIT),
                port,
                keyword,
            }
        });

        Ok(Self {
            command_workdir: expand_workdir(&tool, &raw.command_workdir)?,
            id: tool,
            command,
            description: raw.description,
            parameters,
            timeout,
            output_filter,
            readiness,
            available: raw.available,
            confirmation: ConfirmationGate::new(&raw.confirmation),
            env: raw.env,
        })
    }

    /// Working directory for execution, defaulting to the current directory.
    #[must_use]
    pub fn workdir(&self) -> PathBuf {
        self.command_workdir.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }

    /// True when the command launches a long-running service.
    #[must_use]
    pub fn is_service(&self) -> bool {
        self.readiness.is_some()
    }

    /// Substitute parameter bindings into the command template.
    ///
    /// # Errors
    ///
    /// Returns `ToolError::InvalidParams` on unknown bindings, unsupported value
    /// types, or a missing required parameter without default.
    pub fn render<S: std::hash::BuildHasher>(
        &self,
        bindings: &HashMap<String, serde_json::Value, S>,
    ) -> Result<String, ToolError> {
        if let Some(unknown) = bindings
            .keys()
            .find(|k| !self.parameters.iter().any(|p| &p.name == *k))
        {
            return Err(ToolError::InvalidParams {
                message: format!("tool `{}` has no parameter `{unknown}`", self.id),
            });
        }

        let mut values: HashMap<&str, String> = HashMap::with_capacity(self.parameters.len());
        for param in &self.parameters {
            let bound = match bindings.get(&param.name) {
                Some(value) => {
                    binding_text(value).map_err(|message| ToolError::InvalidParams {
                        message: format!("parameter `{}`: {message}", param.name),
                    })?
                }
                None => None,
            };
            let value = match (bound, &param.default) {
                (Some(v), _) => v,
                (None, Some(default)) => default.clone(),
                (None, None) if !param.required => String::new(),
                (None, None) => {
                    return Err(ToolError::InvalidParams {
                        message: format!("missing required parameter `{}`", param.name),
                    });
                }
            };
            values.insert(param.name.as_str(), value);
        }

        let rendered = PLACEHOLDER_RE.replace_all(&self.command, |caps: &regex::Captures<'_>| {
            caps.get(1)
                .and_then(|name| values.get(name.as_str()))
                .map_or_else(|| "%".to_owned(), Clone::clone)
        });
        Ok(rendered.into_owned())
    }
}

/// Names of `%name%` placeholders in order of first appearance.
#[must_use]
pub fn referenced_parameters(command: &str) -> Vec<&str> {
    let mut seen = Vec::new();
    for caps in PLACEHOLDER_RE.captures_iter(command) {
        if let Some(name) = caps.get(1).map(|m| m.as_str())
            && !seen.contains(&name)
        {
            seen.push(name);
        }
    }
    seen
}

fn validate_parameters(
    tool: &str,
    command: &str,
    raw: Vec<RawParameter>,
) -> Result<Vec<Parameter>, ConfigError> {
    let mut declared = HashSet::with_capacity(raw.len());
    let mut parameters = Vec::with_capacity(raw.len());
    for p in raw {
        if !declared.insert(p.name.clone()) {
            return Err(ConfigError::DuplicateParameter {
                tool: tool.to_owned(),
                name: p.name,
            });
        }
        let default = match &p.default {
            None => None,
            Some(value) => binding_text(value).map_err(|message| {
                invalid(tool, "parameters", format!("default of `{}`: {message}", p.name))
            })?,
        };
        parameters.push(Parameter {
            name: p.name,
            description: p.description,
            required: p.required,
            default,
        });
    }

    let referenced = referenced_parameters(command);
    if let Some(name) = referenced.iter().find(|n| !declared.contains(**n)) {
        return Err(ConfigError::UndeclaredParameter {
            tool: tool.to_owned(),
            name: (*name).to_owned(),
        });
    }
    if let Some(p) = parameters
        .iter()
        .find(|p| !referenced.contains(&p.name.as_str()))
    {
        return Err(ConfigError::UnusedParameter {
            tool: tool.to_owned(),
            name: p.name.clone(),
        });
    }
    Ok(parameters)
}

fn validate_filter(tool: &str, raw: RawOutputFilter) -> Result<OutputFilterConfig, ConfigError> {
    let limit_lines = positive(tool, "output_filter.limit_lines", raw.limit_lines.as_ref())?;
    let limit_chars = positive(tool, "output_filter.limit_chars", raw.limit_chars.as_ref())?;
    let grep_context_lines = count(
        tool,
        "output_filter.grep_context_lines",
        raw.grep_context_lines.as_ref(),
    )?
    .unwrap_or(0);

    Ok(OutputFilterConfig {
        limit_lines,
        limit_chars,
        valuable_top_or_bottom: raw.valuable_top_or_bottom,
        grep: compile_regex(tool, "output_filter.grep", raw.grep)?,
        grep_context_lines,
        remove_from_output: compile_regex(
            tool,
            "output_filter.remove_from_output",
            raw.remove_from_output,
        )?,
    })
}

fn compile_regex(
    tool: &str,
    field: &'static str,
    pattern: Option<String>,
) -> Result<Option<Regex>, ConfigError> {
    match pattern.filter(|p| !p.is_empty()) {
        None => Ok(None),
        Some(p) => Regex::new(&p)
            .map(Some)
            .map_err(|source| ConfigError::InvalidRegex {
                tool: tool.to_owned(),
                field,
                source,
            }),
    }
}

fn expand_workdir(tool: &str, raw: &str) -> Result<Option<PathBuf>, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let path = match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .ok_or_else(|| invalid(tool, "command_workdir", "home directory is unknown"))?
            .join(rest),
        None if raw == "~" => dirs::home_dir()
            .ok_or_else(|| invalid(tool, "command_workdir", "home directory is unknown"))?,
        None => PathBuf::from(raw),
    };
    if !path.is_absolute() {
        return Err(invalid(
            tool,
            "command_workdir",
            format!("`{raw}` is not an absolute path"),
        ));
    }
    Ok(Some(path))
}

fn invalid(tool: &str, field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidField {
        tool: tool.to_owned(),
        field,
        message: message.into(),
    }
}

fn number(
    tool: &str,
    field: &'static str,
    value: Option<&LooseNumber>,
) -> Result<Option<f64>, ConfigError> {
    let Some(value) = value else {
        return Ok(None);
    };
    value.value().map_err(|message| invalid(tool, field, message))
}

fn seconds(
    tool: &str,
    field: &'static str,
    value: Option<&LooseNumber>,
) -> Result<Option<Duration>, ConfigError> {
    let Some(secs) = number(tool, field, value)? else {
        return Ok(None);
    };
    if secs < 0.0 {
        return Err(invalid(tool, field, format!("{secs} is negative")));
    }
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|e| invalid(tool, field, e.to_string()))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn count(
    tool: &str,
    field: &'static str,
    value: Option<&LooseNumber>,
) -> Result<Option<usize>, ConfigError> {
    let Some(n) = number(tool, field, value)? else {
        return Ok(None);
    };
    if !n.is_finite() || n.fract() != 0.0 || n < 0.0 || n > usize::MAX as f64 {
        return Err(invalid(
            tool,
            field,
            format!("expected a non-negative integer, got {n}"),
        ));
    }
    Ok(Some(n as usize))
}

fn positive(
    tool: &str,
    field: &'static str,
    value: Option<&LooseNumber>,
) -> Result<Option<usize>, ConfigError> {
    match count(tool, field, value)? {
        Some(0) => Err(invalid(tool, field, "must be greater than zero")),
        other => Ok(other),
    }
}

/// Text form of a parameter binding. `Ok(None)` for `null`.
fn binding_text(value: &serde_json::Value) -> Result<Option<String>, String> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.clone())),
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        serde_json::Value::Bool(b) => Ok(Some(b.to_string())),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
            Err("expected a string, number or boolean".to_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREREQUISITES: &str = r#"
        command = "cat prerequisites.info"
        command_workdir = "/tmp"
        description = "Show project prerequisites"
        timeout = "10"

        [output_filter]
        limit_lines = 100
        limit_chars = "10000"
        valuable_top_or_bottom = "top"
        grep = ""
        grep_context_lines = 0
        remove_from_output = ""

        [available]
        on_your_laptop = true
        when_isolated = false

        [confirmation]
        ask_user = []
        deny = ["sudo*"]
    "#;

    fn bindings(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn parse_full_definition() {
        let def = ToolDefinition::parse("prerequisites", PREREQUISITES).unwrap();
        assert_eq!(def.id, "prerequisites");
        assert_eq!(def.command, "cat prerequisites.info");
        assert_eq!(def.command_workdir, Some(PathBuf::from("/tmp")));
        assert_eq!(def.timeout, Duration::from_secs(10));
        let filter = def.output_filter.unwrap();
        assert_eq!(filter.limit_lines, Some(100));
        assert_eq!(filter.limit_chars, Some(10_000));
        assert_eq!(filter.valuable_top_or_bottom, TopOrBottom::Top);
        assert!(filter.grep.is_none());
        assert!(filter.remove_from_output.is_none());
        assert!(def.available.on_your_laptop);
        assert!(!def.available.when_isolated);
        assert_eq!(def.confirmation.deny_patterns().len(), 1);
        assert!(def.readiness.is_none());
    }

    #[test]
    fn empty_command_rejected() {
        let err = ToolDefinition::parse("t", "command = \"  \"").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCommand { .. }));
        let err = ToolDefinition::parse("t", "description = \"no command\"").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCommand { .. }));
    }

    #[test]
    fn timeout_defaults_to_ceiling() {
        let def = ToolDefinition::parse("t", "command = \"ls\"").unwrap();
        assert_eq!(def.timeout, DEFAULT_TIMEOUT);
        let def = ToolDefinition::parse_with_timeout("t", "command = \"ls\"", Duration::from_secs(7))
            .unwrap();
        assert_eq!(def.timeout, Duration::from_secs(7));
    }

    #[test]
    fn timeout_accepts_fractional_and_string() {
        let def = ToolDefinition::parse("t", "command = \"ls\"\ntimeout = 0.5").unwrap();
        assert_eq!(def.timeout, Duration::from_millis(500));
        let def = ToolDefinition::parse("t", "command = \"ls\"\ntimeout = \" 3 \"").unwrap();
        assert_eq!(def.timeout, Duration::from_secs(3));
    }

    #[test]
    fn timeout_rejects_garbage_and_negative() {
        let err = ToolDefinition::parse("t", "command = \"ls\"\ntimeout = \"soon\"").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidField {
                field: "timeout",
                ..
            }
        ));
        let err = ToolDefinition::parse("t", "command = \"ls\"\ntimeout = -1").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { .. }));
    }

    #[test]
    fn limits_must_be_positive() {
        for raw in [
            "command = \"ls\"\n[output_filter]\nlimit_lines = 0",
            "command = \"ls\"\n[output_filter]\nlimit_chars = -5",
            "command = \"ls\"\n[output_filter]\nlimit_lines = \"0\"",
            "command = \"ls\"\n[output_filter]\nlimit_lines = 2.5",
        ] {
            let err = ToolDefinition::parse("t", raw).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidField { .. }),
                "accepted: {raw}"
            );
        }
    }

    #[test]
    fn malformed_grep_rejected() {
        let err =
            ToolDefinition::parse("t", "command = \"ls\"\n[output_filter]\ngrep = \"(unclosed\"")
                .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidRegex {
                field: "output_filter.grep",
                ..
            }
        ));
    }

    #[test]
    fn absent_filter_means_none() {
        let def = ToolDefinition::parse("t", "command = \"ls\"").unwrap();
        assert!(def.output_filter.is_none());
    }

    #[test]
    fn undeclared_parameter_rejected() {
        let err = ToolDefinition::parse("t", "command = \"cat %file%\"").unwrap_err();
        assert!(matches!(err, ConfigError::UndeclaredParameter { ref name, .. } if name == "file"));
    }

    #[test]
    fn unused_parameter_rejected() {
        let raw = r#"
            command = "ls"
            [[parameters]]
            name = "path"
        "#;
        let err = ToolDefinition::parse("t", raw).unwrap_err();
        assert!(matches!(err, ConfigError::UnusedParameter { ref name, .. } if name == "path"));
    }

    #[test]
    fn duplicate_parameter_rejected() {
        let raw = r#"
            command = "cat %file%"
            [[parameters]]
            name = "file"
            [[parameters]]
            name = "file"
        "#;
        let err = ToolDefinition::parse("t", raw).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateParameter { .. }));
    }

    #[test]
    fn relative_workdir_rejected() {
        let err = ToolDefinition::parse("t", "command = \"ls\"\ncommand_workdir = \"src\"")
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidField {
                field: "command_workdir",
                ..
            }
        ));
    }

    #[test]
    fn invalid_toml_reports_parse_error() {
        let err = ToolDefinition::parse("broken", "command = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { ref tool, .. } if tool == "broken"));
    }

    #[test]
    fn readiness_criteria_from_fields() {
        let def = ToolDefinition::parse(
            "svc",
            "command = \"python -m http.server 8000\"\nstartup_wait_port = \"8000\"\nstartup_wait_keyword = \"\"",
        )
        .unwrap();
        let readiness = def.readiness.unwrap();
        assert_eq!(readiness.port, Some(8000));
        assert_eq!(readiness.keyword, None);
        assert_eq!(readiness.deadline, DEFAULT_STARTUP_WAIT);

        let def = ToolDefinition::parse(
            "svc",
            "command = \"serve\"\nstartup_wait = 3\nstartup_wait_keyword = \"listening\"",
        )
        .unwrap();
        let readiness = def.readiness.clone().unwrap();
        assert_eq!(readiness.deadline, Duration::from_secs(3));
        assert_eq!(readiness.keyword.as_deref(), Some("listening"));
        assert!(def.is_service());
    }

    #[test]
    fn blank_readiness_fields_mean_plain_command() {
        let def = ToolDefinition::parse(
            "t",
            "command = \"ls\"\nstartup_wait_port = \"\"\nstartup_wait = \"\"",
        )
        .unwrap();
        assert!(!def.is_service());
    }

    #[test]
    fn out_of_range_port_rejected() {
        let err =
            ToolDefinition::parse("t", "command = \"ls\"\nstartup_wait_port = 70000").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidField {
                field: "startup_wait_port",
                ..
            }
        ));
    }

    #[test]
    fn availability_gates_environment() {
        let def = ToolDefinition::parse("prerequisites", PREREQUISITES).unwrap();
        assert!(def.available.allows(HostEnvironment::Laptop));
        assert!(!def.available.allows(HostEnvironment::Isolated));
        assert!(Availability::default().allows(HostEnvironment::Isolated));
    }

    #[test]
    fn render_substitutes_parameters() {
        let raw = r#"
            command = "grep -n %pattern% %file%"
            [[parameters]]
            name = "pattern"
            [[parameters]]
            name = "file"
            required = false
            default = "README.md"
        "#;
        let def = ToolDefinition::parse("t", raw).unwrap();
        let cmd = def
            .render(&bindings(&[("pattern", serde_json::json!("TODO"))]))
            .unwrap();
        assert_eq!(cmd, "grep -n TODO README.md");
        let cmd = def
            .render(&bindings(&[
                ("pattern", serde_json::json!(42)),
                ("file", serde_json::json!("src/lib.rs")),
            ]))
            .unwrap();
        assert_eq!(cmd, "grep -n 42 src/lib.rs");
    }

    #[test]
    fn render_missing_required_fails() {
        let raw = "command = \"cat %file%\"\n[[parameters]]\nname = \"file\"";
        let def = ToolDefinition::parse("t", raw).unwrap();
        let err = def.render(&HashMap::new()).unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));
    }

    #[test]
    fn render_optional_without_default_is_empty() {
        let raw = "command = \"ls %flags%\"\n[[parameters]]\nname = \"flags\"\nrequired = false";
        let def = ToolDefinition::parse("t", raw).unwrap();
        assert_eq!(def.render(&HashMap::new()).unwrap(), "ls ");
    }

    #[test]
    fn render_rejects_unknown_binding_and_nested_values() {
        let raw = "command = \"cat %file%\"\n[[parameters]]\nname = \"file\"";
        let def = ToolDefinition::parse("t", raw).unwrap();
        let err = def
            .render(&bindings(&[
                ("file", serde_json::json!("a")),
                ("extra", serde_json::json!("b")),
            ]))
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));
        let err = def
            .render(&bindings(&[("file", serde_json::json!(["a", "b"]))]))
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));
    }

    #[test]
    fn double_percent_is_literal() {
        let def = ToolDefinition::parse("t", "command = \"date +%%Y\"").unwrap();
        assert_eq!(def.render(&HashMap::new()).unwrap(), "date +%Y");
    }

    #[test]
    fn referenced_parameters_in_order() {
        assert_eq!(
            referenced_parameters("cp %src% %dst% && ls %src%"),
            vec!["src", "dst"]
        );
        assert!(referenced_parameters("echo 100%%").is_empty());
    }

    #[test]
    fn load_file_uses_stem_as_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list_files.toml");
        std::fs::write(&path, "command = \"ls\"").unwrap();
        let def = ToolDefinition::load_file(&path, DEFAULT_TIMEOUT).unwrap();
        assert_eq!(def.id, "list_files");
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err =
            ToolDefinition::load_file(Path::new("/nonexistent/tool.toml"), DEFAULT_TIMEOUT)
                .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn env_entries_are_kept() {
        let def =
            ToolDefinition::parse("t", "command = \"make\"\n[env]\nCARGO_TERM_COLOR = \"never\"")
                .unwrap();
        assert_eq!(def.env.get("CARGO_TERM_COLOR").map(String::as_str), Some("never"));
    }
}
