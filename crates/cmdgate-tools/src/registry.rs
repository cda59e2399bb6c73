use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use crate::config::{HostEnvironment, ToolsConfig};
use crate::definition::{ConfigError, ToolDefinition};

/// Tools available in the host environment, keyed by id.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    environment: HostEnvironment,
    tools: BTreeMap<String, Arc<ToolDefinition>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new(environment: HostEnvironment) -> Self {
        Self {
            environment,
            tools: BTreeMap::new(),
        }
    }

    /// Load inline `[tools.<id>]` tables and definition files.
    ///
    /// Definitions that fail validation, are unavailable in the configured
    /// environment, or reuse an id are logged and skipped.
    #[must_use]
    pub fn load(config: &ToolsConfig) -> Self {
        let mut registry = Self::new(config.environment);
        let default_timeout = config.default_timeout();

        let inline = config.tools.iter().map(|(id, table)| {
            ToolDefinition::from_value(id, table.clone(), default_timeout)
        });
        let files = config
            .definition_files()
            .into_iter()
            .map(|path| ToolDefinition::load_file(&path, default_timeout));

        for result in inline.chain(files) {
            match result {
                Ok(definition) => {
                    registry.register(definition);
                }
                Err(e) => tracing::warn!("skipping tool definition: {e}"),
            }
        }
        tracing::info!(
            tools = registry.len(),
            environment = ?registry.environment,
            "tool registry loaded"
        );
        registry
    }

    /// Register a validated definition. Returns false if it was skipped.
    pub fn register(&mut self, definition: ToolDefinition) -> bool {
        if !definition.available.allows(self.environment) {
            tracing::info!(
                tool = %definition.id,
                environment = ?self.environment,
                "tool not available in this environment"
            );
            return false;
        }
        if self.tools.contains_key(&definition.id) {
            tracing::warn!(tool = %definition.id, "duplicate tool id, keeping the first definition");
            return false;
        }
        tracing::debug!(tool = %definition.id, "registered tool");
        self.tools
            .insert(definition.id.clone(), Arc::new(definition));
        true
    }

    /// Parse and register a TOML definition.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the definition is invalid.
    pub fn register_toml(&mut self, id: &str, raw: &str) -> Result<bool, ConfigError> {
        Ok(self.register(ToolDefinition::parse(id, raw)?))
    }

    #[must_use]
    pub fn environment(&self) -> HostEnvironment {
        self.environment
    }

    #[must_use]
    pub fn find(&self, id: &str) -> Option<Arc<ToolDefinition>> {
        self.tools.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn tools(&self) -> impl Iterator<Item = &Arc<ToolDefinition>> {
        self.tools.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Format tools for an agent prompt, excluding tools whose deny rules
    /// reject every command.
    #[must_use]
    pub fn format_for_prompt(&self) -> String {
        let mut out = String::from("<tools>\n");
        for tool in self.tools.values() {
            if tool.confirmation.is_fully_denied() {
                continue;
            }
            format_tool(&mut out, tool);
        }
        out.push_str("</tools>");
        out
    }

    /// JSON schema object describing the parameters of `id`.
    #[must_use]
    pub fn parameters_schema(&self, id: &str) -> Option<schemars::Schema> {
        self.tools.get(id).map(|tool| parameters_schema(tool))
    }
}

fn format_tool(out: &mut String, tool: &ToolDefinition) {
    let _ = writeln!(out, "## {}", tool.id);
    if !tool.description.is_empty() {
        let _ = writeln!(out, "{}", tool.description);
    }
    let _ = writeln!(
        out,
        "Invocation: use tool_call with {{\"tool_id\": \"{}\", \"params\": {{...}}}}",
        tool.id
    );
    if !tool.parameters.is_empty() {
        let _ = writeln!(out, "Parameters:");
        for p in &tool.parameters {
            let req = match (&p.default, p.required) {
                (Some(default), _) => format!("optional, default {default:?}"),
                (None, true) => "required".to_owned(),
                (None, false) => "optional".to_owned(),
            };
            let _ = writeln!(out, "  - {}: {} ({req})", p.name, p.description);
        }
    }
    let ask = tool.confirmation.ask_patterns();
    if !ask.is_empty() {
        let patterns: Vec<&str> = ask.iter().map(|p| p.as_str()).collect();
        let _ = writeln!(out, "Requires user confirmation for: {}", patterns.join(", "));
    }
    out.push('\n');
}

fn parameters_schema(tool: &ToolDefinition) -> schemars::Schema {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for p in &tool.parameters {
        let mut prop = serde_json::Map::new();
        prop.insert("type".into(), "string".into());
        if !p.description.is_empty() {
            prop.insert("description".into(), p.description.clone().into());
        }
        if let Some(default) = &p.default {
            prop.insert("default".into(), default.clone().into());
        } else if p.required {
            required.push(serde_json::Value::from(p.name.clone()));
        }
        properties.insert(p.name.clone(), prop.into());
    }

    let mut schema = serde_json::Map::new();
    schema.insert("type".into(), "object".into());
    if !tool.description.is_empty() {
        schema.insert("description".into(), tool.description.clone().into());
    }
    schema.insert("properties".into(), properties.into());
    schema.insert("required".into(), required.into());
    schema.insert("additionalProperties".into(), false.into());
    schemars::Schema::from(schema)
}
