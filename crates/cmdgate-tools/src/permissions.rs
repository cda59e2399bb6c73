use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::pattern::GlobPattern;

/// Declared confirmation policy of a tool: ordered deny and ask globs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConfirmationPolicy {
    #[serde(default)]
    pub ask_user: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub case_insensitive: bool,
}

/// Outcome of evaluating a rendered command against a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Allow,
    RequireConfirmation { pattern: String },
    Deny { pattern: String },
}

impl GateDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Compiled confirmation policy. Deny globs are checked before ask globs, each
/// list in declared order; the first match wins.
#[derive(Debug, Clone, Default)]
pub struct ConfirmationGate {
    deny: Vec<GlobPattern>,
    ask_user: Vec<GlobPattern>,
}

impl ConfirmationGate {
    #[must_use]
    pub fn new(policy: &ConfirmationPolicy) -> Self {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| GlobPattern::new(p, policy.case_insensitive))
                .collect()
        };
        Self {
            deny: compile(&policy.deny),
            ask_user: compile(&policy.ask_user),
        }
    }

    #[must_use]
    pub fn evaluate(&self, rendered: &str) -> GateDecision {
        if let Some(pattern) = self.deny.iter().find(|p| p.matches(rendered)) {
            tracing::debug!(pattern = pattern.as_str(), command = rendered, "deny pattern matched");
            return GateDecision::Deny {
                pattern: pattern.as_str().to_owned(),
            };
        }
        if let Some(pattern) = self.ask_user.iter().find(|p| p.matches(rendered)) {
            tracing::debug!(pattern = pattern.as_str(), command = rendered, "ask pattern matched");
            return GateDecision::RequireConfirmation {
                pattern: pattern.as_str().to_owned(),
            };
        }
        GateDecision::Allow
    }

    /// Returns true if some deny glob accepts every command.
    #[must_use]
    pub fn is_fully_denied(&self) -> bool {
        self.deny.iter().any(GlobPattern::matches_everything)
    }

    #[must_use]
    pub fn deny_patterns(&self) -> &[GlobPattern] {
        &self.deny
    }

    #[must_use]
    pub fn ask_patterns(&self) -> &[GlobPattern] {
        &self.ask_user
    }
}

impl From<&ConfirmationPolicy> for ConfirmationGate {
    fn from(policy: &ConfirmationPolicy) -> Self {
        Self::new(policy)
    }
}

/// Evaluate a policy without keeping the compiled gate around.
#[must_use]
pub fn evaluate(policy: &ConfirmationPolicy, rendered: &str) -> GateDecision {
    ConfirmationGate::new(policy).evaluate(rendered)
}
