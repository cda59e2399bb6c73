//! Shell-glob matching for confirmation policies.
//!
//! `*` matches any run of characters (including `/` and the empty run), `?`
//! matches exactly one character, `\` escapes the next character. Bracket
//! classes are not supported: `[` and `]` match literally. Case folding, when
//! enabled, is ASCII-only.

use std::fmt;

use glob::{MatchOptions, Pattern};

/// Compiled glob pattern matched against a full rendered command.
#[derive(Clone, PartialEq, Eq)]
pub struct GlobPattern {
    source: String,
    compiled: Option<Pattern>,
    options: MatchOptions,
}

impl GlobPattern {
    #[must_use]
    pub fn new(pattern: &str, case_insensitive: bool) -> Self {
        let translated = translate(pattern);
        let compiled = match Pattern::new(&translated) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                tracing::warn!(pattern, "glob rejected, matching literally: {e}");
                None
            }
        };
        Self {
            source: pattern.to_owned(),
            compiled,
            options: MatchOptions {
                case_sensitive: !case_insensitive,
                require_literal_separator: false,
                require_literal_leading_dot: false,
            },
        }
    }

    /// The pattern text as it was declared.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True when the pattern accepts every candidate (e.g. `*`).
    #[must_use]
    pub fn matches_everything(&self) -> bool {
        self.compiled.as_ref().is_some_and(|p| p.as_str() == "*")
    }

    /// Match the whole candidate against the pattern.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        match &self.compiled {
            Some(pattern) => pattern.matches_with(candidate, self.options),
            None => self.source == candidate,
        }
    }
}

impl fmt::Debug for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobPattern({:?})", self.source)
    }
}

impl fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Case-sensitive one-shot match.
#[must_use]
pub fn matches(pattern: &str, candidate: &str) -> bool {
    GlobPattern::new(pattern, false).matches(candidate)
}

/// Rewrite into `glob` syntax: literal runs are escaped, `\x` becomes a
/// literal `x`, runs of `*` collapse into one.
fn translate(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut literal = String::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' | '?' => {
                if !literal.is_empty() {
                    out.push_str(&Pattern::escape(&literal));
                    literal.clear();
                }
                if c == '?' || !out.ends_with('*') {
                    out.push(c);
                }
            }
            '\\' => literal.push(chars.next().unwrap_or('\\')),
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        out.push_str(&Pattern::escape(&literal));
    }
    out
}
