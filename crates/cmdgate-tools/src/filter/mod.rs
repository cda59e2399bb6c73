//! Output reduction pipeline: remove, grep, then character and line limits.

pub mod grep;
pub mod truncate;

use regex::Regex;

use crate::definition::OutputFilterConfig;
use crate::executor::FilterStats;

pub use self::grep::grep_lines;
pub use self::truncate::{truncate_chars, truncate_chars_by_line, truncate_lines};

/// Result of applying the pipeline to raw output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterResult {
    pub output: String,
    pub raw_chars: usize,
    pub filtered_chars: usize,
    pub raw_lines: usize,
    pub filtered_lines: usize,
}

impl FilterResult {
    #[must_use]
    pub fn stats(&self, raw_bytes: usize) -> FilterStats {
        FilterStats {
            raw_bytes,
            raw_chars: self.raw_chars,
            raw_lines: self.raw_lines,
            filtered_chars: self.filtered_chars,
            filtered_lines: self.filtered_lines,
        }
    }
}

/// Compiled output filter for one tool.
#[derive(Debug, Clone, Default)]
pub struct OutputFilterPipeline {
    config: OutputFilterConfig,
}

impl OutputFilterPipeline {
    #[must_use]
    pub fn new(config: &OutputFilterConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Pipeline for a tool without `output_filter`: output passes through.
    #[must_use]
    pub fn passthrough() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_optional(config: Option<&OutputFilterConfig>) -> Self {
        config.map_or_else(Self::passthrough, Self::new)
    }

    #[must_use]
    pub fn apply(&self, raw: &str) -> FilterResult {
        let cfg = &self.config;
        let mut current = raw.to_owned();

        if let Some(re) = &cfg.remove_from_output {
            current = remove_all(re, &current);
        }
        if let Some(re) = &cfg.grep {
            current = grep_lines(&current, re, cfg.grep_context_lines);
        }
        if let Some(limit) = cfg.limit_chars {
            let cut = if cfg.grep.is_some() {
                truncate_chars_by_line
            } else {
                truncate_chars
            };
            current = cut(&current, limit, cfg.valuable_top_or_bottom).to_owned();
        }
        if let Some(limit) = cfg.limit_lines {
            current = truncate_lines(&current, limit, cfg.valuable_top_or_bottom).to_owned();
        }

        make_result(raw, current)
    }
}

/// Delete matches until none remain; a deletion can join text into a new match.
fn remove_all(re: &Regex, text: &str) -> String {
    let mut current = text.to_owned();
    loop {
        let next = re.replace_all(&current, "");
        if next.len() == current.len() {
            return current;
        }
        current = next.into_owned();
    }
}

fn count_lines(s: &str) -> usize {
    s.split_inclusive('\n').count()
}

fn make_result(raw: &str, output: String) -> FilterResult {
    FilterResult {
        raw_chars: raw.chars().count(),
        filtered_chars: output.chars().count(),
        raw_lines: count_lines(raw),
        filtered_lines: count_lines(&output),
        output,
    }
}
