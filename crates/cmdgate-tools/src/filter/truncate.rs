//! Truncation helpers. Each returns a contiguous slice of the input, so
//! applying it again to its own output is a no-op.

use crate::definition::TopOrBottom;

/// Keep exactly `limit` characters from the valuable end.
#[must_use]
pub fn truncate_chars(text: &str, limit: usize, keep: TopOrBottom) -> &str {
    let total = text.chars().count();
    if total <= limit {
        return text;
    }
    match keep {
        TopOrBottom::Top => &text[..byte_offset(text, limit)],
        TopOrBottom::Bottom => &text[byte_offset(text, total - limit)..],
    }
}

/// Cut `text` to at most `limit` characters, keeping whole lines.
///
/// Used on grep output, where a partial line could stop matching and vanish
/// on a second pass. When not even one line fits, that line is cut to
/// `limit` characters instead.
#[must_use]
pub fn truncate_chars_by_line(text: &str, limit: usize, keep: TopOrBottom) -> &str {
    let total = text.chars().count();
    if total <= limit {
        return text;
    }

    match keep {
        TopOrBottom::Top => {
            let mut used = 0;
            let mut end = 0;
            for line in text.split_inclusive('\n') {
                let n = line.chars().count();
                if used + n > limit {
                    break;
                }
                used += n;
                end += line.len();
            }
            if end == 0 {
                end = byte_offset(text, limit);
            }
            &text[..end]
        }
        TopOrBottom::Bottom => {
            let mut used = 0;
            let mut start = text.len();
            for line in text.split_inclusive('\n').rev() {
                let n = line.chars().count();
                if used + n > limit {
                    break;
                }
                used += n;
                start -= line.len();
            }
            if start == text.len() {
                start = byte_offset(text, total - limit);
            }
            &text[start..]
        }
    }
}

/// Keep at most `limit` lines from the valuable end.
#[must_use]
pub fn truncate_lines(text: &str, limit: usize, keep: TopOrBottom) -> &str {
    if text.split_inclusive('\n').count() <= limit {
        return text;
    }
    match keep {
        TopOrBottom::Top => {
            let end: usize = text.split_inclusive('\n').take(limit).map(str::len).sum();
            &text[..end]
        }
        TopOrBottom::Bottom => {
            let tail: usize = text
                .split_inclusive('\n')
                .rev()
                .take(limit)
                .map(str::len)
                .sum();
            &text[text.len() - tail..]
        }
    }
}

fn byte_offset(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map_or(text.len(), |(i, _)| i)
}
