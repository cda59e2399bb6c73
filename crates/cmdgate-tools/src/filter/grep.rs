use regex::Regex;

/// Keep lines matching `re` plus `context` lines on each side.
///
/// Overlapping windows are merged and lines keep their original order and
/// line terminators. A trailing `\n` or `\r\n` is not part of the matched text.
#[must_use]
pub fn grep_lines(text: &str, re: &Regex, context: usize) -> String {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let Some(last) = lines.len().checked_sub(1) else {
        return String::new();
    };

    let mut keep = vec![false; lines.len()];
    for (i, line) in lines.iter().enumerate() {
        if re.is_match(line_body(line)) {
            let lo = i.saturating_sub(context);
            let hi = i.saturating_add(context).min(last);
            keep[lo..=hi].fill(true);
        }
    }

    lines
        .iter()
        .zip(keep)
        .filter_map(|(line, kept)| kept.then_some(*line))
        .collect()
}

fn line_body(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}
