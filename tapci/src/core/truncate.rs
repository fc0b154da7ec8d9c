//! Size-bounded views of step output.

use std::sync::LazyLock;

use regex::Regex;

static ERROR_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\berror:\s+|\bfatal:\s+").unwrap());

/// Index of the first line that looks like an error, ignoring workflow
/// commands we printed ourselves.
pub fn first_error_line(lines: &[&str]) -> Option<usize> {
    lines
        .iter()
        .position(|line| !line.starts_with("::error") && ERROR_LINE_RE.is_match(line))
}

/// Keep at most `max_bytes` of `text`.
///
/// The window starts `context_lines` lines before the first error line when
/// there is one, otherwise the tail of the text is kept. Cuts never split a
/// UTF-8 character.
pub fn truncate_around_error(text: &str, max_bytes: usize, context_lines: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    match first_error_line(&lines) {
        Some(index) => {
            let start_line = index.saturating_sub(context_lines);
            let offset: usize = lines[..start_line].iter().map(|line| line.len()).sum();
            head(&text[offset..], max_bytes).to_string()
        }
        None => tail(text, max_bytes).to_string(),
    }
}

/// Longest prefix of `text` that fits in `max_bytes`.
pub fn head(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Longest suffix of `text` that fits in `max_bytes`.
pub fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_around_error("ok\n", 10, 2), "ok\n");
    }

    #[test]
    fn window_starts_before_error_line() {
        let mut text = String::new();
        for i in 0..50 {
            text.push_str(&format!("line {i}\n"));
        }
        text.push_str("Error: something broke\n");
        for i in 0..50 {
            text.push_str(&format!("after {i}\n"));
        }
        let out = truncate_around_error(&text, 64, 2);
        assert!(out.starts_with("line 48\nline 49\nError: something broke\n"));
        assert!(out.len() <= 64);
    }

    #[test]
    fn workflow_commands_are_not_error_lines() {
        let lines = ["::error file=x::boom error: x", "fine", "fatal: bad ref"];
        assert_eq!(first_error_line(&lines), Some(2));
    }

    #[test]
    fn keeps_tail_without_error() {
        let text = "aaaa\nbbbb\ncccc\n";
        assert_eq!(truncate_around_error(text, 5, 3), "cccc\n");
    }

    #[test]
    fn cuts_respect_char_boundaries() {
        let text = "ééééé";
        assert_eq!(head(text, 3), "é");
        assert_eq!(tail(text, 3), "é");
    }
}
