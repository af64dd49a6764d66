//! Helper functions for text cleanup.

use regex::Regex;
use std::sync::LazyLock;

// Left-to-right / right-to-left marks and embedding/override controls that
// chat apps sprinkle into exports around names and timestamps.
static BIDI_CONTROL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\u{200E}\u{200F}\u{202A}-\u{202E}]").unwrap());

/// Remove bidirectional control characters from text.
pub fn strip_bidi_controls(text: &str) -> String {
    BIDI_CONTROL_RE.replace_all(text, "").into_owned()
}

/// Normalize line endings to `\n`.
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Prepare raw export text for line parsing: drop a BOM, invisible
/// direction marks and carriage returns.
pub fn clean_text(text: &str) -> String {
    let text = text.strip_prefix('\u{FEFF}').unwrap_or(text);
    normalize_line_endings(&strip_bidi_controls(text))
}

/// Remove a leading `"{name}: "` from `text`, comparing the name case-insensitively.
pub fn strip_name_prefix<'a>(text: &'a str, name: &str) -> &'a str {
    let name = name.trim();
    if name.is_empty() {
        return text;
    }
    match text.get(..name.len()) {
        Some(head) if head.to_lowercase() == name.to_lowercase() => {
            text[name.len()..].strip_prefix(": ").unwrap_or(text)
        }
        _ => text,
    }
}
