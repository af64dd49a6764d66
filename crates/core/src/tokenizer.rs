//! Line tokenizer for exported chat transcripts.
//!
//! Exports look like:
//!
//! ```text
//! [24.12.2023, 18:03:11] Alice: are you coming tonight?
//! [24.12.2023, 18:04:02] Bob: yes
//! and bringing snacks
//! ```
//!
//! A line without a `[timestamp] sender:` header continues the previous message.
//! A message whose text is empty after joining its lines is skipped.

use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use tracing::warn;

use crate::helpers::clean_text;
use crate::message::RawMessage;

static MESSAGE_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(\d{2}\.\d{2}\.\d{4}, \d{2}:\d{2}:\d{2})\] ([^:]+):(?: (.*))?$").unwrap()
});

/// Timestamp layout used in message headers.
pub const TIMESTAMP_FORMAT: &str = "%d.%m.%Y, %H:%M:%S";

/// A line that could not be attributed to any message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedLine {
    /// 1-based line number in the export.
    pub line: usize,
    pub reason: String,
}

impl std::fmt::Display for MalformedLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

/// Messages recovered from one export plus the lines that were skipped.
#[derive(Debug, Clone, Default)]
pub struct ParsedChat {
    pub messages: Vec<RawMessage>,
    pub skipped: Vec<MalformedLine>,
}

/// Parse the full text of a chat export.
pub fn parse_chat_text(text: &str) -> ParsedChat {
    let cleaned = clean_text(text);
    let mut parsed = ParsedChat::default();
    // Open message and the line its header was on.
    let mut current: Option<(usize, RawMessage)> = None;
    // Continuation lines after a rejected header have no owner.
    let mut orphaned = false;

    for (idx, raw_line) in cleaned.lines().enumerate() {
        let line_number = idx + 1;
        let line = raw_line.trim();

        if let Some(caps) = MESSAGE_HEADER_RE.captures(line) {
            if let Some((header_line, done)) = current.take() {
                finish_message(&mut parsed, header_line, done);
            }

            let timestamp_str = &caps[1];
            let sender = caps[2].trim();
            let content = caps.get(3).map_or("", |m| m.as_str().trim());

            let timestamp = match NaiveDateTime::parse_from_str(timestamp_str, TIMESTAMP_FORMAT) {
                Ok(ts) => ts,
                Err(e) => {
                    skip(&mut parsed, line_number, format!("invalid timestamp '{}': {}", timestamp_str, e));
                    orphaned = true;
                    continue;
                }
            };

            if sender.is_empty() {
                skip(&mut parsed, line_number, "empty sender".to_string());
                orphaned = true;
                continue;
            }

            current = Some((
                line_number,
                RawMessage {
                    timestamp,
                    sender: sender.to_string(),
                    text: content.to_string(),
                },
            ));
            orphaned = false;
        } else if let Some((_, msg)) = current.as_mut() {
            msg.text.push('\n');
            msg.text.push_str(line);
        } else if !line.is_empty() {
            let reason = if orphaned {
                "continuation of a rejected message"
            } else {
                "text before the first message"
            };
            skip(&mut parsed, line_number, reason.to_string());
        }
    }

    if let Some((header_line, done)) = current {
        finish_message(&mut parsed, header_line, done);
    }

    parsed
}

fn finish_message(parsed: &mut ParsedChat, header_line: usize, mut msg: RawMessage) {
    let trimmed = msg.text.trim();
    if trimmed.is_empty() {
        skip(parsed, header_line, "empty message".to_string());
        return;
    }
    if trimmed.len() != msg.text.len() {
        msg.text = trimmed.to_string();
    }
    parsed.messages.push(msg);
}

fn skip(parsed: &mut ParsedChat, line: usize, reason: String) {
    let malformed = MalformedLine { line, reason };
    warn!("Skipping malformed {}", malformed);
    parsed.skipped.push(malformed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 12, 24)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_parses_headers() {
        let parsed = parse_chat_text(
            "[24.12.2023, 18:03:11] Alice: are you coming?\n[24.12.2023, 18:04:02] Bob: yes\n",
        );
        assert!(parsed.skipped.is_empty());
        assert_eq!(parsed.messages.len(), 2);
        assert_eq!(parsed.messages[0].timestamp, ts(18, 3, 11));
        assert_eq!(parsed.messages[0].sender, "Alice");
        assert_eq!(parsed.messages[0].text, "are you coming?");
        assert_eq!(parsed.messages[1].sender, "Bob");
    }

    #[test]
    fn test_continuation_lines_join_previous_message() {
        let parsed = parse_chat_text(
            "[24.12.2023, 18:04:02] Bob: yes\nand bringing snacks\n\n[24.12.2023, 18:05:00] Alice: great",
        );
        assert_eq!(parsed.messages.len(), 2);
        assert_eq!(parsed.messages[0].text, "yes\nand bringing snacks");
        assert_eq!(parsed.messages[1].text, "great");
    }

    #[test]
    fn test_malformed_lines_are_skipped_not_fatal() {
        let parsed = parse_chat_text(
            "garbage before anything\n[31.02.2023, 10:00:00] Alice: bad date\nstill bad\n[24.12.2023, 10:00:00] Alice: ok",
        );
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.messages[0].text, "ok");
        let lines: Vec<usize> = parsed.skipped.iter().map(|s| s.line).collect();
        assert_eq!(lines, vec![1, 2, 3]);
        assert!(parsed.skipped[1].reason.contains("invalid timestamp"));
    }

    #[test]
    fn test_strips_bom_and_direction_marks() {
        let parsed = parse_chat_text("\u{FEFF}\u{200E}[24.12.2023, 18:03:11] Alice:\u{200E} hi\r\n");
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.messages[0].sender, "Alice");
        assert_eq!(parsed.messages[0].text, "hi");
    }

    #[test]
    fn test_header_with_empty_body_is_not_a_continuation() {
        let parsed = parse_chat_text(
            "[01.03.2024, 10:00:00] Alice: hi\n\
             [01.03.2024, 10:00:01] Bot: hello\n\
             [01.03.2024, 10:00:02] Carol: \n\
             [01.03.2024, 10:00:03] Alice: bye\n",
        );
        let senders: Vec<&str> = parsed.messages.iter().map(|m| m.sender.as_str()).collect();
        assert_eq!(senders, vec!["Alice", "Bot", "Alice"]);
        assert_eq!(parsed.messages[1].text, "hello");
        assert!(parsed.messages.iter().all(|m| !m.text.contains("Carol")));
        assert_eq!(parsed.skipped.len(), 1);
        assert_eq!(parsed.skipped[0].line, 3);
        assert_eq!(parsed.skipped[0].reason, "empty message");
    }

    #[test]
    fn test_empty_header_followed_by_text_keeps_the_text() {
        let parsed = parse_chat_text("[01.03.2024, 10:00:02] Carol:\nsecond line\n");
        assert!(parsed.skipped.is_empty());
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.messages[0].sender, "Carol");
        assert_eq!(parsed.messages[0].text, "second line");
    }

    #[test]
    fn test_empty_input() {
        let parsed = parse_chat_text("");
        assert!(parsed.messages.is_empty());
        assert!(parsed.skipped.is_empty());
    }
}
