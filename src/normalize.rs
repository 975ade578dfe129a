//! Content normalizer: turns raw mailbox bodies into plain reviewable text.
//!
//! Pure string processing, no I/O. Everything downstream of the mailbox
//! (classifier, summarizer, drafter) only ever sees normalized text.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::pipeline::types::{BodyFormat, MessageRecord, RawMessage};

static INVISIBLE_BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<!--.*?-->|<script\b.*?</script\s*>|<style\b.*?</style\s*>|<head\b.*?</head\s*>")
        .expect("invisible block pattern")
});

static BLOCK_TAGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*(br|/p|p|/div|div|/li|li|/tr|tr|/h[1-6]|/blockquote|hr)\b[^>]*>")
        .expect("block tag pattern")
});

static TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag pattern"));

static ENTITIES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});").expect("entity pattern")
});

static HORIZONTAL_WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\u{a0}\u{200b}\r\f\v]+").expect("whitespace pattern"));

/// Build a `MessageRecord` from what the mailbox returned.
pub fn normalize_message(raw: RawMessage) -> MessageRecord {
    let body = normalize_body(&raw.body, raw.body_format);
    MessageRecord {
        id: raw.id,
        sender: raw.sender.trim().to_string(),
        subject: normalize_subject(&raw.subject),
        body,
        conversation_id: raw.conversation_id.filter(|c| !c.trim().is_empty()),
        received_at: raw.received_at,
    }
}

/// Normalize a body of the given format into plain text.
pub fn normalize_body(body: &str, format: BodyFormat) -> String {
    let text = match format {
        BodyFormat::Html => html_to_text(body),
        BodyFormat::Text => body.to_string(),
    };
    collapse_whitespace(&strip_quoted_text(&text))
}

/// Subjects are single-line; markup occasionally leaks into them.
pub fn normalize_subject(subject: &str) -> String {
    let text = decode_entities(&TAGS.replace_all(subject, ""));
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip markup, keeping paragraph structure as line breaks.
pub fn html_to_text(html: &str) -> String {
    let visible = INVISIBLE_BLOCKS.replace_all(html, "");
    let broken = BLOCK_TAGS.replace_all(&visible, "\n");
    let stripped = TAGS.replace_all(&broken, "");
    decode_entities(&stripped)
}

/// Decode common named and numeric HTML entities. Unknown ones are kept.
pub fn decode_entities(text: &str) -> String {
    ENTITIES
        .replace_all(text, |caps: &Captures| {
            let entity = &caps[1];
            let decoded = if let Some(hex) = entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = entity.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                match entity {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some(' '),
                    "ndash" => Some('–'),
                    "mdash" => Some('—'),
                    "hellip" => Some('…'),
                    "rsquo" | "lsquo" => Some('\''),
                    "rdquo" | "ldquo" => Some('"'),
                    _ => None,
                }
            };
            decoded
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Strip quoted reply history from a plain-text body.
///
/// Removes `>` lines and everything after an attribution or separator line
/// ("On ... wrote:", "-----Original Message-----", an Outlook underscore rule
/// followed by a `From:` header).
pub fn strip_quoted_text(body: &str) -> String {
    let lines: Vec<&str> = body.lines().collect();
    let mut result = Vec::with_capacity(lines.len());

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();

        if trimmed.starts_with('>') {
            continue;
        }

        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }

        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }

        if trimmed.len() >= 10 && trimmed.chars().all(|c| c == '_') {
            let next = lines[i + 1..].iter().map(|l| l.trim()).find(|l| !l.is_empty());
            if next.is_some_and(|l| l.starts_with("From:")) {
                break;
            }
        }

        result.push(*line);
    }

    result.join("\n")
}

/// Collapse runs of spaces within lines and runs of blank lines, then trim.
pub fn collapse_whitespace(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut blank_run = false;

    for line in text.lines() {
        let line = HORIZONTAL_WS.replace_all(line, " ");
        let line = line.trim();
        if line.is_empty() {
            if !out.is_empty() {
                blank_run = true;
            }
            continue;
        }
        if blank_run {
            out.push(String::new());
            blank_run = false;
        }
        out.push(line.to_string());
    }

    out.join("\n")
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
