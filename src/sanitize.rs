//! Sanitization for untrusted text crossing the backend boundary.
//!
//! Prompts, editor selections and model-produced edit blocks all pass through
//! [`sanitize_text`] so the same tag policy applies everywhere.

use regex::Regex;
use std::sync::OnceLock;

/// Maximum characters accepted in a prompt, instruction or code field.
pub const MAX_PROMPT_CHARS: usize = 20_000;
/// Maximum characters accepted in an explicit editor context.
pub const MAX_CONTEXT_CHARS: usize = 100_000;

/// Elements whose whole body is removed along with the tags.
const BLOCK_TAGS: &[&str] = &["script", "style"];
/// Elements whose stray opening or closing tags are removed.
const STRAY_TAGS: &[&str] = &["script", "style", "iframe", "object", "embed"];

fn block_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        BLOCK_TAGS
            .iter()
            .filter_map(|tag| {
                Regex::new(&format!(r"(?is)<\s*{tag}\b[^>]*>.*?<\s*/\s*{tag}\s*>")).ok()
            })
            .collect()
    })
}

fn stray_tag_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            let names = STRAY_TAGS.join("|");
            Regex::new(&format!(r"(?i)<\s*/?\s*(?:{names})\b[^>]*>")).ok()
        })
        .as_ref()
}

/// Strip disallowed tag sequences and control characters.
///
/// Newlines, carriage returns and tabs survive; everything else below 0x20
/// (and DEL) is dropped.
pub fn sanitize_text(input: &str) -> String {
    let mut out = input.to_string();
    for pattern in block_patterns() {
        if pattern.is_match(&out) {
            out = pattern.replace_all(&out, "").into_owned();
        }
    }
    if let Some(pattern) = stray_tag_pattern() {
        if pattern.is_match(&out) {
            out = pattern.replace_all(&out, "").into_owned();
        }
    }
    out.retain(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'));
    out
}

/// Reject empty or oversized required input. `field` names the field in the message.
pub fn validate_required(field: &str, value: &str, max_chars: usize) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} is required", field));
    }
    validate_length(field, value, max_chars)
}

/// Reject oversized optional input.
pub fn validate_length(field: &str, value: &str, max_chars: usize) -> Result<(), String> {
    let len = value.chars().count();
    if len > max_chars {
        return Err(format!(
            "{} is too long ({} characters, limit {})",
            field, len, max_chars
        ));
    }
    Ok(())
}
