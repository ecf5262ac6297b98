//! Code-edit extraction from model replies
//!
//! An edit block looks like
//!
//! ````text
//! ```edit:src/main.py
//! <complete replacement content>
//! ```
//! ````
//!
//! The body runs to the first line that starts with a fence, so an edit
//! block cannot contain a nested fenced block; the inner fence would end it
//! early. Anything that does not match this shape is left as prose.

use crate::protocol::{CodeEdit, EditRange};
use crate::sanitize::sanitize_text;
use crate::util::{has_parent_traversal, normalize_workspace_path, truncate_str};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Upper bound on one block's content, in characters
pub const MAX_EDIT_CHARS: usize = 50_000;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extraction {
    /// The reply with every recognized edit block removed
    pub display_text: String,
    pub edits: Vec<CodeEdit>,
}

fn edit_block_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?ms)```edit:([^\n]*)\n(.*?)^```").ok())
        .as_ref()
}

/// Split a model reply into display text and file edits. Never fails.
pub fn extract(raw: &str, current_file: Option<&str>) -> Extraction {
    let Some(re) = edit_block_regex() else {
        return Extraction {
            display_text: raw.to_string(),
            edits: Vec::new(),
        };
    };
    let mut edits = Vec::new();
    let mut display = String::with_capacity(raw.len());
    let mut cursor = 0;
    let mut blocks = 0;

    for caps in re.captures_iter(raw) {
        let (Some(whole), Some(tag), Some(body)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        blocks += 1;
        display.push_str(&raw[cursor..whole.start()]);
        cursor = whole.end();

        let Some(file) = resolve_path(tag.as_str(), current_file) else {
            debug!("Dropping edit block with no resolvable file");
            continue;
        };
        edits.push(CodeEdit {
            file,
            new_text: clean_body(body.as_str()),
            range: EditRange::whole_file(),
        });
    }

    if blocks == 0 {
        return Extraction {
            display_text: raw.to_string(),
            edits,
        };
    }
    display.push_str(&raw[cursor..]);
    Extraction {
        display_text: display,
        edits,
    }
}

fn resolve_path(tag: &str, current_file: Option<&str>) -> Option<String> {
    let tag = tag.trim();
    if has_parent_traversal(tag) {
        warn!("Edit block path escapes the workspace, normalizing: {}", tag);
    }
    let tagged = if tag.is_empty() {
        None
    } else {
        normalize_workspace_path(tag)
    };
    tagged.or_else(|| current_file.and_then(normalize_workspace_path))
}

fn clean_body(body: &str) -> String {
    // The line break before the closing fence belongs to the fence
    let body = body
        .strip_suffix("\r\n")
        .or_else(|| body.strip_suffix('\n'))
        .unwrap_or(body);
    let bounded = truncate_str(body, MAX_EDIT_CHARS);
    if bounded.len() < body.len() {
        warn!(
            "Edit block truncated to {} characters",
            MAX_EDIT_CHARS
        );
    }
    sanitize_text(bounded)
}
