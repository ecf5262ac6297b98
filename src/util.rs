use std::path::{Component, Path};

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Truncate a string to at most `max_chars` characters (Unicode-safe, no ellipsis)
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

/// Normalize a model- or user-supplied path into a workspace-relative one.
///
/// Separators become `/`, and root, drive prefix, `.` and `..` components are
/// dropped, so the result can never climb out of the directory it is joined
/// onto. Returns `None` when nothing is left.
pub fn normalize_workspace_path(raw: &str) -> Option<String> {
    let unified = raw.trim().replace('\\', "/");
    let parts: Vec<String> = Path::new(&unified)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::Prefix(_)
            | Component::RootDir
            | Component::CurDir
            | Component::ParentDir => None,
        })
        .filter(|part| !part.contains(':'))
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// True when the path tries to step into a parent directory.
pub fn has_parent_traversal(raw: &str) -> bool {
    let unified = raw.replace('\\', "/");
    Path::new(&unified)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

/// Compute a stable hash of file contents (FNV-1a 64-bit).
pub fn hash_bytes(content: &[u8]) -> String {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in content {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    format!("{:016x}", hash)
}

pub fn hash_str(content: &str) -> String {
    hash_bytes(content.as_bytes())
}
