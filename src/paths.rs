use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Zero-byte marker file that turns a directory into a version bundle.
pub const BUNDLE_MARKER: &str = ".bundle";

/// Card files are PNG images or plain JSON exports.
pub fn is_card_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".png") || lower.ends_with(".json")
}

/// Names with a leading dot (`.trash`, `.cardvault`, `.git`, ...) are
/// excluded from every walk and scan.
pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.')
}

/// The directory prefix of a library id; the empty string is the root.
pub fn parent_category(id: &str) -> &str {
    match id.rfind('/') {
        Some(idx) => &id[..idx],
        None => "",
    }
}

/// Every prefix of a category path, shortest first: `"a/b/c"` yields
/// `["a", "a/b", "a/b/c"]`. The root is never included.
pub fn ancestor_paths(category: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = String::new();
    for part in category.split('/') {
        if part.is_empty() {
            continue;
        }
        if current.is_empty() {
            current = part.to_string();
        } else {
            current = format!("{}/{}", current, part);
        }
        prefixes.push(current.clone());
    }
    prefixes
}

/// Forward-slash id of `path` relative to the library root. Returns None
/// for paths outside the root or with non-UTF-8 components.
pub fn relative_id(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts: Vec<&str> = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Absolute path of a library id under `root`.
pub fn resolve(root: &Path, id: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for segment in id.split('/') {
        if !segment.is_empty() {
            path.push(segment);
        }
    }
    path
}

/// Modification time as float seconds since the epoch, the unit every
/// store column and cache field uses.
pub fn system_time_seconds(time: SystemTime) -> Option<f64> {
    time.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs_f64())
}

pub fn mtime_seconds(path: &Path) -> Option<f64> {
    let meta = fs::metadata(path).ok()?;
    system_time_seconds(meta.modified().ok()?)
}

/// Percent-encode an id for URL embedding, keeping `/` separators intact.
pub fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Image and thumbnail URLs for a card. The integral modification time is
/// embedded as a cache-busting token so the frontend reloads images after
/// an edit.
pub fn card_urls(id: &str, last_modified: f64) -> (String, String) {
    let encoded = encode_id(id);
    let token = last_modified as i64;
    (
        format!("/cards_file/{}?t={}", encoded, token),
        format!("/api/thumbnail/{}?t={}", encoded, token),
    )
}

static ILLEGAL_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("illegal filename charset"));

const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Strip characters that are unsafe in a filename on any supported
/// platform, guard Windows reserved device names, and cap the length.
pub fn sanitize_filename(name: &str) -> String {
    let mut sanitized = ILLEGAL_FILENAME_CHARS.replace_all(name, "_").to_string();
    sanitized = sanitized
        .trim_matches(|c: char| c == '.' || c == ' ')
        .to_string();

    let upper = sanitized.to_uppercase();
    let base = upper.split('.').next().unwrap_or("");
    if RESERVED_DEVICE_NAMES.contains(&upper.as_str()) || RESERVED_DEVICE_NAMES.contains(&base) {
        sanitized = format!("_{}", sanitized);
    }

    if sanitized.len() > 255 {
        sanitized = sanitized.chars().take(200).collect();
    }

    if sanitized.is_empty() {
        "undefined".to_string()
    } else {
        sanitized
    }
}

/// Atomic file write: write to a temp file in the same directory, then
/// rename. Prevents a file watcher from picking up a partially-written
/// file between truncation and write completion.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> Result<(), String> {
    use std::io::Write;

    let file_name = path.file_name().unwrap_or_default().to_string_lossy();
    let temp_path = path.with_file_name(format!("{}.cardvault-tmp", file_name));

    let mut file = fs::File::create(&temp_path)
        .map_err(|e| format!("Failed to create temp file {:?}: {}", temp_path, e))?;
    file.write_all(content)
        .map_err(|e| format!("Failed to write temp file {:?}: {}", temp_path, e))?;
    file.sync_all()
        .map_err(|e| format!("Failed to sync temp file {:?}: {}", temp_path, e))?;
    drop(file);

    fs::rename(&temp_path, path)
        .map_err(|e| format!("Failed to rename {:?} -> {:?}: {}", temp_path, path, e))?;

    Ok(())
}
