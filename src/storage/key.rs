use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

const FILLER: &str = "_";
const EXTENSION: &str = ".jpg";
const FALLBACK_NAME: &str = "image";

/// How artifacts are named in the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStrategy {
    /// Source file name only. Different urls with the same file name overwrite each other.
    #[default]
    Filename,
    /// File name prefixed with the owning record id.
    RecordScoped,
}

impl FromStr for KeyStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "filename" => Ok(KeyStrategy::Filename),
            "record-scoped" | "record_scoped" | "record" => Ok(KeyStrategy::RecordScoped),
            other => Err(format!("unknown key strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn derive(strategy: KeyStrategy, record_id: i32, source_url: &str) -> Self {
        let name = sanitize_file_name(extract_file_name(source_url));
        match strategy {
            KeyStrategy::Filename => StorageKey(format!("{name}{EXTENSION}")),
            KeyStrategy::RecordScoped => StorageKey(format!("{record_id}{FILLER}{name}{EXTENSION}")),
        }
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Absolute path in the store, e.g. `/a.jpg`.
    pub fn path(&self) -> String {
        format!("/{}", self.0)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last path segment with query and fragment removed.
fn extract_file_name(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let path = &url[..end];
    path.rsplit('/').next().unwrap_or(path)
}

fn sanitize_file_name(file_name: &str) -> String {
    static DISALLOWED: OnceLock<Regex> = OnceLock::new();
    static SEPARATORS: OnceLock<Regex> = OnceLock::new();
    let disallowed = DISALLOWED.get_or_init(|| Regex::new(r"[^A-Za-z0-9_\s-]").unwrap());
    let separators = SEPARATORS.get_or_init(|| Regex::new(r"[\s_-]+").unwrap());

    // Drop the source extension; everything is re-encoded to jpeg.
    let stem = match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name,
    };

    let replaced = disallowed.replace_all(stem, FILLER);
    let collapsed = separators.replace_all(&replaced, FILLER);
    let trimmed = collapsed.trim_matches('_');

    if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}
