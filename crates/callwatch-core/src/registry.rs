//! Known-person registry on disk.
//!
//! A directory of reference photos named `<identifier>.<ext>`, where the
//! identifier is the person's name run through [`make_safe_name`]. An
//! optional `<identifier>.json` next to the photo carries free-form metadata.

use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry directory not readable: {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },
    #[error("identifier is not a valid encoded name: {0}")]
    InvalidIdentifier(String),
}

/// One registry reference photo.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub identifier: String,
    pub source_image_path: PathBuf,
    /// Contents of the `<identifier>.json` sidecar, if present and valid.
    pub metadata: Option<serde_json::Value>,
}

impl RegistryEntry {
    /// Human-readable name decoded from the identifier.
    pub fn display_name(&self) -> String {
        display_name(&self.identifier)
    }
}

/// Encode a person's name as a filesystem-safe identifier.
///
/// ASCII letters, digits and `-` pass through, spaces become `_`, and every
/// other byte is written as `~XX`. [`unmake_safe_name`] inverts it exactly.
pub fn make_safe_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
        } else if c == ' ' {
            out.push('_');
        } else {
            let mut utf8 = [0u8; 4];
            for b in c.encode_utf8(&mut utf8).bytes() {
                out.push_str(&format!("~{b:02X}"));
            }
        }
    }
    out
}

/// Decode an identifier (or a file name carrying one) back into the name.
pub fn unmake_safe_name(safe_name: &str) -> Result<String, RegistryError> {
    let invalid = || RegistryError::InvalidIdentifier(safe_name.to_string());

    // Identifiers never contain '.', so anything after it is an extension.
    let stem = safe_name.split('.').next().unwrap_or_default();
    let bytes = stem.as_bytes();

    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                out.push(b' ');
                i += 1;
            }
            b'~' => {
                let hex = stem.get(i + 1..i + 3).ok_or_else(invalid)?;
                out.push(u8::from_str_radix(hex, 16).map_err(|_| invalid())?);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out).map_err(|_| invalid())
}

/// Decoded name for display, falling back to the raw identifier.
pub fn display_name(identifier: &str) -> String {
    unmake_safe_name(identifier).unwrap_or_else(|_| identifier.to_string())
}

/// Registry photos found in one directory, sorted by file name.
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
    entries: Vec<RegistryEntry>,
}

impl Registry {
    /// List the reference photos in `dir`.
    pub fn scan(dir: &Path) -> Result<Self, RegistryError> {
        let unreadable = |source| RegistryError::Unreadable {
            path: dir.display().to_string(),
            source,
        };

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(unreadable)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        paths.sort();

        let mut entries: Vec<RegistryEntry> = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(identifier) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                tracing::warn!(path = %path.display(), "registry file name is not valid UTF-8; skipped");
                continue;
            };
            if entries.iter().any(|e| e.identifier == identifier) {
                tracing::warn!(%identifier, path = %path.display(), "duplicate registry identifier; keeping the first photo");
                continue;
            }
            let metadata = read_sidecar(&dir.join(format!("{identifier}.json")));
            entries.push(RegistryEntry {
                identifier,
                source_image_path: path,
                metadata,
            });
        }

        tracing::debug!(dir = %dir.display(), entries = entries.len(), "registry scanned");
        Ok(Self {
            dir: dir.to_path_buf(),
            entries,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn get(&self, identifier: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| e.identifier == identifier)
    }

    /// Where the photo for `name` is expected to live.
    pub fn image_path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.jpg", make_safe_name(name)))
    }

    /// Metadata sidecar for `identifier`, if present and valid JSON.
    pub fn metadata(&self, identifier: &str) -> Option<&serde_json::Value> {
        self.get(identifier)?.metadata.as_ref()
    }
}

fn read_sidecar(path: &Path) -> Option<serde_json::Value> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "registry metadata is not valid JSON");
            None
        }
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_name_plain() {
        assert_eq!(make_safe_name("John Smith"), "John_Smith");
        assert_eq!(make_safe_name("Mary-Jane Watson"), "Mary-Jane_Watson");
    }

    #[test]
    fn test_safe_name_escapes_everything_else() {
        let safe = make_safe_name("O'Brien, Dr. Zoë_2");
        assert!(safe.chars().all(|c| c.is_ascii_alphanumeric() || "-_~".contains(c)), "{safe}");
        assert!(!safe.contains('.'));
        assert!(!safe.contains('/'));
    }

    #[test]
    fn test_safe_name_reversible() {
        for name in [
            "John Smith",
            "O'Brien, Dr. Zoë",
            "under_score and ~tilde~",
            "José Álvarez-Núñez",
            "../../etc/passwd",
            "王小明",
            "",
        ] {
            let safe = make_safe_name(name);
            assert_eq!(unmake_safe_name(&safe).unwrap(), name, "via {safe}");
        }
    }

    #[test]
    fn test_unmake_strips_extension() {
        assert_eq!(unmake_safe_name("John_Smith.jpg").unwrap(), "John Smith");
    }

    #[test]
    fn test_unmake_rejects_bad_escapes() {
        assert!(unmake_safe_name("abc~").is_err());
        assert!(unmake_safe_name("abc~G1").is_err());
        assert!(unmake_safe_name("~FF").is_err()); // lone byte is not UTF-8
        assert_eq!(display_name("abc~"), "abc~");
    }

    #[test]
    fn test_scan_lists_images_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["bob.png", "Alice_Jones.jpg", "notes.txt", "carol.JPEG", "bob.jpg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.png")).unwrap();

        let registry = Registry::scan(dir.path()).unwrap();
        let ids: Vec<&str> = registry.entries().iter().map(|e| e.identifier.as_str()).collect();
        assert_eq!(ids, vec!["Alice_Jones", "bob", "carol"]);
        assert_eq!(registry.get("Alice_Jones").unwrap().display_name(), "Alice Jones");
        // bob.jpg sorts before bob.png
        assert!(registry.get("bob").unwrap().source_image_path.ends_with("bob.jpg"));
    }

    #[test]
    fn test_scan_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = Registry::scan(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, RegistryError::Unreadable { .. }));
    }

    #[test]
    fn test_metadata_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alice.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("alice.json"), br#"{"case": "A-17"}"#).unwrap();
        std::fs::write(dir.path().join("bob.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("bob.json"), b"{not json").unwrap();

        let registry = Registry::scan(dir.path()).unwrap();
        assert_eq!(registry.metadata("alice").unwrap()["case"], "A-17");
        assert!(registry.metadata("bob").is_none());
        assert!(registry.metadata("carol").is_none());
    }

    #[test]
    fn test_image_path_for() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::scan(dir.path()).unwrap();
        assert_eq!(registry.image_path_for("Ann Lee"), dir.path().join("Ann_Lee.jpg"));
    }
}
