use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::paths::atomic_write_file;

/// Library directories that user resource folders may never point into.
const RESERVED_RESOURCE_NAMES: &[&str] = &["cards", "thumbnails", "db", "backups", "trash"];

/// Per-version annotation inside a bundle entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Remark {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub resource_folder: String,
}

/// One sidecar entry, keyed by a card id or a bundle directory path.
/// Annotations live here rather than in the card file so editing a note
/// never rewrites (or re-hashes) the card itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CardNote {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub resource_folder: String,
    #[serde(
        default,
        rename = "_version_remarks",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub version_remarks: HashMap<String, Remark>,
}

/// Flat key -> note JSON document next to the database.
pub struct NoteStore {
    path: PathBuf,
}

impl NoteStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Load all notes. A missing or unreadable file yields an empty map;
    /// entries whose resource folder points into a reserved library
    /// directory are cleared and the cleaned document is written back.
    pub fn load(&self) -> HashMap<String, CardNote> {
        if !self.path.exists() {
            return HashMap::new();
        }

        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                log::error!("Failed to read note store {:?}: {}", self.path, e);
                return HashMap::new();
            }
        };

        let mut data: HashMap<String, CardNote> = match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(e) => {
                log::error!("Failed to parse note store {:?}: {}", self.path, e);
                return HashMap::new();
            }
        };

        let mut dirty = false;
        for note in data.values_mut() {
            if resource_folder_is_reserved(&note.resource_folder) {
                log::warn!(
                    "Dropping reserved resource folder mapping '{}'",
                    note.resource_folder
                );
                note.resource_folder.clear();
                dirty = true;
            }
        }

        if dirty {
            if let Err(e) = self.save(&data) {
                log::error!("Failed to rewrite cleaned note store: {}", e);
            }
        }

        data
    }

    pub fn save(&self, data: &HashMap<String, CardNote>) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create note store directory: {}", e))?;
        }
        let content = serde_json::to_string_pretty(data)
            .map_err(|e| format!("Failed to serialize notes: {}", e))?;
        atomic_write_file(&self.path, content.as_bytes())
    }
}

fn resource_folder_is_reserved(resource_folder: &str) -> bool {
    if resource_folder.is_empty() {
        return false;
    }
    let first = resource_folder
        .replace('\\', "/")
        .split('/')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    RESERVED_RESOURCE_NAMES.contains(&first.as_str())
}

/// Look up the annotation of one version inside a bundle entry.
pub fn version_remark<'a>(
    data: &'a HashMap<String, CardNote>,
    key: &str,
    version_id: &str,
) -> Option<&'a Remark> {
    data.get(key)?.version_remarks.get(version_id)
}

/// Set one version's annotation. Returns whether the document changed.
pub fn set_version_remark(
    data: &mut HashMap<String, CardNote>,
    key: &str,
    version_id: &str,
    remark: Remark,
) -> bool {
    let entry = data.entry(key.to_string()).or_default();
    if entry.version_remarks.get(version_id) == Some(&remark) {
        return false;
    }
    entry.version_remarks.insert(version_id.to_string(), remark);
    true
}

/// Promote a bundled version's remark to a standalone note, used when a
/// version leaves its bundle. Returns whether anything was migrated.
pub fn migrate_version_remark(
    data: &mut HashMap<String, CardNote>,
    bundle_dir: &str,
    version_id: &str,
) -> bool {
    let remark = match data
        .get(bundle_dir)
        .and_then(|entry| entry.version_remarks.get(version_id))
    {
        Some(remark) => remark.clone(),
        None => return false,
    };

    data.insert(
        version_id.to_string(),
        CardNote {
            summary: remark.summary,
            link: remark.link,
            resource_folder: remark.resource_folder,
            version_remarks: HashMap::new(),
        },
    );
    true
}

/// Drop remarks for versions that no longer exist. Returns the number of
/// remarks removed.
pub fn cleanup_stale_version_remarks(
    data: &mut HashMap<String, CardNote>,
    bundle_dir: &str,
    valid_version_ids: &[String],
) -> usize {
    let entry = match data.get_mut(bundle_dir) {
        Some(entry) => entry,
        None => return 0,
    };

    let before = entry.version_remarks.len();
    entry
        .version_remarks
        .retain(|version_id, _| valid_version_ids.iter().any(|v| v == version_id));
    before - entry.version_remarks.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn note(summary: &str) -> CardNote {
        CardNote {
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = NoteStore::new(&dir.path().join("notes.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let store = NoteStore::new(&dir.path().join("notes.json"));

        let mut data = HashMap::new();
        data.insert("Cats/Tom.png".to_string(), note("my favorite"));
        store.save(&data).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.get("Cats/Tom.png").unwrap().summary, "my favorite");
    }

    #[test]
    fn test_reserved_resource_folder_is_cleared() {
        let dir = TempDir::new().unwrap();
        let store = NoteStore::new(&dir.path().join("notes.json"));

        let mut data = HashMap::new();
        data.insert(
            "Fox.png".to_string(),
            CardNote {
                resource_folder: "thumbnails/sub".to_string(),
                ..Default::default()
            },
        );
        store.save(&data).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.get("Fox.png").unwrap().resource_folder, "");
        // The cleaned document is persisted, not just returned.
        let reloaded = store.load();
        assert_eq!(reloaded.get("Fox.png").unwrap().resource_folder, "");
    }

    #[test]
    fn test_corrupt_file_yields_empty_map() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(NoteStore::new(&path).load().is_empty());
    }

    #[test]
    fn test_version_remark_roundtrip() {
        let mut data = HashMap::new();
        let remark = Remark {
            summary: "v2 notes".to_string(),
            ..Default::default()
        };

        assert!(set_version_remark(&mut data, "Cats/Tom", "Cats/Tom/Tom_v2.png", remark.clone()));
        // Setting the identical remark again reports no change.
        assert!(!set_version_remark(&mut data, "Cats/Tom", "Cats/Tom/Tom_v2.png", remark));
        assert_eq!(
            version_remark(&data, "Cats/Tom", "Cats/Tom/Tom_v2.png").unwrap().summary,
            "v2 notes"
        );
    }

    #[test]
    fn test_migrate_version_remark() {
        let mut data = HashMap::new();
        set_version_remark(
            &mut data,
            "Cats/Tom",
            "Cats/Tom/Tom.png",
            Remark {
                summary: "old".to_string(),
                ..Default::default()
            },
        );

        assert!(migrate_version_remark(&mut data, "Cats/Tom", "Cats/Tom/Tom.png"));
        assert_eq!(data.get("Cats/Tom/Tom.png").unwrap().summary, "old");
        assert!(!migrate_version_remark(&mut data, "Cats/Tom", "Cats/Tom/Missing.png"));
    }

    #[test]
    fn test_cleanup_stale_version_remarks() {
        let mut data = HashMap::new();
        for id in ["a", "b", "c"] {
            set_version_remark(&mut data, "dir", id, Remark::default());
        }

        let removed =
            cleanup_stale_version_remarks(&mut data, "dir", &["a".to_string(), "c".to_string()]);
        assert_eq!(removed, 1);
        assert!(version_remark(&data, "dir", "b").is_none());
        assert_eq!(cleanup_stale_version_remarks(&mut data, "missing", &[]), 0);
    }
}
