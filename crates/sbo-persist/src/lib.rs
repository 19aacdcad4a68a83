//! Durable JSON file-backed persistence.
//!
//! Provides [`JsonStore`], a generic key-value store that keeps data in
//! memory and snapshots to a JSON file on every write. Writes are
//! write-to-temp-then-rename so a reader never observes a partially
//! written file, matching the durability contract the instance registry
//! depends on.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A JSON file-backed store for a single domain of data.
///
/// Keeps data in memory and snapshots to `{state_path}/state/{domain}.json`
/// on every write via a temp-file-and-rename.
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Create a new store for the given domain under `state_path`.
    pub fn new(state_path: &Path, domain: &str) -> Self {
        let path = state_path.join("state").join(format!("{domain}.json"));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load data from disk. Returns empty map if the file doesn't exist or
    /// is corrupt (corruption is logged, never panics).
    pub fn load<T: for<'de> Deserialize<'de>>(&self) -> HashMap<String, T> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt state file, starting fresh");
                HashMap::new()
            }),
            Err(_) => {
                debug!(path = %self.path.display(), "no state file, starting fresh");
                HashMap::new()
            }
        }
    }

    /// Save data to disk. Creates directories as needed. Writes to a
    /// sibling temp file, fsyncs it, then atomically renames it into
    /// place, and fsyncs the parent directory so the rename itself is
    /// durable across a crash.
    pub fn save<T: Serialize>(&self, data: &HashMap<String, T>) -> io::Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| io::Error::other("state path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;

        let content = serde_json::to_string_pretty(data).map_err(io::Error::other)?;

        let tmp_path = parent.join(format!(
            ".{}.tmp",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("state")
        ));

        {
            let file = std::fs::File::create(&tmp_path)?;
            use std::io::Write;
            let mut file = file;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;

        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_store_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path(), "test");

        let mut data = HashMap::new();
        data.insert("key1".to_string(), "value1".to_string());
        data.insert("key2".to_string(), "value2".to_string());
        store.save(&data).expect("save");

        let loaded: HashMap<String, String> = store.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("key1").unwrap(), "value1");
    }

    #[test]
    fn test_json_store_empty_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path(), "nonexistent");
        let loaded: HashMap<String, String> = store.load();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_json_store_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_dir = dir.path().join("state");
        std::fs::create_dir_all(&state_dir).expect("mkdir");
        std::fs::write(state_dir.join("corrupt.json"), "not json").expect("write");

        let store = JsonStore::new(dir.path(), "corrupt");
        let loaded: HashMap<String, String> = store.load();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_json_store_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path(), "clean");

        let mut data = HashMap::new();
        data.insert("k".to_string(), "v".to_string());
        store.save(&data).expect("save");

        let state_dir = dir.path().join("state");
        let entries: Vec<_> = std::fs::read_dir(&state_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].to_str().unwrap(), "clean.json");
    }

    #[test]
    fn test_json_store_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path(), "overwrite");

        let mut data = HashMap::new();
        data.insert("key".to_string(), "first".to_string());
        store.save(&data).expect("save1");

        data.insert("key".to_string(), "second".to_string());
        store.save(&data).expect("save2");

        let loaded: HashMap<String, String> = store.load();
        assert_eq!(loaded.get("key").unwrap(), "second");
    }
}
