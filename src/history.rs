//! Ingestion history.
//!
//! The history maps each source path to its [`FileHistoryEntry`]. It is
//! rewritten after every file so that an interrupted run loses at most the
//! file in flight. Writes go to a sibling temporary file first and are then
//! renamed over the old history.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::models::FileHistoryEntry;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    entries: BTreeMap<String, FileHistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the history at `path`, or an empty one when the file is missing.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let entries: BTreeMap<String, FileHistoryEntry> = serde_json::from_str(&content)?;
        Ok(Self { entries })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| Error::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&FileHistoryEntry> {
        self.entries.get(path)
    }

    pub fn insert(&mut self, entry: FileHistoryEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn remove(&mut self, path: &str) -> Option<FileHistoryEntry> {
        self.entries.remove(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &FileHistoryEntry> {
        self.entries.values()
    }

    pub fn total_records(&self) -> u64 {
        self.entries.values().map(|e| e.record_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn entry(path: &str, start: &str, end: &str, n: u64) -> FileHistoryEntry {
        let parse = |s: &str| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap();
        FileHistoryEntry {
            path: path.to_string(),
            start: parse(start),
            end: parse(end),
            record_count: n,
            load_secs: 0.25,
            header_lines: vec!["# header".to_string()],
        }
    }

    #[test]
    fn test_missing_history_is_empty() {
        let history = History::load(Path::new("/nonexistent/history.json")).unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("temp").join("history.json");

        let mut history = History::new();
        history.insert(entry("a.log", "2011-01-01 00:00:00", "2011-01-01 00:10:00", 10));
        history.insert(entry("b.log", "2011-01-01 00:30:00", "2011-01-01 00:40:00", 5));
        history.save(&path).unwrap();

        let loaded = History::load(&path).unwrap();
        assert_eq!(loaded, history);
        assert_eq!(loaded.total_records(), 15);
        assert!(loaded.contains("a.log"));
        assert_eq!(loaded.get("b.log").unwrap().header_lines, vec!["# header"]);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
