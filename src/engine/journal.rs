//! Persisted record of the tasks known to be up to date.
//!
//! The journal is stored as `.journal.json` in the build directory and maps
//! every successfully completed [`TaskKey`] to the fingerprint of its inputs
//! and of its output. It is the only state carried from one run to the next
//! (besides the artifacts themselves).

use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::engine::TaskKey;
use crate::error::BuildError;

/// Fingerprints recorded for one completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub input: Hash32,
    pub output: Hash32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journal {
    /// Version of the tool that wrote the journal. Entries of any other
    /// version are not trusted.
    version: String,
    entries: BTreeMap<String, JournalEntry>,
}

impl Default for Journal {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            entries: BTreeMap::new(),
        }
    }
}

impl Journal {
    /// Loads the journal, falling back to an empty one when the file is
    /// missing, unreadable, corrupt or written by another version.
    pub fn load(path: &Utf8Path) -> Self {
        let Ok(text) = fs::read_to_string(path) else {
            return Self::default();
        };

        match serde_json::from_str::<Journal>(&text) {
            Ok(journal) if journal.is_compatible() => journal,
            Ok(_) => {
                tracing::info!("Journal '{path}' was written by another version, rebuilding");
                Self::default()
            }
            Err(err) => {
                tracing::warn!("Ignoring corrupt journal '{path}': {err}");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), BuildError> {
        let error = |source| BuildError::Journal {
            path: path.to_owned(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(error)?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|e| error(e.into()))?;
        fs::write(path, json).map_err(error)
    }

    pub fn is_compatible(&self) -> bool {
        self.version == env!("CARGO_PKG_VERSION")
    }

    pub fn get(&self, key: &TaskKey) -> Option<&JournalEntry> {
        self.entries.get(&entry_key(key))
    }

    pub fn record(&mut self, key: &TaskKey, entry: JournalEntry) {
        self.entries.insert(entry_key(key), entry);
    }

    pub fn remove(&mut self, key: &TaskKey) {
        self.entries.remove(&entry_key(key));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Stage and parameters as a JSON array. The display form joins
/// parameters with `-`, which parameters may themselves contain.
fn entry_key(key: &TaskKey) -> String {
    let parts: Vec<&str> = std::iter::once(key.stage()).chain(key.params()).collect();
    serde_json::Value::from(parts).to_string()
}
