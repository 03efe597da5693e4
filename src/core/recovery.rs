//! Clean-shutdown store: a disk-backed table mapping resource names to
//! opaque recovery terms.
//!
//! The table lives in RAM and goes back to disk only on an explicit `sync`,
//! normally once at shutdown. Recovery terms are opaque blobs and round-trip
//! bit-identically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::error::Result;

const FILE_NAME: &str = "clean.dot";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Table {
    entries: HashMap<String, Vec<u8>>,
}

pub struct CleanShutdownStore {
    path: PathBuf,
    table: Table,
}

impl CleanShutdownStore {
    /// Opens `<data>/queues/clean.dot`, loading any previous contents.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join("queues");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(FILE_NAME);
        let table = if path.exists() {
            let raw = std::fs::read(&path)?;
            bincode::deserialize(&raw)?
        } else {
            Table::default()
        };
        info!(path = %path.display(), entries = table.entries.len(), "clean-shutdown store open");
        Ok(CleanShutdownStore { path, table })
    }

    pub fn insert(&mut self, name: impl Into<String>, terms: Vec<u8>) {
        self.table.entries.insert(name.into(), terms);
    }

    pub fn member(&self, name: &str) -> bool {
        self.table.entries.contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Option<&[u8]> {
        self.table.entries.get(name).map(Vec::as_slice)
    }

    pub fn delete(&mut self, name: &str) {
        self.table.entries.remove(name);
    }

    /// Write the table back to disk. Called at shutdown.
    pub fn sync(&self) -> Result<()> {
        let raw = bincode::serialize(&self.table)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn terms_survive_reopen_bit_identically() {
        let dir = TempDir::new().unwrap();
        let blob: Vec<u8> = (0..=255).collect();
        {
            let mut store = CleanShutdownStore::open(dir.path()).unwrap();
            store.insert("orders", blob.clone());
            store.insert("audit", vec![]);
            store.delete("audit");
            store.sync().unwrap();
        }
        let store = CleanShutdownStore::open(dir.path()).unwrap();
        assert!(store.member("orders"));
        assert!(!store.member("audit"));
        assert_eq!(store.lookup("orders"), Some(blob.as_slice()));
        assert_eq!(store.lookup("missing"), None);
    }

    #[test]
    fn unsynced_changes_stay_in_ram() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = CleanShutdownStore::open(dir.path()).unwrap();
            store.insert("ephemeral", vec![1, 2, 3]);
            // No sync.
        }
        let store = CleanShutdownStore::open(dir.path()).unwrap();
        assert!(!store.member("ephemeral"));
    }
}
