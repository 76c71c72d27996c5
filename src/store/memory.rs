//! # In-Memory Data Store
//!
//! The default store: two hash maps (features, segments) behind a single
//! `RwLock`. Reads take the shared lock, so any number of evaluation threads
//! proceed concurrently; only data-source writes take the exclusive lock.
//!
//! Entries are `Arc`-shared, so a snapshot handed to a reader stays alive
//! and internally consistent even while later writes replace the slot it
//! came from.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{DataKind, DataStore, FullDataSet, StoreEntry};
use crate::error::StoreError;

#[derive(Default)]
struct MemoryState {
    flags: HashMap<String, StoreEntry>,
    segments: HashMap<String, StoreEntry>,
    initialized: bool,
}

impl MemoryState {
    fn collection(&self, kind: DataKind) -> &HashMap<String, StoreEntry> {
        match kind {
            DataKind::Features => &self.flags,
            DataKind::Segments => &self.segments,
        }
    }

    fn collection_mut(&mut self, kind: DataKind) -> &mut HashMap<String, StoreEntry> {
        match kind {
            DataKind::Features => &mut self.flags,
            DataKind::Segments => &mut self.segments,
        }
    }
}

/// Thread-safe in-memory store for flag and segment definitions.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataStore for MemoryStore {
    fn init(&self, data: FullDataSet) -> Result<(), StoreError> {
        let mut state = self.state.write().unwrap();
        state.flags = data.flags;
        state.segments = data.segments;
        state.initialized = true;
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        let state = self.state.read().unwrap();
        Ok(state
            .collection(kind)
            .get(key)
            .filter(|entry| !entry.is_tombstone())
            .cloned())
    }

    fn all(&self, kind: DataKind) -> Result<Vec<(String, StoreEntry)>, StoreError> {
        let state = self.state.read().unwrap();
        Ok(state
            .collection(kind)
            .iter()
            .filter(|(_, entry)| !entry.is_tombstone())
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect())
    }

    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        entry: StoreEntry,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().unwrap();
        let collection = state.collection_mut(kind);
        if let Some(existing) = collection.get(key) {
            // Version gate: stale writes are ignored, including attempts to
            // resurrect below a tombstone.
            if existing.version() >= entry.version() {
                return Ok(false);
            }
        }
        collection.insert(key.to_owned(), entry);
        Ok(true)
    }

    fn initialized(&self) -> bool {
        self.state.read().unwrap().initialized
    }
}
