//! # Data Store Module
//!
//! This module contains the storage components for flag and segment
//! definitions:
//!
//! - **`memory`**: In-memory store guarded by a readers-writer lock
//! - **`backend`**: Interface persistent backends implement, plus the
//!   serialized-item boundary types
//! - **`caching`**: TTL-bounded caching wrapper that fronts a backend
//! - **`sled_backend`**: Persistent backend over a sled database
//!
//! ## Design
//!
//! The store keeps exactly two namespaces, features and segments, keyed by
//! string. Every write is version-gated: an update at a version at or below
//! the stored one is ignored, so out-of-order delivery cannot roll data
//! back. Deletes are tombstones carrying the deletion version; readers see
//! tombstoned keys as absent, but the version keeps gating later writes.
//!
//! Items handed to readers are `Arc`-shared immutable snapshots. A reader
//! holding an entry (or an `all` listing) keeps that data alive and
//! consistent no matter how many writes land after the read.

pub mod backend;
pub mod caching;
pub mod memory;
pub mod sled_backend;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StoreError;
use crate::schema::{AllData, FeatureFlag, Segment};

pub use backend::{PersistentBackend, SerializedItem};
pub use caching::CachingStore;
pub use memory::MemoryStore;
pub use sled_backend::SledBackend;

/// The two data namespaces the store tracks. Anything else a backend
/// returns is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Features,
    Segments,
}

impl DataKind {
    /// Namespace string used in cache keys and backend storage.
    pub fn namespace(&self) -> &'static str {
        match self {
            DataKind::Features => "features",
            DataKind::Segments => "segments",
        }
    }
}

/// One versioned slot in the store: a live item or a tombstone left behind
/// by a delete.
#[derive(Debug, Clone)]
pub enum StoreEntry {
    Flag(Arc<FeatureFlag>),
    Segment(Arc<Segment>),
    Tombstone(u64),
}

impl StoreEntry {
    /// The version that gates writes to this slot.
    pub fn version(&self) -> u64 {
        match self {
            StoreEntry::Flag(flag) => flag.version,
            StoreEntry::Segment(segment) => segment.version,
            StoreEntry::Tombstone(version) => *version,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, StoreEntry::Tombstone(_))
    }

    /// Wrap a parsed flag, converting a pre-deleted document into its
    /// tombstone.
    pub fn from_flag(flag: FeatureFlag) -> StoreEntry {
        if flag.deleted {
            StoreEntry::Tombstone(flag.version)
        } else {
            StoreEntry::Flag(Arc::new(flag))
        }
    }

    /// Wrap a parsed segment, converting a pre-deleted document into its
    /// tombstone.
    pub fn from_segment(segment: Segment) -> StoreEntry {
        if segment.deleted {
            StoreEntry::Tombstone(segment.version)
        } else {
            StoreEntry::Segment(Arc::new(segment))
        }
    }

    pub fn as_flag(&self) -> Option<Arc<FeatureFlag>> {
        match self {
            StoreEntry::Flag(flag) => Some(flag.clone()),
            _ => None,
        }
    }

    pub fn as_segment(&self) -> Option<Arc<Segment>> {
        match self {
            StoreEntry::Segment(segment) => Some(segment.clone()),
            _ => None,
        }
    }
}

/// A complete dataset, as delivered by a `put` event or a poll.
#[derive(Debug, Clone, Default)]
pub struct FullDataSet {
    pub flags: HashMap<String, StoreEntry>,
    pub segments: HashMap<String, StoreEntry>,
}

impl From<AllData> for FullDataSet {
    fn from(data: AllData) -> FullDataSet {
        FullDataSet {
            flags: data
                .flags
                .into_iter()
                .map(|(key, flag)| (key, StoreEntry::from_flag(flag)))
                .collect(),
            segments: data
                .segments
                .into_iter()
                .map(|(key, segment)| (key, StoreEntry::from_segment(segment)))
                .collect(),
        }
    }
}

/// The store interface the client and evaluator read through and the data
/// sources write through.
pub trait DataStore: Send + Sync {
    /// Atomically replace the full dataset.
    fn init(&self, data: FullDataSet) -> Result<(), StoreError>;

    /// Fetch one item. Tombstoned and missing keys both come back as `None`.
    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreEntry>, StoreError>;

    /// Snapshot every live item of a kind, excluding tombstones.
    fn all(&self, kind: DataKind) -> Result<Vec<(String, StoreEntry)>, StoreError>;

    /// Version-gated insert-or-replace. Returns whether the write was
    /// applied; a write at or below the stored version is ignored.
    fn upsert(&self, kind: DataKind, key: &str, entry: StoreEntry)
        -> Result<bool, StoreError>;

    /// True once a full dataset has been stored.
    fn initialized(&self) -> bool;
}

/// Typed convenience lookup for the evaluator.
pub fn get_flag(
    store: &dyn DataStore,
    key: &str,
) -> Result<Option<Arc<FeatureFlag>>, StoreError> {
    Ok(store
        .get(DataKind::Features, key)?
        .and_then(|entry| entry.as_flag()))
}

/// Typed convenience lookup for segment-match clauses.
pub fn get_segment(
    store: &dyn DataStore,
    key: &str,
) -> Result<Option<Arc<Segment>>, StoreError> {
    Ok(store
        .get(DataKind::Segments, key)?
        .and_then(|entry| entry.as_segment()))
}

/// Snapshot of every live flag.
pub fn all_flags(store: &dyn DataStore) -> Result<Vec<Arc<FeatureFlag>>, StoreError> {
    Ok(store
        .all(DataKind::Features)?
        .into_iter()
        .filter_map(|(_, entry)| entry.as_flag())
        .collect())
}
