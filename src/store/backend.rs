//! # Persistent Backend Interface
//!
//! This module defines the interface a persistent store (Redis, sled, a
//! database) implements to hold flag data across process restarts, and the
//! serialized-item types that cross that boundary.
//!
//! Backends deal in opaque byte buffers plus a version and key; they never
//! parse flag documents. All serialization to and from the typed model lives
//! in the caching wrapper on this side of the boundary. The one semantic
//! obligation backends carry is the version gate: an upsert at or below the
//! stored version must be rejected, so a tombstone can never be resurrected
//! by a stale write.

use crate::error::StoreError;
use crate::schema::{FeatureFlag, Segment};

use super::{DataKind, StoreEntry};

/// One item at the backend boundary. A `None` buffer is a tombstone record
/// carrying only its deletion version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedItem {
    pub key: String,
    pub version: u64,
    pub buffer: Option<Vec<u8>>,
}

/// The operations a persistent backend must provide.
///
/// Implementations must be safe to call from multiple threads.
#[cfg_attr(test, mockall::automock)]
pub trait PersistentBackend: Send + Sync {
    /// Replace all stored data with the given collections.
    fn init(
        &self,
        collections: Vec<(DataKind, Vec<SerializedItem>)>,
    ) -> Result<(), StoreError>;

    /// Fetch one item. A stored tombstone comes back as an item with no
    /// buffer; a key never written comes back as `None`.
    fn get(&self, kind: DataKind, key: &str) -> Result<Option<SerializedItem>, StoreError>;

    /// Fetch every item of a kind, tombstone records included.
    fn all(&self, kind: DataKind) -> Result<Vec<SerializedItem>, StoreError>;

    /// Version-gated insert-or-replace. Returns whether the write was
    /// applied.
    fn upsert(&self, kind: DataKind, item: SerializedItem) -> Result<bool, StoreError>;

    /// True once `init` has completed at some point in this backend's
    /// lifetime (including by another process).
    fn initialized(&self) -> bool;
}

/// Serialize a store entry for the backend boundary.
pub fn serialize_entry(key: &str, entry: &StoreEntry) -> Result<SerializedItem, StoreError> {
    let buffer = match entry {
        StoreEntry::Flag(flag) => Some(
            serde_json::to_vec(flag.as_ref())
                .map_err(|e| StoreError::InvalidData(e.to_string()))?,
        ),
        StoreEntry::Segment(segment) => Some(
            serde_json::to_vec(segment.as_ref())
                .map_err(|e| StoreError::InvalidData(e.to_string()))?,
        ),
        StoreEntry::Tombstone(_) => None,
    };
    Ok(SerializedItem {
        key: key.to_owned(),
        version: entry.version(),
        buffer,
    })
}

/// Deserialize a backend item back into a typed store entry.
///
/// A missing buffer, or a document with `deleted` set, becomes a tombstone.
pub fn deserialize_item(
    kind: DataKind,
    item: &SerializedItem,
) -> Result<StoreEntry, StoreError> {
    let buffer = match &item.buffer {
        Some(buffer) => buffer,
        None => return Ok(StoreEntry::Tombstone(item.version)),
    };
    match kind {
        DataKind::Features => {
            let flag: FeatureFlag = serde_json::from_slice(buffer)
                .map_err(|e| StoreError::InvalidData(e.to_string()))?;
            Ok(StoreEntry::from_flag(flag))
        }
        DataKind::Segments => {
            let segment: Segment = serde_json::from_slice(buffer)
                .map_err(|e| StoreError::InvalidData(e.to_string()))?;
            Ok(StoreEntry::from_segment(segment))
        }
    }
}
