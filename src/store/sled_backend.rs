//! # Sled Persistent Backend
//!
//! A [`PersistentBackend`] over an embedded sled database, one tree per data
//! namespace. Useful on its own for single-node durability and as the
//! reference implementation of the backend contract, version gating
//! included.
//!
//! Records are stored as a small JSON envelope holding the version, so the
//! gate can be checked without parsing the item document, and tombstones can
//! be represented as envelopes with no payload.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use super::backend::{PersistentBackend, SerializedItem};
use super::DataKind;
use crate::error::StoreError;

/// Marker key in the metadata tree set once `init` has completed.
const INITED_KEY: &str = "$inited";
const META_TREE: &str = "meta";

/// On-disk record: the version plus the serialized item document, or no
/// document for a tombstone.
#[derive(Serialize, Deserialize)]
struct Record {
    version: u64,
    data: Option<String>,
}

/// Persistent flag storage over a sled database.
pub struct SledBackend {
    #[allow(dead_code)]
    db: Db,
    features: Tree,
    segments: Tree,
    meta: Tree,
}

fn backend_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl SledBackend {
    pub fn new(storage_path: &str) -> Result<Self, StoreError> {
        let db = sled::open(storage_path).map_err(backend_err)?;
        let features = db
            .open_tree(DataKind::Features.namespace())
            .map_err(backend_err)?;
        let segments = db
            .open_tree(DataKind::Segments.namespace())
            .map_err(backend_err)?;
        let meta = db.open_tree(META_TREE).map_err(backend_err)?;
        Ok(Self {
            db,
            features,
            segments,
            meta,
        })
    }

    fn tree(&self, kind: DataKind) -> &Tree {
        match kind {
            DataKind::Features => &self.features,
            DataKind::Segments => &self.segments,
        }
    }

    fn encode(item: &SerializedItem) -> Result<Vec<u8>, StoreError> {
        let record = Record {
            version: item.version,
            data: item
                .buffer
                .as_ref()
                .map(|buffer| String::from_utf8_lossy(buffer).into_owned()),
        };
        serde_json::to_vec(&record).map_err(backend_err)
    }

    fn decode(key: &[u8], raw: &[u8]) -> Result<SerializedItem, StoreError> {
        let record: Record = serde_json::from_slice(raw)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        Ok(SerializedItem {
            key: String::from_utf8_lossy(key).into_owned(),
            version: record.version,
            buffer: record.data.map(String::into_bytes),
        })
    }
}

impl PersistentBackend for SledBackend {
    fn init(
        &self,
        collections: Vec<(DataKind, Vec<SerializedItem>)>,
    ) -> Result<(), StoreError> {
        self.features.clear().map_err(backend_err)?;
        self.segments.clear().map_err(backend_err)?;
        for (kind, items) in collections {
            let tree = self.tree(kind);
            for item in items {
                tree.insert(item.key.as_bytes(), Self::encode(&item)?)
                    .map_err(backend_err)?;
            }
        }
        self.meta
            .insert(INITED_KEY, b"1")
            .map_err(backend_err)?;
        self.db.flush().map_err(backend_err)?;
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<SerializedItem>, StoreError> {
        match self.tree(kind).get(key).map_err(backend_err)? {
            Some(raw) => Ok(Some(Self::decode(key.as_bytes(), &raw)?)),
            None => Ok(None),
        }
    }

    fn all(&self, kind: DataKind) -> Result<Vec<SerializedItem>, StoreError> {
        let mut items = Vec::new();
        for pair in self.tree(kind).iter() {
            let (key, raw) = pair.map_err(backend_err)?;
            items.push(Self::decode(&key, &raw)?);
        }
        Ok(items)
    }

    fn upsert(&self, kind: DataKind, item: SerializedItem) -> Result<bool, StoreError> {
        let tree = self.tree(kind);
        let encoded = Self::encode(&item)?;
        // Compare-and-swap loop so concurrent writers still respect the
        // version gate.
        loop {
            let current = tree.get(&item.key).map_err(backend_err)?;
            if let Some(raw) = &current {
                let existing = Self::decode(item.key.as_bytes(), raw)?;
                if existing.version >= item.version {
                    return Ok(false);
                }
            }
            let swap = tree
                .compare_and_swap(
                    item.key.as_bytes(),
                    current,
                    Some(encoded.clone()),
                )
                .map_err(backend_err)?;
            if swap.is_ok() {
                return Ok(true);
            }
            // Lost a race; re-read and retry.
        }
    }

    fn initialized(&self) -> bool {
        matches!(self.meta.get(INITED_KEY), Ok(Some(_)))
    }
}
