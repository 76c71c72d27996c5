//! # Caching Wrapper for Persistent Backends
//!
//! Fronts a [`PersistentBackend`] with a TTL-bounded in-memory cache so that
//! evaluations are not a database round trip each. Cache keys are
//! `"<kind>:<key>"` per item and `"all:<kind>"` per collection listing.
//!
//! Contracts kept here:
//!
//! - Reads serve from cache while fresh; a miss or expired slot fetches from
//!   the backend and writes through. Backend misses are cached as tombstones
//!   so repeated lookups of an absent key stay cheap.
//! - An upsert never downgrades a fresher cached version, and always
//!   invalidates the collection listing for its kind.
//! - `init` touches the cache only after the backend accepted the dataset.
//! - Initialization checks are throttled with a `$initChecked` sentinel:
//!   while the sentinel is fresh the store reports "not initialized" without
//!   querying the backend. Once the backend reports initialized, that result
//!   is permanent.
//! - A TTL of zero disables caching entirely; every read hits the backend.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use log::warn;

use super::backend::{deserialize_item, serialize_entry, PersistentBackend};
use super::{DataKind, DataStore, FullDataSet, StoreEntry};
use crate::error::StoreError;

/// Sentinel cache key recording "we recently asked the backend whether it is
/// initialized, and it was not".
const INIT_CHECKED_KEY: &str = "$initChecked";

struct Timed<T> {
    value: T,
    updated: Instant,
}

impl<T> Timed<T> {
    fn new(value: T) -> Timed<T> {
        Timed {
            value,
            updated: Instant::now(),
        }
    }
}

#[derive(Default)]
struct CacheState {
    /// Per-item slots keyed `"<kind>:<key>"`. Tombstones are cached too, so
    /// absence is as cheap to answer as presence.
    items: HashMap<String, Timed<StoreEntry>>,
    /// Per-collection listings, invalidated wholesale by any upsert.
    alls: HashMap<DataKind, Timed<Vec<(String, StoreEntry)>>>,
    initialized: bool,
}

/// A [`DataStore`] backed by a persistent backend with a TTL cache in front.
pub struct CachingStore {
    backend: Box<dyn PersistentBackend>,
    cache_ms: u64,
    state: RwLock<CacheState>,
}

fn item_cache_key(kind: DataKind, key: &str) -> String {
    format!("{}:{}", kind.namespace(), key)
}

impl CachingStore {
    pub fn new(backend: Box<dyn PersistentBackend>, cache_ms: u64) -> Self {
        Self {
            backend,
            cache_ms,
            state: RwLock::new(CacheState::default()),
        }
    }

    fn is_fresh(&self, updated: Instant) -> bool {
        self.cache_ms != 0
            && updated.elapsed() < Duration::from_millis(self.cache_ms)
    }

    /// Insert into the item cache unless a fresher same-or-newer version is
    /// already there. Any accepted replacement invalidates the collection
    /// listing for that kind.
    fn upsert_cached(
        &self,
        state: &mut CacheState,
        kind: DataKind,
        key: &str,
        entry: StoreEntry,
    ) {
        let cache_key = item_cache_key(kind, key);
        if let Some(existing) = state.items.get(&cache_key) {
            if self.is_fresh(existing.updated)
                && existing.value.version() >= entry.version()
            {
                return;
            }
        }
        state.items.insert(cache_key, Timed::new(entry));
        state.alls.remove(&kind);
    }

    fn fetch_single(
        &self,
        kind: DataKind,
        key: &str,
    ) -> Result<Option<StoreEntry>, StoreError> {
        let entry = match self.backend.get(kind, key)? {
            Some(item) => deserialize_item(kind, &item)?,
            // The backend has never seen this key; cache that absence.
            None => StoreEntry::Tombstone(0),
        };

        let mut state = self.state.write().unwrap();
        self.upsert_cached(&mut state, kind, key, entry.clone());

        if entry.is_tombstone() {
            Ok(None)
        } else {
            Ok(Some(entry))
        }
    }

    fn fetch_all(&self, kind: DataKind) -> Result<Vec<(String, StoreEntry)>, StoreError> {
        let mut listing = Vec::new();
        for item in self.backend.all(kind)? {
            let entry = match deserialize_item(kind, &item) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("skipping invalid {} item from backend: {}", kind.namespace(), e);
                    continue;
                }
            };
            if !entry.is_tombstone() {
                listing.push((item.key, entry));
            }
        }

        let mut state = self.state.write().unwrap();
        state.alls.insert(kind, Timed::new(listing.clone()));
        Ok(listing)
    }
}

impl DataStore for CachingStore {
    fn init(&self, data: FullDataSet) -> Result<(), StoreError> {
        let mut collections = Vec::new();
        for (kind, map) in [
            (DataKind::Features, &data.flags),
            (DataKind::Segments, &data.segments),
        ] {
            let mut items = Vec::with_capacity(map.len());
            for (key, entry) in map {
                items.push(serialize_entry(key, entry)?);
            }
            collections.push((kind, items));
        }

        // The backend accepts the dataset first; a failed init leaves the
        // cache exactly as it was.
        self.backend.init(collections)?;

        let mut state = self.state.write().unwrap();
        state.items.clear();
        state.alls.clear();
        state.initialized = true;
        for (kind, map) in [
            (DataKind::Features, data.flags),
            (DataKind::Segments, data.segments),
        ] {
            let mut listing = Vec::new();
            for (key, entry) in map {
                if !entry.is_tombstone() {
                    listing.push((key.clone(), entry.clone()));
                }
                state
                    .items
                    .insert(item_cache_key(kind, &key), Timed::new(entry));
            }
            state.alls.insert(kind, Timed::new(listing));
        }
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        {
            let state = self.state.read().unwrap();
            if let Some(cached) = state.items.get(&item_cache_key(kind, key)) {
                if self.is_fresh(cached.updated) {
                    if cached.value.is_tombstone() {
                        return Ok(None);
                    }
                    return Ok(Some(cached.value.clone()));
                }
            }
        }
        self.fetch_single(kind, key)
    }

    fn all(&self, kind: DataKind) -> Result<Vec<(String, StoreEntry)>, StoreError> {
        {
            let state = self.state.read().unwrap();
            if let Some(cached) = state.alls.get(&kind) {
                if self.is_fresh(cached.updated) {
                    return Ok(cached.value.clone());
                }
            }
        }
        self.fetch_all(kind)
    }

    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        entry: StoreEntry,
    ) -> Result<bool, StoreError> {
        let item = serialize_entry(key, &entry)?;
        let applied = self.backend.upsert(kind, item)?;
        if applied {
            let mut state = self.state.write().unwrap();
            self.upsert_cached(&mut state, kind, key, entry);
        }
        Ok(applied)
    }

    fn initialized(&self) -> bool {
        {
            let state = self.state.read().unwrap();
            if state.initialized {
                return true;
            }
            if let Some(checked) = state.items.get(INIT_CHECKED_KEY) {
                if self.is_fresh(checked.updated) {
                    // Recently verified as uninitialized; don't hit the
                    // backend again until the sentinel expires.
                    return false;
                }
            }
        }

        let mut state = self.state.write().unwrap();
        state.items.remove(INIT_CHECKED_KEY);
        if self.backend.initialized() {
            state.initialized = true;
            true
        } else {
            // The sentinel's value is irrelevant; only its presence and age
            // matter.
            state
                .items
                .insert(INIT_CHECKED_KEY.to_owned(), Timed::new(StoreEntry::Tombstone(0)));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::{MockPersistentBackend, SerializedItem};
    use crate::store::test_data::{dataset, flag_entry};

    const TTL: u64 = 60_000;

    fn serialized_flag(key: &str, version: u64) -> SerializedItem {
        serialize_entry(key, &flag_entry(key, version)).unwrap()
    }

    #[test]
    fn test_get_writes_through_and_serves_from_cache() {
        let mut backend = MockPersistentBackend::new();
        backend
            .expect_get()
            .times(1)
            .returning(|_, _| Ok(Some(serialized_flag("f", 2))));
        let store = CachingStore::new(Box::new(backend), TTL);

        // Second call must not reach the backend.
        let first = store.get(DataKind::Features, "f").unwrap().unwrap();
        let second = store.get(DataKind::Features, "f").unwrap().unwrap();
        assert_eq!(first.version(), 2);
        assert_eq!(second.version(), 2);
    }

    #[test]
    fn test_zero_ttl_always_hits_backend() {
        let mut backend = MockPersistentBackend::new();
        backend
            .expect_get()
            .times(2)
            .returning(|_, _| Ok(Some(serialized_flag("f", 2))));
        let store = CachingStore::new(Box::new(backend), 0);

        store.get(DataKind::Features, "f").unwrap();
        store.get(DataKind::Features, "f").unwrap();
    }

    #[test]
    fn test_backend_miss_is_negatively_cached() {
        let mut backend = MockPersistentBackend::new();
        backend.expect_get().times(1).returning(|_, _| Ok(None));
        let store = CachingStore::new(Box::new(backend), TTL);

        assert!(store.get(DataKind::Features, "nope").unwrap().is_none());
        // Served from the cached tombstone.
        assert!(store.get(DataKind::Features, "nope").unwrap().is_none());
    }

    #[test]
    fn test_tombstone_record_surfaces_as_absent() {
        let mut backend = MockPersistentBackend::new();
        backend.expect_get().times(1).returning(|_, _| {
            Ok(Some(SerializedItem {
                key: "f".to_owned(),
                version: 5,
                buffer: None,
            }))
        });
        let store = CachingStore::new(Box::new(backend), TTL);
        assert!(store.get(DataKind::Features, "f").unwrap().is_none());
    }

    #[test]
    fn test_upsert_does_not_downgrade_cached_version() {
        let mut backend = MockPersistentBackend::new();
        backend
            .expect_get()
            .times(1)
            .returning(|_, _| Ok(Some(serialized_flag("f", 5))));
        // The backend would apply the write (say another process pruned it),
        // but the cache must keep its newer copy.
        backend.expect_upsert().times(1).returning(|_, _| Ok(true));
        let store = CachingStore::new(Box::new(backend), TTL);

        assert_eq!(
            store
                .get(DataKind::Features, "f")
                .unwrap()
                .unwrap()
                .version(),
            5
        );
        store
            .upsert(DataKind::Features, "f", flag_entry("f", 3))
            .unwrap();
        assert_eq!(
            store
                .get(DataKind::Features, "f")
                .unwrap()
                .unwrap()
                .version(),
            5
        );
    }

    #[test]
    fn test_upsert_invalidates_all_listing() {
        let mut backend = MockPersistentBackend::new();
        backend
            .expect_all()
            .times(2)
            .returning(|_| Ok(vec![serialized_flag("f", 1)]));
        backend.expect_upsert().returning(|_, _| Ok(true));
        let store = CachingStore::new(Box::new(backend), TTL);

        // Prime the listing cache, then invalidate it with an upsert.
        assert_eq!(store.all(DataKind::Features).unwrap().len(), 1);
        assert_eq!(store.all(DataKind::Features).unwrap().len(), 1);
        store
            .upsert(DataKind::Features, "g", flag_entry("g", 1))
            .unwrap();
        store.all(DataKind::Features).unwrap();
    }

    #[test]
    fn test_init_failure_leaves_cache_untouched() {
        let mut backend = MockPersistentBackend::new();
        backend
            .expect_init()
            .times(1)
            .returning(|_| Err(StoreError::Backend("down".to_owned())));
        backend.expect_initialized().returning(|| false);
        let store = CachingStore::new(Box::new(backend), TTL);

        assert!(store.init(dataset(vec![("f", 1)])).is_err());
        assert!(!store.initialized());
    }

    #[test]
    fn test_init_populates_cache() {
        let mut backend = MockPersistentBackend::new();
        backend.expect_init().times(1).returning(|_| Ok(()));
        // No get/all expectations: every read below is served from cache.
        let store = CachingStore::new(Box::new(backend), TTL);

        store.init(dataset(vec![("f", 2), ("g", 3)])).unwrap();
        assert!(store.initialized());
        assert_eq!(
            store
                .get(DataKind::Features, "f")
                .unwrap()
                .unwrap()
                .version(),
            2
        );
        assert_eq!(store.all(DataKind::Features).unwrap().len(), 2);
    }

    #[test]
    fn test_initialized_sentinel_throttles_backend_queries() {
        let mut backend = MockPersistentBackend::new();
        backend
            .expect_initialized()
            .times(1)
            .returning(|| false);
        let store = CachingStore::new(Box::new(backend), TTL);

        assert!(!store.initialized());
        // Sentinel is fresh: the second check must not query the backend.
        assert!(!store.initialized());
    }

    #[test]
    fn test_initialized_true_is_permanent() {
        let mut backend = MockPersistentBackend::new();
        backend
            .expect_initialized()
            .times(1)
            .returning(|| true);
        let store = CachingStore::new(Box::new(backend), 0);

        // Even with caching disabled, a positive answer is remembered.
        assert!(store.initialized());
        assert!(store.initialized());
    }

    #[test]
    fn test_zero_ttl_reasks_backend_when_uninitialized() {
        let mut backend = MockPersistentBackend::new();
        backend
            .expect_initialized()
            .times(2)
            .returning(|| false);
        let store = CachingStore::new(Box::new(backend), 0);

        assert!(!store.initialized());
        assert!(!store.initialized());
    }
}
