//! # Client Facade
//!
//! The public face of the SDK. `Client::start` wires the store (optionally
//! wrapped around a persistent backend), the event processor, and the data
//! sources, then spawns the background networking thread. Evaluations run
//! synchronously on the calling thread against the local store; nothing in
//! the variation path waits on the network.
//!
//! Every variation call returns the caller's fallback on any failure; the
//! `*_detail` variants also return the reason, so applications can tell an
//! honest `Off` from a `CLIENT_NOT_READY`.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, warn};
use tokio::sync::watch;

use crate::config::Config;
use crate::error::{Error, EvalErrorKind};
use crate::eval::{self, Detail, Reason};
use crate::events::{now_unix_ms, EventProcessor};
use crate::network;
use crate::store::{self, CachingStore, DataStore, MemoryStore};
use crate::user::User;
use crate::value::Value;

/// How long `wait_for_initialization` sleeps between checks.
const INIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A server-side feature flag client.
///
/// Create one per process with [`Client::start`] and share it; evaluation
/// is thread-safe. Dropping the client (or calling [`Client::close`]) shuts
/// the background worker down.
pub struct Client {
    config: Arc<Config>,
    store: Arc<dyn DataStore>,
    events: Arc<EventProcessor>,
    shutdown: watch::Sender<bool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Client {
    /// Construct the client and start background synchronization. Returns
    /// as soon as the worker is running; use [`Client::wait_for_initialization`]
    /// to block until flag data is available.
    pub fn start(mut config: Config) -> Result<Client, Error> {
        let backend = config.store_backend.take();
        let cache_ms = config.store_cache_ms;
        let config = Arc::new(config);

        let store: Arc<dyn DataStore> = match backend {
            Some(backend) => Arc::new(CachingStore::new(backend, cache_ms)),
            None => Arc::new(MemoryStore::new()),
        };
        let events = Arc::new(EventProcessor::new(config.clone()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let worker = if config.offline {
            None
        } else {
            let worker_config = config.clone();
            let worker_store = store.clone();
            let worker_events = events.clone();
            let handle = thread::Builder::new()
                .name("flagkit-network".to_owned())
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            error!("failed to build worker runtime: {}", e);
                            return;
                        }
                    };
                    runtime.block_on(network::run(
                        worker_config,
                        worker_store,
                        worker_events,
                        shutdown_rx,
                    ));
                })
                .map_err(|e| Error::Config(format!("failed to spawn worker: {}", e)))?;
            Some(handle)
        };

        Ok(Client {
            config,
            store,
            events,
            shutdown,
            worker,
        })
    }

    /// True once the store holds a full dataset.
    pub fn initialized(&self) -> bool {
        self.store.initialized()
    }

    /// Block up to `max_wait` for the initial dataset. Returns whether the
    /// client became ready; it stays usable either way, serving fallbacks
    /// until data arrives.
    pub fn wait_for_initialization(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.initialized() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(INIT_POLL_INTERVAL);
        }
    }

    pub fn bool_variation(&self, user: &User, key: &str, fallback: bool) -> bool {
        self.bool_variation_detail(user, key, fallback).0
    }

    pub fn bool_variation_detail(
        &self,
        user: &User,
        key: &str,
        fallback: bool,
    ) -> (bool, Detail) {
        let detail = self.evaluate_for_caller(user, key, Value::Bool(fallback), true);
        typed_result(detail, fallback, Value::as_bool)
    }

    pub fn int_variation(&self, user: &User, key: &str, fallback: i64) -> i64 {
        self.int_variation_detail(user, key, fallback).0
    }

    pub fn int_variation_detail(
        &self,
        user: &User,
        key: &str,
        fallback: i64,
    ) -> (i64, Detail) {
        let detail = self.evaluate_for_caller(user, key, Value::Number(fallback as f64), true);
        typed_result(detail, fallback, |value| value.as_f64().map(|n| n as i64))
    }

    pub fn double_variation(&self, user: &User, key: &str, fallback: f64) -> f64 {
        self.double_variation_detail(user, key, fallback).0
    }

    pub fn double_variation_detail(
        &self,
        user: &User,
        key: &str,
        fallback: f64,
    ) -> (f64, Detail) {
        let detail = self.evaluate_for_caller(user, key, Value::Number(fallback), true);
        typed_result(detail, fallback, Value::as_f64)
    }

    pub fn string_variation(&self, user: &User, key: &str, fallback: &str) -> String {
        self.string_variation_detail(user, key, fallback).0
    }

    pub fn string_variation_detail(
        &self,
        user: &User,
        key: &str,
        fallback: &str,
    ) -> (String, Detail) {
        let detail =
            self.evaluate_for_caller(user, key, Value::String(fallback.to_owned()), true);
        typed_result(detail, fallback.to_owned(), |value| {
            value.as_str().map(str::to_owned)
        })
    }

    /// Evaluate a flag whose variations are arbitrary JSON.
    pub fn json_variation(&self, user: &User, key: &str, fallback: Value) -> Value {
        self.json_variation_detail(user, key, fallback).0
    }

    pub fn json_variation_detail(
        &self,
        user: &User,
        key: &str,
        fallback: Value,
    ) -> (Value, Detail) {
        let detail = self.evaluate_for_caller(user, key, fallback.clone(), true);
        let value = detail.value.clone().unwrap_or(fallback);
        (value, detail)
    }

    /// Evaluate every flag for the user without generating feature events.
    /// Returns `None` when the client is offline or has no data.
    pub fn all_flags(&self, user: &User) -> Option<HashMap<String, Value>> {
        if self.config.offline() {
            warn!("all_flags called while offline; returning nothing");
            return None;
        }
        if !self.store.initialized() {
            warn!("all_flags called before initialization; returning nothing");
            return None;
        }
        let flags = match store::all_flags(self.store.as_ref()) {
            Ok(flags) => flags,
            Err(e) => {
                error!("all_flags failed to read store: {}", e);
                return None;
            }
        };

        let mut values = HashMap::new();
        for flag in flags {
            let mut prereq_events = Vec::new();
            let detail = eval::evaluate(&flag, user, self.store.as_ref(), &mut prereq_events);
            if let Some(value) = detail.value {
                values.insert(flag.key.clone(), value);
            }
        }
        Some(values)
    }

    /// Capture the state of every flag for the user, with per-flag metadata
    /// suitable for bootstrapping a front-end client.
    pub fn all_flags_state(&self, user: &User, options: AllFlagsStateOptions) -> AllFlagsState {
        if self.config.offline() || !self.store.initialized() {
            return AllFlagsState {
                valid: false,
                entries: HashMap::new(),
            };
        }
        let flags = match store::all_flags(self.store.as_ref()) {
            Ok(flags) => flags,
            Err(_) => {
                return AllFlagsState {
                    valid: false,
                    entries: HashMap::new(),
                }
            }
        };

        let mut entries = HashMap::new();
        for flag in flags {
            if options.client_side_only && !flag.client_side {
                continue;
            }
            let mut prereq_events = Vec::new();
            let detail = eval::evaluate(&flag, user, self.store.as_ref(), &mut prereq_events);

            let debug_open = flag
                .debug_events_until_date
                .map(|until| until > now_unix_ms())
                .unwrap_or(false);
            let tracked = flag.track_events || debug_open;
            let with_details = !options.details_only_for_tracked_flags || tracked;

            entries.insert(
                flag.key.clone(),
                FlagState {
                    value: detail.value,
                    variation: detail.variation_index,
                    version: with_details.then_some(flag.version),
                    track_events: flag.track_events,
                    debug_events_until_date: flag.debug_events_until_date,
                    reason: (with_details && options.include_reasons)
                        .then(|| detail.reason.to_json()),
                },
            );
        }
        AllFlagsState {
            valid: true,
            entries,
        }
    }

    /// Report the user's attributes to the analytics stream.
    pub fn identify(&self, user: &User) {
        self.events.record_identify(user);
    }

    /// Record an application-defined event.
    pub fn track(&self, user: &User, event_key: &str, data: Option<Value>) {
        self.events.record_custom(user, event_key, data, None);
    }

    /// Record an application-defined event with a numeric metric.
    pub fn track_metric(&self, user: &User, event_key: &str, data: Option<Value>, metric: f64) {
        self.events.record_custom(user, event_key, data, Some(metric));
    }

    /// Ask the background worker to deliver buffered events now.
    pub fn flush(&self) {
        self.events.request_flush();
    }

    /// Shut down: stop the worker and release the store.
    pub fn close(mut self) {
        self.shutdown_worker();
    }

    fn shutdown_worker(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("network worker panicked during shutdown");
            }
        }
    }

    /// Core of every variation call: resolve the flag, evaluate, record
    /// events, substitute the fallback.
    fn evaluate_for_caller(
        &self,
        user: &User,
        key: &str,
        fallback: Value,
        with_reason: bool,
    ) -> Detail {
        if key.is_empty() {
            return fallback_detail(fallback, EvalErrorKind::NullKey);
        }
        if !self.store.initialized() {
            return fallback_detail(fallback, EvalErrorKind::ClientNotReady);
        }

        let flag = match store::get_flag(self.store.as_ref(), key) {
            Ok(flag) => flag,
            Err(e) => {
                error!("store failure evaluating {:?}: {}", key, e);
                return fallback_detail(fallback, EvalErrorKind::StoreError);
            }
        };

        let flag = match flag {
            Some(flag) => flag,
            None => {
                let detail = Detail::error(EvalErrorKind::FlagNotFound);
                self.events
                    .record_eval(user, key, None, &detail, Some(&fallback), None, with_reason);
                return fallback_detail(fallback, EvalErrorKind::FlagNotFound);
            }
        };

        let mut prereq_events = Vec::new();
        let mut detail =
            eval::evaluate(&flag, user, self.store.as_ref(), &mut prereq_events);

        for prereq in &prereq_events {
            self.events.record_eval(
                user,
                &prereq.flag.key,
                Some(&prereq.flag),
                &prereq.detail,
                None,
                Some(&prereq.prereq_of),
                with_reason,
            );
        }
        self.events
            .record_eval(user, key, Some(&flag), &detail, Some(&fallback), None, with_reason);

        if detail.value.is_none() {
            detail.value = Some(fallback);
        }
        detail
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

fn fallback_detail(fallback: Value, kind: EvalErrorKind) -> Detail {
    Detail {
        value: Some(fallback),
        variation_index: None,
        reason: Reason::Error { kind },
    }
}

/// Convert a detail into the typed value the caller asked for, falling back
/// with `WRONG_TYPE` when the served value has a different shape.
fn typed_result<T>(
    detail: Detail,
    fallback: T,
    accessor: impl Fn(&Value) -> Option<T>,
) -> (T, Detail) {
    match detail.value.as_ref().and_then(&accessor) {
        Some(value) => (value, detail),
        None => (
            fallback,
            Detail {
                value: detail.value,
                variation_index: None,
                reason: Reason::Error {
                    kind: EvalErrorKind::WrongType,
                },
            },
        ),
    }
}

/// Options for [`Client::all_flags_state`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AllFlagsStateOptions {
    /// Include only flags marked for client-side use.
    pub client_side_only: bool,
    /// Include evaluation reasons in the per-flag metadata.
    pub include_reasons: bool,
    /// Omit metadata for flags with no event tracking or debugging active,
    /// shrinking the serialized form.
    pub details_only_for_tracked_flags: bool,
}

/// Per-flag record inside an [`AllFlagsState`].
#[derive(Debug, Clone)]
struct FlagState {
    value: Option<Value>,
    variation: Option<usize>,
    version: Option<u64>,
    track_events: bool,
    debug_events_until_date: Option<u64>,
    reason: Option<Value>,
}

/// A snapshot of all flag values and metadata for one user.
#[derive(Debug, Clone)]
pub struct AllFlagsState {
    valid: bool,
    entries: HashMap<String, FlagState>,
}

impl AllFlagsState {
    /// False when the snapshot could not be captured (offline, no data, or
    /// a store failure); such a snapshot is empty but still serializable.
    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).and_then(|state| state.value.as_ref())
    }

    pub fn variation_index(&self, key: &str) -> Option<usize> {
        self.entries.get(key).and_then(|state| state.variation)
    }

    /// Map of flag key to value, omitting flags that served no value.
    pub fn to_values_map(&self) -> HashMap<String, Value> {
        self.entries
            .iter()
            .filter_map(|(key, state)| {
                state.value.clone().map(|value| (key.clone(), value))
            })
            .collect()
    }

    /// The bootstrap document: flag values at the top level plus
    /// `$flagsState` metadata and a `$valid` marker.
    pub fn to_json(&self) -> Value {
        let mut root = Vec::new();
        let mut meta = Vec::new();
        for (key, state) in &self.entries {
            root.push((
                key.clone(),
                state.value.clone().unwrap_or(Value::Null),
            ));

            let mut entry = Vec::new();
            if let Some(variation) = state.variation {
                entry.push(("variation".to_owned(), Value::Number(variation as f64)));
            }
            if let Some(version) = state.version {
                entry.push(("version".to_owned(), Value::Number(version as f64)));
            }
            if state.track_events {
                entry.push(("trackEvents".to_owned(), Value::Bool(true)));
            }
            if let Some(until) = state.debug_events_until_date {
                entry.push((
                    "debugEventsUntilDate".to_owned(),
                    Value::Number(until as f64),
                ));
            }
            if let Some(reason) = &state.reason {
                entry.push(("reason".to_owned(), reason.clone()));
            }
            meta.push((key.clone(), Value::Object(entry)));
        }
        root.push(("$flagsState".to_owned(), Value::Object(meta)));
        root.push(("$valid".to_owned(), Value::Bool(self.valid)));
        Value::Object(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::serialize_entry;
    use crate::store::{DataKind, PersistentBackend, SerializedItem, SledBackend, StoreEntry};
    use tempfile::tempdir;

    fn flag_json(key: &str, on_value: bool) -> String {
        format!(
            r#"{{
                "key": "{key}",
                "version": 2,
                "on": true,
                "salt": "salt",
                "fallthrough": {{"variation": {idx}}},
                "variations": [false, true],
                "clientSide": true
            }}"#,
            key = key,
            idx = if on_value { 1 } else { 0 }
        )
    }

    fn serialized_flag(key: &str, on_value: bool) -> SerializedItem {
        let flag: crate::schema::FeatureFlag =
            serde_json::from_str(&flag_json(key, on_value)).unwrap();
        serialize_entry(key, &StoreEntry::from_flag(flag)).unwrap()
    }

    fn daemon_client(dir: &std::path::Path, flags: Vec<SerializedItem>) -> Client {
        let backend = SledBackend::new(dir.to_str().unwrap()).unwrap();
        backend
            .init(vec![(DataKind::Features, flags), (DataKind::Segments, vec![])])
            .unwrap();
        let config = Config::builder("sdk-key")
            .use_ldd(true)
            .send_events(false)
            .store_backend(Box::new(backend), 0)
            .build();
        Client::start(config).unwrap()
    }

    fn user() -> User {
        User::with_key("u").unwrap()
    }

    #[test]
    fn test_offline_client_serves_fallbacks() {
        let config = Config::builder("sdk-key").offline(true).build();
        let client = Client::start(config).unwrap();

        assert!(!client.initialized());
        assert!(!client.wait_for_initialization(Duration::from_millis(30)));

        let (value, detail) = client.bool_variation_detail(&user(), "missing", true);
        assert!(value);
        assert_eq!(
            detail.reason,
            Reason::Error {
                kind: EvalErrorKind::ClientNotReady
            }
        );
        assert!(client.all_flags(&user()).is_none());
        assert!(!client.all_flags_state(&user(), Default::default()).valid());
        client.close();
    }

    #[test]
    fn test_daemon_mode_reads_persistent_store() {
        let dir = tempdir().unwrap();
        let client = daemon_client(dir.path(), vec![serialized_flag("f", true)]);

        assert!(client.wait_for_initialization(Duration::from_secs(2)));
        let (value, detail) = client.bool_variation_detail(&user(), "f", false);
        assert!(value);
        assert_eq!(detail.variation_index, Some(1));
        assert_eq!(
            detail.reason,
            Reason::Fallthrough {
                in_experiment: false
            }
        );
        client.close();
    }

    #[test]
    fn test_missing_flag_and_empty_key() {
        let dir = tempdir().unwrap();
        let client = daemon_client(dir.path(), vec![]);
        client.wait_for_initialization(Duration::from_secs(2));

        let (value, detail) = client.string_variation_detail(&user(), "ghost", "fb");
        assert_eq!(value, "fb");
        assert_eq!(
            detail.reason,
            Reason::Error {
                kind: EvalErrorKind::FlagNotFound
            }
        );

        let (_, detail) = client.string_variation_detail(&user(), "", "fb");
        assert_eq!(
            detail.reason,
            Reason::Error {
                kind: EvalErrorKind::NullKey
            }
        );
        client.close();
    }

    #[test]
    fn test_wrong_type_falls_back() {
        let dir = tempdir().unwrap();
        let client = daemon_client(dir.path(), vec![serialized_flag("f", true)]);
        client.wait_for_initialization(Duration::from_secs(2));

        // The flag serves booleans; asking for a string falls back.
        let (value, detail) = client.string_variation_detail(&user(), "f", "fb");
        assert_eq!(value, "fb");
        assert_eq!(
            detail.reason,
            Reason::Error {
                kind: EvalErrorKind::WrongType
            }
        );

        // Asking for the right type works.
        assert!(client.bool_variation(&user(), "f", false));
        client.close();
    }

    #[test]
    fn test_all_flags_and_state() {
        let dir = tempdir().unwrap();
        let client = daemon_client(
            dir.path(),
            vec![serialized_flag("a", true), serialized_flag("b", false)],
        );
        client.wait_for_initialization(Duration::from_secs(2));

        let values = client.all_flags(&user()).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values.get("a"), Some(&Value::Bool(true)));
        assert_eq!(values.get("b"), Some(&Value::Bool(false)));

        let state = client.all_flags_state(
            &user(),
            AllFlagsStateOptions {
                include_reasons: true,
                ..Default::default()
            },
        );
        assert!(state.valid());
        assert_eq!(state.value("a"), Some(&Value::Bool(true)));
        assert_eq!(state.variation_index("b"), Some(0));
        assert_eq!(state.to_values_map().len(), 2);

        let json = state.to_json();
        assert_eq!(json.get("$valid"), Some(&Value::Bool(true)));
        assert_eq!(json.get("a"), Some(&Value::Bool(true)));
        let meta = json.get("$flagsState").unwrap().get("a").unwrap();
        assert_eq!(meta.get("version"), Some(&Value::Number(2.0)));
        assert_eq!(
            meta.get("reason").unwrap().get("kind"),
            Some(&Value::from("FALLTHROUGH"))
        );
        client.close();
    }

    #[test]
    fn test_int_and_double_variations() {
        let dir = tempdir().unwrap();
        let backend = SledBackend::new(dir.path().to_str().unwrap()).unwrap();
        let flag: crate::schema::FeatureFlag = serde_json::from_str(
            r#"{
                "key": "n",
                "version": 1,
                "on": true,
                "fallthrough": {"variation": 0},
                "variations": [12.5]
            }"#,
        )
        .unwrap();
        backend
            .init(vec![
                (
                    DataKind::Features,
                    vec![serialize_entry("n", &StoreEntry::from_flag(flag)).unwrap()],
                ),
                (DataKind::Segments, vec![]),
            ])
            .unwrap();
        let config = Config::builder("sdk-key")
            .use_ldd(true)
            .send_events(false)
            .store_backend(Box::new(backend), 0)
            .build();
        let client = Client::start(config).unwrap();
        client.wait_for_initialization(Duration::from_secs(2));

        assert_eq!(client.double_variation(&user(), "n", 0.0), 12.5);
        assert_eq!(client.int_variation(&user(), "n", 0), 12);
        client.close();
    }
}
