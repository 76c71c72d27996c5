//! # Analytics Event Processor
//!
//! Collects the telemetry stream: `index` events introducing users, `feature`
//! events for tracked evaluations (plus temporary `debug` duplicates),
//! `identify` and `custom` events from the application, and a per-flush
//! `summary` aggregating every evaluation.
//!
//! Recording happens on caller threads and only ever takes one mutex for a
//! short copy/swap window; delivery happens on the background worker, which
//! asks for a prepared payload and POSTs it. The payload id is generated
//! once per payload so that a retried POST is idempotent server-side.
//!
//! ## Deduplication
//!
//! A user's details only need to be sent once per flush window. An LRU of
//! user keys suppresses repeat `index` events; the whole LRU is cleared on a
//! fixed cadence so long-lived users are re-introduced occasionally. When
//! users are inlined into every event, index events are skipped entirely.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::eval::{Detail, Reason};
use crate::schema::FeatureFlag;
use crate::user::User;
use crate::value::Value;

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Least-recently-used set of user keys, used to deduplicate index events.
struct KeyLru {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl KeyLru {
    fn new(capacity: usize) -> KeyLru {
        KeyLru {
            capacity,
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Insert a key, returning true if it was already present. Inserting an
    /// existing key refreshes its recency.
    fn insert(&mut self, key: &str) -> bool {
        if self.members.contains(key) {
            if let Some(position) = self.order.iter().position(|k| k == key) {
                self.order.remove(position);
            }
            self.order.push_back(key.to_owned());
            return true;
        }
        self.members.insert(key.to_owned());
        self.order.push_back(key.to_owned());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        false
    }

    fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

/// Per-flag summary bucket.
struct FlagSummary {
    /// Fallback supplied by the first summarized evaluation of this flag.
    default_value: Option<Value>,
    counters: HashMap<String, Counter>,
}

struct Counter {
    count: u64,
    value: Option<Value>,
    version: Option<u64>,
    variation: Option<usize>,
    unknown: bool,
}

/// Counter key: the (variation, version) pair in its serialized form.
fn summary_key(variation: Option<usize>, version: Option<u64>) -> String {
    let mut entries = Vec::new();
    if let Some(variation) = variation {
        entries.push(("variation".to_owned(), Value::Number(variation as f64)));
    }
    if let Some(version) = version {
        entries.push(("version".to_owned(), Value::Number(version as f64)));
    }
    Value::Object(entries).to_json_string()
}

struct EventState {
    events: Vec<Value>,
    summary: HashMap<String, FlagSummary>,
    summary_start: u64,
    user_keys: KeyLru,
    last_user_key_flush: Instant,
    last_server_time_ms: u64,
    should_flush: bool,
}

/// A serialized batch ready for delivery, with the payload id that must be
/// reused on retry.
pub struct FlushPayload {
    pub body: String,
    pub payload_id: String,
    pub event_count: usize,
}

/// Buffers and aggregates analytics events until the worker flushes them.
pub struct EventProcessor {
    config: Arc<Config>,
    state: Mutex<EventState>,
    disabled: AtomicBool,
}

impl EventProcessor {
    pub fn new(config: Arc<Config>) -> EventProcessor {
        let user_keys = KeyLru::new(config.user_keys_capacity);
        EventProcessor {
            config,
            state: Mutex::new(EventState {
                events: Vec::new(),
                summary: HashMap::new(),
                summary_start: 0,
                user_keys,
                last_user_key_flush: Instant::now(),
                last_server_time_ms: 0,
                should_flush: false,
            }),
            disabled: AtomicBool::new(false),
        }
    }

    /// Permanently stop producing or delivering events (after a 401/403).
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    fn enabled(&self) -> bool {
        self.config.send_events && !self.is_disabled()
    }

    /// Record one evaluation outcome: index bookkeeping, summary counter,
    /// and (when tracked or debugged) a feature event.
    ///
    /// `flag` is `None` when the flag did not exist; such evaluations only
    /// contribute an `unknown` summary counter. `prereq_of` names the parent
    /// flag when this evaluation was a prerequisite check.
    #[allow(clippy::too_many_arguments)]
    pub fn record_eval(
        &self,
        user: &User,
        flag_key: &str,
        flag: Option<&FeatureFlag>,
        detail: &Detail,
        fallback: Option<&Value>,
        prereq_of: Option<&str>,
        with_reason: bool,
    ) {
        if !self.enabled() {
            return;
        }

        let served: Option<&Value> = detail.value.as_ref().or(fallback);
        let mut state = self.state.lock().unwrap();

        self.maybe_index_user(&mut state, user);
        self.summarize(
            &mut state,
            flag_key,
            flag.map(|f| f.version),
            detail.variation_index,
            served,
            fallback,
            flag.is_none(),
        );

        let flag = match flag {
            Some(flag) => flag,
            None => return,
        };

        let tracked = flag.track_events || rule_track_events(flag, &detail.reason);
        let debugged = self.debug_window_open(&state, flag);
        if !tracked && !debugged {
            return;
        }

        let build = |kind: &str| {
            let mut event = self.base_event(kind, user);
            push(&mut event, "key", Value::String(flag_key.to_owned()));
            if let Some(index) = detail.variation_index {
                push(&mut event, "variation", Value::Number(index as f64));
            }
            if let Some(value) = served {
                push(&mut event, "value", value.clone());
            }
            if let Some(default_value) = fallback {
                push(&mut event, "default", default_value.clone());
            }
            if let Some(parent) = prereq_of {
                push(&mut event, "prereqOf", Value::String(parent.to_owned()));
            }
            push(&mut event, "version", Value::Number(flag.version as f64));
            if with_reason {
                push(&mut event, "reason", detail.reason.to_json());
            }
            Value::Object(event)
        };

        if tracked {
            self.push_event(&mut state, build("feature"));
        }
        if debugged {
            self.push_event(&mut state, build("debug"));
        }
    }

    /// Record an explicit identify call.
    pub fn record_identify(&self, user: &User) {
        if !self.enabled() {
            return;
        }
        let mut event = base_entries("identify");
        push(&mut event, "key", Value::String(user.key().to_owned()));
        push(&mut event, "user", user.event_json(&self.config, true));

        let mut state = self.state.lock().unwrap();
        self.push_event(&mut state, Value::Object(event));
    }

    /// Record a custom event, optionally carrying data and a metric value.
    pub fn record_custom(
        &self,
        user: &User,
        event_key: &str,
        data: Option<Value>,
        metric_value: Option<f64>,
    ) {
        if !self.enabled() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        self.maybe_index_user(&mut state, user);

        let mut event = self.base_event("custom", user);
        push(&mut event, "key", Value::String(event_key.to_owned()));
        if let Some(data) = data {
            push(&mut event, "data", data);
        }
        if let Some(metric) = metric_value {
            push(&mut event, "metricValue", Value::Number(metric));
        }
        self.push_event(&mut state, Value::Object(event));
    }

    /// Ask for an immediate flush; the worker picks this up on its next
    /// iteration.
    pub fn request_flush(&self) {
        self.state.lock().unwrap().should_flush = true;
    }

    /// True when an explicit flush has been requested and not yet served.
    pub fn flush_requested(&self) -> bool {
        self.state.lock().unwrap().should_flush
    }

    /// Record the server clock from a delivery response, used to gate debug
    /// events against local clock skew.
    pub fn set_last_server_time(&self, unix_ms: u64) {
        self.state.lock().unwrap().last_server_time_ms = unix_ms;
    }

    /// Swap out the buffered events and summary, producing a serialized
    /// batch. Returns `None` when there is nothing to send.
    pub fn prepare_flush(&self) -> Option<FlushPayload> {
        let mut state = self.state.lock().unwrap();
        state.should_flush = false;
        if state.events.is_empty() && state.summary.is_empty() {
            return None;
        }

        let mut batch = std::mem::take(&mut state.events);
        let summary = std::mem::take(&mut state.summary);
        let summary_start = state.summary_start;
        state.summary_start = 0;
        drop(state);

        if !summary.is_empty() {
            batch.push(summary_event(summary, summary_start));
        }
        let event_count = batch.len();
        Some(FlushPayload {
            body: Value::Array(batch).to_json_string(),
            payload_id: Uuid::new_v4().to_string(),
            event_count,
        })
    }

    fn base_event(&self, kind: &str, user: &User) -> Vec<(String, Value)> {
        let mut event = base_entries(kind);
        if self.config.inline_users_in_events {
            push(&mut event, "user", user.event_json(&self.config, true));
        } else {
            push(&mut event, "userKey", Value::String(user.key().to_owned()));
        }
        event
    }

    /// Emit an index event for this user unless one was already sent in the
    /// current dedup window. Inline-users mode suppresses them entirely.
    fn maybe_index_user(&self, state: &mut EventState, user: &User) {
        if self.config.inline_users_in_events {
            return;
        }

        let flush_interval =
            std::time::Duration::from_millis(self.config.user_keys_flush_interval_ms);
        if state.last_user_key_flush.elapsed() > flush_interval {
            state.user_keys.clear();
            state.last_user_key_flush = Instant::now();
        }

        if state.user_keys.insert(user.key()) {
            return;
        }

        let mut event = base_entries("index");
        push(&mut event, "user", user.event_json(&self.config, true));
        self.push_event(state, Value::Object(event));
    }

    #[allow(clippy::too_many_arguments)]
    fn summarize(
        &self,
        state: &mut EventState,
        flag_key: &str,
        version: Option<u64>,
        variation: Option<usize>,
        value: Option<&Value>,
        default_value: Option<&Value>,
        unknown: bool,
    ) {
        if state.summary_start == 0 {
            state.summary_start = now_unix_ms();
        }

        let flag_summary = state
            .summary
            .entry(flag_key.to_owned())
            .or_insert_with(|| FlagSummary {
                default_value: default_value.cloned(),
                counters: HashMap::new(),
            });

        let counter = flag_summary
            .counters
            .entry(summary_key(variation, version))
            .or_insert_with(|| Counter {
                count: 0,
                value: value.cloned(),
                version,
                variation,
                unknown,
            });
        counter.count += 1;
    }

    /// Buffer an event, dropping it (not older ones) when full.
    fn push_event(&self, state: &mut EventState, event: Value) {
        if state.events.len() >= self.config.events_capacity {
            warn!("event capacity exceeded, dropping event");
            return;
        }
        state.events.push(event);
    }

    /// A debug duplicate is only worth sending while the flag's debug window
    /// is open by both our clock and the server's.
    fn debug_window_open(&self, state: &EventState, flag: &FeatureFlag) -> bool {
        match flag.debug_events_until_date {
            Some(until) => now_unix_ms() < until && state.last_server_time_ms < until,
            None => false,
        }
    }
}

fn base_entries(kind: &str) -> Vec<(String, Value)> {
    vec![
        (
            "creationDate".to_owned(),
            Value::Number(now_unix_ms() as f64),
        ),
        ("kind".to_owned(), Value::String(kind.to_owned())),
    ]
}

fn push(entries: &mut Vec<(String, Value)>, key: &str, value: Value) {
    entries.push((key.to_owned(), value));
}

/// Did the matched rule itself ask for event tracking?
fn rule_track_events(flag: &FeatureFlag, reason: &Reason) -> bool {
    match reason {
        Reason::RuleMatch { rule_index, .. } => flag
            .rules
            .get(*rule_index)
            .map(|rule| rule.track_events)
            .unwrap_or(false),
        _ => false,
    }
}

fn summary_event(summary: HashMap<String, FlagSummary>, start: u64) -> Value {
    let mut features = Vec::new();
    for (flag_key, flag_summary) in summary {
        let mut flag_entries = Vec::new();
        if let Some(default_value) = flag_summary.default_value {
            push(&mut flag_entries, "default", default_value);
        }
        let mut counters = Vec::new();
        for counter in flag_summary.counters.into_values() {
            let mut entry = Vec::new();
            if let Some(variation) = counter.variation {
                push(&mut entry, "variation", Value::Number(variation as f64));
            }
            if let Some(version) = counter.version {
                push(&mut entry, "version", Value::Number(version as f64));
            }
            if let Some(value) = counter.value {
                push(&mut entry, "value", value);
            }
            if counter.unknown {
                push(&mut entry, "unknown", Value::Bool(true));
            }
            push(&mut entry, "count", Value::Number(counter.count as f64));
            counters.push(Value::Object(entry));
        }
        push(&mut flag_entries, "counters", Value::Array(counters));
        features.push((flag_key, Value::Object(flag_entries)));
    }

    Value::Object(vec![
        ("kind".to_owned(), Value::String("summary".to_owned())),
        ("startDate".to_owned(), Value::Number(start as f64)),
        ("endDate".to_owned(), Value::Number(now_unix_ms() as f64)),
        ("features".to_owned(), Value::Object(features)),
    ])
}
