//! # Streaming Data Source
//!
//! Keeps the store live through a long-lived Server-Sent-Events connection
//! to `{stream_uri}/all`. Three named events mutate the store: `put`
//! replaces the full dataset, `patch` upserts one flag or segment, and
//! `delete` writes a tombstone. Anything else is ignored.
//!
//! The SSE line protocol is parsed incrementally: `:`-prefixed comments are
//! discarded, `event:` and `data:` fields accumulate (multi-line data joins
//! with `\n`), and a blank line dispatches. A malformed payload is treated
//! as a broken stream: the connection is dropped and reopened with
//! exponential backoff, because a stream that desynchronized once cannot be
//! trusted for deltas.

use std::sync::Arc;

use futures::StreamExt;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::StoreError;
use crate::network::Backoff;
use crate::schema::{
    parse_patch_path, DeletePayload, FeatureFlag, PatchPayload, PatchTarget, PutPayload,
    Segment,
};
use crate::store::{DataKind, DataStore, FullDataSet, StoreEntry};

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub name: String,
    pub data: String,
}

/// Incremental SSE field parser. Feed it lines; it returns an event at each
/// dispatch boundary.
#[derive(Default)]
pub struct SseParser {
    event_name: String,
    data: Option<String>,
}

impl SseParser {
    pub fn new() -> SseParser {
        SseParser::default()
    }

    /// Consume one line (without its terminator). Returns a complete event
    /// when the line was a dispatch boundary.
    pub fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.starts_with(':') {
            // Comment; commonly used as a keepalive.
            return None;
        }
        if line.is_empty() {
            if self.event_name.is_empty() {
                if self.data.is_some() {
                    warn!("SSE dispatch without an event name");
                }
                self.data = None;
                return None;
            }
            let data = match self.data.take() {
                Some(data) => data,
                None => {
                    warn!("SSE dispatch without data");
                    self.event_name.clear();
                    return None;
                }
            };
            let name = std::mem::take(&mut self.event_name);
            return Some(SseEvent { name, data });
        }
        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            match &mut self.data {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(rest);
                }
                None => self.data = Some(rest.to_owned()),
            }
            return None;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            self.event_name = rest.to_owned();
            return None;
        }
        // Unknown field (id:, retry:, ...): ignored.
        None
    }
}

/// Splits a byte stream into lines, tolerating chunk boundaries anywhere and
/// both `\n` and `\r\n` terminators.
#[derive(Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> LineBuffer {
        LineBuffer::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

/// A stream payload the store could not accept.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("malformed {0} payload: {1}")]
    Malformed(&'static str, String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Apply one dispatched event to the store. Unknown event names are
/// ignored; malformed payloads are errors that fail the stream.
pub fn apply_event(store: &dyn DataStore, event: &SseEvent) -> Result<(), StreamError> {
    match event.name.as_str() {
        "put" => {
            let payload: PutPayload = serde_json::from_str(&event.data)
                .map_err(|e| StreamError::Malformed("put", e.to_string()))?;
            store.init(FullDataSet::from(payload.data))?;
            info!("stream delivered full dataset");
            Ok(())
        }
        "patch" => {
            let payload: PatchPayload = serde_json::from_str(&event.data)
                .map_err(|e| StreamError::Malformed("patch", e.to_string()))?;
            match parse_patch_path(&payload.path) {
                PatchTarget::Flag(key) => {
                    let flag: FeatureFlag = serde_json::from_value(payload.data)
                        .map_err(|e| StreamError::Malformed("patch", e.to_string()))?;
                    store.upsert(DataKind::Features, &key, StoreEntry::from_flag(flag))?;
                }
                PatchTarget::Segment(key) => {
                    let segment: Segment = serde_json::from_value(payload.data)
                        .map_err(|e| StreamError::Malformed("patch", e.to_string()))?;
                    store.upsert(DataKind::Segments, &key, StoreEntry::from_segment(segment))?;
                }
                PatchTarget::Ignored => {
                    debug!("ignoring patch for unrecognized path {:?}", payload.path);
                }
            }
            Ok(())
        }
        "delete" => {
            let payload: DeletePayload = serde_json::from_str(&event.data)
                .map_err(|e| StreamError::Malformed("delete", e.to_string()))?;
            let entry = StoreEntry::Tombstone(payload.version);
            match parse_patch_path(&payload.path) {
                PatchTarget::Flag(key) => {
                    store.upsert(DataKind::Features, &key, entry)?;
                }
                PatchTarget::Segment(key) => {
                    store.upsert(DataKind::Segments, &key, entry)?;
                }
                PatchTarget::Ignored => {
                    debug!("ignoring delete for unrecognized path {:?}", payload.path);
                }
            }
            Ok(())
        }
        other => {
            debug!("ignoring unknown stream event {:?}", other);
            Ok(())
        }
    }
}

/// Run the streaming worker until shutdown. Reconnects with exponential
/// backoff; 401/403 are permanent and end the worker.
pub async fn run(
    http: reqwest::Client,
    config: Arc<Config>,
    store: Arc<dyn DataStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = format!("{}/all", config.stream_uri);
    let mut backoff = Backoff::new();

    while !*shutdown.borrow() {
        info!("connecting to streaming url: {}", url);
        let response = tokio::select! {
            _ = shutdown.changed() => return,
            response = http.get(&url).send() => response,
        };

        let connected_at = std::time::Instant::now();
        match response {
            Ok(response) => {
                let status = response.status();
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    error!("streaming access denied ({}); giving up", status);
                    return;
                }
                if !status.is_success() {
                    warn!("streaming connection failed with status {}", status);
                } else if let Err(e) = consume(response, store.as_ref(), &mut shutdown).await
                {
                    warn!("stream failed: {}", e);
                }
            }
            Err(e) => {
                warn!("streaming connection error: {}", e);
            }
        }

        if *shutdown.borrow() {
            return;
        }

        // A connection that stayed healthy for a while earns a fresh
        // backoff schedule.
        if connected_at.elapsed() >= Backoff::RESET_AFTER {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        debug!("reconnecting stream in {:?}", delay);
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Drive one open response body through the parser until it ends, errors,
/// or produces a payload the store rejects.
async fn consume(
    response: reqwest::Response,
    store: &dyn DataStore,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), StreamError> {
    let mut body = response.bytes_stream();
    let mut lines = LineBuffer::new();
    let mut parser = SseParser::new();

    loop {
        let chunk = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            chunk = body.next() => chunk,
        };
        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                warn!("stream read error: {}", e);
                return Ok(());
            }
            // Server closed the stream; reconnect.
            None => return Ok(()),
        };
        for line in lines.push(&chunk) {
            if let Some(event) = parser.feed_line(&line) {
                apply_event(store, &event)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn dispatch(parser: &mut SseParser, lines: &[&str]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for line in lines {
            if let Some(event) = parser.feed_line(line) {
                events.push(event);
            }
        }
        events
    }

    #[test]
    fn test_sse_basic_dispatch() {
        let mut parser = SseParser::new();
        let events = dispatch(
            &mut parser,
            &["event: put", "data: {\"x\":1}", ""],
        );
        assert_eq!(
            events,
            vec![SseEvent {
                name: "put".to_owned(),
                data: "{\"x\":1}".to_owned()
            }]
        );
    }

    #[test]
    fn test_sse_multiline_data_joined_with_newline() {
        let mut parser = SseParser::new();
        let events = dispatch(&mut parser, &["event: patch", "data: line1", "data: line2", ""]);
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn test_sse_comments_and_unknown_fields_ignored() {
        let mut parser = SseParser::new();
        let events = dispatch(
            &mut parser,
            &[": keepalive", "id: 7", "event: put", "data: {}", ""],
        );
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_sse_dispatch_without_name_or_data_is_dropped() {
        let mut parser = SseParser::new();
        assert!(dispatch(&mut parser, &["data: orphan", ""]).is_empty());
        assert!(dispatch(&mut parser, &["event: put", ""]).is_empty());
        // State is cleared between attempts.
        let events = dispatch(&mut parser, &["event: put", "data: {}", ""]);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_sse_field_without_space_after_colon() {
        let mut parser = SseParser::new();
        let events = dispatch(&mut parser, &["event:put", "data:{}", ""]);
        assert_eq!(events[0].name, "put");
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn test_line_buffer_handles_split_chunks_and_crlf() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"event: pu").is_empty());
        assert_eq!(buffer.push(b"t\r\ndata: {}\n\n"), vec![
            "event: put".to_owned(),
            "data: {}".to_owned(),
            "".to_owned()
        ]);
    }

    fn put_event(data: &str) -> SseEvent {
        SseEvent {
            name: "put".to_owned(),
            data: data.to_owned(),
        }
    }

    fn event(name: &str, data: &str) -> SseEvent {
        SseEvent {
            name: name.to_owned(),
            data: data.to_owned(),
        }
    }

    const PUT_BODY: &str = r#"{
        "path": "/",
        "data": {
            "flags": {"f": {"key": "f", "version": 2, "on": false, "offVariation": 0, "variations": [true]}},
            "segments": {}
        }
    }"#;

    #[test]
    fn test_put_initializes_store() {
        let store = MemoryStore::new();
        assert!(!store.initialized());
        apply_event(&store, &put_event(PUT_BODY)).unwrap();
        assert!(store.initialized());
        let entry = store.get(DataKind::Features, "f").unwrap().unwrap();
        assert_eq!(entry.version(), 2);
    }

    #[test]
    fn test_patch_then_delete_then_stale_upsert() {
        let store = MemoryStore::new();
        apply_event(&store, &put_event(PUT_BODY)).unwrap();

        // Patch to version 3.
        apply_event(
            &store,
            &event(
                "patch",
                r#"{"path": "/flags/f", "data": {"key": "f", "version": 3}}"#,
            ),
        )
        .unwrap();
        assert_eq!(
            store.get(DataKind::Features, "f").unwrap().unwrap().version(),
            3
        );

        // Delete at version 4.
        apply_event(
            &store,
            &event("delete", r#"{"path": "/flags/f", "version": 4}"#),
        )
        .unwrap();
        assert!(store.get(DataKind::Features, "f").unwrap().is_none());

        // A stale patch at version 3 stays dead.
        apply_event(
            &store,
            &event(
                "patch",
                r#"{"path": "/flags/f", "data": {"key": "f", "version": 3}}"#,
            ),
        )
        .unwrap();
        assert!(store.get(DataKind::Features, "f").unwrap().is_none());
    }

    #[test]
    fn test_patch_segment_namespace() {
        let store = MemoryStore::new();
        apply_event(
            &store,
            &event(
                "patch",
                r#"{"path": "/segments/s", "data": {"key": "s", "version": 1}}"#,
            ),
        )
        .unwrap();
        assert!(store.get(DataKind::Segments, "s").unwrap().is_some());
        assert!(store.get(DataKind::Features, "s").unwrap().is_none());
    }

    #[test]
    fn test_unknown_paths_and_event_names_ignored() {
        let store = MemoryStore::new();
        apply_event(
            &store,
            &event("patch", r#"{"path": "/other/x", "data": {"key": "x"}}"#),
        )
        .unwrap();
        apply_event(
            &store,
            &event("delete", r#"{"path": "/other/x", "version": 1}"#),
        )
        .unwrap();
        apply_event(&store, &event("ping", "{}")).unwrap();
        assert!(store.all(DataKind::Features).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_payloads_fail_the_stream() {
        let store = MemoryStore::new();
        // Not JSON at all.
        assert!(apply_event(&store, &put_event("not json")).is_err());
        // Missing the segments collection.
        assert!(apply_event(
            &store,
            &put_event(r#"{"path": "/", "data": {"flags": {}}}"#)
        )
        .is_err());
        // Patch data of the wrong type.
        assert!(apply_event(
            &store,
            &event("patch", r#"{"path": "/flags/f", "data": [1, 2]}"#)
        )
        .is_err());
        // Delete without a version.
        assert!(apply_event(
            &store,
            &event("delete", r#"{"path": "/flags/f"}"#)
        )
        .is_err());
    }

    #[test]
    fn test_deleted_document_in_patch_becomes_tombstone() {
        let store = MemoryStore::new();
        apply_event(&store, &put_event(PUT_BODY)).unwrap();
        apply_event(
            &store,
            &event(
                "patch",
                r#"{"path": "/flags/f", "data": {"key": "f", "version": 5, "deleted": true}}"#,
            ),
        )
        .unwrap();
        assert!(store.get(DataKind::Features, "f").unwrap().is_none());
        // The tombstone's version still gates.
        apply_event(
            &store,
            &event(
                "patch",
                r#"{"path": "/flags/f", "data": {"key": "f", "version": 4}}"#,
            ),
        )
        .unwrap();
        assert!(store.get(DataKind::Features, "f").unwrap().is_none());
    }
}
