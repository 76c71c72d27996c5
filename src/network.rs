//! # Network Engine
//!
//! Hosts the background networking for the client: one worker drives the
//! data source (streaming or polling) and the analytics delivery loop as
//! cooperatively scheduled futures on a single runtime thread. Caller
//! threads never touch a socket.
//!
//! Also owns what the workers share: the HTTP client carrying the
//! authorization and user-agent headers, reconnect backoff, and the
//! deterministic parse of the response `Date:` header used to track server
//! time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::DateTime;
use log::{debug, error, warn};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use tokio::sync::watch;

use crate::config::Config;
use crate::events::{EventProcessor, FlushPayload};
use crate::store::DataStore;
use crate::{polling, streaming};

/// How often the analytics loop wakes to check for due flushes.
const EVENT_TICK: Duration = Duration::from_millis(50);
/// Pause before the single delivery retry.
const RETRY_DELAY: Duration = Duration::from_millis(1_000);

/// Exponential reconnect backoff with jitter: 1s doubling to a 30s ceiling,
/// with the upper half of each delay randomized so a fleet of clients does
/// not reconnect in lockstep.
pub struct Backoff {
    attempts: u32,
}

impl Backoff {
    const BASE_MS: u64 = 1_000;
    const MAX_MS: u64 = 30_000;
    /// A connection alive this long resets the schedule.
    pub const RESET_AFTER: Duration = Duration::from_secs(60);

    pub fn new() -> Backoff {
        Backoff { attempts: 0 }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempts.min(16);
        self.attempts = self.attempts.saturating_add(1);
        let ceiling = (Self::BASE_MS << exponent).min(Self::MAX_MS);
        let jittered = ceiling / 2 + rand::thread_rng().gen_range(0..=ceiling / 2);
        Duration::from_millis(jittered)
    }
}

impl Default for Backoff {
    fn default() -> Backoff {
        Backoff::new()
    }
}

/// Build the shared HTTP client: authorization, user agent, optional
/// wrapper identification, and the configured connection timeout.
pub fn build_http_client(config: &Config) -> Result<reqwest::Client, String> {
    let mut headers = HeaderMap::new();
    let auth = HeaderValue::from_str(&config.key)
        .map_err(|_| "SDK key is not a valid header value".to_owned())?;
    headers.insert(AUTHORIZATION, auth);

    let agent = format!("CServerClient/{}", env!("CARGO_PKG_VERSION"));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&agent).map_err(|e| e.to_string())?,
    );

    if let Some(name) = &config.wrapper_name {
        let wrapper = match &config.wrapper_version {
            Some(version) => format!("{}/{}", name, version),
            None => name.clone(),
        };
        headers.insert(
            "X-LaunchDarkly-Wrapper",
            HeaderValue::from_str(&wrapper).map_err(|e| e.to_string())?,
        );
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_millis(config.timeout_ms))
        .build()
        .map_err(|e| e.to_string())
}

/// Parse an RFC 2822 `Date:` header into Unix milliseconds.
pub fn parse_server_date(header: &str) -> Option<u64> {
    DateTime::parse_from_rfc2822(header)
        .ok()
        .map(|dt| dt.timestamp_millis())
        .filter(|ms| *ms >= 0)
        .map(|ms| ms as u64)
}

/// The background worker: data source plus analytics until shutdown.
pub async fn run(
    config: Arc<Config>,
    store: Arc<dyn DataStore>,
    events: Arc<EventProcessor>,
    shutdown: watch::Receiver<bool>,
) {
    let http = match build_http_client(&config) {
        Ok(http) => http,
        Err(e) => {
            error!("failed to construct HTTP client: {}", e);
            return;
        }
    };

    let data_source = {
        let http = http.clone();
        let config = config.clone();
        let store = store.clone();
        let shutdown = shutdown.clone();
        async move {
            if config.use_ldd {
                // Daemon mode: another process keeps the store fresh.
                return;
            }
            if config.stream {
                streaming::run(http, config, store, shutdown).await;
            } else {
                polling::run(http, config, store, shutdown).await;
            }
        }
    };

    let analytics = {
        let config = config.clone();
        let events = events.clone();
        let shutdown = shutdown.clone();
        async move {
            if config.send_events {
                run_events(http, config, events, shutdown).await;
            }
        }
    };

    tokio::join!(data_source, analytics);
}

/// Deliver batches on the flush interval or on demand, with the single
/// same-payload-id retry.
async fn run_events(
    http: reqwest::Client,
    config: Arc<Config>,
    events: Arc<EventProcessor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let flush_interval = Duration::from_millis(config.flush_interval_ms);
    let url = format!("{}/bulk", config.events_uri);
    let mut last_flush = Instant::now();

    while !*shutdown.borrow() {
        if events.flush_requested() || last_flush.elapsed() >= flush_interval {
            if let Some(payload) = events.prepare_flush() {
                deliver(&http, &url, &events, payload, &mut shutdown).await;
                if events.is_disabled() {
                    return;
                }
            }
            last_flush = Instant::now();
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(EVENT_TICK) => {}
        }
    }
}

async fn deliver(
    http: &reqwest::Client,
    url: &str,
    events: &EventProcessor,
    payload: FlushPayload,
    shutdown: &mut watch::Receiver<bool>,
) {
    for attempt in 0..2 {
        if attempt > 0 {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(RETRY_DELAY) => {}
            }
        }

        let request = http
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-LaunchDarkly-Event-Schema", "3")
            .header("X-LaunchDarkly-Payload-ID", &payload.payload_id)
            .body(payload.body.clone());

        match request.send().await {
            Ok(response) => {
                if let Some(server_ms) = response
                    .headers()
                    .get(reqwest::header::DATE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(parse_server_date)
                {
                    events.set_last_server_time(server_ms);
                }

                let status = response.status();
                if status.is_success() {
                    debug!("delivered {} events", payload.event_count);
                    return;
                }
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    error!("event delivery access denied ({}); disabling events", status);
                    events.disable();
                    return;
                }
                warn!("event delivery failed with status {}", status);
            }
            Err(e) => {
                warn!("event delivery failed: {}", e);
            }
        }
    }
    error!(
        "failed to deliver {} events twice, discarding batch",
        payload.event_count
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_to_ceiling() {
        let mut backoff = Backoff::new();
        let first = backoff.next_delay();
        // First delay: between 500ms and 1s.
        assert!(first >= Duration::from_millis(500));
        assert!(first <= Duration::from_millis(1_000));

        // After many attempts, delays sit in the jittered ceiling band.
        for _ in 0..20 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped >= Duration::from_millis(15_000));
        assert!(capped <= Duration::from_millis(30_000));

        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(1_000));
    }

    #[test]
    fn test_parse_server_date() {
        let ms = parse_server_date("Tue, 15 Nov 1994 12:45:26 GMT").unwrap();
        assert_eq!(ms, 784_903_526_000);
        assert!(parse_server_date("not a date").is_none());
    }
}
