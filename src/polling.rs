//! # Polling Data Source
//!
//! Fallback synchronization for environments where streaming is disabled:
//! fetch the full dataset from `{base_uri}/sdk/latest-all` on a fixed
//! interval and replace the store contents wholesale. Never runs when
//! streaming is enabled.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::StoreError;
use crate::schema::AllData;
use crate::store::{DataStore, FullDataSet};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("polling access denied ({0})")]
    AccessDenied(u16),
    #[error("polling request failed: {0}")]
    Http(String),
    #[error("malformed polling document: {0}")]
    Malformed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parse a polling document and replace the store dataset with it.
pub fn apply_poll_payload(store: &dyn DataStore, body: &str) -> Result<(), PollError> {
    let data: AllData =
        serde_json::from_str(body).map_err(|e| PollError::Malformed(e.to_string()))?;
    store.init(FullDataSet::from(data))?;
    Ok(())
}

async fn poll_once(
    http: &reqwest::Client,
    url: &str,
    store: &dyn DataStore,
) -> Result<(), PollError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| PollError::Http(e.to_string()))?;
    let status = response.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(PollError::AccessDenied(status.as_u16()));
    }
    if !status.is_success() {
        return Err(PollError::Http(format!("status {}", status)));
    }
    let body = response
        .text()
        .await
        .map_err(|e| PollError::Http(e.to_string()))?;
    apply_poll_payload(store, &body)?;
    debug!("poll refreshed dataset");
    Ok(())
}

/// Run the polling worker until shutdown. Transient failures are logged and
/// retried on the next tick; 401/403 end the worker permanently.
pub async fn run(
    http: reqwest::Client,
    config: Arc<Config>,
    store: Arc<dyn DataStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = format!("{}/sdk/latest-all", config.base_uri);
    let interval = Duration::from_millis(config.poll_interval_ms);
    info!("polling {} every {:?}", url, interval);

    while !*shutdown.borrow() {
        let outcome = tokio::select! {
            _ = shutdown.changed() => return,
            outcome = poll_once(&http, &url, store.as_ref()) => outcome,
        };
        match outcome {
            Ok(()) => {}
            Err(e @ PollError::AccessDenied(_)) => {
                error!("{}; giving up", e);
                return;
            }
            Err(e) => warn!("{}", e),
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
