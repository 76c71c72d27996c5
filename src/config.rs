//! # Configuration Management
//!
//! This module holds the SDK configuration: service endpoints, the data
//! source mode (streaming vs. polling vs. none), analytics tuning, redaction
//! policy, and the optional persistent store backend.
//!
//! Configuration is normally assembled with [`Config::builder`]. For
//! deployments that keep settings in files, [`Config::builder_from_file`]
//! loads the plain options from TOML and returns a builder so that
//! non-serializable pieces (the store backend) can still be attached in code.
//!
//! ## Example Configuration File (flagkit.toml)
//! ```toml
//! key = "sdk-key"
//! stream = true
//! events_capacity = 10000
//! flush_interval_ms = 5000
//!
//! [endpoints]
//! base_uri = "https://app.launchdarkly.com"
//! stream_uri = "https://stream.launchdarkly.com"
//! events_uri = "https://events.launchdarkly.com"
//! ```

use std::path::Path;

use config::{Config as ConfigLib, File};
use serde::Deserialize;

use crate::error::Error;
use crate::store::backend::PersistentBackend;

const DEFAULT_BASE_URI: &str = "https://app.launchdarkly.com";
const DEFAULT_STREAM_URI: &str = "https://stream.launchdarkly.com";
const DEFAULT_EVENTS_URI: &str = "https://events.launchdarkly.com";

/// SDK configuration. Ownership transfers to the client at startup.
pub struct Config {
    /// SDK key, sent as the `Authorization` header.
    pub(crate) key: String,
    /// Polling service endpoint, no trailing slash.
    pub(crate) base_uri: String,
    /// Streaming service endpoint, no trailing slash.
    pub(crate) stream_uri: String,
    /// Events service endpoint, no trailing slash.
    pub(crate) events_uri: String,
    /// Use streaming; when false, polling is used instead.
    pub(crate) stream: bool,
    /// Master switch for analytics events.
    pub(crate) send_events: bool,
    /// Disable all network activity; every evaluation falls back.
    pub(crate) offline: bool,
    /// Daemon mode: another process writes the store, this SDK only reads.
    pub(crate) use_ldd: bool,
    /// Maximum number of buffered analytics events.
    pub(crate) events_capacity: usize,
    /// Periodic event flush interval, milliseconds.
    pub(crate) flush_interval_ms: u64,
    /// Polling period, milliseconds.
    pub(crate) poll_interval_ms: u64,
    /// Per-connection timeout, milliseconds.
    pub(crate) timeout_ms: u64,
    /// Redact every user attribute.
    pub(crate) all_attributes_private: bool,
    /// Attribute names redacted for every user.
    pub(crate) private_attribute_names: Vec<String>,
    /// Embed the full redacted user in feature/custom events instead of the
    /// key, suppressing index events.
    pub(crate) inline_users_in_events: bool,
    /// Size of the index-event user key LRU.
    pub(crate) user_keys_capacity: usize,
    /// How often the user key LRU is fully cleared, milliseconds.
    pub(crate) user_keys_flush_interval_ms: u64,
    /// Optional persistent store backend; taken by the client at startup.
    pub(crate) store_backend: Option<Box<dyn PersistentBackend>>,
    /// TTL of the caching wrapper over the backend, milliseconds. Zero means
    /// never cache.
    pub(crate) store_cache_ms: u64,
    /// Wrapper SDK name reported in headers.
    pub(crate) wrapper_name: Option<String>,
    /// Wrapper SDK version reported in headers.
    pub(crate) wrapper_version: Option<String>,
}

impl Config {
    /// Start building a configuration with the given SDK key.
    pub fn builder(key: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            config: Config {
                key: key.into(),
                base_uri: DEFAULT_BASE_URI.to_owned(),
                stream_uri: DEFAULT_STREAM_URI.to_owned(),
                events_uri: DEFAULT_EVENTS_URI.to_owned(),
                stream: true,
                send_events: true,
                offline: false,
                use_ldd: false,
                events_capacity: 10_000,
                flush_interval_ms: 5_000,
                poll_interval_ms: 30_000,
                timeout_ms: 5_000,
                all_attributes_private: false,
                private_attribute_names: Vec::new(),
                inline_users_in_events: false,
                user_keys_capacity: 1_000,
                user_keys_flush_interval_ms: 300_000,
                store_backend: None,
                store_cache_ms: 30_000,
                wrapper_name: None,
                wrapper_version: None,
            },
        }
    }

    /// Load the plain options from a TOML file and return a builder seeded
    /// with them.
    pub fn builder_from_file(path: &Path) -> Result<ConfigBuilder, Error> {
        let settings = ConfigLib::builder()
            .add_source(File::from(path))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        let file: ConfigFile = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;

        let mut builder = Config::builder(file.key);
        if let Some(endpoints) = file.endpoints {
            if let Some(uri) = endpoints.base_uri {
                builder = builder.base_uri(uri);
            }
            if let Some(uri) = endpoints.stream_uri {
                builder = builder.stream_uri(uri);
            }
            if let Some(uri) = endpoints.events_uri {
                builder = builder.events_uri(uri);
            }
        }
        if let Some(stream) = file.stream {
            builder = builder.stream(stream);
        }
        if let Some(send_events) = file.send_events {
            builder = builder.send_events(send_events);
        }
        if let Some(offline) = file.offline {
            builder = builder.offline(offline);
        }
        if let Some(use_ldd) = file.use_ldd {
            builder = builder.use_ldd(use_ldd);
        }
        if let Some(capacity) = file.events_capacity {
            builder = builder.events_capacity(capacity);
        }
        if let Some(interval) = file.flush_interval_ms {
            builder = builder.flush_interval_ms(interval);
        }
        if let Some(interval) = file.poll_interval_ms {
            builder = builder.poll_interval_ms(interval);
        }
        if let Some(timeout) = file.timeout_ms {
            builder = builder.timeout_ms(timeout);
        }
        Ok(builder)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn offline(&self) -> bool {
        self.offline
    }
}

/// The file-loadable subset of the configuration.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    key: String,
    endpoints: Option<ConfigFileEndpoints>,
    stream: Option<bool>,
    send_events: Option<bool>,
    offline: Option<bool>,
    use_ldd: Option<bool>,
    events_capacity: Option<usize>,
    flush_interval_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ConfigFileEndpoints {
    base_uri: Option<String>,
    stream_uri: Option<String>,
    events_uri: Option<String>,
}

fn trim_uri(uri: String) -> String {
    uri.trim_end_matches('/').to_owned()
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn base_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.base_uri = trim_uri(uri.into());
        self
    }

    pub fn stream_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.stream_uri = trim_uri(uri.into());
        self
    }

    pub fn events_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.events_uri = trim_uri(uri.into());
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.config.stream = stream;
        self
    }

    pub fn send_events(mut self, send_events: bool) -> Self {
        self.config.send_events = send_events;
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.config.offline = offline;
        self
    }

    pub fn use_ldd(mut self, use_ldd: bool) -> Self {
        self.config.use_ldd = use_ldd;
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity;
        self
    }

    pub fn flush_interval_ms(mut self, interval: u64) -> Self {
        self.config.flush_interval_ms = interval;
        self
    }

    pub fn poll_interval_ms(mut self, interval: u64) -> Self {
        self.config.poll_interval_ms = interval;
        self
    }

    pub fn timeout_ms(mut self, timeout: u64) -> Self {
        self.config.timeout_ms = timeout;
        self
    }

    pub fn all_attributes_private(mut self, private: bool) -> Self {
        self.config.all_attributes_private = private;
        self
    }

    /// Add one globally-private attribute name.
    pub fn private_attribute_name(mut self, name: impl Into<String>) -> Self {
        self.config.private_attribute_names.push(name.into());
        self
    }

    pub fn inline_users_in_events(mut self, inline: bool) -> Self {
        self.config.inline_users_in_events = inline;
        self
    }

    pub fn user_keys_capacity(mut self, capacity: usize) -> Self {
        self.config.user_keys_capacity = capacity;
        self
    }

    pub fn user_keys_flush_interval_ms(mut self, interval: u64) -> Self {
        self.config.user_keys_flush_interval_ms = interval;
        self
    }

    /// Attach a persistent store backend, cached for `cache_ms` milliseconds.
    pub fn store_backend(
        mut self,
        backend: Box<dyn PersistentBackend>,
        cache_ms: u64,
    ) -> Self {
        self.config.store_backend = Some(backend);
        self.config.store_cache_ms = cache_ms;
        self
    }

    /// Identify a wrapper SDK in outbound headers.
    pub fn wrapper(mut self, name: impl Into<String>, version: Option<String>) -> Self {
        self.config.wrapper_name = Some(name.into());
        self.config.wrapper_version = version;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::builder("sdk-key").build();
        assert_eq!(config.key, "sdk-key");
        assert_eq!(config.base_uri, DEFAULT_BASE_URI);
        assert!(config.stream);
        assert!(config.send_events);
        assert!(!config.offline);
        assert_eq!(config.events_capacity, 10_000);
        assert_eq!(config.flush_interval_ms, 5_000);
        assert_eq!(config.poll_interval_ms, 30_000);
        assert_eq!(config.user_keys_capacity, 1_000);
    }

    #[test]
    fn test_trailing_slashes_trimmed() {
        let config = Config::builder("k")
            .base_uri("https://example.com/")
            .stream_uri("https://stream.example.com//")
            .events_uri("https://events.example.com")
            .build();
        assert_eq!(config.base_uri, "https://example.com");
        assert_eq!(config.stream_uri, "https://stream.example.com");
        assert_eq!(config.events_uri, "https://events.example.com");
    }

    #[test]
    fn test_builder_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flagkit.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
key = "file-key"
stream = false
events_capacity = 50
poll_interval_ms = 10000

[endpoints]
base_uri = "https://poll.example.com/"
            "#
        )
        .unwrap();

        let config = Config::builder_from_file(&path).unwrap().build();
        assert_eq!(config.key, "file-key");
        assert!(!config.stream);
        assert_eq!(config.events_capacity, 50);
        assert_eq!(config.poll_interval_ms, 10_000);
        assert_eq!(config.base_uri, "https://poll.example.com");
        // Unset options keep their defaults.
        assert_eq!(config.flush_interval_ms, 5_000);
    }

    #[test]
    fn test_missing_key_in_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flagkit.toml");
        std::fs::write(&path, "stream = true\n").unwrap();
        assert!(Config::builder_from_file(&path).is_err());
    }
}
