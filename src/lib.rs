//! # flagkit - Server-Side Feature Flag SDK
//!
//! Embed this crate, hand it a user and a flag key, and get a variation
//! value back with diagnostic detail. Behind that call the SDK keeps a live
//! local copy of the project's flag and segment definitions (streamed from
//! the flag service, with polling as a fallback), evaluates rule graphs
//! locally with no round trip, and ships a deduplicated, summarized
//! analytics stream back for billing and experimentation.
//!
//! ## Architecture Overview
//!
//! - **Value model** (`value`): dynamic JSON-shaped values with deep
//!   equality and canonical serialization
//! - **Store** (`store`): versioned flag/segment storage; in-memory by
//!   default, optionally a TTL-cached persistent backend (sled bundled)
//! - **Data sources** (`streaming`, `polling`): SSE-driven updates with
//!   reconnect backoff, or periodic full refreshes
//! - **Evaluation** (`eval`, `ops`): prerequisites, targets, rules,
//!   segments, and deterministic SHA-1 bucketing
//! - **Events** (`events`): index/feature/debug/custom/summary analytics
//!   with LRU dedup, capacity bounds, and idempotent delivery
//! - **Client** (`client`): lifecycle and the typed variation API
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use flagkit::{Client, Config, User};
//!
//! let config = Config::builder("your-sdk-key").build();
//! let client = Client::start(config).unwrap();
//! client.wait_for_initialization(Duration::from_secs(5));
//!
//! let user = User::with_key("user-123").unwrap();
//! if client.bool_variation(&user, "new-dashboard", false) {
//!     // serve the new dashboard
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod eval;
pub mod events;
pub mod ops;
pub mod polling;
pub mod schema;
pub mod store;
pub mod streaming;
pub mod user;
pub mod value;

mod network;

pub use client::{AllFlagsState, AllFlagsStateOptions, Client};
pub use config::{Config, ConfigBuilder};
pub use error::{Error, EvalErrorKind, StoreError};
pub use eval::{Detail, Reason};
pub use store::{DataStore, PersistentBackend, SerializedItem, SledBackend};
pub use user::{User, UserBuilder};
pub use value::{Value, ValueKind};
