//! Remote document store abstraction.
//!
//! The sync core treats the realtime database as a JSON tree addressed by
//! slash-separated paths, with:
//! - whole-value `set`, one-shot `get`, partial `update` and `remove`
//! - change subscriptions that fire on every overlapping write, including
//!   the subscriber's own
//! - server-assigned, monotonic write timestamps via a sentinel value
//!
//! Two backends are provided: `MemoryStore` for in-process collaboration and
//! tests, and `DocumentStore`, which persists the tree in Sled.

mod memory;
mod sled_store;
mod tree;

pub use memory::MemoryStore;
pub use sled_store::DocumentStore;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::warn;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Metadata encoding error: {0}")]
    Metadata(#[from] bincode::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A realtime JSON document store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Overwrite the value at `path`, returning the write timestamp
    async fn set(&self, path: &str, value: Value) -> StoreResult<i64>;

    /// Read the value at `path` once
    async fn get(&self, path: &str) -> StoreResult<Option<Value>>;

    /// Write several children of `path` in one round; `null` removes a child
    async fn update(&self, path: &str, fields: Map<String, Value>) -> StoreResult<i64>;

    /// Remove the value at `path` and everything below it
    async fn remove(&self, path: &str) -> StoreResult<()>;

    /// Subscribe to the value at `path`
    fn subscribe(&self, path: &str) -> StoreResult<Subscription>;

    /// Current server clock, milliseconds since the Unix epoch
    fn server_time(&self) -> i64;
}

/// A stream of snapshots of one path.
///
/// The first snapshot is the value at subscription time; every later one is
/// the value after a write overlapping the path. `None` means the path is
/// empty.
pub struct Subscription {
    path: String,
    initial: Option<Option<Value>>,
    inner: BroadcastStream<Option<Value>>,
}

impl Subscription {
    pub(crate) fn new(
        path: impl Into<String>,
        initial: Option<Value>,
        rx: broadcast::Receiver<Option<Value>>,
    ) -> Self {
        Self {
            path: path.into(),
            initial: Some(initial),
            inner: BroadcastStream::new(rx),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next snapshot, or `None` once the store has gone away
    pub async fn next(&mut self) -> Option<Option<Value>> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }

        loop {
            match self.inner.next().await {
                Some(Ok(snapshot)) => return Some(snapshot),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    // Later snapshots supersede the skipped ones.
                    warn!("Subscription to {} lagged by {} snapshots", self.path, skipped);
                }
                None => return None,
            }
        }
    }
}

/// Configuration for the Sled-backed store
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = flush on every write)
    pub flush_interval_ms: u64,
    /// Capacity of each subscription channel
    pub subscriber_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/seating.sled".to_string(),
            cache_size: 64 * 1024 * 1024, // 64MB
            flush_interval_ms: 500,
            subscriber_capacity: 64,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }
}

/// Bookkeeping persisted next to the tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// Timestamp of the latest write, keeps the clock monotonic across restarts
    pub last_write_at: i64,
    /// Number of store writes (one per set, update or remove) since creation
    pub write_count: u64,
}
