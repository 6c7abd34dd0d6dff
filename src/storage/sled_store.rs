//! Sled-based store.
//!
//! Keeps the same tree semantics as `MemoryStore` but writes every touched
//! top-level node through to Sled, so the seating plan and presence records
//! survive a restart. Supports:
//! - one JSON value per top-level key (`seatingPlan`, `presence`, ...)
//! - bincode-encoded store metadata keeping the write clock monotonic
//! - each write committed in one transaction across nodes and metadata
//! - flush on drop

use async_trait::async_trait;
use serde_json::{Map, Value};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::tree::{NodeWrite, Persist, TreeCore};
use super::{
    RemoteStore, StorageConfig, StoreError, StoreMetadata, StoreResult, Subscription,
};

/// Tree names for different data types
const TREE_NODES: &str = "nodes";
const TREE_META: &str = "meta";

/// Key of the metadata record
const META_KEY: &[u8] = b"store";

/// Write-through persistence into Sled trees
struct SledPersist {
    db: Arc<Db>,
    nodes: Tree,
    meta: Tree,
    flush_each_write: bool,
}

impl Persist for SledPersist {
    fn persist(&self, nodes: &[NodeWrite], write_at: i64, write_count: u64) -> StoreResult<()> {
        let mut encoded = Vec::with_capacity(nodes.len());
        for (key, node) in nodes {
            let bytes = node.as_ref().map(serde_json::to_vec).transpose()?;
            encoded.push((key.as_bytes(), bytes));
        }
        let meta = bincode::serialize(&StoreMetadata {
            last_write_at: write_at,
            write_count,
        })?;

        // Every node and the metadata land together or not at all.
        (&self.nodes, &self.meta)
            .transaction(|(node_tree, meta_tree)| {
                for (key, bytes) in &encoded {
                    match bytes {
                        Some(bytes) => {
                            node_tree.insert(*key, bytes.as_slice())?;
                        }
                        None => {
                            node_tree.remove(*key)?;
                        }
                    }
                }
                meta_tree.insert(META_KEY, meta.as_slice())?;
                Ok::<(), ConflictableTransactionError<StoreError>>(())
            })
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => StoreError::Sled(e),
            })?;

        if self.flush_each_write {
            self.db.flush()?;
        }
        Ok(())
    }
}

fn load_metadata(meta: &Tree) -> StoreResult<StoreMetadata> {
    match meta.get(META_KEY)? {
        Some(bytes) => Ok(bincode::deserialize(&bytes)?),
        None => Ok(StoreMetadata::default()),
    }
}

/// Sled-backed realtime document store
pub struct DocumentStore {
    db: Arc<Db>,
    nodes: Tree,
    meta: Tree,
    core: TreeCore,
}

impl DocumentStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StoreResult<Self> {
        let path = Path::new(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;
        let db = Arc::new(db);

        let nodes = db.open_tree(TREE_NODES)?;
        let meta = db.open_tree(TREE_META)?;

        let mut root = Map::new();
        for item in nodes.iter() {
            let (key, bytes) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::InitFailed(format!("Corrupt node key: {}", e)))?;
            root.insert(key, serde_json::from_slice(&bytes)?);
        }
        let metadata = load_metadata(&meta)?;

        info!(
            "Opened store at {} ({} nodes, {} writes)",
            config.path,
            root.len(),
            metadata.write_count
        );

        let persist = SledPersist {
            db: db.clone(),
            nodes: nodes.clone(),
            meta: meta.clone(),
            flush_each_write: config.flush_interval_ms == 0,
        };
        let core = TreeCore::restore(
            Value::Object(root),
            metadata.last_write_at,
            metadata.write_count,
            config.subscriber_capacity,
            Some(Box::new(persist)),
        );

        Ok(Self {
            db,
            nodes,
            meta,
            core,
        })
    }

    /// Open with default configuration
    pub fn open_default() -> StoreResult<Self> {
        Self::open(StorageConfig::default())
    }

    /// Persisted bookkeeping
    pub fn metadata(&self) -> StoreResult<StoreMetadata> {
        load_metadata(&self.meta)
    }

    /// Number of writes applied, including those before the last reopen
    pub fn write_count(&self) -> u64 {
        self.core.write_count()
    }

    /// Number of persisted top-level nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for DocumentStore {
    async fn set(&self, path: &str, value: Value) -> StoreResult<i64> {
        self.core.set(path, value)
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Value>> {
        self.core.get(path)
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> StoreResult<i64> {
        self.core.update(path, fields)
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        self.core.remove(path)
    }

    fn subscribe(&self, path: &str) -> StoreResult<Subscription> {
        self.core.subscribe(path)
    }

    fn server_time(&self) -> i64 {
        self.core.server_time()
    }
}

impl Drop for DocumentStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        if let Err(e) = self.flush() {
            debug!("Flush on drop failed: {}", e);
        }
    }
}
