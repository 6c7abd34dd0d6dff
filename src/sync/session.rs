//! Session lifecycle and presence management.
//!
//! Each client participates under a generated session id and keeps an
//! ephemeral presence record at `presence/<id>`:
//! - written when the session starts, removed when it ends
//! - `lastSeen` refreshed on a fixed interval
//! - records not seen within the staleness window swept by every client

use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::{SyncResult, PRESENCE_PATH};
use crate::model::{PresenceRecord, SessionId, WriteTimestamp};
use crate::storage::RemoteStore;

/// Length of the random session id suffix
const SUFFIX_LEN: usize = 9;

/// Configuration for presence behaviour
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Store path under which presence records live
    pub presence_path: String,
    /// Diagnostic string stored with the presence record
    pub user_agent: String,
    /// How often `lastSeen` is refreshed
    pub refresh_interval: Duration,
    /// How often stale records are swept
    pub sweep_interval: Duration,
    /// Records older than this are removed by the sweep
    pub stale_after: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            presence_path: PRESENCE_PATH.to_string(),
            user_agent: format!("seating-sync/{}", env!("CARGO_PKG_VERSION")),
            refresh_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
        }
    }
}

impl SessionConfig {
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// One presence record currently marked online
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub id: SessionId,
    pub last_seen: Option<i64>,
    pub user_agent: String,
}

/// Owner of this client's session id and presence record
pub struct SessionManager {
    config: SessionConfig,
    store: Arc<dyn RemoteStore>,
    session_id: RwLock<Option<SessionId>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn RemoteStore>, config: SessionConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            store,
            session_id: RwLock::new(None),
            shutdown_tx,
        }
    }

    /// Create with default configuration
    pub fn with_store(store: Arc<dyn RemoteStore>) -> Self {
        Self::new(store, SessionConfig::default())
    }

    /// Current session id, if a session is active
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.read().clone()
    }

    pub fn is_active(&self) -> bool {
        self.session_id.read().is_some()
    }

    /// Store path under which presence records live
    pub fn presence_path(&self) -> &str {
        &self.config.presence_path
    }

    fn record_path(&self, session_id: &str) -> String {
        format!("{}/{}", self.config.presence_path, session_id)
    }

    /// Start a session and announce presence.
    ///
    /// Returns the existing id when a session is already active. A failed
    /// presence write is logged; the session still starts.
    pub async fn start_session(&self) -> SessionId {
        let session_id = {
            let mut current = self.session_id.write();
            if let Some(existing) = current.as_ref() {
                return existing.clone();
            }
            let id = generate_session_id();
            *current = Some(id.clone());
            id
        };

        let record = PresenceRecord::online(self.config.user_agent.clone());
        match serde_json::to_value(&record) {
            Ok(value) => {
                if let Err(e) = self.store.set(&self.record_path(&session_id), value).await {
                    error!("Failed to write presence for {}: {}", session_id, e);
                }
            }
            Err(e) => error!("Failed to encode presence record: {}", e),
        }

        info!("Collaboration session started: {}", session_id);
        session_id
    }

    /// End the session and remove its presence record, best effort
    pub async fn end_session(&self) -> Option<SessionId> {
        let session_id = self.session_id.write().take()?;

        if let Err(e) = self.store.remove(&self.record_path(&session_id)).await {
            warn!("Failed to remove presence for {}: {}", session_id, e);
        }

        info!("Collaboration session ended: {}", session_id);
        Some(session_id)
    }

    /// Touch `lastSeen` on this session's record; false with no session
    pub async fn refresh_presence(&self) -> bool {
        let Some(session_id) = self.session_id() else {
            return false;
        };

        let mut fields = Map::new();
        fields.insert("lastSeen".to_string(), WriteTimestamp::sentinel());
        match self.store.update(&self.record_path(&session_id), fields).await {
            Ok(_) => {
                debug!("Presence refreshed for {}", session_id);
                true
            }
            Err(e) => {
                warn!("Failed to refresh presence for {}: {}", session_id, e);
                false
            }
        }
    }

    /// Remove every presence record not seen within the staleness window.
    ///
    /// Records without a `lastSeen` count as stale. All removals go out in a
    /// single batched update. Returns the removed session ids.
    pub async fn sweep_stale_presence(&self) -> SyncResult<Vec<SessionId>> {
        let cutoff = self.store.server_time() - self.config.stale_after.as_millis() as i64;

        let stale: Vec<SessionId> = self
            .presence_records()
            .await?
            .into_iter()
            .filter(|(_, record)| record.last_seen_ms().map_or(true, |seen| seen <= cutoff))
            .map(|(id, _)| id)
            .collect();

        if stale.is_empty() {
            return Ok(stale);
        }

        let removals: Map<String, Value> = stale
            .iter()
            .map(|id| (id.clone(), Value::Null))
            .collect();
        self.store.update(&self.config.presence_path, removals).await?;

        info!("Swept {} stale presence records", stale.len());
        Ok(stale)
    }

    /// One-shot list of records currently marked online
    pub async fn list_online_users(&self) -> SyncResult<Vec<OnlineUser>> {
        Ok(self
            .presence_records()
            .await?
            .into_iter()
            .filter(|(_, record)| record.online)
            .map(|(id, record)| OnlineUser {
                last_seen: record.last_seen_ms(),
                user_agent: record.user_agent,
                id,
            })
            .collect())
    }

    async fn presence_records(&self) -> SyncResult<Vec<(SessionId, PresenceRecord)>> {
        let Some(Value::Object(children)) = self.store.get(&self.config.presence_path).await?
        else {
            return Ok(Vec::new());
        };

        let mut records = Vec::with_capacity(children.len());
        for (id, value) in children {
            match serde_json::from_value::<PresenceRecord>(value) {
                Ok(record) => records.push((id, record)),
                Err(e) => {
                    // Unreadable records are treated as stale leftovers.
                    debug!("Unreadable presence record {}: {}", id, e);
                    records.push((
                        id,
                        PresenceRecord {
                            online: false,
                            last_seen: None,
                            user_agent: String::new(),
                        },
                    ));
                }
            }
        }
        Ok(records)
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop the background tasks
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Start background tasks (presence refresh loop, stale sweep loop)
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let manager = self.clone();
        let refresh_interval = manager.config.refresh_interval;

        // Refresh task
        let refresh_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresh_interval);
            let mut shutdown = manager.shutdown_receiver();
            // The first tick fires immediately; the record was just written.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        manager.refresh_presence().await;
                    }
                    _ = shutdown.recv() => {
                        info!("Presence refresh task shutting down");
                        break;
                    }
                }
            }
        });

        let manager = self.clone();
        let sweep_interval = manager.config.sweep_interval;

        // Sweep task
        let sweep_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            let mut shutdown = manager.shutdown_receiver();
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = manager.sweep_stale_presence().await {
                            warn!("Presence sweep failed: {}", e);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Presence sweep task shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            refresh_task: refresh_handle,
            sweep_task: sweep_handle,
        }
    }
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub refresh_task: tokio::task::JoinHandle<()>,
    pub sweep_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = tokio::join!(self.refresh_task, self.sweep_task);
    }
}

/// Session id: `user_<unix ms>_<random base36 suffix>`
pub fn generate_session_id() -> SessionId {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("user_{}_{}", chrono::Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn manager() -> (Arc<MemoryStore>, SessionManager) {
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(
            store.clone(),
            SessionConfig::default().with_user_agent("test-agent"),
        );
        (store, manager)
    }

    #[test]
    fn test_generate_session_id() {
        let id = generate_session_id();
        let parts: Vec<&str> = id.split('_').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "user");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), SUFFIX_LEN);
        assert_ne!(id, generate_session_id());
    }

    #[tokio::test]
    async fn test_start_session_writes_presence() {
        let (store, manager) = manager();
        let id = manager.start_session().await;

        let record = store.get(&format!("presence/{}", id)).await.unwrap().unwrap();
        assert_eq!(record["online"], json!(true));
        assert_eq!(record["userAgent"], json!("test-agent"));
        assert!(record["lastSeen"].is_i64());
    }

    #[tokio::test]
    async fn test_start_session_is_idempotent() {
        let (_store, manager) = manager();
        let first = manager.start_session().await;
        let second = manager.start_session().await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_end_session_removes_presence() {
        let (store, manager) = manager();
        let id = manager.start_session().await;

        assert_eq!(manager.end_session().await, Some(id));
        assert!(!manager.is_active());
        assert!(store.get("presence").await.unwrap().is_none());
        assert_eq!(manager.end_session().await, None);
    }

    #[tokio::test]
    async fn test_refresh_without_session_is_noop() {
        let (store, manager) = manager();
        assert!(!manager.refresh_presence().await);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_touches_last_seen() {
        let (store, manager) = manager();
        let id = manager.start_session().await;
        let path = format!("presence/{}/lastSeen", id);
        let before = store.get(&path).await.unwrap().unwrap().as_i64().unwrap();

        assert!(manager.refresh_presence().await);
        let after = store.get(&path).await.unwrap().unwrap().as_i64().unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_stale_records() {
        let (store, manager) = manager();
        let now = store.server_time();
        let six_minutes = 6 * 60 * 1000;

        store
            .set("presence/old", json!({ "online": true, "lastSeen": now - six_minutes, "userAgent": "a" }))
            .await
            .unwrap();
        store
            .set("presence/orphan", json!({ "lastSeen": null, "online": true }))
            .await
            .unwrap();
        store
            .set("presence/fresh", json!({ "online": true, "lastSeen": now - 60_000, "userAgent": "b" }))
            .await
            .unwrap();

        let mut removed = manager.sweep_stale_presence().await.unwrap();
        removed.sort();
        assert_eq!(removed, vec!["old".to_string(), "orphan".to_string()]);

        let remaining = store.get("presence").await.unwrap().unwrap();
        assert!(remaining.get("fresh").is_some());
        assert!(remaining.get("old").is_none());
    }

    #[tokio::test]
    async fn test_list_online_users() {
        let (store, manager) = manager();
        let id = manager.start_session().await;
        store
            .set("presence/away", json!({ "online": false, "lastSeen": 1, "userAgent": "x" }))
            .await
            .unwrap();

        let users = manager.list_online_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, id);
        assert_eq!(users[0].user_agent, "test-agent");
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_tasks_refresh_sweep_and_stop() {
        let (store, manager) = manager();
        let manager = Arc::new(manager);
        let id = manager.start_session().await;
        let path = format!("presence/{}/lastSeen", id);
        let first_seen = store.get(&path).await.unwrap().unwrap().as_i64().unwrap();
        let six_minutes_ago = store.server_time() - 6 * 60 * 1000;
        store
            .set("presence/old", json!({ "online": true, "lastSeen": six_minutes_ago }))
            .await
            .unwrap();

        let handles = manager.clone().start_background_tasks();

        // One refresh interval: lastSeen moves, the sweep has not run yet.
        tokio::time::sleep(Duration::from_secs(31)).await;
        let refreshed = store.get(&path).await.unwrap().unwrap().as_i64().unwrap();
        assert!(refreshed > first_seen);
        assert!(store.get("presence/old").await.unwrap().is_some());

        // Past the sweep interval: the stale record is gone, ours stays.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(store.get("presence/old").await.unwrap().is_none());
        assert!(store.get(&path).await.unwrap().is_some());

        manager.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handles.wait())
            .await
            .unwrap();
    }
}
