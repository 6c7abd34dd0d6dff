//! Sync engine: push scheduling and remote update handling.
//!
//! The engine sits between the local seating plan and the remote store:
//! - local edits are pushed as whole documents after a debounce window,
//!   skipped when nothing changed since the last successful write
//! - incoming remote documents pass through a series of gates (self-echo,
//!   merge decision, cooldown, authority, staleness) before being imported
//! - while a remote update is being applied, the merge guard blocks pushes
//!   so the import does not bounce straight back to the store
//!
//! The merge guard is generation-counted: each application takes a new
//! generation, and a delayed release only clears the guard if that
//! generation still holds it.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::diagnostics::{EngineStatus, SyncReport};
use super::merge::{self, MergeKind};
use super::session::SessionManager;
use super::{SyncConfig, SyncError, SyncResult};
use crate::model::{LocalModel, SeatingDocument, SessionId, TableId};
use crate::storage::RemoteStore;

/// Callback invoked after a remote update has been imported
pub type MergeHook = Box<dyn Fn(&SeatingDocument) + Send + Sync>;

/// Why an incoming remote document was not considered at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No session is active
    Inactive,
    /// The path is empty or the document has no tables
    NoTables,
    /// The document carries no resolved `lastUpdated`
    NoTimestamp,
    /// The document was written by this session
    SelfEcho,
    /// The snapshot is not a seating document
    Unreadable,
}

/// What happened to one incoming remote document
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Ignored(IgnoreReason),
    /// Nothing differs from the local plan
    Unchanged,
    /// A remote update was applied too recently
    CoolingDown,
    /// Not newer than this client's last write
    Stale { incoming: i64, last_written: i64 },
    /// The local plan was replaced with the merged document
    Applied {
        kind: MergeKind,
        adopted: Vec<TableId>,
        authoritative: bool,
    },
    /// The local model rejected the merged document
    ImportFailed,
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MergeOutcome::Applied { .. })
    }
}

#[derive(Debug, Default)]
struct GuardState {
    generation: u64,
    holder: Option<u64>,
}

/// Blocks pushes while a remote update is being applied
#[derive(Debug, Default)]
struct MergeGuard {
    state: Mutex<GuardState>,
}

impl MergeGuard {
    /// Take the guard under a fresh generation
    fn acquire(&self) -> u64 {
        let mut state = self.state.lock();
        state.generation += 1;
        state.holder = Some(state.generation);
        state.generation
    }

    /// Clear the guard if `generation` still holds it
    fn release(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.holder == Some(generation) {
            state.holder = None;
            true
        } else {
            false
        }
    }

    fn is_held(&self) -> bool {
        self.state.lock().holder.is_some()
    }

    fn clear(&self) {
        self.state.lock().holder = None;
    }
}

#[derive(Default)]
struct EngineState {
    /// Serialized plan of the last successful push or applied merge
    last_written: Option<String>,
    /// Server timestamp of the last successful push or applied merge
    last_written_at: Option<i64>,
    /// When a remote update was last let through the cooldown gate
    last_applied: Option<Instant>,
    /// Debounced push waiting to fire
    pending_push: Option<JoinHandle<()>>,
}

/// Synchronizes one local model with the shared remote document
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn RemoteStore>,
    model: Arc<dyn LocalModel>,
    session: Arc<SessionManager>,
    state: Mutex<EngineState>,
    guard: Arc<MergeGuard>,
    subscription: Mutex<Option<JoinHandle<()>>>,
    hooks: RwLock<Vec<MergeHook>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        model: Arc<dyn LocalModel>,
        session: Arc<SessionManager>,
        config: SyncConfig,
    ) -> Self {
        Self {
            config,
            store,
            model,
            session,
            state: Mutex::new(EngineState::default()),
            guard: Arc::new(MergeGuard::default()),
            subscription: Mutex::new(None),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn is_collaborating(&self) -> bool {
        self.session.is_active()
    }

    pub fn is_merge_guard_held(&self) -> bool {
        self.guard.is_held()
    }

    /// Server timestamp of the last successful push or applied merge
    pub fn last_written_at(&self) -> Option<i64> {
        self.state.lock().last_written_at
    }

    /// Register a callback run after every applied remote update
    pub fn on_merged<F>(&self, hook: F)
    where
        F: Fn(&SeatingDocument) + Send + Sync + 'static,
    {
        self.hooks.write().push(Box::new(hook));
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Start a session, load the remote plan once and follow remote changes
    pub async fn start(self: &Arc<Self>) -> SyncResult<SessionId> {
        let session_id = self.session.start_session().await;

        if let Err(e) = self.load_once().await {
            error!("Initial load failed: {}", e);
        }
        self.subscribe()?;

        Ok(session_id)
    }

    /// Stop following remote changes and end the session
    pub async fn stop(&self) -> Option<SessionId> {
        self.stop_tasks();
        self.session.end_session().await
    }

    fn stop_tasks(&self) {
        if let Some(handle) = self.subscription.lock().take() {
            handle.abort();
        }
        self.cancel_pending_push();
    }

    fn cancel_pending_push(&self) {
        if let Some(handle) = self.state.lock().pending_push.take() {
            handle.abort();
        }
    }

    // ========================================================================
    // OUTBOUND
    // ========================================================================

    /// Schedule a debounced push after a local change to `state`.
    ///
    /// Cancels any push still waiting. Returns false when the push was
    /// suppressed: no session, merge guard held, identical to the last
    /// successful write, or no tables. When the timer fires, the plan is read
    /// from the local model again, so the write carries every table present
    /// at that moment, including tables adopted from a merge in between.
    pub fn schedule_push(self: &Arc<Self>, state: SeatingDocument) -> bool {
        if !self.session.is_active() {
            return false;
        }
        if self.guard.is_held() {
            debug!("Push suppressed while applying a remote update");
            return false;
        }

        let mut engine_state = self.state.lock();
        if let Some(pending) = engine_state.pending_push.take() {
            pending.abort();
        }

        let serialized = match serde_json::to_string(&state) {
            Ok(serialized) => serialized,
            Err(e) => {
                error!("Failed to encode plan: {}", e);
                return false;
            }
        };
        if engine_state.last_written.as_deref() == Some(serialized.as_str()) {
            trace!("Plan unchanged since last write");
            return false;
        }
        if !state.has_tables() {
            debug!("Not pushing a plan without tables");
            return false;
        }

        let engine = Arc::clone(self);
        let debounce = self.config.push_debounce;
        engine_state.pending_push = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            engine.push_current_state().await;
        }));
        true
    }

    /// Write whatever the local model holds now; used by the debounce timer
    async fn push_current_state(&self) {
        let current = self.model.get_state();
        if !current.has_tables() {
            debug!("Plan emptied before the scheduled push fired");
            return;
        }
        let serialized = match serde_json::to_string(&current) {
            Ok(serialized) => serialized,
            Err(e) => {
                error!("Failed to encode plan: {}", e);
                return;
            }
        };
        if let Err(e) = self.write_document(current, serialized).await {
            error!("Error saving plan to store: {}", e);
        }
    }

    /// Push the current plan immediately, bypassing debounce and no-op checks
    pub async fn force_push(&self) -> SyncResult<i64> {
        self.cancel_pending_push();
        let state = self.model.get_state();
        let serialized = serde_json::to_string(&state)?;
        self.write_document(state, serialized).await
    }

    /// Push the current plan marked as authoritative, so other clients adopt
    /// it regardless of their own write timestamps
    pub async fn force_push_authoritative(&self) -> SyncResult<i64> {
        self.cancel_pending_push();
        let state = self.model.get_state();
        let serialized = serde_json::to_string(&state)?;
        info!("Pushing authoritative plan with {} tables", state.table_count());
        self.write_document(state.with_authority(), serialized).await
    }

    async fn write_document(&self, document: SeatingDocument, serialized: String) -> SyncResult<i64> {
        let session_id = self.session.session_id().ok_or(SyncError::NoSession)?;
        let table_count = document.table_count();
        let value = serde_json::to_value(document.stamped(&session_id))?;

        let written_at = self.store.set(&self.config.document_path, value).await?;

        let mut state = self.state.lock();
        state.last_written = Some(serialized);
        state.last_written_at = Some(written_at);
        info!("Saved plan with {} tables at {}", table_count, written_at);
        Ok(written_at)
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    /// Read the remote document once and import it wholesale.
    ///
    /// Returns false when there is no session or the remote document is
    /// missing, unreadable or has no tables; the local plan is kept then.
    pub async fn load_once(&self) -> SyncResult<bool> {
        if !self.session.is_active() {
            return Ok(false);
        }

        let Some(value) = self.store.get(&self.config.document_path).await? else {
            info!("No remote plan yet, keeping local state");
            return Ok(false);
        };
        let remote: SeatingDocument = match serde_json::from_value(value) {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Ignoring unreadable remote plan: {}", e);
                return Ok(false);
            }
        };
        if !remote.has_tables() {
            info!("Remote plan has no tables, keeping local state");
            return Ok(false);
        }

        let plan = remote.stripped();
        self.model.import_state(&serde_json::to_string(&plan)?)?;
        info!("Loaded {} tables from store", plan.table_count());
        Ok(true)
    }

    /// Replace the local plan with the remote one, dropping any pending push
    pub async fn reload_from_remote(&self) -> SyncResult<bool> {
        if !self.session.is_active() {
            return Err(SyncError::NoSession);
        }
        self.cancel_pending_push();

        let loaded = self.load_once().await?;
        if loaded {
            let serialized = serde_json::to_string(&self.model.get_state())?;
            self.state.lock().last_written = Some(serialized);
        }
        Ok(loaded)
    }

    /// Delete the shared plan and every presence record, then end the session
    pub async fn reset_remote(&self) -> SyncResult<()> {
        if !self.session.is_active() {
            return Err(SyncError::NoSession);
        }
        self.stop_tasks();

        self.store.remove(&self.config.document_path).await?;
        self.store.remove(self.session.presence_path()).await?;
        self.session.end_session().await;

        *self.state.lock() = EngineState::default();
        self.guard.clear();
        warn!("Remote plan and presence records cleared");
        Ok(())
    }

    /// Follow the remote document, replacing any previous subscription
    pub fn subscribe(self: &Arc<Self>) -> SyncResult<()> {
        let mut subscription = self.store.subscribe(&self.config.document_path)?;
        let engine: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            while let Some(snapshot) = subscription.next().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                let outcome = engine.handle_snapshot(snapshot);
                trace!("Remote snapshot processed: {:?}", outcome);
            }
            debug!("Subscription to {} ended", subscription.path());
        });

        if let Some(previous) = self.subscription.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Decode a raw snapshot and run it through `on_remote_change`
    pub fn handle_snapshot(&self, snapshot: Option<Value>) -> MergeOutcome {
        let Some(value) = snapshot else {
            return MergeOutcome::Ignored(IgnoreReason::NoTables);
        };
        match serde_json::from_value::<SeatingDocument>(value) {
            Ok(remote) => self.on_remote_change(remote),
            Err(e) => {
                warn!("Ignoring unreadable remote snapshot: {}", e);
                MergeOutcome::Ignored(IgnoreReason::Unreadable)
            }
        }
    }

    /// Decide whether to apply an incoming remote document, and apply it.
    ///
    /// Must be called from within a Tokio runtime; the merge guard release is
    /// scheduled as a task.
    pub fn on_remote_change(&self, remote: SeatingDocument) -> MergeOutcome {
        let Some(session_id) = self.session.session_id() else {
            return MergeOutcome::Ignored(IgnoreReason::Inactive);
        };
        if !remote.has_tables() {
            return MergeOutcome::Ignored(IgnoreReason::NoTables);
        }
        let Some(incoming) = remote.last_updated_ms() else {
            return MergeOutcome::Ignored(IgnoreReason::NoTimestamp);
        };
        if remote.updated_by.as_deref() == Some(session_id.as_str()) {
            trace!("Ignoring own write");
            return MergeOutcome::Ignored(IgnoreReason::SelfEcho);
        }

        let local = self.model.get_state();
        let Some(mut plan) = merge::plan_merge(&local, &remote) else {
            debug!("No meaningful changes in remote plan");
            return MergeOutcome::Unchanged;
        };

        let authoritative = remote.is_authoritative();
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            if let Some(last) = state.last_applied {
                if now.duration_since(last) <= self.config.merge_cooldown {
                    debug!("Remote update skipped, previous one applied too recently");
                    return MergeOutcome::CoolingDown;
                }
            }
            state.last_applied = Some(now);

            if authoritative {
                info!(
                    "Authoritative plan from {}, adopting all {} tables",
                    remote.updated_by.as_deref().unwrap_or("unknown"),
                    remote.table_count()
                );
                plan.merged.tables = remote.tables.clone();
            } else if let Some(last_written) = state.last_written_at {
                if incoming <= last_written {
                    debug!(
                        "Remote plan at {} is not newer than our write at {}",
                        incoming, last_written
                    );
                    return MergeOutcome::Stale {
                        incoming,
                        last_written,
                    };
                }
            }
        }

        let merged = plan.merged.stripped();
        let serialized = match serde_json::to_string(&merged) {
            Ok(serialized) => serialized,
            Err(e) => {
                error!("Failed to encode merged plan: {}", e);
                return MergeOutcome::ImportFailed;
            }
        };

        let generation = self.guard.acquire();
        let outcome = match self.model.import_state(&serialized) {
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    state.last_written = Some(serialized);
                    state.last_written_at = Some(
                        state
                            .last_written_at
                            .map_or(incoming, |last| last.max(incoming)),
                    );
                }
                for hook in self.hooks.read().iter() {
                    hook(&merged);
                }
                info!(
                    "Applied remote plan from {} ({} tables adopted)",
                    remote.updated_by.as_deref().unwrap_or("unknown"),
                    plan.adopted.len()
                );
                MergeOutcome::Applied {
                    kind: plan.kind,
                    adopted: plan.adopted,
                    authoritative,
                }
            }
            Err(e) => {
                error!("Error applying remote plan: {}", e);
                MergeOutcome::ImportFailed
            }
        };

        self.schedule_guard_release(generation);
        outcome
    }

    fn schedule_guard_release(&self, generation: u64) {
        let guard = Arc::clone(&self.guard);
        let delay = self.config.guard_release;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !guard.release(generation) {
                trace!("Merge guard generation {} superseded", generation);
            }
        });
    }

    // ========================================================================
    // DIAGNOSTICS
    // ========================================================================

    /// Compare the local plan with the remote document, table by table
    pub async fn diagnose(&self) -> SyncResult<SyncReport> {
        let remote = match self.store.get(&self.config.document_path).await? {
            Some(value) => match serde_json::from_value::<SeatingDocument>(value) {
                Ok(remote) => Some(remote),
                Err(e) => {
                    warn!("Remote plan unreadable during diagnosis: {}", e);
                    None
                }
            },
            None => None,
        };
        let local = self.model.get_state();

        let status = {
            let state = self.state.lock();
            EngineStatus {
                session_id: self.session.session_id(),
                collaborating: self.session.is_active(),
                merge_guard_held: self.guard.is_held(),
                has_last_written: state.last_written.is_some(),
                last_written_at: state.last_written_at,
                push_pending: state
                    .pending_push
                    .as_ref()
                    .map_or(false, |handle| !handle.is_finished()),
            }
        };

        Ok(SyncReport::build(status, &local, remote.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelError, ModelResult, SeatingPlan, Table, WriteTimestamp};
    use crate::storage::MemoryStore;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        plan: Arc<SeatingPlan>,
        engine: Arc<SyncEngine>,
    }

    fn harness_on(store: Arc<MemoryStore>, config: SyncConfig) -> Harness {
        let plan = Arc::new(SeatingPlan::new());
        let session = Arc::new(SessionManager::with_store(store.clone()));
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            plan.clone(),
            session,
            config,
        ));
        Harness { store, plan, engine }
    }

    async fn started(config: SyncConfig) -> Harness {
        let harness = harness_on(Arc::new(MemoryStore::new()), config);
        harness.engine.session().start_session().await;
        harness
    }

    fn remote(by: &str, at: i64, tables: &[(&str, &str)]) -> SeatingDocument {
        let tables: BTreeMap<TableId, Table> = tables
            .iter()
            .map(|(id, name)| (id.to_string(), Table::new(*name, 4, 0.0, 0.0)))
            .collect();
        let mut doc = SeatingDocument::new(tables);
        doc.last_updated = Some(WriteTimestamp::At(at));
        doc.updated_by = Some(by.to_string());
        doc
    }

    async fn remote_plan(store: &MemoryStore) -> Option<SeatingDocument> {
        store
            .get("seatingPlan")
            .await
            .unwrap()
            .map(|value| serde_json::from_value(value).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_waits_for_debounce() {
        let h = started(SyncConfig::default()).await;
        h.plan.add_table("t1", "Table 1", 4, 0.0, 0.0).unwrap();

        assert!(h.engine.schedule_push(h.plan.get_state()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(remote_plan(&h.store).await.is_none());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let pushed = remote_plan(&h.store).await.unwrap();
        assert_eq!(pushed.table_count(), 1);
        assert_eq!(pushed.updated_by, h.engine.session().session_id());
        assert!(pushed.last_updated_ms().is_some());
        assert!(h.engine.last_written_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_edits_collapse_into_last_state() {
        let h = started(SyncConfig::default()).await;
        let writes_before = h.store.write_count();

        h.plan.add_table("t1", "Table 1", 4, 0.0, 0.0).unwrap();
        h.engine.schedule_push(h.plan.get_state());
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.plan.add_table("t2", "Table 2", 4, 0.0, 0.0).unwrap();
        h.engine.schedule_push(h.plan.get_state());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.store.write_count() - writes_before, 1);
        assert_eq!(remote_plan(&h.store).await.unwrap().table_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_carries_tables_merged_during_debounce() {
        let h = started(SyncConfig::default()).await;
        h.plan.add_table("t1", "A", 4, 0.0, 0.0).unwrap();
        assert!(h.engine.schedule_push(h.plan.get_state()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let outcome = h.engine.on_remote_change(remote(
            "user_other",
            1,
            &[("t1", "A"), ("t2", "B"), ("t3", "C")],
        ));
        assert!(outcome.is_applied());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let pushed = remote_plan(&h.store).await.unwrap();
        assert_eq!(pushed.table_count(), 3);
        assert_eq!(pushed.updated_by, h.engine.session().session_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_skipped_when_plan_emptied_before_timer() {
        let h = started(SyncConfig::default()).await;
        h.plan.add_table("t1", "A", 4, 0.0, 0.0).unwrap();
        assert!(h.engine.schedule_push(h.plan.get_state()));

        h.plan.remove_table("t1").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(remote_plan(&h.store).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_state_is_not_pushed_twice() {
        let h = started(SyncConfig::default()).await;
        h.plan.add_table("t1", "Table 1", 4, 0.0, 0.0).unwrap();

        assert!(h.engine.schedule_push(h.plan.get_state()));
        tokio::time::sleep(Duration::from_millis(400)).await;
        let writes = h.store.write_count();

        assert!(!h.engine.schedule_push(h.plan.get_state()));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.store.write_count(), writes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_plan_is_never_pushed() {
        let h = started(SyncConfig::default()).await;
        assert!(!h.engine.schedule_push(h.plan.get_state()));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(remote_plan(&h.store).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_requires_session() {
        let h = harness_on(Arc::new(MemoryStore::new()), SyncConfig::default());
        h.plan.add_table("t1", "Table 1", 4, 0.0, 0.0).unwrap();

        assert!(!h.engine.schedule_push(h.plan.get_state()));
        assert!(matches!(
            h.engine.force_push().await,
            Err(SyncError::NoSession)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_write_is_ignored() {
        let h = started(SyncConfig::default()).await;
        let id = h.engine.session().session_id().unwrap();

        let outcome = h.engine.on_remote_change(remote(&id, 1, &[("t1", "A")]));
        assert_eq!(outcome, MergeOutcome::Ignored(IgnoreReason::SelfEcho));
        assert!(h.plan.table("t1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_document_without_tables_or_timestamp_is_ignored() {
        let h = started(SyncConfig::default()).await;

        let empty = remote("user_other", 1, &[]);
        assert_eq!(
            h.engine.on_remote_change(empty),
            MergeOutcome::Ignored(IgnoreReason::NoTables)
        );

        let mut untimed = remote("user_other", 1, &[("t1", "A")]);
        untimed.last_updated = None;
        assert_eq!(
            h.engine.on_remote_change(untimed),
            MergeOutcome::Ignored(IgnoreReason::NoTimestamp)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_change_replaces_local_tables() {
        let h = started(SyncConfig::default()).await;
        h.plan.add_table("t1", "A", 4, 0.0, 0.0).unwrap();
        h.plan.add_table("t2", "B", 4, 0.0, 0.0).unwrap();

        let outcome = h.engine.on_remote_change(remote(
            "user_other",
            1,
            &[("t1", "A"), ("t3", "C"), ("t4", "D")],
        ));

        assert!(outcome.is_applied());
        let ids: Vec<TableId> = h.plan.get_state().tables.into_keys().collect();
        assert_eq!(ids, vec!["t1", "t3", "t4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_update_within_cooldown_is_dropped() {
        let h = started(SyncConfig::default()).await;

        assert!(h
            .engine
            .on_remote_change(remote("user_other", 1, &[("t1", "A")]))
            .is_applied());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            h.engine
                .on_remote_change(remote("user_other", 2, &[("t1", "A"), ("t2", "B")])),
            MergeOutcome::CoolingDown
        );
        assert_eq!(h.plan.get_state().table_count(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(h
            .engine
            .on_remote_change(remote("user_other", 3, &[("t1", "A"), ("t2", "B")]))
            .is_applied());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_update_dropped_unless_authoritative() {
        let h = started(SyncConfig::default()).await;
        h.plan.add_table("t1", "A", 4, 0.0, 0.0).unwrap();
        let written_at = h.engine.force_push().await.unwrap();

        let older = remote("user_other", written_at - 1, &[("t1", "A"), ("t2", "B")]);
        assert_eq!(
            h.engine.on_remote_change(older.clone()),
            MergeOutcome::Stale {
                incoming: written_at - 1,
                last_written: written_at
            }
        );

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let outcome = h.engine.on_remote_change(older.with_authority());
        assert!(matches!(
            outcome,
            MergeOutcome::Applied {
                authoritative: true,
                ..
            }
        ));
        assert_eq!(h.plan.get_state().table_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authoritative_document_replaces_all_tables() {
        let h = started(SyncConfig::default()).await;
        h.plan.add_table("t1", "A", 4, 0.0, 0.0).unwrap();
        h.plan.add_table("t2", "B", 4, 0.0, 0.0).unwrap();

        let mut forced = remote("user_other", 1, &[("t1", "A"), ("t3", "C")]);
        forced.force_correct = Some(true);
        forced.priority = Some(crate::model::FORCE_CORRECT_PRIORITY);

        assert!(h.engine.on_remote_change(forced).is_applied());
        let ids: Vec<TableId> = h.plan.get_state().tables.into_keys().collect();
        assert_eq!(ids, vec!["t1", "t3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mistyped_authority_markers_merge_as_ordinary() {
        let h = started(SyncConfig::default()).await;
        let snapshot = serde_json::json!({
            "tables": { "t1": { "name": "A", "seatCount": 4 } },
            "lastUpdated": 1,
            "updatedBy": "user_other",
            "bulletproof": "true",
            "priority": "999999999"
        });

        let outcome = h.engine.handle_snapshot(Some(snapshot));
        assert!(matches!(
            outcome,
            MergeOutcome::Applied {
                authoritative: false,
                ..
            }
        ));
        assert!(h.plan.table("t1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_blocks_push_until_released() {
        let h = started(SyncConfig::default()).await;
        let outcome = h
            .engine
            .on_remote_change(remote("user_other", 1, &[("t1", "A")]));
        assert!(outcome.is_applied());
        assert!(h.engine.is_merge_guard_held());

        h.plan.add_table("t2", "B", 4, 0.0, 0.0).unwrap();
        assert!(!h.engine.schedule_push(h.plan.get_state()));

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(!h.engine.is_merge_guard_held());
        assert!(h.engine.schedule_push(h.plan.get_state()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_release_keeps_guard() {
        let config = SyncConfig::default().with_guard_release(Duration::from_millis(2000));
        let h = started(config).await;

        assert!(h
            .engine
            .on_remote_change(remote("user_other", 1, &[("t1", "A")]))
            .is_applied());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(h
            .engine
            .on_remote_change(remote("user_other", 2, &[("t1", "A"), ("t2", "B")]))
            .is_applied());

        // The first release fires at 2000ms but no longer owns the guard.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(h.engine.is_merge_guard_held());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!h.engine.is_merge_guard_held());
    }

    struct RejectingModel;

    impl LocalModel for RejectingModel {
        fn get_state(&self) -> SeatingDocument {
            SeatingDocument::default()
        }

        fn import_state(&self, _json: &str) -> ModelResult<()> {
            Err(ModelError::TableNotFound("t1".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_import_failure_still_releases_guard() {
        let store = Arc::new(MemoryStore::new());
        let session = Arc::new(SessionManager::with_store(store.clone()));
        session.start_session().await;
        let engine = SyncEngine::new(
            store,
            Arc::new(RejectingModel),
            session,
            SyncConfig::default(),
        );

        let outcome = engine.on_remote_change(remote("user_other", 1, &[("t1", "A")]));
        assert_eq!(outcome, MergeOutcome::ImportFailed);
        assert!(engine.is_merge_guard_held());

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(!engine.is_merge_guard_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_hooks_receive_applied_plan() {
        let h = started(SyncConfig::default()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        h.engine.on_merged(move |doc| {
            assert_eq!(doc.table_count(), 1);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        h.engine
            .on_remote_change(remote("user_other", 1, &[("t1", "A")]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_once_imports_without_metadata() {
        let h = started(SyncConfig::default()).await;
        let mut doc = remote("user_other", 1, &[("t1", "A")]).with_authority();
        doc.extra
            .insert("debugMarker".to_string(), serde_json::json!("x"));
        h.store
            .set("seatingPlan", serde_json::to_value(&doc).unwrap())
            .await
            .unwrap();

        assert!(h.engine.load_once().await.unwrap());
        let local = h.plan.get_state();
        assert_eq!(local.table_count(), 1);
        assert!(local.priority.is_none());
        assert!(local.extra.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_once_keeps_local_when_remote_empty() {
        let h = started(SyncConfig::default()).await;
        h.plan.add_table("t1", "A", 4, 0.0, 0.0).unwrap();

        assert!(!h.engine.load_once().await.unwrap());
        assert_eq!(h.plan.get_state().table_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_clients_converge() {
        let store = Arc::new(MemoryStore::new());
        let alice = harness_on(store.clone(), SyncConfig::default());
        let bob = harness_on(store.clone(), SyncConfig::default());
        tokio_test::assert_ok!(alice.engine.start().await);
        tokio_test::assert_ok!(bob.engine.start().await);

        alice.plan.add_table("t1", "Head table", 8, 0.0, 0.0).unwrap();
        alice.plan.add_guest("Alice").unwrap();
        alice.plan.seat_guest("t1", 0, "Alice").unwrap();
        alice.engine.schedule_push(alice.plan.get_state());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let table = bob.plan.table("t1").unwrap();
        assert_eq!(table.name, "Head table");
        assert_eq!(table.sorted_guests(), vec!["Alice"]);
        // Alice's own echo leaves her plan untouched.
        assert!(!alice.engine.is_merge_guard_held());
        assert!(bob.engine.is_merge_guard_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_session() {
        let h = harness_on(Arc::new(MemoryStore::new()), SyncConfig::default());
        let id = h.engine.start().await.unwrap();

        assert_eq!(h.engine.stop().await, Some(id));
        assert!(!h.engine.is_collaborating());
        assert!(h.store.get("presence").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_remote_clears_everything() {
        let h = started(SyncConfig::default()).await;
        h.store
            .set("presence/user_other", serde_json::json!({ "online": true }))
            .await
            .unwrap();
        h.plan.add_table("t1", "A", 4, 0.0, 0.0).unwrap();
        h.engine.force_push().await.unwrap();

        h.engine.reset_remote().await.unwrap();
        assert!(remote_plan(&h.store).await.is_none());
        assert!(h.store.get("presence").await.unwrap().is_none());
        assert!(!h.engine.is_collaborating());
        assert!(h.engine.last_written_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_from_remote_replaces_local() {
        let h = started(SyncConfig::default()).await;
        h.plan.add_table("local", "Mine", 4, 0.0, 0.0).unwrap();
        let doc = remote("user_other", 1, &[("t1", "A"), ("t2", "B")]);
        h.store
            .set("seatingPlan", serde_json::to_value(&doc).unwrap())
            .await
            .unwrap();

        assert!(h.engine.reload_from_remote().await.unwrap());
        let ids: Vec<TableId> = h.plan.get_state().tables.into_keys().collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        // The reloaded plan is not echoed back.
        assert!(!h.engine.schedule_push(h.plan.get_state()));
    }
}
