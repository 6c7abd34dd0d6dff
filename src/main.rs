//! Seating Sync - headless seating-plan collaborator
//!
//! Runs one collaborating client against the shared plan:
//! - Sled-backed realtime document store
//! - Debounced pushes and heuristic merges of remote changes
//! - Presence refresh and stale-record sweeping
//! - Axum control surface for editing the plan and inspecting sync state

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use seating_sync::config::AppConfig;
use seating_sync::model::{LocalModel, ModelError, SeatingDocument, SeatingPlan, Table};
use seating_sync::storage::DocumentStore;
use seating_sync::sync::{
    OnlineUser, SessionManager, SyncEngine, SyncError, SyncReport,
};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Local seating plan
    plan: Arc<SeatingPlan>,
    /// Sync engine for the plan
    engine: Arc<SyncEngine>,
    /// Session and presence owner
    session: Arc<SessionManager>,
    /// Server start time
    started_at: std::time::Instant,
}

impl AppState {
    /// Queue a push of the current plan after an edit
    fn push_current(&self) -> bool {
        self.engine.schedule_push(self.plan.get_state())
    }
}

// ============================================================================
// REQUEST/RESPONSE TYPES
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    session_id: Option<String>,
    collaborating: bool,
    uptime_seconds: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanResponse {
    plan: SeatingDocument,
    unassigned: Vec<String>,
    guest_count: usize,
    seat_total: usize,
}

#[derive(Deserialize)]
struct SeatRequest {
    guest: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SeatResponse {
    /// Guest that previously sat there, if any
    displaced: Option<String>,
    push_scheduled: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTableRequest {
    id: Option<String>,
    name: String,
    seat_count: usize,
    #[serde(default)]
    left: f64,
    #[serde(default)]
    top: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTableResponse {
    id: String,
    table: Table,
    push_scheduled: bool,
}

#[derive(Deserialize, Default)]
struct ForceSyncRequest {
    #[serde(default)]
    authoritative: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ForceSyncResponse {
    written_at: i64,
    authoritative: bool,
}

#[derive(Serialize)]
struct ReloadResponse {
    loaded: bool,
}

#[derive(Serialize)]
struct PresenceResponse {
    users: Vec<OnlineUser>,
    total: usize,
}

type ApiError = (StatusCode, String);

fn model_error(e: ModelError) -> ApiError {
    let status = match &e {
        ModelError::TableNotFound(_) => StatusCode::NOT_FOUND,
        ModelError::TableExists(_) => StatusCode::CONFLICT,
        ModelError::SeatOutOfRange { .. } | ModelError::EmptyGuestName => {
            StatusCode::BAD_REQUEST
        }
        ModelError::InvalidState(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn sync_error(e: SyncError) -> ApiError {
    let status = match &e {
        SyncError::NoSession => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error!("Sync request failed: {}", e);
    (status, e.to_string())
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        session_id: state.session.session_id(),
        collaborating: state.engine.is_collaborating(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Current local plan
async fn get_plan(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(PlanResponse {
        plan: state.plan.get_state(),
        unassigned: state.plan.unassigned_guests(),
        guest_count: state.plan.guest_count(),
        seat_total: state.plan.seat_total(),
    })
}

/// Seat a guest, or clear the seat when `guest` is null
async fn set_seat(
    State(state): State<Arc<AppState>>,
    Path((table_id, seat)): Path<(String, usize)>,
    Json(payload): Json<SeatRequest>,
) -> Result<Json<SeatResponse>, ApiError> {
    let displaced = match payload.guest {
        Some(guest) => state
            .plan
            .seat_guest(&table_id, seat, &guest)
            .map_err(model_error)?,
        None => state.plan.unseat(&table_id, seat).map_err(model_error)?,
    };

    Ok(Json(SeatResponse {
        displaced,
        push_scheduled: state.push_current(),
    }))
}

/// Add a table
async fn create_table(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateTableRequest>,
) -> Result<Json<CreateTableResponse>, ApiError> {
    let id = payload
        .id
        .unwrap_or_else(|| format!("table_{}", chrono::Utc::now().timestamp_millis()));

    state
        .plan
        .add_table(&id, &payload.name, payload.seat_count, payload.left, payload.top)
        .map_err(model_error)?;
    let table = state.plan.table(&id).ok_or_else(|| {
        model_error(ModelError::TableNotFound(id.clone()))
    })?;

    info!("Created table {} ({})", table.name, id);

    Ok(Json(CreateTableResponse {
        id,
        table,
        push_scheduled: state.push_current(),
    }))
}

/// Sessions currently marked online
async fn list_presence(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PresenceResponse>, ApiError> {
    let users = state.session.list_online_users().await.map_err(sync_error)?;
    let total = users.len();
    Ok(Json(PresenceResponse { users, total }))
}

/// Local versus remote comparison
async fn diagnostics(State(state): State<Arc<AppState>>) -> Result<Json<SyncReport>, ApiError> {
    state.engine.diagnose().await.map(Json).map_err(sync_error)
}

/// Push the local plan right away
async fn force_sync(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<ForceSyncRequest>>,
) -> Result<Json<ForceSyncResponse>, ApiError> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();

    let written_at = if request.authoritative {
        state.engine.force_push_authoritative().await
    } else {
        state.engine.force_push().await
    }
    .map_err(sync_error)?;

    Ok(Json(ForceSyncResponse {
        written_at,
        authoritative: request.authoritative,
    }))
}

/// Replace the local plan with the remote one
async fn reload(State(state): State<Arc<AppState>>) -> Result<Json<ReloadResponse>, ApiError> {
    let loaded = state.engine.reload_from_remote().await.map_err(sync_error)?;
    Ok(Json(ReloadResponse { loaded }))
}

// ============================================================================
// MAIN
// ============================================================================

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seating_sync=info,tower_http=info".into()),
        )
        .init();

    let config = AppConfig::from_env();

    // Initialize storage
    info!("Initializing storage at: {}", config.storage_path);
    let store = Arc::new(
        DocumentStore::open(config.storage()).context("Failed to open storage")?,
    );
    info!("Storage initialized successfully");

    // Wire the plan, session and engine together
    let plan = Arc::new(SeatingPlan::new());
    let session = Arc::new(SessionManager::new(store.clone(), config.session()));
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        plan.clone(),
        session.clone(),
        config.sync(),
    ));
    engine.on_merged(|doc| info!("Plan refreshed from remote: {} tables", doc.table_count()));

    let session_id = engine.start().await.context("Failed to start sync")?;
    let background_handles = session.clone().start_background_tasks();

    let state = Arc::new(AppState {
        plan,
        engine: engine.clone(),
        session: session.clone(),
        started_at: std::time::Instant::now(),
    });

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/plan", get(get_plan))
        .route("/api/tables", post(create_table))
        .route("/api/tables/:table_id/seats/:seat", put(set_seat))
        .route("/api/presence", get(list_presence))
        .route("/api/diagnostics", get(diagnostics))
        .route("/api/sync/force", post(force_sync))
        .route("/api/sync/reload", post(reload))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("Seating sync v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Session: {}", session_id);
    info!("   Listening on: http://{}", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Leave the session cleanly so other clients stop counting us
    engine.stop().await;
    session.shutdown();
    background_handles.wait().await;
    store.flush()?;

    info!("Seating sync stopped");
    Ok(())
}
