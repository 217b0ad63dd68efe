//! Thin HTTP/WebSocket control-plane adapter (C10, spec §6).
//!
//! Explicitly not a product-logic owner: every handler here is a
//! translation from an HTTP request to a call against `orc-store` /
//! `orc-runtime` and back, the way the teacher's `factory::api`/`factory::ws`
//! pair is a translation layer over `factory::db`/`factory::pipeline`
//! rather than where pipeline logic lives.

mod error;
pub mod routes;
mod ws;
pub mod workflow;

use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use orc_runtime::bus::EventBus;
use orc_runtime::phase_runner::PhaseRunner;
use orc_runtime::supervisor::Supervisor;
use orc_runtime::task_executor::TaskExecutor;
use orc_store::Store;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

pub use error::ApiError;

/// Shared application state, handed to every route via axum's `State`
/// extractor. One `AppState` per open project (spec §6's control plane is
/// scoped to a single project at a time, same as the teacher's one
/// `AppState` per `factory` process).
pub struct AppState {
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub supervisor: Arc<Supervisor>,
    pub phase_runner: Arc<PhaseRunner>,
    /// Executors for tasks currently mid-run, keyed by task id, so
    /// `pause`/`rewind` handlers can reach the right cancellation token
    /// (spec §4.8: pause is per-task, cooperative, next-boundary).
    pub running: DashMap<Uuid, Arc<TaskExecutor>>,
    pub worktree_root: PathBuf,
    pub target_branch: String,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        supervisor: Arc<Supervisor>,
        phase_runner: Arc<PhaseRunner>,
        worktree_root: PathBuf,
        target_branch: impl Into<String>,
    ) -> Self {
        AppState {
            store,
            bus,
            supervisor,
            phase_runner,
            running: DashMap::new(),
            worktree_root,
            target_branch: target_branch.into(),
        }
    }
}

pub type SharedState = Arc<AppState>;

/// Builds the full router: REST routes plus `/ws`, with a permissive CORS
/// layer the way the teacher's dev-mode server applies one (spec §6 does
/// not call for origin restriction since this is a local loopback control
/// plane, not a hosted multi-tenant API).
pub fn build_router(state: SharedState) -> Router {
    routes::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
