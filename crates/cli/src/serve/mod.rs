//! `payplan serve` -- HTTP JSON API over the operation service.
//!
//! Plans and runs live in a [`MemoryStorage`] for the life of the process.
//! Plan files named on the command line are loaded at startup.
//!
//! Endpoints:
//! - GET    /health
//! - POST   /plans                                  - createPlan
//! - GET    /plans/{plan_id}                        - getPlan
//! - POST   /plans/{plan_id}/validate               - validateExpression
//! - POST   /plans/{plan_id}/steps                  - createPlanStep
//! - PATCH  /steps/{step_id}                        - updatePlanStep
//! - DELETE /steps/{step_id}                        - deletePlanStep
//! - POST   /plans/{plan_id}/approve|lock|archive   - lifecycle
//! - POST   /plans/{plan_id}/runs                   - executePlanWithTape
//! - GET    /plans/{plan_id}/runs                   - listRuns
//! - GET    /plans/{plan_id}/runs/{run_id}/tape     - getCalculationTape
//! - GET    /runs/{run_id}/hash                     - getRunSnapshotHash
//! - POST   /runs/{run_id}/cancel                   - cancelRun
//! - POST   /plans/{plan_id}/verify                 - verifyReproducibility
//!
//! Every response is an envelope `{success, data, message, error?}` with
//! Content-Type: application/json.

mod handlers;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use axum::routing::{get, patch, post};
use axum::Router;
use payplan_eval::Plan;
use payplan_storage::MemoryStorage;
use tower_http::cors::{Any, CorsLayer};

use self::handlers::{
    handle_approve, handle_archive, handle_cancel, handle_create_plan, handle_create_step,
    handle_delete_step, handle_execute, handle_get_plan, handle_health, handle_list_runs,
    handle_lock, handle_not_found, handle_run_hash, handle_tape, handle_update_step,
    handle_validate, handle_verify,
};
use crate::config::Settings;
use crate::service::PlanService;

/// Maximum request body size: 10 MB.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

pub(crate) type AppState = Arc<PlanService<MemoryStorage>>;

/// Build the router over `state`.
pub(crate) fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/plans", post(handle_create_plan))
        .route("/plans/{plan_id}", get(handle_get_plan))
        .route("/plans/{plan_id}/validate", post(handle_validate))
        .route("/plans/{plan_id}/steps", post(handle_create_step))
        .route(
            "/steps/{step_id}",
            patch(handle_update_step).delete(handle_delete_step),
        )
        .route("/plans/{plan_id}/approve", post(handle_approve))
        .route("/plans/{plan_id}/lock", post(handle_lock))
        .route("/plans/{plan_id}/archive", post(handle_archive))
        .route(
            "/plans/{plan_id}/runs",
            post(handle_execute).get(handle_list_runs),
        )
        .route("/plans/{plan_id}/runs/{run_id}/tape", get(handle_tape))
        .route("/runs/{run_id}/hash", get(handle_run_hash))
        .route("/runs/{run_id}/cancel", post(handle_cancel))
        .route("/plans/{plan_id}/verify", post(handle_verify))
        .fallback(handle_not_found)
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Start the HTTP server on the given port, optionally pre-loading plans.
pub async fn start_server(
    port: u16,
    plan_paths: Vec<PathBuf>,
    settings: Settings,
) -> Result<(), Box<dyn std::error::Error>> {
    let state: AppState = Arc::new(PlanService::new(Arc::new(MemoryStorage::new()), settings));

    for path in &plan_paths {
        match preload(&state, path).await {
            Ok(plan_id) => tracing::info!(plan_id = %plan_id, path = %path.display(), "loaded plan"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to load plan"),
        }
    }

    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "payplan listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shut down");
    Ok(())
}

async fn preload(state: &AppState, path: &Path) -> Result<String, String> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("could not read: {e}"))?;
    let plan: Plan = serde_json::from_str(&text).map_err(|e| format!("could not parse: {e}"))?;
    let plan = state.import_plan(plan).await.map_err(|e| e.to_string())?;
    Ok(plan.id().to_string())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received shutdown signal"),
        Err(e) => {
            tracing::error!(error = %e, "cannot listen for Ctrl+C; running until killed");
            std::future::pending::<()>().await;
        }
    }
}
