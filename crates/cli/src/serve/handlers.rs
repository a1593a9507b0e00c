//! HTTP route handlers. Each one unpacks the request, calls the service,
//! and wraps the result in an envelope with the matching status code.

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use payplan_eval::{NewStep, Plan, StepPatch};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::service::{
    Envelope, ExecuteRequest, LockRequest, NotesRequest, ServiceError, ValidateRequest,
    VerifyRequest,
};

#[derive(Debug, Deserialize)]
pub(crate) struct TapeQuery {
    employee_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListRunsQuery {
    #[serde(default)]
    limit: usize,
}

fn respond<T: Serialize>(
    result: Result<T, ServiceError>,
    ok_status: StatusCode,
    message: &str,
) -> Response {
    let status = match &result {
        Ok(_) => ok_status,
        Err(e) => StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    };
    (status, Json(Envelope::from_result(result, message))).into_response()
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ServiceError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| ServiceError::BadRequest(e.body_text()))
}

/// A JSON body that may be omitted entirely.
fn optional_body<T: DeserializeOwned + Default>(bytes: &Bytes) -> Result<T, ServiceError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes)
        .map_err(|e| ServiceError::BadRequest(format!("invalid request body: {e}")))
}

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> Response {
    respond::<()>(
        Err(ServiceError::NotFound("no such endpoint".to_string())),
        StatusCode::OK,
        "",
    )
}

/// GET /health
pub(crate) async fn handle_health(State(svc): State<AppState>) -> impl IntoResponse {
    let settings = svc.settings();
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "precision_modes": settings.precision_names(),
        "default_mode": settings.default_mode,
    });
    (StatusCode::OK, Json(response))
}

// ── Plans ─────────────────────────────────────────────────────────────────────

/// POST /plans
pub(crate) async fn handle_create_plan(
    State(svc): State<AppState>,
    payload: Result<Json<Plan>, JsonRejection>,
) -> Response {
    let result = match body(payload) {
        Ok(plan) => svc.create_plan(plan).await,
        Err(e) => Err(e),
    };
    respond(result, StatusCode::CREATED, "plan created")
}

/// GET /plans/{plan_id}
pub(crate) async fn handle_get_plan(
    State(svc): State<AppState>,
    Path(plan_id): Path<String>,
) -> Response {
    respond(svc.get_plan(&plan_id).await, StatusCode::OK, "plan")
}

/// POST /plans/{plan_id}/validate
pub(crate) async fn handle_validate(
    State(svc): State<AppState>,
    Path(plan_id): Path<String>,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> Response {
    let result = match body(payload) {
        Ok(req) => svc.validate_expression(&plan_id, req).await,
        Err(e) => Err(e),
    };
    let message = match &result {
        Ok(r) if r.valid => "expression is valid",
        _ => "expression is invalid",
    };
    respond(result, StatusCode::OK, message)
}

/// POST /plans/{plan_id}/steps
pub(crate) async fn handle_create_step(
    State(svc): State<AppState>,
    Path(plan_id): Path<String>,
    payload: Result<Json<NewStep>, JsonRejection>,
) -> Response {
    let result = match body(payload) {
        Ok(new) => svc.create_plan_step(&plan_id, new).await,
        Err(e) => Err(e),
    };
    respond(result, StatusCode::CREATED, "step created")
}

/// PATCH /steps/{step_id}
pub(crate) async fn handle_update_step(
    State(svc): State<AppState>,
    Path(step_id): Path<String>,
    payload: Result<Json<StepPatch>, JsonRejection>,
) -> Response {
    let result = match body(payload) {
        Ok(patch) => svc.update_plan_step(&step_id, patch).await,
        Err(e) => Err(e),
    };
    respond(result, StatusCode::OK, "step updated")
}

/// DELETE /steps/{step_id}
pub(crate) async fn handle_delete_step(
    State(svc): State<AppState>,
    Path(step_id): Path<String>,
) -> Response {
    respond(
        svc.delete_plan_step(&step_id).await,
        StatusCode::OK,
        "step deleted",
    )
}

/// POST /plans/{plan_id}/approve
pub(crate) async fn handle_approve(
    State(svc): State<AppState>,
    Path(plan_id): Path<String>,
    bytes: Bytes,
) -> Response {
    let result = match optional_body::<NotesRequest>(&bytes) {
        Ok(req) => svc.approve_plan(&plan_id, req).await,
        Err(e) => Err(e),
    };
    respond(result, StatusCode::OK, "plan approved")
}

/// POST /plans/{plan_id}/lock
pub(crate) async fn handle_lock(
    State(svc): State<AppState>,
    Path(plan_id): Path<String>,
    bytes: Bytes,
) -> Response {
    let result = match optional_body::<LockRequest>(&bytes) {
        Ok(req) => svc.lock_plan(&plan_id, req).await,
        Err(e) => Err(e),
    };
    respond(result, StatusCode::OK, "plan locked")
}

/// POST /plans/{plan_id}/archive
pub(crate) async fn handle_archive(
    State(svc): State<AppState>,
    Path(plan_id): Path<String>,
    bytes: Bytes,
) -> Response {
    let result = match optional_body::<NotesRequest>(&bytes) {
        Ok(req) => svc.archive_plan(&plan_id, req).await,
        Err(e) => Err(e),
    };
    respond(result, StatusCode::OK, "plan archived")
}

// ── Runs ──────────────────────────────────────────────────────────────────────

/// POST /plans/{plan_id}/runs
pub(crate) async fn handle_execute(
    State(svc): State<AppState>,
    Path(plan_id): Path<String>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let result = match body(payload) {
        Ok(req) => svc.execute_plan_with_tape(&plan_id, req).await,
        Err(e) => Err(e),
    };
    let message = match &result {
        Ok(summary) => format!("run {} {}", summary.run_id, summary.status),
        Err(_) => String::new(),
    };
    respond(result, StatusCode::CREATED, &message)
}

/// GET /plans/{plan_id}/runs?limit=
pub(crate) async fn handle_list_runs(
    State(svc): State<AppState>,
    Path(plan_id): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> Response {
    respond(
        svc.list_runs(&plan_id, query.limit).await,
        StatusCode::OK,
        "runs",
    )
}

/// GET /plans/{plan_id}/runs/{run_id}/tape?employee_ref=
pub(crate) async fn handle_tape(
    State(svc): State<AppState>,
    Path((plan_id, run_id)): Path<(String, String)>,
    Query(query): Query<TapeQuery>,
) -> Response {
    respond(
        svc.get_calculation_tape(&plan_id, &run_id, query.employee_ref.as_deref())
            .await,
        StatusCode::OK,
        "calculation tape",
    )
}

/// GET /runs/{run_id}/hash
pub(crate) async fn handle_run_hash(
    State(svc): State<AppState>,
    Path(run_id): Path<String>,
) -> Response {
    respond(
        svc.get_run_snapshot_hash(&run_id).await,
        StatusCode::OK,
        "snapshot hash",
    )
}

/// POST /runs/{run_id}/cancel
pub(crate) async fn handle_cancel(
    State(svc): State<AppState>,
    Path(run_id): Path<String>,
) -> Response {
    respond(
        svc.cancel_run(&run_id).await,
        StatusCode::ACCEPTED,
        "cancellation requested",
    )
}

/// POST /plans/{plan_id}/verify
pub(crate) async fn handle_verify(
    State(svc): State<AppState>,
    Path(plan_id): Path<String>,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> Response {
    let result = match body(payload) {
        Ok(req) => svc.verify_reproducibility(&plan_id, req).await,
        Err(e) => Err(e),
    };
    let message = match &result {
        Ok(report) if report.is_reproducible => "plan is reproducible",
        Ok(_) => "snapshot hash mismatch",
        Err(_) => "",
    };
    respond(result, StatusCode::OK, message)
}
