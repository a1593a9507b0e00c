//! The operation service: every externally visible plan and run operation,
//! over any [`PlanStorage`], with results wrapped in a uniform [`Envelope`].
//!
//! The HTTP server and the file-driven subcommands both call into here, so
//! error codes and response shapes are the same on every surface.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use payplan_core::{validate, ValidationError};
use payplan_eval::{
    execute, hash, new_run_id, verify, CancellationToken, EmployeeFailure, EmployeeRecord,
    EngineError, ExecuteOptions, ExecutionMode, NewStep, Plan, PlanError, PlanStatus, PlanStep,
    PoolScalingResult, ReproducibilityReport, Run, RunStatus, StateError, StepPatch, TapeEntry,
    Value,
};
use payplan_storage::{PlanStorage, StorageError};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, Settings};

// ──────────────────────────────────────────────
// Envelope and errors
// ──────────────────────────────────────────────

/// `{success, data, message, error?}` wrapper returned to every caller.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Envelope {
            success: true,
            data: Some(data),
            message: message.into(),
            error: None,
            details: None,
        }
    }

    pub fn fail(err: &ServiceError) -> Self {
        Envelope {
            success: false,
            data: None,
            message: err.to_string(),
            error: Some(err.code()),
            details: err.details(),
        }
    }

    pub fn from_result(result: Result<T, ServiceError>, message: impl Into<String>) -> Self {
        match result {
            Ok(data) => Envelope::ok(data, message),
            Err(err) => Envelope::fail(&err),
        }
    }
}

/// Everything an operation can fail with, mapped to an envelope code and
/// an HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    State(#[from] StateError),

    /// A strict run stopped at an employee-level failure.
    #[error("{message}")]
    Evaluation {
        message: String,
        details: serde_json::Value,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    /// The target exists but its state forbids the request.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation_error",
            ServiceError::State(_) | ServiceError::Conflict(_) => "state_error",
            ServiceError::Evaluation { .. } => "evaluation_error",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::BadRequest(_) => "bad_request",
            ServiceError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ServiceError::Validation(_) | ServiceError::Evaluation { .. } => 422,
            ServiceError::State(_) | ServiceError::Conflict(_) => 409,
            ServiceError::NotFound(_) => 404,
            ServiceError::BadRequest(_) => 400,
            ServiceError::Internal(_) => 500,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ServiceError::Validation(e) => serde_json::to_value(e).ok(),
            ServiceError::Evaluation { details, .. } => Some(details.clone()),
            _ => None,
        }
    }
}

impl From<PlanError> for ServiceError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::State(e) => ServiceError::State(e),
            PlanError::Validation(e) => ServiceError::Validation(e),
            e @ (PlanError::StepNotFound { .. } | PlanError::InputNotFound { .. }) => {
                ServiceError::NotFound(e.to_string())
            }
            PlanError::InvalidEdit { message } => ServiceError::BadRequest(message),
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(e) => ServiceError::Validation(e),
            EngineError::State(e) => ServiceError::State(e),
            e @ EngineError::Batch { .. } => ServiceError::BadRequest(e.to_string()),
            e @ EngineError::WorkerPool { .. } => ServiceError::Internal(e.to_string()),
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            e @ (StorageError::PlanNotFound { .. }
            | StorageError::RunNotFound { .. }
            | StorageError::StepNotFound { .. }) => ServiceError::NotFound(e.to_string()),
            e @ (StorageError::AlreadyExists { .. } | StorageError::RunImmutable { .. }) => {
                ServiceError::Conflict(e.to_string())
            }
            e @ StorageError::Backend(_) => ServiceError::Internal(e.to_string()),
        }
    }
}

impl From<ConfigError> for ServiceError {
    fn from(err: ConfigError) -> Self {
        ServiceError::BadRequest(err.to_string())
    }
}

// ──────────────────────────────────────────────
// Requests
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateRequest {
    pub expression: String,
    /// Validate as if the expression were step `step_order`; `None` uses
    /// every output of the plan.
    #[serde(default)]
    pub step_order: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotesRequest {
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LockRequest {
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub precision_mode: Option<String>,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    /// Label of the batch the employees came from.
    #[serde(default)]
    pub batch_ref: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    pub employees: Vec<EmployeeRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyRequest {
    pub expected_hash: String,
    #[serde(default)]
    pub precision_mode: Option<String>,
    /// Stored run whose canonical form explains a mismatch.
    #[serde(default)]
    pub run_id: Option<String>,
}

// ──────────────────────────────────────────────
// Responses
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ValidationError>,
    pub variables: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub plan_id: String,
    pub plan_version: u32,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_ref: Option<String>,
    pub precision_mode: String,
    pub mode: ExecutionMode,
    pub snapshot_hash: String,
    pub results_hash: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub total_employees: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<EmployeeFailure>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_scaling: Option<PoolScalingResult>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        RunSummary {
            run_id: run.run_id().to_string(),
            plan_id: run.plan_id().to_string(),
            plan_version: run.plan_version(),
            status: run.status(),
            batch_ref: run.batch_ref().map(str::to_string),
            precision_mode: run.precision().name.clone(),
            mode: run.mode(),
            snapshot_hash: run.snapshot_hash().to_string(),
            results_hash: run.results_hash().to_string(),
            started_at: run.started_at().to_string(),
            finished_at: run.finished_at().map(str::to_string),
            total_employees: run.total_employees(),
            succeeded: run.succeeded(),
            failed: run.failed(),
            failures: run.failures().to_vec(),
            warnings: run.warnings().to_vec(),
            pool_scaling: run.pool_scaling().cloned(),
        }
    }
}

/// One tape entry as seen by callers of `getCalculationTape`.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step_order: u32,
    pub step_name: String,
    pub output_name: String,
    pub value: Value,
    pub sequence_index: u32,
}

impl From<&TapeEntry> for StepResult {
    fn from(entry: &TapeEntry) -> Self {
        StepResult {
            step_order: entry.step_order,
            step_name: entry.step_name.clone(),
            output_name: entry.output_name.clone(),
            value: entry.value.clone(),
            sequence_index: entry.sequence_index,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TapeResponse {
    pub run_id: String,
    pub calculation_tape: BTreeMap<String, Vec<StepResult>>,
    pub total_employees: usize,
    pub total_steps: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunHashResponse {
    pub run_id: String,
    pub snapshot_hash: String,
    pub results_hash: String,
    pub status: RunStatus,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanHashResponse {
    pub plan_id: String,
    pub version: u32,
    pub status: PlanStatus,
    pub precision_mode: String,
    pub snapshot_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub run_id: String,
    pub cancelled: bool,
}

// ──────────────────────────────────────────────
// Service
// ──────────────────────────────────────────────

pub struct PlanService<S: PlanStorage> {
    storage: Arc<S>,
    settings: Settings,
    /// Cancellation tokens of runs currently executing, by run id.
    active: Mutex<HashMap<String, CancellationToken>>,
}

/// Removes a run's token from the active set when the run ends or its
/// request is dropped.
struct ActiveRun<'a> {
    active: &'a Mutex<HashMap<String, CancellationToken>>,
    run_id: String,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        lock_active(self.active).remove(&self.run_id);
    }
}

fn lock_active(
    active: &Mutex<HashMap<String, CancellationToken>>,
) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S: PlanStorage> PlanService<S> {
    pub fn new(storage: Arc<S>, settings: Settings) -> Self {
        PlanService {
            storage,
            settings,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ── Plans ─────────────────────────────────

    /// Register a new draft plan. Steps supplied up front are validated
    /// as a whole.
    pub async fn create_plan(&self, mut plan: Plan) -> Result<Plan, ServiceError> {
        if plan.status() != PlanStatus::Draft {
            return Err(ServiceError::BadRequest(format!(
                "new plans must be drafts, got {}",
                plan.status()
            )));
        }
        plan.normalize();
        if !plan.steps().is_empty() {
            plan.compile()?;
        }
        let cell = self.storage.create_plan(plan).await?;
        let plan = cell.plan();
        tracing::info!(plan_id = %plan.id(), steps = plan.steps().len(), "plan created");
        Ok(plan)
    }

    /// Store a plan read from a file, whatever its status. Approved and
    /// locked plans must still compile.
    pub async fn import_plan(&self, mut plan: Plan) -> Result<Plan, ServiceError> {
        plan.normalize();
        if plan.status().is_executable() || !plan.steps().is_empty() {
            plan.compile()?;
        }
        let cell = self.storage.create_plan(plan).await?;
        let plan = cell.plan();
        tracing::debug!(plan_id = %plan.id(), status = %plan.status(), "plan imported");
        Ok(plan)
    }

    pub async fn get_plan(&self, plan_id: &str) -> Result<Plan, ServiceError> {
        Ok(self.storage.plan(plan_id).await?.plan())
    }

    pub async fn validate_expression(
        &self,
        plan_id: &str,
        req: ValidateRequest,
    ) -> Result<ValidateResponse, ServiceError> {
        let cell = self.storage.plan(plan_id).await?;
        let scope = cell.read(|p| p.scope_at(req.step_order));
        Ok(match validate(&req.expression, &scope) {
            Ok(valid) => ValidateResponse {
                valid: true,
                error: None,
                variables: valid.variables,
            },
            Err(error) => ValidateResponse {
                valid: false,
                error: Some(error),
                variables: Vec::new(),
            },
        })
    }

    pub async fn create_plan_step(
        &self,
        plan_id: &str,
        new: NewStep,
    ) -> Result<PlanStep, ServiceError> {
        let cell = self.storage.plan(plan_id).await?;
        let step = cell.mutate(|p| p.create_step(new))?;
        self.storage.save_plan(plan_id).await?;
        Ok(step)
    }

    pub async fn update_plan_step(
        &self,
        step_id: &str,
        patch: StepPatch,
    ) -> Result<PlanStep, ServiceError> {
        let cell = self.storage.plan_for_step(step_id).await?;
        let (plan_id, step) = cell.mutate(|p| {
            let step = p.update_step(step_id, patch)?;
            Ok((p.id().to_string(), step))
        })?;
        self.storage.save_plan(&plan_id).await?;
        Ok(step)
    }

    pub async fn delete_plan_step(&self, step_id: &str) -> Result<(), ServiceError> {
        let cell = self.storage.plan_for_step(step_id).await?;
        let plan_id = cell.mutate(|p| {
            p.delete_step(step_id)?;
            Ok(p.id().to_string())
        })?;
        self.storage.save_plan(&plan_id).await?;
        Ok(())
    }

    pub async fn approve_plan(
        &self,
        plan_id: &str,
        req: NotesRequest,
    ) -> Result<Plan, ServiceError> {
        self.transition(plan_id, |p| p.approve(req.notes)).await
    }

    pub async fn lock_plan(&self, plan_id: &str, req: LockRequest) -> Result<Plan, ServiceError> {
        self.transition(plan_id, |p| p.lock(req.confirm, req.notes))
            .await
    }

    pub async fn archive_plan(
        &self,
        plan_id: &str,
        req: NotesRequest,
    ) -> Result<Plan, ServiceError> {
        self.transition(plan_id, |p| p.archive(req.notes)).await
    }

    async fn transition(
        &self,
        plan_id: &str,
        f: impl FnOnce(&mut Plan) -> Result<(), PlanError>,
    ) -> Result<Plan, ServiceError> {
        let cell = self.storage.plan(plan_id).await?;
        let plan = cell.mutate(|p| {
            f(p)?;
            Ok(p.clone())
        })?;
        self.storage.save_plan(plan_id).await?;
        Ok(plan)
    }

    // ── Runs ──────────────────────────────────

    /// Execute a batch against the plan and store the sealed run.
    ///
    /// The plan is leased for the whole run, so step edits fail with
    /// `RunInProgress` until it finishes. A strict run that stops at a
    /// failing employee is stored and reported as `evaluation_error`.
    pub async fn execute_plan_with_tape(
        &self,
        plan_id: &str,
        req: ExecuteRequest,
    ) -> Result<RunSummary, ServiceError> {
        let run = self.execute_run(plan_id, req).await?;
        Ok(RunSummary::from(run.as_ref()))
    }

    /// Same as [`execute_plan_with_tape`](Self::execute_plan_with_tape) but
    /// hands back the whole stored run, tape included.
    pub async fn execute_run(
        &self,
        plan_id: &str,
        req: ExecuteRequest,
    ) -> Result<Arc<Run>, ServiceError> {
        let cell = self.storage.plan(plan_id).await?;
        let precision = self.settings.precision(req.precision_mode.as_deref())?;
        let workers = match req.workers {
            Some(0) => {
                return Err(ServiceError::BadRequest(
                    "workers must be at least 1".to_string(),
                ))
            }
            Some(n) => n,
            None => self.settings.workers,
        };
        let run_id = new_run_id();
        let options = ExecuteOptions {
            mode: req.mode.unwrap_or(self.settings.default_mode),
            precision,
            workers,
            run_id: Some(run_id.clone()),
            batch_ref: req.batch_ref,
        };

        let lease = cell.begin_run()?;
        let cancel = CancellationToken::new();
        let _active = self.register(&run_id, cancel.clone());
        let employees = req.employees;
        let run = tokio::task::spawn_blocking(move || {
            execute(lease.snapshot(), &employees, &options, &cancel)
        })
        .await
        .map_err(|e| ServiceError::Internal(format!("run {run_id} did not complete: {e}")))??;

        let run = self.storage.insert_run(run).await?;
        if run.status() == RunStatus::Failed {
            let summary = RunSummary::from(run.as_ref());
            let reason = run
                .failures()
                .first()
                .map(|f| format!("{} at step {}: {}", f.employee_ref, f.step_order, f.reason))
                .unwrap_or_else(|| "unknown failure".to_string());
            return Err(ServiceError::Evaluation {
                message: format!("run {} failed: {}", run.run_id(), reason),
                details: serde_json::to_value(&summary).unwrap_or_default(),
            });
        }
        Ok(run)
    }

    fn register(&self, run_id: &str, cancel: CancellationToken) -> ActiveRun<'_> {
        lock_active(&self.active).insert(run_id.to_string(), cancel);
        ActiveRun {
            active: &self.active,
            run_id: run_id.to_string(),
        }
    }

    pub async fn list_runs(
        &self,
        plan_id: &str,
        limit: usize,
    ) -> Result<Vec<RunSummary>, ServiceError> {
        self.storage.plan(plan_id).await?;
        let runs = self.storage.list_runs(Some(plan_id), limit).await?;
        Ok(runs.iter().map(|r| RunSummary::from(r.as_ref())).collect())
    }

    /// Ask a running execution to stop. Employees already finished are
    /// kept; the run ends as `cancelled`.
    pub async fn cancel_run(&self, run_id: &str) -> Result<CancelResponse, ServiceError> {
        if let Some(token) = lock_active(&self.active).get(run_id) {
            token.cancel();
            tracing::info!(run_id, "cancellation requested");
            return Ok(CancelResponse {
                run_id: run_id.to_string(),
                cancelled: true,
            });
        }
        let run = self.storage.get_run(run_id).await?;
        Err(ServiceError::Conflict(format!(
            "run {} already finished with status {}",
            run_id,
            run.status()
        )))
    }

    pub async fn get_calculation_tape(
        &self,
        plan_id: &str,
        run_id: &str,
        employee_ref: Option<&str>,
    ) -> Result<TapeResponse, ServiceError> {
        let cell = self.storage.plan(plan_id).await?;
        let run = self.storage.get_run(run_id).await?;
        if run.plan_id() != plan_id {
            return Err(ServiceError::NotFound(format!(
                "run {run_id} does not belong to plan {plan_id}"
            )));
        }

        let mut calculation_tape: BTreeMap<String, Vec<StepResult>> = run
            .tape_by_employee()
            .into_iter()
            .filter(|(emp, _)| employee_ref.map_or(true, |wanted| *emp == wanted))
            .map(|(emp, entries)| {
                (
                    emp.to_string(),
                    entries.into_iter().map(StepResult::from).collect(),
                )
            })
            .collect();
        // Failed employees are listed with no entries.
        for failure in run.failures() {
            if employee_ref.map_or(true, |wanted| failure.employee_ref == wanted) {
                calculation_tape
                    .entry(failure.employee_ref.clone())
                    .or_default();
            }
        }
        if let Some(wanted) = employee_ref {
            if calculation_tape.is_empty() {
                return Err(ServiceError::NotFound(format!(
                    "employee {wanted} is not part of run {run_id}"
                )));
            }
        }

        Ok(TapeResponse {
            run_id: run_id.to_string(),
            calculation_tape,
            total_employees: run.total_employees(),
            total_steps: cell.read(|p| p.steps().len()),
        })
    }

    /// Snapshot hash of the plan as it stands now.
    pub async fn plan_hash(
        &self,
        plan_id: &str,
        precision_mode: Option<&str>,
    ) -> Result<PlanHashResponse, ServiceError> {
        let plan = self.storage.plan(plan_id).await?.plan();
        let precision = self.settings.precision(precision_mode)?;
        Ok(PlanHashResponse {
            plan_id: plan.id().to_string(),
            version: plan.version(),
            status: plan.status(),
            precision_mode: precision.name.clone(),
            snapshot_hash: hash(&plan, &precision),
        })
    }

    /// Store a run recorded elsewhere so it can back a verification.
    pub async fn import_run(&self, run: Run) -> Result<Arc<Run>, ServiceError> {
        Ok(self.storage.insert_run(run).await?)
    }

    pub async fn get_run_snapshot_hash(&self, run_id: &str) -> Result<RunHashResponse, ServiceError> {
        let run = self.storage.get_run(run_id).await?;
        Ok(RunHashResponse {
            run_id: run.run_id().to_string(),
            snapshot_hash: run.snapshot_hash().to_string(),
            results_hash: run.results_hash().to_string(),
            status: run.status(),
            started_at: run.started_at().to_string(),
            finished_at: run.finished_at().map(str::to_string),
        })
    }

    /// Compare the plan's current digest with `expected_hash`.
    ///
    /// Field differences are reported when a stored run recorded the
    /// expected hash: the one named by `run_id`, or else any stored run
    /// with that snapshot hash.
    pub async fn verify_reproducibility(
        &self,
        plan_id: &str,
        req: VerifyRequest,
    ) -> Result<ReproducibilityReport, ServiceError> {
        let plan = self.storage.plan(plan_id).await?.plan();
        let recorded = match &req.run_id {
            Some(run_id) => Some(self.storage.get_run(run_id).await?),
            None => {
                let expected = req.expected_hash.trim();
                self.storage
                    .list_runs(None, 0)
                    .await?
                    .into_iter()
                    .find(|r| r.snapshot_hash().eq_ignore_ascii_case(expected))
            }
        };
        let precision = match (req.precision_mode.as_deref(), &recorded) {
            (Some(name), _) => self.settings.precision(Some(name))?,
            (None, Some(run)) => run.precision().clone(),
            (None, None) => self.settings.precision(None)?,
        };
        Ok(verify(
            &plan,
            &precision,
            &req.expected_hash,
            recorded.as_deref().map(Run::canonical),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payplan_eval::{InputDecl, ValueType};
    use payplan_storage::MemoryStorage;
    use serde_json::json;

    fn service() -> PlanService<MemoryStorage> {
        let mut settings = Settings::default();
        settings.set_workers(2).unwrap();
        PlanService::new(Arc::new(MemoryStorage::new()), settings)
    }

    fn draft(id: &str) -> Plan {
        let mut plan = Plan::new(id, "Team bonus");
        plan.add_input(InputDecl::new("salary", ValueType::Numeric))
            .unwrap();
        plan.add_input(InputDecl::new("score", ValueType::Numeric))
            .unwrap();
        plan
    }

    fn step(name: &str, expression: &str) -> NewStep {
        NewStep {
            name: name.to_string(),
            expression: expression.to_string(),
            outputs: vec![name.to_string()],
            description: None,
            step_order: None,
        }
    }

    fn batch() -> Vec<EmployeeRecord> {
        vec![
            EmployeeRecord::new("B2")
                .with("salary", json!("80000"))
                .with("score", json!("0")),
            EmployeeRecord::new("A1")
                .with("salary", json!("50000"))
                .with("score", json!("2")),
        ]
    }

    async fn approved_service() -> PlanService<MemoryStorage> {
        let svc = service();
        svc.create_plan(draft("p1")).await.unwrap();
        svc.create_plan_step("p1", step("base", "salary * 0.1"))
            .await
            .unwrap();
        svc.create_plan_step("p1", step("per_point", "base / score"))
            .await
            .unwrap();
        svc.approve_plan("p1", NotesRequest::default())
            .await
            .unwrap();
        svc
    }

    #[tokio::test]
    async fn validate_expression_reports_unknown_variable() {
        let svc = service();
        svc.create_plan(draft("p1")).await.unwrap();
        let ok = svc
            .validate_expression(
                "p1",
                ValidateRequest {
                    expression: "max(score, salary) * 2".into(),
                    step_order: None,
                },
            )
            .await
            .unwrap();
        assert!(ok.valid);
        assert_eq!(ok.variables, ["salary", "score"]);

        let bad = svc
            .validate_expression(
                "p1",
                ValidateRequest {
                    expression: "salary * bonusRate".into(),
                    step_order: Some(1),
                },
            )
            .await
            .unwrap();
        assert!(!bad.valid);
        assert_eq!(bad.error.unwrap().token.as_deref(), Some("bonusRate"));
    }

    #[tokio::test]
    async fn lifecycle_gates_step_edits() {
        let svc = approved_service().await;
        let err = svc
            .create_plan_step("p1", step("extra", "salary"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "state_error");
        assert_eq!(err.status(), 409);

        let plan = svc.get_plan("p1").await.unwrap();
        let step_id = plan.steps()[0].step_id.clone();
        let err = svc.delete_plan_step(&step_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::State(StateError::NotDraft { .. })));
        assert_eq!(svc.get_plan("p1").await.unwrap().steps().len(), 2);

        let err = svc
            .lock_plan("p1", LockRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::State(StateError::ConfirmationRequired { .. })
        ));
    }

    #[tokio::test]
    async fn lenient_run_is_stored_with_grouped_tape() {
        let svc = approved_service().await;
        let summary = svc
            .execute_plan_with_tape(
                "p1",
                ExecuteRequest {
                    batch_ref: Some("q1-batch".into()),
                    employees: batch(),
                    ..ExecuteRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.batch_ref.as_deref(), Some("q1-batch"));
        assert_eq!((summary.succeeded, summary.failed), (1, 1));
        assert_eq!(summary.failures[0].employee_ref, "B2");

        let tape = svc
            .get_calculation_tape("p1", &summary.run_id, None)
            .await
            .unwrap();
        assert_eq!(tape.total_employees, 2);
        assert_eq!(tape.total_steps, 2);
        let a1 = &tape.calculation_tape["A1"];
        let names: Vec<&str> = a1.iter().map(|r| r.output_name.as_str()).collect();
        assert_eq!(names, ["base", "per_point"]);
        assert_eq!(a1[1].value.text(), "2500.00");
        let listed: Vec<&str> = tape.calculation_tape.keys().map(String::as_str).collect();
        assert_eq!(listed, ["A1", "B2"]);
        assert!(tape.calculation_tape["B2"].is_empty());

        let only_b2 = svc
            .get_calculation_tape("p1", &summary.run_id, Some("B2"))
            .await
            .unwrap();
        assert!(only_b2.calculation_tape["B2"].is_empty());
        let missing = svc
            .get_calculation_tape("p1", &summary.run_id, Some("Z9"))
            .await
            .unwrap_err();
        assert_eq!(missing.code(), "not_found");

        let hash = svc.get_run_snapshot_hash(&summary.run_id).await.unwrap();
        assert_eq!(hash.snapshot_hash, summary.snapshot_hash);
        assert!(hash.finished_at.is_some());
        assert_eq!(svc.list_runs("p1", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn strict_failure_is_an_evaluation_error() {
        let svc = approved_service().await;
        let err = svc
            .execute_plan_with_tape(
                "p1",
                ExecuteRequest {
                    mode: Some(ExecutionMode::Strict),
                    employees: batch(),
                    ..ExecuteRequest::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "evaluation_error");
        let envelope: Envelope<()> = Envelope::fail(&err);
        let details = envelope.details.unwrap();
        assert_eq!(details["status"], "failed");
        assert_eq!(details["failures"][0]["employee_ref"], "B2");

        let runs = svc.list_runs("p1", 0).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn draft_plans_cannot_execute() {
        let svc = service();
        svc.create_plan(draft("p1")).await.unwrap();
        let err = svc
            .execute_plan_with_tape(
                "p1",
                ExecuteRequest {
                    employees: batch(),
                    ..ExecuteRequest::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::State(StateError::NotExecutable { .. })
        ));
    }

    #[tokio::test]
    async fn verify_lists_changed_step_of_next_version() {
        let svc = approved_service().await;
        let summary = svc
            .execute_plan_with_tape(
                "p1",
                ExecuteRequest {
                    employees: batch(),
                    ..ExecuteRequest::default()
                },
            )
            .await
            .unwrap();

        let same = svc
            .verify_reproducibility(
                "p1",
                VerifyRequest {
                    expected_hash: summary.snapshot_hash.clone(),
                    precision_mode: None,
                    run_id: None,
                },
            )
            .await
            .unwrap();
        assert!(same.is_reproducible);

        let mut next = svc.get_plan("p1").await.unwrap().next_version("p2").unwrap();
        let step_id = next.steps()[0].step_id.clone();
        next.update_step(
            &step_id,
            StepPatch {
                expression: Some("salary * 0.2".into()),
                ..StepPatch::default()
            },
        )
        .unwrap();
        svc.create_plan(next).await.unwrap();

        let report = svc
            .verify_reproducibility(
                "p2",
                VerifyRequest {
                    expected_hash: summary.snapshot_hash.clone(),
                    precision_mode: None,
                    run_id: None,
                },
            )
            .await
            .unwrap();
        assert!(!report.is_reproducible);
        assert_eq!(report.changed_steps(), vec![1]);
    }

    #[tokio::test]
    async fn cancel_reaches_active_runs_only() {
        let svc = approved_service().await;
        let token = CancellationToken::new();
        let guard = svc.register("run-live", token.clone());
        let resp = svc.cancel_run("run-live").await.unwrap();
        assert!(resp.cancelled);
        assert!(token.is_cancelled());
        drop(guard);

        let err = svc.cancel_run("run-live").await.unwrap_err();
        assert_eq!(err.code(), "not_found");

        let summary = svc
            .execute_plan_with_tape(
                "p1",
                ExecuteRequest {
                    employees: batch(),
                    ..ExecuteRequest::default()
                },
            )
            .await
            .unwrap();
        let err = svc.cancel_run(&summary.run_id).await.unwrap_err();
        assert_eq!(err.status(), 409);
    }

    #[tokio::test]
    async fn create_plan_rejects_non_drafts_and_bad_steps() {
        let svc = service();
        let mut plan = draft("p1");
        plan.create_step(step("base", "salary")).unwrap();
        plan.approve(None).unwrap();
        let err = svc.create_plan(plan).await.unwrap_err();
        assert_eq!(err.code(), "bad_request");

        let raw = json!({
            "id": "p2",
            "name": "Broken",
            "inputs": [{"name": "salary", "type": "numeric"}],
            "steps": [{"step_order": 1, "name": "x", "expression": "salary * rate", "outputs": ["x"]}]
        });
        let plan: Plan = serde_json::from_value(raw).unwrap();
        let err = svc.create_plan(plan).await.unwrap_err();
        assert_eq!(err.code(), "validation_error");
        let envelope: Envelope<Plan> = Envelope::fail(&err);
        assert_eq!(envelope.details.unwrap()["token"], "rate");
    }
}
