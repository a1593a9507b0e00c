use std::sync::Arc;

use async_trait::async_trait;
use payplan_eval::{Plan, PlanCell, Run};

use crate::error::StorageError;

/// The storage trait for payplan backends.
///
/// A `PlanStorage` implementation keeps plans and the runs executed against
/// them.
///
/// ## Plans
///
/// Plans are handed out as shared [`PlanCell`]s rather than copies. All
/// editing and every run go through the cell, so the mutual exclusion between
/// plan mutation and run execution holds across every caller of the same
/// backend. A backend that persists plans writes the cell's plan back after
/// each successful mutation via [`PlanStorage::save_plan`].
///
/// ## Runs
///
/// A run is stored once, after it has finished. Stored runs are immutable:
/// a second `insert_run` for the same `run_id` returns
/// `Err(StorageError::RunImmutable)` and leaves the stored run untouched.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be used in axum
/// application state and across async task boundaries.
#[async_trait]
pub trait PlanStorage: Send + Sync + 'static {
    // ── Plans ─────────────────────────────────────────────────────────────────

    /// Register a new plan.
    ///
    /// Returns `Err(StorageError::AlreadyExists)` if the id is taken.
    async fn create_plan(&self, plan: Plan) -> Result<Arc<PlanCell>, StorageError>;

    /// The cell holding `plan_id`.
    ///
    /// Returns `Err(StorageError::PlanNotFound)` if no such plan exists.
    async fn plan(&self, plan_id: &str) -> Result<Arc<PlanCell>, StorageError>;

    /// The cell holding the plan that owns `step_id`.
    ///
    /// Returns `Err(StorageError::StepNotFound)` if no plan owns the step.
    async fn plan_for_step(&self, step_id: &str) -> Result<Arc<PlanCell>, StorageError>;

    /// Persist the current state of a plan's cell.
    async fn save_plan(&self, plan_id: &str) -> Result<(), StorageError>;

    /// All plans, ordered by id.
    async fn list_plans(&self) -> Result<Vec<Plan>, StorageError>;

    // ── Runs ──────────────────────────────────────────────────────────────────

    /// Store a finished run.
    ///
    /// Returns `Err(StorageError::RunImmutable)` if a run with the same id is
    /// already stored, and `Err(StorageError::Backend)` for a run that has not
    /// finished.
    async fn insert_run(&self, run: Run) -> Result<Arc<Run>, StorageError>;

    /// Read a run by id.
    ///
    /// Returns `Err(StorageError::RunNotFound)` if not found.
    async fn get_run(&self, run_id: &str) -> Result<Arc<Run>, StorageError>;

    /// List runs in insertion order.
    ///
    /// - `plan_id`: filter to runs of a specific plan
    /// - `limit`: maximum number of results, newest kept (0 = no limit)
    async fn list_runs(
        &self,
        plan_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Arc<Run>>, StorageError>;
}
