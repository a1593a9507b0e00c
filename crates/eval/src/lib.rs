//! payplan-eval: deterministic evaluation engine for compensation plans.
//!
//! Takes plans whose steps were checked by `payplan-core`, executes them
//! against employee batches with fixed-point decimal arithmetic, and seals
//! each execution into an immutable [`Run`] with a calculation tape and a
//! snapshot hash.
//!
//! # Public API
//!
//! - [`Plan`] with the Draft-only editing and lifecycle operations in
//!   [`lifecycle`]
//! - [`evaluate()`] -- evaluate one expression under a [`PrecisionMode`]
//! - [`execute()`] / [`execute_plan()`] -- run a batch, producing a [`Run`]
//! - [`apply_pool_limit()`] -- proportional scaling under a funding ceiling
//! - [`hash()`] / [`verify()`] -- snapshot digests and reproducibility checks
//! - [`PlanCell`] -- keeps plan mutation and execution mutually exclusive

pub mod cell;
pub mod evaluate;
pub mod executor;
pub mod lifecycle;
pub mod numeric;
pub mod pool;
pub mod snapshot;
pub mod types;

pub use cell::{LockedSnapshot, PlanCell, RunLease};
pub use evaluate::{evaluate, evaluate_step, Environment};
pub use executor::{
    execute, execute_plan, new_run_id, CancellationToken, EmployeeOutcome, ExecuteOptions,
    POOL_STEP_NAME,
};
pub use lifecycle::{NewStep, StepPatch};
pub use numeric::{PrecisionMode, Rounding};
pub use pool::{apply_pool_limit, PoolScalingOutcome};
pub use snapshot::{
    hash, results_hash, verify, CanonicalSnapshot, FieldDifference, ReproducibilityReport,
};
pub use types::{
    EmployeeFailure, EmployeeRecord, EngineError, EvalError, ExecutionMode, InputDecl,
    LifecycleEvent, Plan, PlanError, PlanStatus, PlanStep, PoolConfig, PoolScalingError,
    PoolScalingResult, Run, RunStatus, StateError, TapeEntry, Value, ValueType,
};

/// Current UTC time as RFC 3339.
pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}
