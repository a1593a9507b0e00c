//! Data model and error types for the evaluation engine.

pub mod plan;
pub mod run;
pub mod values;

use serde::{Deserialize, Serialize};

use payplan_core::ValidationError;

pub use plan::{
    InputDecl, LifecycleEvent, Plan, PlanStatus, PlanStep, PoolConfig, DEFAULT_SCALED_OUTPUT,
};
pub use run::{
    EmployeeFailure, EmployeeRecord, ExecutionMode, PoolScalingResult, Run, RunStatus, TapeEntry,
};
pub use values::{Value, ValueType};

// ──────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────

/// Runtime failure while evaluating one (employee, step) pair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvalError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },
    #[error("{function}() takes {expected}, got {got}")]
    Arity {
        function: String,
        expected: String,
        got: usize,
    },
    #[error("variable '{name}' has no value")]
    MissingVariable { name: String },
    #[error("invalid input '{name}': {message}")]
    InvalidInput { name: String, message: String },
    #[error("numeric overflow: {message}")]
    Overflow { message: String },
}

/// Illegal plan mutation or execution given the plan's current state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("plan '{plan_id}' is {status}; {action} is only allowed in draft")]
    NotDraft {
        plan_id: String,
        status: PlanStatus,
        action: String,
    },
    #[error("plan '{plan_id}' cannot move from {from} to {to}")]
    IllegalTransition {
        plan_id: String,
        from: PlanStatus,
        to: PlanStatus,
    },
    #[error("locking plan '{plan_id}' requires explicit confirmation")]
    ConfirmationRequired { plan_id: String },
    #[error("plan '{plan_id}' has {active_runs} run(s) in progress")]
    RunInProgress { plan_id: String, active_runs: usize },
    #[error("plan '{plan_id}' is {status}; only approved or locked plans can be executed")]
    NotExecutable { plan_id: String, status: PlanStatus },
}

/// Result of a plan editing operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("step '{step_id}' not found")]
    StepNotFound { step_id: String },
    #[error("input '{name}' not found")]
    InputNotFound { name: String },
    #[error("{message}")]
    InvalidEdit { message: String },
}

impl PlanError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        PlanError::InvalidEdit {
            message: message.into(),
        }
    }
}

/// Degenerate pool totals or limits. Always downgraded to a run warning.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolScalingError {
    #[error("pool scaling skipped: total payout is zero")]
    ZeroTotal,
    #[error("pool scaling skipped: limit {limit} is not positive")]
    NonPositiveLimit { limit: rust_decimal::Decimal },
    #[error("pool scaling skipped: '{output}' for employee '{employee_ref}' is not numeric")]
    NonNumericPayout {
        employee_ref: String,
        output: String,
    },
    #[error("pool scaling skipped: payout total overflows")]
    Overflow,
}

/// Why a run could not start.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("invalid batch: {message}")]
    Batch { message: String },
    #[error("cannot start worker pool: {message}")]
    WorkerPool { message: String },
}
