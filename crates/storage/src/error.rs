/// All errors that can be returned by a `PlanStorage` implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No plan with the given id.
    #[error("plan not found: {plan_id}")]
    PlanNotFound { plan_id: String },

    /// No run with the given id.
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// No plan owns a step with the given id.
    #[error("step not found: {step_id}")]
    StepNotFound { step_id: String },

    /// A plan with this id is already registered.
    #[error("plan already exists: {plan_id}")]
    AlreadyExists { plan_id: String },

    /// A finished run is already stored under this id and cannot be replaced.
    #[error("run {run_id} is finished and cannot be modified")]
    RunImmutable { run_id: String },

    /// A backend-specific storage error (serialization, I/O, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}
