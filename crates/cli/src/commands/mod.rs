//! File-driven subcommands.
//!
//! Each one loads its JSON files into an in-memory [`PlanService`], runs a
//! single operation, prints the envelope on stdout and returns the process
//! exit code.

pub(crate) mod hash;
pub(crate) mod run;
pub(crate) mod validate;
pub(crate) mod verify;

use std::path::Path;
use std::sync::Arc;

use payplan_eval::Plan;
use payplan_storage::MemoryStorage;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Settings;
use crate::service::{Envelope, PlanService, ServiceError};

pub(crate) type Service = PlanService<MemoryStorage>;

pub(crate) fn service(settings: Settings) -> Service {
    PlanService::new(Arc::new(MemoryStorage::new()), settings)
}

/// Print `envelope` as pretty JSON. Returns 0 on success, 1 otherwise.
pub(crate) fn emit<T: Serialize>(envelope: &Envelope<T>) -> i32 {
    match serde_json::to_string_pretty(envelope) {
        Ok(text) => println!("{}", text),
        Err(e) => {
            eprintln!("serialization error: {}", e);
            return 1;
        }
    }
    if envelope.success {
        0
    } else {
        1
    }
}

pub(crate) fn finish<T: Serialize>(result: Result<T, ServiceError>, message: &str) -> i32 {
    emit(&Envelope::from_result(result, message))
}

pub(crate) fn fail(err: &ServiceError) -> i32 {
    emit(&Envelope::<()>::fail(err))
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T, ServiceError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ServiceError::BadRequest(format!("could not read {} '{}': {}", what, path.display(), e))
    })?;
    serde_json::from_str(&text).map_err(|e| {
        ServiceError::BadRequest(format!("invalid {} JSON in '{}': {}", what, path.display(), e))
    })
}

/// Read a plan file and store it, whatever its status.
pub(crate) async fn load_plan(svc: &Service, path: &Path) -> Result<Plan, ServiceError> {
    let plan: Plan = read_json(path, "plan")?;
    tracing::debug!(path = %path.display(), plan_id = %plan.id(), "loading plan");
    svc.import_plan(plan).await
}
