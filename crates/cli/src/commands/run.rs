use std::path::PathBuf;

use payplan_eval::{EmployeeRecord, ExecutionMode, PlanStatus, Run};
use serde::Deserialize;

use super::{fail, finish, load_plan, read_json, Service};
use crate::service::{ExecuteRequest, NotesRequest, ServiceError};

/// The object form of a batch file.
#[derive(Debug, Deserialize)]
struct WrappedBatch {
    employees: Vec<EmployeeRecord>,
    #[serde(default)]
    batch_ref: Option<String>,
}

/// A batch file is a bare array of employees or an object wrapping one.
///
/// Dispatched on the parsed shape instead of an untagged enum, which
/// would buffer attribute numbers through `f64`.
fn batch_parts(
    raw: serde_json::Value,
) -> Result<(Vec<EmployeeRecord>, Option<String>), serde_json::Error> {
    if raw.is_array() {
        return Ok((serde_json::from_value(raw)?, None));
    }
    let wrapped: WrappedBatch = serde_json::from_value(raw)?;
    Ok((wrapped.employees, wrapped.batch_ref))
}

pub(crate) struct RunArgs {
    pub plan: PathBuf,
    pub employees: PathBuf,
    pub precision: Option<String>,
    pub strict: bool,
    pub workers: Option<usize>,
}

/// `payplan run <plan.json> --employees <batch.json>`
///
/// A draft plan is approved in memory first. The envelope carries the
/// whole run, tape included.
pub(crate) async fn cmd_run(svc: &Service, args: RunArgs) -> i32 {
    let plan = match load_plan(svc, &args.plan).await {
        Ok(plan) => plan,
        Err(e) => return fail(&e),
    };
    let parsed = read_json::<serde_json::Value>(&args.employees, "batch").and_then(|raw| {
        batch_parts(raw).map_err(|e| {
            ServiceError::BadRequest(format!(
                "invalid batch in '{}': {}",
                args.employees.display(),
                e
            ))
        })
    });
    let (employees, batch_ref) = match parsed {
        Ok(parts) => parts,
        Err(e) => return fail(&e),
    };

    if plan.status() == PlanStatus::Draft {
        let notes = NotesRequest {
            notes: Some("approved for a local run".to_string()),
        };
        if let Err(e) = svc.approve_plan(plan.id(), notes).await {
            return fail(&e);
        }
    }

    let req = ExecuteRequest {
        precision_mode: args.precision,
        mode: args.strict.then_some(ExecutionMode::Strict),
        batch_ref: batch_ref.or_else(|| Some(args.employees.display().to_string())),
        workers: args.workers,
        employees,
    };
    let result = svc
        .execute_run(plan.id(), req)
        .await
        .map(|run| Run::clone(&run));
    let message = match &result {
        Ok(run) => format!(
            "run {} {}: {} succeeded, {} failed",
            run.run_id(),
            run.status(),
            run.succeeded(),
            run.failed()
        ),
        Err(_) => String::new(),
    };
    finish(result, &message)
}
