use std::path::{Path, PathBuf};

use payplan_eval::Run;

use super::{emit, fail, load_plan, read_json, Service};
use crate::service::{Envelope, ServiceError, VerifyRequest};

/// A recorded run is the bare run or the envelope `payplan run` printed.
fn recorded_run(mut raw: serde_json::Value) -> Result<Run, serde_json::Error> {
    if raw.get("run_id").is_none() {
        if let Some(data) = raw.get_mut("data").map(serde_json::Value::take) {
            raw = data;
        }
    }
    serde_json::from_value(raw)
}

pub(crate) struct VerifyArgs {
    pub plan: PathBuf,
    pub expected: String,
    pub run: Option<PathBuf>,
    pub precision: Option<String>,
}

/// `payplan verify <plan.json> --expected <hash> [--run <run.json>]`
///
/// Exits 1 on a mismatch even though the envelope itself is successful.
pub(crate) async fn cmd_verify(svc: &Service, args: VerifyArgs) -> i32 {
    let plan = match load_plan(svc, &args.plan).await {
        Ok(plan) => plan,
        Err(e) => return fail(&e),
    };
    let run_id = match args.run.as_deref() {
        Some(path) => match import_run(svc, path).await {
            Ok(run_id) => Some(run_id),
            Err(code) => return code,
        },
        None => None,
    };

    let req = VerifyRequest {
        expected_hash: args.expected,
        precision_mode: args.precision,
        run_id,
    };
    match svc.verify_reproducibility(plan.id(), req).await {
        Ok(report) => {
            let reproducible = report.is_reproducible;
            let message = if reproducible {
                "plan is reproducible"
            } else {
                "snapshot hash mismatch"
            };
            let code = emit(&Envelope::ok(report, message));
            if reproducible {
                code
            } else {
                1
            }
        }
        Err(e) => fail(&e),
    }
}

async fn import_run(svc: &Service, path: &Path) -> Result<String, i32> {
    let raw = read_json::<serde_json::Value>(path, "run").map_err(|e| fail(&e))?;
    let recorded = recorded_run(raw).map_err(|e| {
        fail(&ServiceError::BadRequest(format!(
            "invalid run in '{}': {}",
            path.display(),
            e
        )))
    })?;
    let run = svc
        .import_run(recorded)
        .await
        .map_err(|e| fail(&e))?;
    Ok(run.run_id().to_string())
}
