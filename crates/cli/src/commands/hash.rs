use std::path::Path;

use super::{fail, finish, load_plan, Service};

/// `payplan hash <plan.json> [--precision P]`
pub(crate) async fn cmd_hash(svc: &Service, plan_path: &Path, precision: Option<&str>) -> i32 {
    let plan = match load_plan(svc, plan_path).await {
        Ok(plan) => plan,
        Err(e) => return fail(&e),
    };
    finish(svc.plan_hash(plan.id(), precision).await, "snapshot hash")
}
