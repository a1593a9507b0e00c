use std::path::Path;

use payplan_eval::{Plan, PlanStatus};
use serde::Serialize;

use super::{fail, finish, load_plan, Service};
use crate::service::{ServiceError, ValidateRequest};

/// What a whole-plan check reports back.
#[derive(Debug, Serialize)]
struct PlanCheck {
    plan_id: String,
    version: u32,
    status: PlanStatus,
    inputs: Vec<String>,
    steps: usize,
    outputs: Vec<String>,
}

impl From<&Plan> for PlanCheck {
    fn from(plan: &Plan) -> Self {
        PlanCheck {
            plan_id: plan.id().to_string(),
            version: plan.version(),
            status: plan.status(),
            inputs: plan.input_names(),
            steps: plan.steps().len(),
            outputs: plan
                .steps()
                .iter()
                .flat_map(|s| s.outputs.iter().cloned())
                .collect(),
        }
    }
}

/// `payplan validate <plan.json> [--expression E [--step-order N]]`
///
/// Without an expression the plan's steps are checked as a whole. An
/// invalid expression is reported as `validation_error`.
pub(crate) async fn cmd_validate(
    svc: &Service,
    plan_path: &Path,
    expression: Option<String>,
    step_order: Option<u32>,
) -> i32 {
    let plan = match load_plan(svc, plan_path).await {
        Ok(plan) => plan,
        Err(e) => return fail(&e),
    };

    let Some(expression) = expression else {
        return finish(Ok(PlanCheck::from(&plan)), "plan is valid");
    };
    let result = svc
        .validate_expression(
            plan.id(),
            ValidateRequest {
                expression,
                step_order,
            },
        )
        .await
        .and_then(|resp| match resp.error {
            Some(err) => Err(ServiceError::Validation(err)),
            None => Ok(resp),
        });
    finish(result, "expression is valid")
}
