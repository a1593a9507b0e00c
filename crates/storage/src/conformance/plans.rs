use std::future::Future;

use payplan_eval::{PlanStatus, StepPatch};

use super::{make_plan, TestResult};
use crate::{PlanStorage, StorageError};

pub(super) async fn run_plan_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "plans",
        "create_plan_is_readable",
        create_plan_is_readable(factory).await,
    ));
    results.push(TestResult::from_result(
        "plans",
        "duplicate_plan_returns_already_exists",
        duplicate_plan_returns_already_exists(factory).await,
    ));
    results.push(TestResult::from_result(
        "plans",
        "missing_plan_returns_plan_not_found",
        missing_plan_returns_plan_not_found(factory).await,
    ));
    results.push(TestResult::from_result(
        "plans",
        "step_lookup_finds_owning_plan",
        step_lookup_finds_owning_plan(factory).await,
    ));
    results.push(TestResult::from_result(
        "plans",
        "missing_step_returns_step_not_found",
        missing_step_returns_step_not_found(factory).await,
    ));
    results.push(TestResult::from_result(
        "plans",
        "mutations_through_cell_are_visible",
        mutations_through_cell_are_visible(factory).await,
    ));
    results.push(TestResult::from_result(
        "plans",
        "list_plans_ordered_by_id",
        list_plans_ordered_by_id(factory).await,
    ));

    results
}

// ── Test implementations ──────────────────────────────────────────────────────

/// A registered plan is returned unchanged by `plan`.
async fn create_plan_is_readable<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.create_plan(make_plan("p1")?)
        .await
        .map_err(|e| e.to_string())?;
    let cell = s.plan("p1").await.map_err(|e| e.to_string())?;
    let plan = cell.plan();
    if plan.id() != "p1" || plan.status() != PlanStatus::Draft {
        return Err(format!(
            "expected draft plan p1, got {} ({})",
            plan.id(),
            plan.status()
        ));
    }
    if plan.steps().len() != 1 {
        return Err(format!("expected 1 step, got {}", plan.steps().len()));
    }
    Ok(())
}

async fn duplicate_plan_returns_already_exists<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.create_plan(make_plan("p1")?)
        .await
        .map_err(|e| e.to_string())?;
    match s.create_plan(make_plan("p1")?).await {
        Err(StorageError::AlreadyExists { plan_id }) if plan_id == "p1" => Ok(()),
        Err(e) => Err(format!("expected AlreadyExists, got: {e}")),
        Ok(_) => Err("expected AlreadyExists, got Ok".to_string()),
    }
}

async fn missing_plan_returns_plan_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.plan("nope").await {
        Err(StorageError::PlanNotFound { plan_id }) if plan_id == "nope" => Ok(()),
        Err(e) => Err(format!("expected PlanNotFound, got: {e}")),
        Ok(_) => Err("expected PlanNotFound, got Ok".to_string()),
    }
}

/// `plan_for_step` resolves a step id to the plan that owns it.
async fn step_lookup_finds_owning_plan<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.create_plan(make_plan("p1")?)
        .await
        .map_err(|e| e.to_string())?;
    let cell = s
        .create_plan(make_plan("p2")?)
        .await
        .map_err(|e| e.to_string())?;
    let step_id = cell.read(|p| p.steps()[0].step_id.clone());
    let owner = s
        .plan_for_step(&step_id)
        .await
        .map_err(|e| e.to_string())?;
    let owner_id = owner.read(|p| p.id().to_string());
    if owner_id != "p2" {
        return Err(format!("expected step {step_id} in p2, found in {owner_id}"));
    }
    Ok(())
}

async fn missing_step_returns_step_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.create_plan(make_plan("p1")?)
        .await
        .map_err(|e| e.to_string())?;
    match s.plan_for_step("p1.s99").await {
        Err(StorageError::StepNotFound { step_id }) if step_id == "p1.s99" => Ok(()),
        Err(e) => Err(format!("expected StepNotFound, got: {e}")),
        Ok(_) => Err("expected StepNotFound, got Ok".to_string()),
    }
}

/// An edit committed through one handle is seen through a fresh lookup.
async fn mutations_through_cell_are_visible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let cell = s
        .create_plan(make_plan("p1")?)
        .await
        .map_err(|e| e.to_string())?;
    let step_id = cell.read(|p| p.steps()[0].step_id.clone());
    cell.mutate(|p| {
        p.update_step(
            &step_id,
            StepPatch {
                expression: Some("salary * 0.2".to_string()),
                ..StepPatch::default()
            },
        )
    })
    .map_err(|e| e.to_string())?;
    s.save_plan("p1").await.map_err(|e| e.to_string())?;

    let again = s.plan("p1").await.map_err(|e| e.to_string())?;
    let expression = again.read(|p| p.steps()[0].expression.clone());
    if expression != "salary * 0.2" {
        return Err(format!("expected edited expression, got \"{expression}\""));
    }
    Ok(())
}

async fn list_plans_ordered_by_id<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for id in ["p3", "p1", "p2"] {
        s.create_plan(make_plan(id)?)
            .await
            .map_err(|e| e.to_string())?;
    }
    let ids: Vec<String> = s
        .list_plans()
        .await
        .map_err(|e| e.to_string())?
        .iter()
        .map(|p| p.id().to_string())
        .collect();
    if ids != ["p1", "p2", "p3"] {
        return Err(format!("expected [p1, p2, p3], got {ids:?}"));
    }
    Ok(())
}
