use std::future::Future;

use payplan_eval::Run;

use super::{make_approved_plan, make_run, TestResult};
use crate::{PlanStorage, StorageError};

pub(super) async fn run_run_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "runs",
        "inserted_run_is_readable",
        inserted_run_is_readable(factory).await,
    ));
    results.push(TestResult::from_result(
        "runs",
        "missing_run_returns_run_not_found",
        missing_run_returns_run_not_found(factory).await,
    ));
    results.push(TestResult::from_result(
        "runs",
        "second_insert_returns_run_immutable",
        second_insert_returns_run_immutable(factory).await,
    ));
    results.push(TestResult::from_result(
        "runs",
        "rejected_insert_leaves_stored_run_untouched",
        rejected_insert_leaves_stored_run_untouched(factory).await,
    ));
    results.push(TestResult::from_result(
        "runs",
        "unfinished_run_is_rejected",
        unfinished_run_is_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "runs",
        "list_runs_filters_by_plan",
        list_runs_filters_by_plan(factory).await,
    ));
    results.push(TestResult::from_result(
        "runs",
        "list_runs_limit_keeps_newest",
        list_runs_limit_keeps_newest(factory).await,
    ));

    results
}

// ── Test implementations ──────────────────────────────────────────────────────

/// A stored run reads back with the same tape and hashes.
async fn inserted_run_is_readable<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = make_run(&make_approved_plan("p1")?, "run-1")?;
    s.insert_run(run.clone()).await.map_err(|e| e.to_string())?;
    let stored = s.get_run("run-1").await.map_err(|e| e.to_string())?;
    if *stored != run {
        return Err("stored run differs from inserted run".to_string());
    }
    if stored.tape().len() != 2 {
        return Err(format!("expected 2 tape entries, got {}", stored.tape().len()));
    }
    Ok(())
}

async fn missing_run_returns_run_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.get_run("run-x").await {
        Err(StorageError::RunNotFound { run_id }) if run_id == "run-x" => Ok(()),
        Err(e) => Err(format!("expected RunNotFound, got: {e}")),
        Ok(_) => Err("expected RunNotFound, got Ok".to_string()),
    }
}

async fn second_insert_returns_run_immutable<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = make_run(&make_approved_plan("p1")?, "run-1")?;
    s.insert_run(run.clone()).await.map_err(|e| e.to_string())?;
    match s.insert_run(run).await {
        Err(StorageError::RunImmutable { run_id }) if run_id == "run-1" => Ok(()),
        Err(e) => Err(format!("expected RunImmutable, got: {e}")),
        Ok(_) => Err("expected RunImmutable, got Ok".to_string()),
    }
}

/// A different run reusing a stored id must not replace the stored one.
async fn rejected_insert_leaves_stored_run_untouched<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let first = make_run(&make_approved_plan("p1")?, "run-1")?;
    let impostor = make_run(&make_approved_plan("p2")?, "run-1")?;
    s.insert_run(first.clone())
        .await
        .map_err(|e| e.to_string())?;
    if s.insert_run(impostor).await.is_ok() {
        return Err("overwrite was accepted".to_string());
    }
    let stored = s.get_run("run-1").await.map_err(|e| e.to_string())?;
    if stored.plan_id() != "p1" || *stored != first {
        return Err(format!(
            "stored run was replaced (plan {})",
            stored.plan_id()
        ));
    }
    Ok(())
}

/// Only finished runs may be stored.
async fn unfinished_run_is_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let run = make_run(&make_approved_plan("p1")?, "run-1")?;
    let mut raw = serde_json::to_value(&run).map_err(|e| e.to_string())?;
    raw["status"] = serde_json::json!("running");
    raw["finished_at"] = serde_json::Value::Null;
    let running: Run = serde_json::from_value(raw).map_err(|e| e.to_string())?;
    match s.insert_run(running).await {
        Err(StorageError::Backend(_)) => {}
        Err(e) => return Err(format!("expected Backend error, got: {e}")),
        Ok(_) => return Err("expected Backend error, got Ok".to_string()),
    }
    match s.get_run("run-1").await {
        Err(StorageError::RunNotFound { .. }) => Ok(()),
        _ => Err("unfinished run was stored".to_string()),
    }
}

async fn list_runs_filters_by_plan<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let p1 = make_approved_plan("p1")?;
    let p2 = make_approved_plan("p2")?;
    for (plan, id) in [(&p1, "run-a"), (&p2, "run-b"), (&p1, "run-c")] {
        s.insert_run(make_run(plan, id)?)
            .await
            .map_err(|e| e.to_string())?;
    }

    let all = s.list_runs(None, 0).await.map_err(|e| e.to_string())?;
    if all.len() != 3 {
        return Err(format!("expected 3 runs, got {}", all.len()));
    }
    let ids: Vec<&str> = all.iter().map(|r| r.run_id()).collect();
    if ids != ["run-a", "run-b", "run-c"] {
        return Err(format!("expected insertion order, got {ids:?}"));
    }

    let p1_runs = s
        .list_runs(Some("p1"), 0)
        .await
        .map_err(|e| e.to_string())?;
    let ids: Vec<&str> = p1_runs.iter().map(|r| r.run_id()).collect();
    if ids != ["run-a", "run-c"] {
        return Err(format!("expected [run-a, run-c], got {ids:?}"));
    }
    Ok(())
}

async fn list_runs_limit_keeps_newest<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let plan = make_approved_plan("p1")?;
    for id in ["run-1", "run-2", "run-3"] {
        s.insert_run(make_run(&plan, id)?)
            .await
            .map_err(|e| e.to_string())?;
    }
    let runs = s.list_runs(None, 2).await.map_err(|e| e.to_string())?;
    let ids: Vec<&str> = runs.iter().map(|r| r.run_id()).collect();
    if ids != ["run-2", "run-3"] {
        return Err(format!("expected [run-2, run-3], got {ids:?}"));
    }
    Ok(())
}
