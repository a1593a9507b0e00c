use std::future::Future;
use std::sync::Arc;

use payplan_eval::{PlanError, StateError};

use super::{make_approved_plan, make_plan, make_run, TestResult};
use crate::{PlanStorage, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_run_inserts_exactly_one_wins",
        concurrent_run_inserts_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_plan_creates_exactly_one_wins",
        concurrent_plan_creates_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "run_lease_blocks_mutation_across_lookups",
        run_lease_blocks_mutation_across_lookups(factory).await,
    ));

    results
}

// ── Concurrent run insert: exactly one wins ─────────────────────────────────

/// N tasks race to store a run under the same id. Exactly one succeeds; the
/// rest must get RunImmutable.
async fn concurrent_run_inserts_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let run = make_run(&make_approved_plan("p1")?, "run-1")?;

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        let run = run.clone();
        handles.push(tokio::spawn(async move {
            match s.insert_run(run).await {
                Ok(_) => Ok(true),
                Err(StorageError::RunImmutable { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    Ok(())
}

// ── Concurrent plan registration: exactly one wins ──────────────────────────

async fn concurrent_plan_creates_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let plan = make_plan("p1")?;

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        let plan = plan.clone();
        handles.push(tokio::spawn(async move {
            match s.create_plan(plan).await {
                Ok(_) => Ok(true),
                Err(StorageError::AlreadyExists { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    Ok(())
}

// ── Run lease shared through the backend ────────────────────────────────────

/// A lease taken on one lookup of a plan blocks edits made through another.
async fn run_lease_blocks_mutation_across_lookups<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.create_plan(make_approved_plan("p1")?)
        .await
        .map_err(|e| e.to_string())?;

    let runner = s.plan("p1").await.map_err(|e| e.to_string())?;
    let lease = runner.begin_run().map_err(|e| e.to_string())?;

    let editor = s.plan("p1").await.map_err(|e| e.to_string())?;
    match editor.mutate(|p| p.lock(true, None)) {
        Err(PlanError::State(StateError::RunInProgress { .. })) => {}
        Err(e) => return Err(format!("expected RunInProgress, got: {e}")),
        Ok(()) => return Err("mutation succeeded during a run".to_string()),
    }

    drop(lease);
    editor
        .mutate(|p| p.lock(true, None))
        .map_err(|e| format!("mutation after run: {e}"))?;
    Ok(())
}
