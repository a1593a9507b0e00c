//! Conformance test suite for `PlanStorage` implementations.
//!
//! This module provides a backend-agnostic test suite that any `PlanStorage`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Plans**: registration, lookup by plan id and by step id, duplicates
//! - **Runs**: storage, listing, filters, immutability of finished runs
//! - **Concurrency**: racing writers and shared plan cells
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use payplan_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn sqlite_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         create_test_sqlite_storage().await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod concurrent;
mod plans;
mod runs;

use std::fmt;
use std::future::Future;

use payplan_eval::{
    execute, CancellationToken, EmployeeRecord, ExecuteOptions, InputDecl, LockedSnapshot,
    NewStep, Plan, Run, ValueType,
};
use serde_json::json;

use crate::PlanStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "plans", "runs").
    pub category: String,
    /// Test name (e.g. "create_plan_is_readable").
    pub name: String,
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: PlanStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(plans::run_plan_tests(&factory).await);
    results.extend(runs::run_run_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: fixtures with sensible defaults ─────────────────────────────────

/// A draft plan with one input and one step producing `bonus`.
fn make_plan(id: &str) -> Result<Plan, String> {
    let mut plan = Plan::new(id, "Conformance bonus");
    plan.add_input(InputDecl::new("salary", ValueType::Numeric))
        .map_err(|e| format!("add_input: {e}"))?;
    plan.create_step(NewStep {
        name: "bonus".to_string(),
        expression: "salary * 0.1".to_string(),
        outputs: vec!["bonus".to_string()],
        description: None,
        step_order: None,
    })
    .map_err(|e| format!("create_step: {e}"))?;
    Ok(plan)
}

/// An approved copy of [`make_plan`].
fn make_approved_plan(id: &str) -> Result<Plan, String> {
    let mut plan = make_plan(id)?;
    plan.approve(None).map_err(|e| format!("approve: {e}"))?;
    Ok(plan)
}

/// A finished run of an approved plan over two employees.
fn make_run(plan: &Plan, run_id: &str) -> Result<Run, String> {
    let snapshot = LockedSnapshot::new(plan.clone()).map_err(|e| format!("snapshot: {e}"))?;
    let employees = vec![
        EmployeeRecord::new("E1").with("salary", json!("1000")),
        EmployeeRecord::new("E2").with("salary", json!("2500")),
    ];
    let options = ExecuteOptions {
        workers: 1,
        run_id: Some(run_id.to_string()),
        ..ExecuteOptions::default()
    };
    execute(&snapshot, &employees, &options, &CancellationToken::new())
        .map_err(|e| format!("execute: {e}"))
}
