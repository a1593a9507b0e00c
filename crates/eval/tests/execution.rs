//! Batch execution integration tests.
//!
//! 1. Annual bonus scenario: tape order, capping, pool scaling
//! 2. Determinism across worker counts
//! 3. Lenient vs strict handling of a failing employee
//! 4. Cancellation
//! 5. Plans that do not validate never produce a run
//! 6. Input binding: defaults, missing attributes, bad types
//! 7. Pool scaling warnings

use std::str::FromStr;
use std::sync::Arc;

use payplan_eval::{
    execute, execute_plan, CancellationToken, EmployeeRecord, EngineError, ExecuteOptions,
    ExecutionMode, InputDecl, LockedSnapshot, NewStep, Plan, PlanCell, PoolConfig, PrecisionMode,
    RunStatus, Value, ValueType, POOL_STEP_NAME,
};
use rust_decimal::Decimal;
use serde_json::json;

fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn step(name: &str, expression: &str, outputs: &[&str]) -> NewStep {
    NewStep {
        name: name.into(),
        expression: expression.into(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        description: None,
        step_order: None,
    }
}

fn numeric_inputs(plan: &mut Plan, names: &[&str]) {
    for name in names {
        plan.add_input(InputDecl::new(*name, ValueType::Numeric))
            .unwrap();
    }
}

fn bonus_plan(pool_limit: Option<&str>) -> Plan {
    let mut plan = Plan::new("annual-2024", "Annual bonus");
    numeric_inputs(
        &mut plan,
        &[
            "salary",
            "investmentWeight",
            "investmentScore",
            "targetBonus",
            "combinedScore",
            "raf",
            "cap",
        ],
    );
    plan.create_step(step(
        "Investment component",
        "investment_component = salary * investmentWeight * investmentScore",
        &["investment_component"],
    ))
    .unwrap();
    plan.create_step(step(
        "Final bonus",
        "final_bonus = min(targetBonus * combinedScore * raf, cap)",
        &["final_bonus"],
    ))
    .unwrap();
    if let Some(limit) = pool_limit {
        plan.set_pool(Some(PoolConfig::new("final_bonus", d(limit))))
            .unwrap();
    }
    plan.approve(None).unwrap();
    plan
}

fn employee(
    employee_ref: &str,
    salary: &str,
    target: &str,
    score: &str,
    raf: &str,
    cap: &str,
) -> EmployeeRecord {
    EmployeeRecord::new(employee_ref)
        .with("salary", json!(salary))
        .with("investmentWeight", json!("0.1"))
        .with("investmentScore", json!("1.5"))
        .with("targetBonus", json!(target))
        .with("combinedScore", json!(score))
        .with("raf", json!(raf))
        .with("cap", json!(cap))
}

/// Raw final bonuses 30000, 40000 (capped from 50000) and 20000: sum 90000.
fn bonus_batch() -> Vec<EmployeeRecord> {
    vec![
        employee("E3", "50000", "20000", "1.25", "0.8", "100000"),
        employee("E1", "100000", "30000", "1", "1", "100000"),
        employee("E2", "200000", "50000", "1", "1", "40000"),
    ]
}

fn options(workers: usize) -> ExecuteOptions {
    ExecuteOptions {
        workers,
        ..ExecuteOptions::default()
    }
}

fn snapshot(plan: Plan) -> LockedSnapshot {
    LockedSnapshot::new(plan).unwrap()
}

// ──────────────────────────────────────────────
// 1. Annual bonus scenario
// ──────────────────────────────────────────────

#[test]
fn bonus_scenario_tape_and_pool_scaling() {
    let snap = snapshot(bonus_plan(Some("50000")));
    let run = execute(
        &snap,
        &bonus_batch(),
        &options(2),
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(run.status(), RunStatus::Completed);
    assert_eq!(run.total_employees(), 3);
    assert_eq!(run.succeeded(), 3);
    assert!(run.failures().is_empty());

    // Step 1 then step 2 then the pool entry, per employee, employees ascending.
    let layout: Vec<(&str, u32, &str, u32)> = run
        .tape()
        .iter()
        .map(|e| {
            (
                e.employee_ref.as_str(),
                e.step_order,
                e.output_name.as_str(),
                e.sequence_index,
            )
        })
        .collect();
    assert_eq!(
        layout,
        vec![
            ("E1", 1, "investment_component", 0),
            ("E1", 2, "final_bonus", 1),
            ("E1", 3, "pool_scaled_bonus", 2),
            ("E2", 1, "investment_component", 0),
            ("E2", 2, "final_bonus", 1),
            ("E2", 3, "pool_scaled_bonus", 2),
            ("E3", 1, "investment_component", 0),
            ("E3", 2, "final_bonus", 1),
            ("E3", 3, "pool_scaled_bonus", 2),
        ]
    );

    assert_eq!(
        run.output("E1", "investment_component"),
        Some(&Value::Numeric(d("15000.00")))
    );
    // Cap applied inside the step, before scaling.
    assert_eq!(
        run.output("E2", "final_bonus"),
        Some(&Value::Numeric(d("40000.00")))
    );

    let pool = run.pool_scaling().expect("pool result recorded");
    assert!(pool.applied);
    assert_eq!(pool.pre_scaling_total, d("90000.00"));
    assert_eq!(pool.pool_limit, d("50000"));
    assert_eq!(pool.scale_factor.round_dp(4), d("0.5556"));
    assert!(pool.scaled_total <= pool.pool_limit + pool.tolerance);

    for (employee_ref, raw) in [("E1", "30000"), ("E2", "40000"), ("E3", "20000")] {
        let scaled = run
            .output(employee_ref, "pool_scaled_bonus")
            .and_then(Value::as_decimal)
            .unwrap();
        let expected = d(raw) * pool.scale_factor;
        assert!(
            (scaled - expected).abs() <= d("0.005"),
            "{}: {} vs {}",
            employee_ref,
            scaled,
            expected
        );
    }
    let pool_entry = run.tape_for("E1").last().unwrap();
    assert_eq!(pool_entry.step_name, POOL_STEP_NAME);
    // The pre-scaling value is still on the tape.
    assert_eq!(
        run.output("E1", "final_bonus"),
        Some(&Value::Numeric(d("30000.00")))
    );
}

#[test]
fn under_limit_writes_no_pool_entries() {
    let snap = snapshot(bonus_plan(Some("100000")));
    let run = execute(
        &snap,
        &bonus_batch(),
        &options(2),
        &CancellationToken::new(),
    )
    .unwrap();
    assert!(run
        .tape()
        .iter()
        .all(|e| e.output_name != "pool_scaled_bonus"));
    let pool = run.pool_scaling().unwrap();
    assert!(!pool.applied);
    assert_eq!(pool.scale_factor, Decimal::ONE);
}

// ──────────────────────────────────────────────
// 2. Determinism
// ──────────────────────────────────────────────

#[test]
fn worker_count_does_not_change_results() {
    let snap = snapshot(bonus_plan(Some("50000")));
    let mut batch = bonus_batch();
    for i in 0..40 {
        batch.push(employee(
            &format!("X{:03}", i),
            &format!("{}", 40000 + i * 1000),
            "10000",
            "1.1",
            "0.9",
            "12000",
        ));
    }
    let single = execute(&snap, &batch, &options(1), &CancellationToken::new()).unwrap();
    let parallel = execute(&snap, &batch, &options(8), &CancellationToken::new()).unwrap();

    assert_eq!(single.snapshot_hash(), parallel.snapshot_hash());
    assert_eq!(single.results_hash(), parallel.results_hash());
    let values = |run: &payplan_eval::Run| -> Vec<(String, String, String)> {
        run.tape()
            .iter()
            .map(|e| (e.employee_ref.clone(), e.output_name.clone(), e.value.text()))
            .collect()
    };
    assert_eq!(values(&single), values(&parallel));
}

#[test]
fn repeated_execution_is_identical() {
    let snap = snapshot(bonus_plan(Some("50000")));
    let a = execute(&snap, &bonus_batch(), &options(4), &CancellationToken::new()).unwrap();
    let b = execute(&snap, &bonus_batch(), &options(4), &CancellationToken::new()).unwrap();
    assert_ne!(a.run_id(), b.run_id());
    assert_eq!(a.snapshot_hash(), b.snapshot_hash());
    assert_eq!(a.results_hash(), b.results_hash());
}

// ──────────────────────────────────────────────
// 3. Failing employees
// ──────────────────────────────────────────────

fn ratio_plan() -> Plan {
    let mut plan = Plan::new("ratio", "Ratio");
    numeric_inputs(&mut plan, &["salary", "divisor"]);
    plan.create_step(step("share", "salary / divisor", &["share"]))
        .unwrap();
    plan.create_step(step("double", "share * 2", &["doubled"]))
        .unwrap();
    plan.approve(None).unwrap();
    plan
}

fn ratio_batch() -> Vec<EmployeeRecord> {
    ["4", "0", "8", "0"]
        .iter()
        .enumerate()
        .map(|(i, divisor)| {
            EmployeeRecord::new(format!("E{}", i + 1))
                .with("salary", json!(1000))
                .with("divisor", json!(divisor))
        })
        .collect()
}

#[test]
fn lenient_mode_records_failures_and_continues() {
    let run = execute(
        &snapshot(ratio_plan()),
        &ratio_batch(),
        &options(3),
        &CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(run.status(), RunStatus::Completed);
    assert_eq!(run.succeeded(), 2);
    assert_eq!(run.failed(), 2);
    let failed: Vec<&str> = run
        .failures()
        .iter()
        .map(|f| f.employee_ref.as_str())
        .collect();
    assert_eq!(failed, ["E2", "E4"]);
    assert_eq!(run.failures()[0].step_order, 1);
    assert!(run.failures()[0].reason.contains("division by zero"));
    assert_eq!(run.tape_for("E2").count(), 0);
    assert_eq!(
        run.output("E3", "doubled"),
        Some(&Value::Numeric(d("250.00")))
    );
}

#[test]
fn strict_mode_aborts_without_partial_tape() {
    let opts = ExecuteOptions {
        mode: ExecutionMode::Strict,
        ..options(3)
    };
    for _ in 0..5 {
        let run = execute(
            &snapshot(ratio_plan()),
            &ratio_batch(),
            &opts,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.tape().is_empty());
        assert_eq!(run.failures().len(), 1);
        assert_eq!(run.failures()[0].employee_ref, "E2");
        assert!(run.pool_scaling().is_none());
    }
}

#[test]
fn all_failed_lenient_run_completes_with_warning() {
    let batch = vec![EmployeeRecord::new("E1")
        .with("salary", json!(1))
        .with("divisor", json!(0))];
    let run = execute(
        &snapshot(ratio_plan()),
        &batch,
        &options(1),
        &CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(run.status(), RunStatus::Completed);
    assert_eq!(run.succeeded(), 0);
    assert!(!run.warnings().is_empty());
}

// ──────────────────────────────────────────────
// 4. Cancellation
// ──────────────────────────────────────────────

#[test]
fn cancelled_before_start_keeps_nothing() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let run = execute(
        &snapshot(bonus_plan(Some("50000"))),
        &bonus_batch(),
        &options(2),
        &cancel,
    )
    .unwrap();
    assert_eq!(run.status(), RunStatus::Cancelled);
    assert!(run.tape().is_empty());
    assert!(run.pool_scaling().is_none());
    assert!(run.finished_at().is_some());
}

#[test]
fn cancellation_mid_run_keeps_only_completed_employees() {
    let snap = snapshot(bonus_plan(Some("1000")));
    let batch: Vec<EmployeeRecord> = (0..20_000)
        .map(|i| employee(&format!("E{:05}", i), "100000", "30000", "1", "1", "100000"))
        .collect();
    let cancel = CancellationToken::new();

    let run = std::thread::scope(|s| {
        let handle = s.spawn(|| execute(&snap, &batch, &options(1), &cancel));
        cancel.cancel();
        handle.join().unwrap()
    })
    .unwrap();

    assert_eq!(run.status(), RunStatus::Cancelled);
    assert_eq!(run.total_employees(), 20_000);
    assert!(run.succeeded() < 20_000);
    assert!(run.failures().is_empty());
    assert!(run.pool_scaling().is_none());

    // Whatever survived is complete: both steps, no pool entry.
    let grouped = run.tape_by_employee();
    assert_eq!(grouped.len(), run.succeeded());
    for entries in grouped.values() {
        let names: Vec<&str> = entries.iter().map(|e| e.output_name.as_str()).collect();
        assert_eq!(names, ["investment_component", "final_bonus"]);
    }
}

// ──────────────────────────────────────────────
// 5. Validation blocks execution
// ──────────────────────────────────────────────

#[test]
fn invalid_plan_never_starts() {
    // Deserialized plans bypass the editing checks; execution re-validates.
    let plan: Plan = serde_json::from_value(json!({
        "id": "broken",
        "name": "Broken",
        "status": "approved",
        "inputs": [{"name": "salary", "type": "numeric"}],
        "steps": [
            {"step_order": 1, "name": "bonus", "expression": "salary * bonusRate", "outputs": ["bonus"]}
        ]
    }))
    .unwrap();
    let err = execute(
        &snapshot(plan),
        &bonus_batch(),
        &options(1),
        &CancellationToken::new(),
    )
    .unwrap_err();
    match err {
        EngineError::Validation(e) => assert_eq!(e.token.as_deref(), Some("bonusRate")),
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn duplicate_employee_refs_are_rejected() {
    let batch = vec![bonus_batch()[0].clone(), bonus_batch()[0].clone()];
    assert!(matches!(
        execute(
            &snapshot(bonus_plan(None)),
            &batch,
            &options(1),
            &CancellationToken::new()
        ),
        Err(EngineError::Batch { .. })
    ));
}

#[test]
fn execute_plan_releases_the_lease() {
    let cell = Arc::new(PlanCell::new(bonus_plan(None)));
    let run = execute_plan(&cell, &bonus_batch(), &options(2), &CancellationToken::new()).unwrap();
    assert_eq!(run.plan_id(), "annual-2024");
    assert_eq!(cell.active_runs(), 0);

    let draft = Arc::new(PlanCell::new(Plan::new("d", "Draft")));
    assert!(matches!(
        execute_plan(&draft, &bonus_batch(), &options(1), &CancellationToken::new()),
        Err(EngineError::State(_))
    ));
}

// ──────────────────────────────────────────────
// 6. Input binding
// ──────────────────────────────────────────────

#[test]
fn defaults_fill_missing_attributes_and_bad_types_fail() {
    let mut plan = Plan::new("defaults", "Defaults");
    plan.add_input(InputDecl::new("salary", ValueType::Numeric))
        .unwrap();
    plan.add_input(
        InputDecl::new("raf", ValueType::Numeric).with_default(Value::Numeric(d("1"))),
    )
    .unwrap();
    plan.add_input(InputDecl::new("mrt", ValueType::Bool)).unwrap();
    plan.create_step(step(
        "bonus",
        "mrt ? min(salary * raf, 100) : salary * raf",
        &["bonus"],
    ))
    .unwrap();
    plan.approve(None).unwrap();

    let batch = vec![
        EmployeeRecord::new("A")
            .with("salary", json!(500))
            .with("mrt", json!(true)),
        EmployeeRecord::new("B")
            .with("salary", json!("500"))
            .with("raf", json!("0.5"))
            .with("mrt", json!("false")),
        EmployeeRecord::new("C")
            .with("salary", json!("lots"))
            .with("mrt", json!(false)),
        EmployeeRecord::new("D").with("salary", json!(10)),
    ];
    let run = execute(
        &snapshot(plan),
        &batch,
        &ExecuteOptions {
            precision: PrecisionMode::high(),
            ..options(2)
        },
        &CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(run.output("A", "bonus").unwrap().text(), "100.000000");
    assert_eq!(run.output("B", "bonus").unwrap().text(), "250.000000");
    let reasons: Vec<(&str, u32)> = run
        .failures()
        .iter()
        .map(|f| (f.employee_ref.as_str(), f.step_order))
        .collect();
    assert_eq!(reasons, [("C", 0), ("D", 1)]);
    assert!(run.failures()[1].reason.contains("mrt"));
}

// ──────────────────────────────────────────────
// 7. Pool warnings
// ──────────────────────────────────────────────

#[test]
fn zero_total_skips_scaling_with_warning() {
    let batch: Vec<EmployeeRecord> = bonus_batch()
        .into_iter()
        .map(|e| e.with("raf", json!(0)))
        .collect();
    let run = execute(
        &snapshot(bonus_plan(Some("50000"))),
        &batch,
        &options(2),
        &CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(run.status(), RunStatus::Completed);
    assert!(run.pool_scaling().is_none());
    assert!(run.warnings().iter().any(|w| w.contains("zero")));
}

#[test]
fn non_positive_limit_skips_scaling_with_warning() {
    let run = execute(
        &snapshot(bonus_plan(Some("0"))),
        &bonus_batch(),
        &options(2),
        &CancellationToken::new(),
    )
    .unwrap();
    assert!(run.pool_scaling().is_none());
    assert!(run.warnings().iter().any(|w| w.contains("not positive")));
}
