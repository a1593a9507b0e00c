//! Batch execution: every employee through every step, producing a sealed
//! [`Run`].
//!
//! Employees are evaluated on a bounded rayon pool. Workers share nothing
//! mutable except the strict-mode abort marker; each returns an
//! [`EmployeeOutcome`] and the calling thread folds those in ascending
//! employee_ref order, so tape order and hashes never depend on scheduling.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use payplan_core::CompiledStep;
use rayon::prelude::*;

use crate::cell::{LockedSnapshot, PlanCell};
use crate::evaluate::{evaluate_step, Environment};
use crate::numeric::PrecisionMode;
use crate::pool::{apply_pool_limit, payouts_from_tape};
use crate::snapshot::{results_hash, CanonicalSnapshot};
use crate::types::{
    EmployeeFailure, EmployeeRecord, EngineError, EvalError, ExecutionMode, Plan,
    PoolScalingResult, Run, RunStatus, TapeEntry, Value,
};

/// Step name recorded on pool-scaled tape entries.
pub const POOL_STEP_NAME: &str = "pool_scaling";

// ──────────────────────────────────────────────
// Options and cancellation
// ──────────────────────────────────────────────

/// Cooperative cancellation signal, checked before and after each employee.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub mode: ExecutionMode,
    pub precision: PrecisionMode,
    /// Worker threads; 0 is treated as 1.
    pub workers: usize,
    /// Generated when `None`.
    pub run_id: Option<String>,
    /// Caller's label for the batch, recorded on the run.
    pub batch_ref: Option<String>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        ExecuteOptions {
            mode: ExecutionMode::Lenient,
            precision: PrecisionMode::standard(),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            run_id: None,
            batch_ref: None,
        }
    }
}

pub fn new_run_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    format!("run-{:x}-{}", nanos, SEQ.fetch_add(1, Ordering::Relaxed))
}

// ──────────────────────────────────────────────
// Per-employee evaluation
// ──────────────────────────────────────────────

/// One computed output before it is placed on the tape.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub step_order: u32,
    pub step_name: String,
    pub output_name: String,
    pub value: Value,
}

/// What a worker hands back for one employee.
#[derive(Debug, Clone, PartialEq)]
pub enum EmployeeOutcome {
    Completed {
        employee_ref: String,
        outputs: Vec<StepOutput>,
    },
    Failed(EmployeeFailure),
    /// Cancelled before or during evaluation; nothing is kept.
    Discarded { employee_ref: String },
    /// Not evaluated because a canonically earlier employee failed in
    /// strict mode.
    Skipped { employee_ref: String },
}

/// Bind declared inputs from the employee's attributes, falling back to
/// defaults. Inputs with neither stay unbound and surface as
/// `MissingVariable` in the first step that reads them.
fn input_environment(plan: &Plan, employee: &EmployeeRecord) -> Result<Environment, EvalError> {
    let mut env = Environment::new();
    for input in plan.inputs() {
        match employee.attributes.get(&input.name) {
            Some(serde_json::Value::Null) | None => {
                if let Some(default) = &input.default {
                    env.insert(input.name.clone(), default.clone());
                }
            }
            Some(raw) => {
                let value = Value::from_attribute(input.value_type, raw).map_err(|message| {
                    EvalError::InvalidInput {
                        name: input.name.clone(),
                        message,
                    }
                })?;
                env.insert(input.name.clone(), value);
            }
        }
    }
    Ok(env)
}

/// Run every step for one employee, in ascending step_order.
pub fn evaluate_employee(
    plan: &Plan,
    steps: &[CompiledStep],
    employee: &EmployeeRecord,
    precision: &PrecisionMode,
) -> Result<Vec<StepOutput>, EmployeeFailure> {
    let failure = |step_order: u32, step_name: &str, err: EvalError| EmployeeFailure {
        employee_ref: employee.employee_ref.clone(),
        step_order,
        step_name: step_name.to_string(),
        reason: err.to_string(),
    };

    let mut env = input_environment(plan, employee).map_err(|e| failure(0, "inputs", e))?;
    let mut outputs = Vec::new();
    for step in steps {
        let values = evaluate_step(step, &env, precision)
            .map_err(|e| failure(step.step_order, &step.name, e))?;
        for (output_name, value) in values {
            env.insert(output_name.clone(), value.clone());
            outputs.push(StepOutput {
                step_order: step.step_order,
                step_name: step.name.clone(),
                output_name,
                value,
            });
        }
    }
    Ok(outputs)
}

fn check_batch(employees: &[EmployeeRecord]) -> Result<(), EngineError> {
    let mut seen = BTreeSet::new();
    for e in employees {
        if e.employee_ref.trim().is_empty() {
            return Err(EngineError::Batch {
                message: "employee_ref must not be empty".into(),
            });
        }
        if !seen.insert(e.employee_ref.as_str()) {
            return Err(EngineError::Batch {
                message: format!("duplicate employee_ref '{}'", e.employee_ref),
            });
        }
    }
    Ok(())
}

// ──────────────────────────────────────────────
// Execution
// ──────────────────────────────────────────────

/// Execute a frozen plan against a batch.
///
/// Fails before any employee is evaluated if the plan does not validate or
/// the batch is malformed. Evaluation errors never surface here: they are
/// recorded on the returned run.
pub fn execute(
    snapshot: &LockedSnapshot,
    employees: &[EmployeeRecord],
    options: &ExecuteOptions,
    cancel: &CancellationToken,
) -> Result<Run, EngineError> {
    let plan = snapshot.plan();
    let run_id = options.run_id.clone().unwrap_or_else(new_run_id);
    let span = tracing::info_span!("run", run_id = %run_id, plan_id = %plan.id(), plan_version = plan.version());
    let _entered = span.enter();

    let started_at = crate::now_rfc3339();
    let steps = plan.compile()?;
    check_batch(employees)?;
    let workers = options.workers.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| EngineError::WorkerPool {
            message: e.to_string(),
        })?;

    let mut ordered: Vec<&EmployeeRecord> = employees.iter().collect();
    ordered.sort_by(|a, b| a.employee_ref.cmp(&b.employee_ref));
    tracing::info!(employees = ordered.len(), workers, mode = options.mode.as_str(), precision = %options.precision.name, "run started");

    let strict = options.mode == ExecutionMode::Strict;
    // Lowest canonical index that has failed so far (strict mode only).
    // Employees after it may be skipped; employees before it never are, so
    // the reported failure does not depend on scheduling.
    let first_failure = AtomicUsize::new(usize::MAX);

    let outcomes: Vec<EmployeeOutcome> = pool.install(|| {
        ordered
            .par_iter()
            .enumerate()
            .map(|(idx, employee)| {
                let _worker = span.enter();
                let employee_ref = employee.employee_ref.clone();
                if cancel.is_cancelled() {
                    return EmployeeOutcome::Discarded { employee_ref };
                }
                if strict && idx > first_failure.load(Ordering::SeqCst) {
                    return EmployeeOutcome::Skipped { employee_ref };
                }
                let result = evaluate_employee(plan, &steps, employee, &options.precision);
                if let (true, Err(_)) = (strict, &result) {
                    first_failure.fetch_min(idx, Ordering::SeqCst);
                }
                if cancel.is_cancelled() {
                    return EmployeeOutcome::Discarded { employee_ref };
                }
                match result {
                    Ok(outputs) => EmployeeOutcome::Completed {
                        employee_ref,
                        outputs,
                    },
                    Err(failure) => EmployeeOutcome::Failed(failure),
                }
            })
            .collect()
    });

    let mut recorder = RunRecorder::new(run_id, plan, options, started_at);
    for outcome in outcomes {
        recorder.record(outcome);
    }
    Ok(recorder.seal(plan, cancel))
}

/// Take a run lease on `cell`, execute, and release the lease.
pub fn execute_plan(
    cell: &Arc<PlanCell>,
    employees: &[EmployeeRecord],
    options: &ExecuteOptions,
    cancel: &CancellationToken,
) -> Result<Run, EngineError> {
    let lease = cell.begin_run()?;
    execute(lease.snapshot(), employees, options, cancel)
}

// ──────────────────────────────────────────────
// Single-writer reduction
// ──────────────────────────────────────────────

struct RunRecorder {
    run_id: String,
    plan_id: String,
    plan_version: u32,
    precision: PrecisionMode,
    mode: ExecutionMode,
    batch_ref: Option<String>,
    started_at: String,
    canonical: CanonicalSnapshot,
    tape: BTreeMap<String, Vec<TapeEntry>>,
    failures: Vec<EmployeeFailure>,
    warnings: Vec<String>,
    total_employees: usize,
    succeeded: usize,
    discarded: usize,
}

impl RunRecorder {
    fn new(run_id: String, plan: &Plan, options: &ExecuteOptions, started_at: String) -> Self {
        RunRecorder {
            run_id,
            plan_id: plan.id().to_string(),
            plan_version: plan.version(),
            precision: options.precision.clone(),
            mode: options.mode,
            batch_ref: options.batch_ref.clone(),
            started_at,
            canonical: CanonicalSnapshot::from_plan(plan, &options.precision),
            tape: BTreeMap::new(),
            failures: Vec::new(),
            warnings: Vec::new(),
            total_employees: 0,
            succeeded: 0,
            discarded: 0,
        }
    }

    fn record(&mut self, outcome: EmployeeOutcome) {
        self.total_employees += 1;
        match outcome {
            EmployeeOutcome::Completed {
                employee_ref,
                outputs,
            } => {
                tracing::debug!(employee_ref = %employee_ref, outputs = outputs.len(), "employee completed");
                let entries = outputs
                    .into_iter()
                    .enumerate()
                    .map(|(i, o)| TapeEntry {
                        run_id: self.run_id.clone(),
                        employee_ref: employee_ref.clone(),
                        step_order: o.step_order,
                        step_name: o.step_name,
                        output_name: o.output_name,
                        value: o.value,
                        sequence_index: i as u32,
                    })
                    .collect();
                self.tape.insert(employee_ref, entries);
                self.succeeded += 1;
            }
            EmployeeOutcome::Failed(failure) => {
                tracing::warn!(employee_ref = %failure.employee_ref, step_order = failure.step_order, reason = %failure.reason, "employee failed");
                self.failures.push(failure);
            }
            EmployeeOutcome::Discarded { employee_ref } => {
                tracing::debug!(employee_ref = %employee_ref, "employee discarded after cancellation");
                self.discarded += 1;
            }
            EmployeeOutcome::Skipped { employee_ref } => {
                tracing::debug!(employee_ref = %employee_ref, "employee skipped after strict failure");
            }
        }
    }

    fn seal(mut self, plan: &Plan, cancel: &CancellationToken) -> Run {
        let status = if self.mode == ExecutionMode::Strict && !self.failures.is_empty() {
            self.failures.truncate(1);
            self.tape.clear();
            self.succeeded = 0;
            RunStatus::Failed
        } else if self.discarded > 0 || (cancel.is_cancelled() && self.total_employees == 0) {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };

        if status == RunStatus::Completed {
            if self.total_employees == 0 {
                self.warnings.push("batch is empty".to_string());
            } else if self.succeeded == 0 {
                self.warnings.push("every employee failed".to_string());
            }
        }

        let pool_scaling = if status == RunStatus::Completed {
            self.apply_pool(plan)
        } else {
            None
        };

        let tape: Vec<TapeEntry> = self.tape.into_values().flatten().collect();
        let results_hash = results_hash(&tape, &self.failures);
        let snapshot_hash = self.canonical.digest();
        let failed = self.failures.len();
        tracing::info!(
            status = status.as_str(),
            succeeded = self.succeeded,
            failed,
            snapshot_hash = %snapshot_hash,
            "run finished"
        );

        Run {
            run_id: self.run_id,
            plan_id: self.plan_id,
            plan_version: self.plan_version,
            precision: self.precision,
            mode: self.mode,
            batch_ref: self.batch_ref,
            status,
            started_at: self.started_at,
            finished_at: Some(crate::now_rfc3339()),
            snapshot_hash,
            results_hash,
            canonical: self.canonical,
            tape,
            failures: self.failures,
            pool_scaling,
            warnings: self.warnings,
            total_employees: self.total_employees,
            succeeded: self.succeeded,
            failed,
        }
    }

    /// Scale the configured payout output and append one entry per
    /// succeeded employee. Degenerate totals become warnings.
    fn apply_pool(&mut self, plan: &Plan) -> Option<PoolScalingResult> {
        let config = plan.pool()?;
        let flat: Vec<TapeEntry> = self.tape.values().flatten().cloned().collect();
        let outcome = payouts_from_tape(&flat, &config.payout_output)
            .and_then(|payouts| apply_pool_limit(&payouts, config.limit, &self.precision));
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(error = %e, "pool scaling skipped");
                self.warnings.push(e.to_string());
                return None;
            }
        };

        let pool_step = plan.steps().len() as u32 + 1;
        for (employee_ref, scaled) in &outcome.scaled {
            if let Some(entries) = self.tape.get_mut(employee_ref) {
                let sequence_index = entries.len() as u32;
                entries.push(TapeEntry {
                    run_id: self.run_id.clone(),
                    employee_ref: employee_ref.clone(),
                    step_order: pool_step,
                    step_name: POOL_STEP_NAME.to_string(),
                    output_name: config.scaled_output.clone(),
                    value: Value::Numeric(*scaled),
                    sequence_index,
                });
            }
        }
        if outcome.applied {
            tracing::info!(
                total = %outcome.pre_scaling_total,
                limit = %outcome.pool_limit,
                scale_factor = %outcome.scale_factor,
                "pool scaling applied"
            );
        }
        Some(PoolScalingResult {
            run_id: self.run_id.clone(),
            pre_scaling_total: outcome.pre_scaling_total,
            pool_limit: outcome.pool_limit,
            scale_factor: outcome.scale_factor,
            applied: outcome.applied,
            scaled_total: outcome.scaled_total,
            tolerance: outcome.tolerance,
        })
    }
}
