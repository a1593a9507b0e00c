//! Mutual exclusion between plan mutation and run execution.
//!
//! A [`PlanCell`] owns one plan. Starting a run takes a [`RunLease`] that
//! holds a frozen copy of the plan; while any lease is alive every
//! mutation through the cell fails with [`StateError::RunInProgress`],
//! whatever the plan's lifecycle status.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::{Plan, PlanError, StateError};

/// Immutable view of an executable plan, shared with the workers of one run.
#[derive(Debug, Clone)]
pub struct LockedSnapshot {
    plan: Arc<Plan>,
}

impl LockedSnapshot {
    /// Freeze `plan` for execution. Only Approved or Locked plans qualify.
    pub fn new(plan: Plan) -> Result<Self, StateError> {
        if !plan.status().is_executable() {
            return Err(StateError::NotExecutable {
                plan_id: plan.id().to_string(),
                status: plan.status(),
            });
        }
        Ok(LockedSnapshot {
            plan: Arc::new(plan),
        })
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }
}

#[derive(Debug)]
struct CellState {
    plan: Plan,
    active_runs: usize,
}

#[derive(Debug)]
pub struct PlanCell {
    state: Mutex<CellState>,
}

impl PlanCell {
    pub fn new(plan: Plan) -> Self {
        PlanCell {
            state: Mutex::new(CellState {
                plan,
                active_runs: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CellState> {
        // A panic while holding the guard cannot leave the plan half
        // edited: mutations swap in a fully built copy.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A copy of the current plan.
    pub fn plan(&self) -> Plan {
        self.lock().plan.clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&Plan) -> R) -> R {
        f(&self.lock().plan)
    }

    pub fn active_runs(&self) -> usize {
        self.lock().active_runs
    }

    /// Apply `f` to a copy of the plan and commit it only on success.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Plan) -> Result<R, PlanError>) -> Result<R, PlanError> {
        let mut state = self.lock();
        if state.active_runs > 0 {
            tracing::debug!(plan_id = %state.plan.id(), active_runs = state.active_runs, "mutation blocked by running execution");
            return Err(StateError::RunInProgress {
                plan_id: state.plan.id().to_string(),
                active_runs: state.active_runs,
            }
            .into());
        }
        let mut draft = state.plan.clone();
        let out = f(&mut draft)?;
        state.plan = draft;
        Ok(out)
    }

    /// Freeze the plan for a run and block mutation until the lease drops.
    pub fn begin_run(self: &Arc<Self>) -> Result<RunLease, StateError> {
        let mut state = self.lock();
        let snapshot = LockedSnapshot::new(state.plan.clone())?;
        state.active_runs += 1;
        Ok(RunLease {
            cell: Arc::clone(self),
            snapshot,
        })
    }
}

/// Held for the lifetime of one run.
#[derive(Debug)]
pub struct RunLease {
    cell: Arc<PlanCell>,
    snapshot: LockedSnapshot,
}

impl RunLease {
    pub fn snapshot(&self) -> &LockedSnapshot {
        &self.snapshot
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        let mut state = self.cell.lock();
        state.active_runs = state.active_runs.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::NewStep;
    use crate::types::{InputDecl, PlanStatus, ValueType};

    fn approved() -> Plan {
        let mut plan = Plan::new("p1", "Bonus");
        plan.add_input(InputDecl::new("salary", ValueType::Numeric))
            .unwrap();
        plan.create_step(NewStep {
            name: "base".into(),
            expression: "salary".into(),
            outputs: vec!["base".into()],
            description: None,
            step_order: None,
        })
        .unwrap();
        plan.approve(None).unwrap();
        plan
    }

    #[test]
    fn draft_plans_cannot_run() {
        let cell = Arc::new(PlanCell::new(Plan::new("p1", "Bonus")));
        assert!(matches!(
            cell.begin_run(),
            Err(StateError::NotExecutable {
                status: PlanStatus::Draft,
                ..
            })
        ));
    }

    #[test]
    fn lease_blocks_mutation_until_dropped() {
        let cell = Arc::new(PlanCell::new(approved()));
        let lease = cell.begin_run().unwrap();
        assert_eq!(cell.active_runs(), 1);
        let err = cell.mutate(|p| p.lock(true, None)).unwrap_err();
        assert!(matches!(
            err,
            PlanError::State(StateError::RunInProgress { active_runs: 1, .. })
        ));
        drop(lease);
        assert_eq!(cell.active_runs(), 0);
        cell.mutate(|p| p.lock(true, None)).unwrap();
        assert_eq!(cell.read(|p| p.status()), PlanStatus::Locked);
    }

    #[test]
    fn failed_mutation_leaves_plan_untouched() {
        let cell = PlanCell::new(approved());
        let before = cell.plan();
        assert!(cell.mutate(|p| p.archive(None)).is_err());
        assert_eq!(cell.plan(), before);
    }

    #[test]
    fn snapshot_is_frozen() {
        let cell = Arc::new(PlanCell::new(approved()));
        let lease = cell.begin_run().unwrap();
        let snap = lease.snapshot().clone();
        drop(lease);
        cell.mutate(|p| p.lock(true, None)).unwrap();
        assert_eq!(snap.plan().status(), PlanStatus::Approved);
    }
}
