//! Plan lifecycle: Draft-only editing and the one-way
//! Draft -> Approved -> Locked -> Archived state machine.
//!
//! Every operation checks its preconditions and builds the edited plan
//! before touching `self`, so a rejected call leaves the plan unchanged.

use std::collections::{BTreeMap, BTreeSet};

use payplan_core::{
    compile_step, is_identifier, validate_plan, CompiledStep, Scope, StepSource, ValidationError,
    ValidationErrorKind,
};
use serde::{Deserialize, Serialize};

use crate::types::{
    InputDecl, LifecycleEvent, Plan, PlanError, PlanStatus, PlanStep, PoolConfig, StateError,
};

/// Fields of a step to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStep {
    pub name: String,
    pub expression: String,
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Insert position; `None` appends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_order: Option<u32>,
}

/// Partial update of an existing step. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub outputs: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
    /// Move the step to this position.
    #[serde(default)]
    pub step_order: Option<u32>,
}

impl Plan {
    fn ensure_draft(&self, action: &str) -> Result<(), StateError> {
        if self.status == PlanStatus::Draft {
            return Ok(());
        }
        tracing::debug!(plan_id = %self.id, status = %self.status, action, "rejected plan mutation");
        Err(StateError::NotDraft {
            plan_id: self.id.clone(),
            status: self.status,
            action: action.to_string(),
        })
    }

    fn touch(&mut self) {
        self.updated_at = crate::now_rfc3339();
    }

    // ── Inputs ───────────────────────────────────

    pub fn add_input(&mut self, input: InputDecl) -> Result<(), PlanError> {
        self.ensure_draft("adding an input")?;
        if !is_identifier(&input.name) {
            return Err(ValidationError::new(
                ValidationErrorKind::Syntax,
                format!("input name '{}' is not a valid identifier", input.name),
            )
            .with_token(input.name)
            .into());
        }
        if self.input(&input.name).is_some() {
            return Err(ValidationError::new(
                ValidationErrorKind::DuplicateInput,
                format!("input '{}' is already declared", input.name),
            )
            .with_token(input.name)
            .into());
        }
        if let Some(step) = self.steps.iter().find(|s| s.outputs.contains(&input.name)) {
            return Err(ValidationError::new(
                ValidationErrorKind::OutputCollision,
                format!(
                    "input '{}' collides with an output of step {}",
                    input.name, step.step_order
                ),
            )
            .with_token(input.name)
            .into());
        }
        if let Some(default) = &input.default {
            if default.value_type() != input.value_type {
                return Err(PlanError::invalid(format!(
                    "default for '{}' is {}, declared {}",
                    input.name,
                    default.value_type(),
                    input.value_type
                )));
            }
        }
        self.inputs.push(input);
        self.inputs.sort_by(|a, b| a.name.cmp(&b.name));
        self.touch();
        Ok(())
    }

    pub fn remove_input(&mut self, name: &str) -> Result<InputDecl, PlanError> {
        self.ensure_draft("removing an input")?;
        let idx = self
            .inputs
            .iter()
            .position(|i| i.name == name)
            .ok_or_else(|| PlanError::InputNotFound {
                name: name.to_string(),
            })?;
        let removed = self.inputs.remove(idx);
        self.touch();
        Ok(removed)
    }

    // ── Steps ────────────────────────────────────

    /// Insert a step, shifting later steps down. The step is validated
    /// against the scope at its target position before anything changes.
    pub fn create_step(&mut self, new: NewStep) -> Result<PlanStep, PlanError> {
        self.ensure_draft("creating a step")?;
        let len = self.steps.len() as u32;
        let order = new.step_order.unwrap_or(len + 1);
        if order == 0 || order > len + 1 {
            return Err(PlanError::invalid(format!(
                "step_order {} is out of range 1..={}",
                order,
                len + 1
            )));
        }

        let next_seq = self.next_step_seq + 1;
        let step = PlanStep {
            step_id: format!("{}.s{}", self.id, next_seq),
            step_order: order,
            name: new.name,
            expression: new.expression,
            outputs: new.outputs,
            description: new.description,
        };

        let mut candidate = self.steps.clone();
        candidate.insert(order as usize - 1, step.clone());
        renumber(&mut candidate);
        self.check_step_at(&candidate, order as usize - 1)?;

        self.steps = candidate;
        self.next_step_seq = next_seq;
        self.touch();
        tracing::debug!(plan_id = %self.id, step_id = %step.step_id, step_order = order, "step created");
        Ok(step)
    }

    pub fn update_step(&mut self, step_id: &str, patch: StepPatch) -> Result<PlanStep, PlanError> {
        self.ensure_draft("updating a step")?;
        let idx = self.step_index(step_id)?;
        let mut candidate = self.steps.clone();
        let mut step = candidate.remove(idx);
        if let Some(name) = patch.name {
            step.name = name;
        }
        if let Some(expression) = patch.expression {
            step.expression = expression;
        }
        if let Some(outputs) = patch.outputs {
            step.outputs = outputs;
        }
        if patch.description.is_some() {
            step.description = patch.description;
        }
        let len = self.steps.len() as u32;
        let order = patch.step_order.unwrap_or(step.step_order);
        if order == 0 || order > len {
            return Err(PlanError::invalid(format!(
                "step_order {} is out of range 1..={}",
                order, len
            )));
        }
        candidate.insert(order as usize - 1, step);
        renumber(&mut candidate);
        self.check_step_at(&candidate, order as usize - 1)?;

        let updated = candidate[order as usize - 1].clone();
        self.steps = candidate;
        self.touch();
        Ok(updated)
    }

    /// Remove a step and close the gap. Later steps that referenced its
    /// outputs are left for `approve` to reject.
    pub fn delete_step(&mut self, step_id: &str) -> Result<PlanStep, PlanError> {
        self.ensure_draft("deleting a step")?;
        let idx = self.step_index(step_id)?;
        let removed = self.steps.remove(idx);
        renumber(&mut self.steps);
        self.touch();
        Ok(removed)
    }

    /// Reassign step orders to follow `step_ids`, which must list every
    /// existing step exactly once.
    pub fn reorder_steps(&mut self, step_ids: &[String]) -> Result<(), PlanError> {
        self.ensure_draft("reordering steps")?;
        let existing: BTreeSet<&str> = self.steps.iter().map(|s| s.step_id.as_str()).collect();
        let requested: BTreeSet<&str> = step_ids.iter().map(String::as_str).collect();
        if step_ids.len() != self.steps.len() || existing != requested {
            return Err(PlanError::invalid(
                "reorder must list every step id exactly once",
            ));
        }
        let mut by_id: BTreeMap<&str, PlanStep> = self
            .steps
            .iter()
            .map(|s| (s.step_id.as_str(), s.clone()))
            .collect();
        let mut reordered = Vec::with_capacity(step_ids.len());
        for id in step_ids {
            if let Some(step) = by_id.remove(id.as_str()) {
                reordered.push(step);
            }
        }
        renumber(&mut reordered);
        self.steps = reordered;
        self.touch();
        Ok(())
    }

    pub fn set_pool(&mut self, pool: Option<PoolConfig>) -> Result<(), PlanError> {
        self.ensure_draft("changing the pool limit")?;
        self.pool = pool;
        self.touch();
        Ok(())
    }

    fn step_index(&self, step_id: &str) -> Result<usize, PlanError> {
        self.steps
            .iter()
            .position(|s| s.step_id == step_id)
            .ok_or_else(|| PlanError::StepNotFound {
                step_id: step_id.to_string(),
            })
    }

    fn check_step_at(&self, steps: &[PlanStep], idx: usize) -> Result<CompiledStep, PlanError> {
        let scope = scope_around(&self.inputs, steps, idx);
        let step = &steps[idx];
        Ok(compile_step(source(step), &scope)?)
    }

    // ── Validation ───────────────────────────────

    /// Names visible to an expression placed at `step_order` (inputs plus
    /// outputs of earlier steps). `None` means after the last step.
    pub fn scope_at(&self, step_order: Option<u32>) -> BTreeSet<String> {
        let limit = step_order.unwrap_or(u32::MAX);
        let mut names: BTreeSet<String> = self.inputs.iter().map(|i| i.name.clone()).collect();
        for step in self.steps.iter().filter(|s| s.step_order < limit) {
            names.extend(step.outputs.iter().cloned());
        }
        names
    }

    /// Full plan validation: ordering, scoping, output binding, pool config.
    pub fn compile(&self) -> Result<Vec<CompiledStep>, ValidationError> {
        let sources: Vec<StepSource<'_>> = self.steps.iter().map(source).collect();
        let compiled = validate_plan(&self.input_names(), &sources)?;
        if let Some(pool) = &self.pool {
            self.check_pool(pool)?;
        }
        Ok(compiled)
    }

    fn check_pool(&self, pool: &PoolConfig) -> Result<(), ValidationError> {
        let produced = |name: &str| self.steps.iter().any(|s| s.outputs.iter().any(|o| o == name));
        if !produced(&pool.payout_output) {
            return Err(ValidationError::new(
                ValidationErrorKind::PoolConfig,
                format!(
                    "pool payout output '{}' is not produced by any step",
                    pool.payout_output
                ),
            )
            .with_token(pool.payout_output.clone()));
        }
        if !is_identifier(&pool.scaled_output)
            || produced(&pool.scaled_output)
            || self.input(&pool.scaled_output).is_some()
        {
            return Err(ValidationError::new(
                ValidationErrorKind::PoolConfig,
                format!(
                    "pool scaled output '{}' must be a fresh identifier",
                    pool.scaled_output
                ),
            )
            .with_token(pool.scaled_output.clone()));
        }
        Ok(())
    }

    // ── Transitions ──────────────────────────────

    /// Draft -> Approved. Requires at least one step and a plan that
    /// validates end to end.
    pub fn approve(&mut self, notes: Option<String>) -> Result<(), PlanError> {
        self.expect_status(PlanStatus::Draft, PlanStatus::Approved)?;
        self.compile()?;
        self.transition(PlanStatus::Approved, notes);
        Ok(())
    }

    /// Approved -> Locked. Freezes steps and inputs for good.
    pub fn lock(&mut self, confirm: bool, notes: Option<String>) -> Result<(), PlanError> {
        self.expect_status(PlanStatus::Approved, PlanStatus::Locked)?;
        if !confirm {
            return Err(StateError::ConfirmationRequired {
                plan_id: self.id.clone(),
            }
            .into());
        }
        self.transition(PlanStatus::Locked, notes);
        Ok(())
    }

    /// Locked -> Archived. Terminal.
    pub fn archive(&mut self, notes: Option<String>) -> Result<(), PlanError> {
        self.expect_status(PlanStatus::Locked, PlanStatus::Archived)?;
        self.transition(PlanStatus::Archived, notes);
        Ok(())
    }

    fn expect_status(&self, from: PlanStatus, to: PlanStatus) -> Result<(), StateError> {
        if self.status == from {
            return Ok(());
        }
        Err(StateError::IllegalTransition {
            plan_id: self.id.clone(),
            from: self.status,
            to,
        })
    }

    fn transition(&mut self, to: PlanStatus, notes: Option<String>) {
        let at = crate::now_rfc3339();
        tracing::info!(plan_id = %self.id, version = self.version, from = %self.status, to = %to, "plan transition");
        self.history.push(LifecycleEvent {
            from: self.status,
            to,
            notes,
            at: at.clone(),
        });
        self.status = to;
        self.updated_at = at;
    }
}

fn source(step: &PlanStep) -> StepSource<'_> {
    StepSource {
        step_order: step.step_order,
        name: &step.name,
        expression: &step.expression,
        outputs: &step.outputs,
    }
}

fn renumber(steps: &mut [PlanStep]) {
    for (i, step) in steps.iter_mut().enumerate() {
        step.step_order = i as u32 + 1;
    }
}

/// Scope for `steps[idx]`: inputs and earlier outputs visible, later
/// outputs known but off limits.
fn scope_around(inputs: &[InputDecl], steps: &[PlanStep], idx: usize) -> Scope {
    let mut scope = Scope::from_names(inputs.iter().map(|i| i.name.clone()));
    for step in &steps[..idx] {
        scope.visible.extend(step.outputs.iter().cloned());
    }
    for step in &steps[idx + 1..] {
        for out in &step.outputs {
            scope.later.entry(out.clone()).or_insert(step.step_order);
        }
    }
    scope
}
