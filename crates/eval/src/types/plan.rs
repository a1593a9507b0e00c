//! Plan definition: declared inputs, ordered steps, optional pool limit,
//! and lifecycle status. Editing operations live in `crate::lifecycle`.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::values::{Value, ValueType};

pub const DEFAULT_SCALED_OUTPUT: &str = "pool_scaled_bonus";

// ──────────────────────────────────────────────
// Status
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Approved,
    Locked,
    Archived,
}

impl PlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::Draft => "draft",
            PlanStatus::Approved => "approved",
            PlanStatus::Locked => "locked",
            PlanStatus::Archived => "archived",
        }
    }

    /// The only status reachable from this one, if any.
    pub fn next(self) -> Option<PlanStatus> {
        match self {
            PlanStatus::Draft => Some(PlanStatus::Approved),
            PlanStatus::Approved => Some(PlanStatus::Locked),
            PlanStatus::Locked => Some(PlanStatus::Archived),
            PlanStatus::Archived => None,
        }
    }

    pub fn is_executable(self) -> bool {
        matches!(self, PlanStatus::Approved | PlanStatus::Locked)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ──────────────────────────────────────────────
// Definition parts
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    /// Used when an employee record has no attribute of this name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl InputDecl {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        InputDecl {
            name: name.into(),
            value_type,
            default: None,
            description: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Stable across reorders. Assigned by the plan when missing.
    #[serde(default)]
    pub step_id: String,
    pub step_order: u32,
    pub name: String,
    pub expression: String,
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Funding ceiling applied after all employees are evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Step output whose per-employee values are summed and scaled.
    pub payout_output: String,
    pub limit: Decimal,
    #[serde(default = "default_scaled_output")]
    pub scaled_output: String,
}

fn default_scaled_output() -> String {
    DEFAULT_SCALED_OUTPUT.to_string()
}

impl PoolConfig {
    pub fn new(payout_output: impl Into<String>, limit: Decimal) -> Self {
        PoolConfig {
            payout_output: payout_output.into(),
            limit,
            scaled_output: default_scaled_output(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub from: PlanStatus,
    pub to: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub at: String,
}

// ──────────────────────────────────────────────
// Plan
// ──────────────────────────────────────────────

/// A versioned compensation plan.
///
/// Fields are read through accessors; every change goes through the
/// Draft-gated operations in `crate::lifecycle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub(crate) id: String,
    pub(crate) name: String,
    #[serde(default = "first_version")]
    pub(crate) version: u32,
    #[serde(default = "draft")]
    pub(crate) status: PlanStatus,
    #[serde(default)]
    pub(crate) inputs: Vec<InputDecl>,
    #[serde(default)]
    pub(crate) steps: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) pool: Option<PoolConfig>,
    #[serde(default)]
    pub(crate) history: Vec<LifecycleEvent>,
    #[serde(default)]
    pub(crate) next_step_seq: u32,
    #[serde(default)]
    pub(crate) created_at: String,
    #[serde(default)]
    pub(crate) updated_at: String,
}

fn first_version() -> u32 {
    1
}

fn draft() -> PlanStatus {
    PlanStatus::Draft
}

impl Plan {
    /// A fresh, empty Draft at version 1.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = crate::now_rfc3339();
        Plan {
            id: id.into(),
            name: name.into(),
            version: 1,
            status: PlanStatus::Draft,
            inputs: Vec::new(),
            steps: Vec::new(),
            pool: None,
            history: Vec::new(),
            next_step_seq: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn status(&self) -> PlanStatus {
        self.status
    }

    pub fn inputs(&self) -> &[InputDecl] {
        &self.inputs
    }

    pub fn input(&self, name: &str) -> Option<&InputDecl> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Steps in ascending step_order.
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn step(&self, step_id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn pool(&self) -> Option<&PoolConfig> {
        self.pool.as_ref()
    }

    pub fn history(&self) -> &[LifecycleEvent] {
        &self.history
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn updated_at(&self) -> &str {
        &self.updated_at
    }

    /// Names of all declared inputs.
    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|i| i.name.clone()).collect()
    }

    /// Bring a deserialized plan into canonical shape: steps sorted by
    /// order, missing step ids assigned, the id counter past every id.
    pub fn normalize(&mut self) {
        self.steps.sort_by_key(|s| s.step_order);
        let prefix = format!("{}.s", self.id);
        let max_seen = self
            .steps
            .iter()
            .filter_map(|s| s.step_id.strip_prefix(&prefix))
            .filter_map(|n| n.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        self.next_step_seq = self.next_step_seq.max(max_seen);
        for i in 0..self.steps.len() {
            if self.steps[i].step_id.is_empty() {
                self.steps[i].step_id = self.allocate_step_id();
            }
        }
        if self.created_at.is_empty() {
            self.created_at = crate::now_rfc3339();
        }
        if self.updated_at.is_empty() {
            self.updated_at = self.created_at.clone();
        }
    }

    pub(crate) fn allocate_step_id(&mut self) -> String {
        self.next_step_seq += 1;
        format!("{}.s{}", self.id, self.next_step_seq)
    }

    /// Clone this plan into a new Draft with the next version number.
    ///
    /// Only plans that have left Draft can be versioned; a Draft is edited
    /// in place instead.
    pub fn next_version(&self, new_id: impl Into<String>) -> Option<Plan> {
        if self.status == PlanStatus::Draft {
            return None;
        }
        let new_id = new_id.into();
        let now = crate::now_rfc3339();
        let mut next = Plan {
            id: new_id,
            name: self.name.clone(),
            version: self.version + 1,
            status: PlanStatus::Draft,
            inputs: self.inputs.clone(),
            steps: self.steps.clone(),
            pool: self.pool.clone(),
            history: Vec::new(),
            next_step_seq: 0,
            created_at: now.clone(),
            updated_at: now,
        };
        for step in &mut next.steps {
            step.step_id.clear();
        }
        next.normalize();
        Some(next)
    }
}
