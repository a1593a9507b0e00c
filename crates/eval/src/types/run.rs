//! Run records: the sealed result of executing a plan against a batch.

use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use super::values::Value;
use crate::numeric::PrecisionMode;
use crate::snapshot::CanonicalSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(self) -> bool {
        self != RunStatus::Running
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an employee-level evaluation error affects the rest of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Strict,
    #[default]
    Lenient,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Strict => "strict",
            ExecutionMode::Lenient => "lenient",
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(ExecutionMode::Strict),
            "lenient" => Ok(ExecutionMode::Lenient),
            other => Err(format!(
                "unknown execution mode '{}' (expected strict or lenient)",
                other
            )),
        }
    }
}

// ──────────────────────────────────────────────
// Batch input
// ──────────────────────────────────────────────

/// One employee of a batch. Every key besides `employee_ref` is an
/// attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmployeeRecord {
    pub employee_ref: String,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

// Read as a plain map rather than through `flatten`, which buffers the
// attributes and turns JSON numbers into `f64`.
impl<'de> Deserialize<'de> for EmployeeRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut attributes = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let employee_ref = match attributes.remove("employee_ref") {
            Some(serde_json::Value::String(s)) => s,
            Some(other) => {
                return Err(D::Error::custom(format!(
                    "employee_ref must be a string, got {}",
                    other
                )))
            }
            None => return Err(D::Error::missing_field("employee_ref")),
        };
        Ok(EmployeeRecord {
            employee_ref,
            attributes,
        })
    }
}

impl EmployeeRecord {
    pub fn new(employee_ref: impl Into<String>) -> Self {
        EmployeeRecord {
            employee_ref: employee_ref.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

// ──────────────────────────────────────────────
// Run output
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeEntry {
    pub run_id: String,
    pub employee_ref: String,
    pub step_order: u32,
    pub step_name: String,
    pub output_name: String,
    pub value: Value,
    /// 0-based position within this employee's entries.
    pub sequence_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeFailure {
    pub employee_ref: String,
    pub step_order: u32,
    pub step_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolScalingResult {
    pub run_id: String,
    pub pre_scaling_total: Decimal,
    pub pool_limit: Decimal,
    /// Unrounded `limit / total`, in (0, 1].
    pub scale_factor: Decimal,
    pub applied: bool,
    pub scaled_total: Decimal,
    pub tolerance: Decimal,
}

/// One execution of a plan against a batch.
///
/// Built by the executor and sealed before it is returned; there are no
/// public mutators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub(crate) run_id: String,
    pub(crate) plan_id: String,
    pub(crate) plan_version: u32,
    pub(crate) precision: PrecisionMode,
    pub(crate) mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) batch_ref: Option<String>,
    pub(crate) status: RunStatus,
    pub(crate) started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) finished_at: Option<String>,
    pub(crate) snapshot_hash: String,
    pub(crate) results_hash: String,
    pub(crate) canonical: CanonicalSnapshot,
    pub(crate) tape: Vec<TapeEntry>,
    pub(crate) failures: Vec<EmployeeFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) pool_scaling: Option<PoolScalingResult>,
    pub(crate) warnings: Vec<String>,
    pub(crate) total_employees: usize,
    pub(crate) succeeded: usize,
    pub(crate) failed: usize,
}

impl Run {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn plan_version(&self) -> u32 {
        self.plan_version
    }

    pub fn precision(&self) -> &PrecisionMode {
        &self.precision
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn batch_ref(&self) -> Option<&str> {
        self.batch_ref.as_deref()
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn started_at(&self) -> &str {
        &self.started_at
    }

    pub fn finished_at(&self) -> Option<&str> {
        self.finished_at.as_deref()
    }

    pub fn snapshot_hash(&self) -> &str {
        &self.snapshot_hash
    }

    pub fn results_hash(&self) -> &str {
        &self.results_hash
    }

    /// Canonical plan form the snapshot hash was computed over.
    pub fn canonical(&self) -> &CanonicalSnapshot {
        &self.canonical
    }

    /// Every entry, ordered by employee_ref then sequence_index.
    pub fn tape(&self) -> &[TapeEntry] {
        &self.tape
    }

    pub fn failures(&self) -> &[EmployeeFailure] {
        &self.failures
    }

    pub fn pool_scaling(&self) -> Option<&PoolScalingResult> {
        self.pool_scaling.as_ref()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn total_employees(&self) -> usize {
        self.total_employees
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn tape_for<'a>(&'a self, employee_ref: &'a str) -> impl Iterator<Item = &'a TapeEntry> {
        self.tape.iter().filter(move |e| e.employee_ref == employee_ref)
    }

    /// Tape grouped per employee, in canonical order.
    pub fn tape_by_employee(&self) -> BTreeMap<&str, Vec<&TapeEntry>> {
        let mut grouped: BTreeMap<&str, Vec<&TapeEntry>> = BTreeMap::new();
        for entry in &self.tape {
            grouped.entry(entry.employee_ref.as_str()).or_default().push(entry);
        }
        grouped
    }

    /// The value an employee ended up with for `output_name`.
    pub fn output<'a>(&'a self, employee_ref: &'a str, output_name: &str) -> Option<&'a Value> {
        self.tape_for(employee_ref)
            .find(|e| e.output_name == output_name)
            .map(|e| &e.value)
    }
}
