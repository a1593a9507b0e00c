//! Snapshot hashing and reproducibility verification.
//!
//! A plan plus a precision mode is flattened into a key-sorted map of
//! field path to canonical text. The digest is SHA-256 over the compact
//! JSON form of that map. Volatile fields (ids, names, version, status,
//! history, timestamps, descriptions) are never part of it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::numeric::PrecisionMode;
use crate::types::{EmployeeFailure, Plan, TapeEntry, Value};

pub const SNAPSHOT_FORMAT: &str = "payplan-snapshot/1";

/// Canonical, hashable form of a plan definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalSnapshot {
    fields: BTreeMap<String, String>,
}

impl CanonicalSnapshot {
    pub fn from_plan(plan: &Plan, precision: &PrecisionMode) -> Self {
        let mut fields = BTreeMap::new();
        let mut put = |key: String, value: String| {
            fields.insert(key, value);
        };

        put("format".into(), SNAPSHOT_FORMAT.into());
        put("precision.name".into(), precision.name.clone());
        put("precision.scale".into(), precision.scale.to_string());
        put("precision.rounding".into(), precision.rounding.as_str().into());

        for input in plan.inputs() {
            put(
                format!("inputs.{}.type", input.name),
                input.value_type.as_str().into(),
            );
            if let Some(default) = &input.default {
                put(format!("inputs.{}.default", input.name), canonical_value(default));
            }
        }

        for step in plan.steps() {
            let key = |field: &str| format!("steps.{:04}.{}", step.step_order, field);
            put(key("name"), step.name.clone());
            put(key("expression"), step.expression.trim().to_string());
            put(key("outputs"), step.outputs.join(","));
        }

        if let Some(pool) = plan.pool() {
            put("pool.payout_output".into(), pool.payout_output.clone());
            put("pool.limit".into(), pool.limit.normalize().to_string());
            put("pool.scaled_output".into(), pool.scaled_output.clone());
        }

        CanonicalSnapshot { fields }
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Compact JSON, keys in ascending byte order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let map: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        serde_json::Value::Object(map).to_string().into_bytes()
    }

    pub fn digest(&self) -> String {
        format!("{:x}", Sha256::digest(self.to_bytes()))
    }

    /// Fields whose canonical text differs, including fields present on
    /// only one side. `self` is the expected form.
    pub fn diff(&self, current: &CanonicalSnapshot) -> Vec<FieldDifference> {
        let keys: BTreeSet<&String> = self.fields.keys().chain(current.fields.keys()).collect();
        keys.into_iter()
            .filter_map(|k| {
                let expected = self.fields.get(k);
                let now = current.fields.get(k);
                (expected != now).then(|| FieldDifference {
                    field: k.clone(),
                    expected: expected.cloned(),
                    current: now.cloned(),
                })
            })
            .collect()
    }
}

fn canonical_value(v: &Value) -> String {
    match v {
        Value::Numeric(d) => format!("numeric:{}", d.normalize()),
        other => format!("{}:{}", other.type_name(), other.text()),
    }
}

/// Digest of a plan definition under a precision mode.
pub fn hash(plan: &Plan, precision: &PrecisionMode) -> String {
    CanonicalSnapshot::from_plan(plan, precision).digest()
}

// ──────────────────────────────────────────────
// Verification
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDifference {
    pub field: String,
    pub expected: Option<String>,
    pub current: Option<String>,
}

/// Outcome of a reproducibility check. A mismatch is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReproducibilityReport {
    pub is_reproducible: bool,
    pub current_hash: String,
    pub expected_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub differences: Option<Vec<FieldDifference>>,
}

impl ReproducibilityReport {
    /// Step orders with at least one differing field.
    pub fn changed_steps(&self) -> Vec<u32> {
        let mut orders: Vec<u32> = self
            .differences
            .iter()
            .flatten()
            .filter_map(|d| d.field.strip_prefix("steps."))
            .filter_map(|rest| rest.split('.').next())
            .filter_map(|n| n.parse().ok())
            .collect();
        orders.dedup();
        orders
    }
}

/// Recompute the digest of `current` under `precision` and compare it with
/// `expected_hash`.
///
/// Field-level differences need the canonical form the expected hash was
/// computed from; pass it as `recorded` when it is known (e.g. from a
/// stored run). Without it `differences` is `None`.
pub fn verify(
    current: &Plan,
    precision: &PrecisionMode,
    expected_hash: &str,
    recorded: Option<&CanonicalSnapshot>,
) -> ReproducibilityReport {
    let canonical = CanonicalSnapshot::from_plan(current, precision);
    let current_hash = canonical.digest();
    let is_reproducible = current_hash.eq_ignore_ascii_case(expected_hash.trim());
    let differences = if is_reproducible {
        None
    } else {
        recorded
            .filter(|r| r.digest().eq_ignore_ascii_case(expected_hash.trim()))
            .map(|r| r.diff(&canonical))
    };
    if !is_reproducible {
        tracing::info!(plan_id = %current.id(), expected = %expected_hash, current = %current_hash, "snapshot hash mismatch");
    }
    ReproducibilityReport {
        is_reproducible,
        current_hash,
        expected_hash: expected_hash.trim().to_lowercase(),
        differences,
    }
}

// ──────────────────────────────────────────────
// Results digest
// ──────────────────────────────────────────────

/// Digest of a run's outputs. Run ids and timestamps are excluded, so two
/// runs with identical results share it.
pub fn results_hash(tape: &[TapeEntry], failures: &[EmployeeFailure]) -> String {
    let tape: Vec<serde_json::Value> = tape
        .iter()
        .map(|e| {
            json!({
                "employee_ref": e.employee_ref,
                "step_order": e.step_order,
                "output_name": e.output_name,
                "value": e.value.text(),
                "type": e.value.type_name(),
                "sequence_index": e.sequence_index,
            })
        })
        .collect();
    let failures: Vec<serde_json::Value> = failures
        .iter()
        .map(|f| {
            json!({
                "employee_ref": f.employee_ref,
                "step_order": f.step_order,
                "reason": f.reason,
            })
        })
        .collect();
    let canonical = json!({ "tape": tape, "failures": failures });
    format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
}
