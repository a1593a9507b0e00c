//! Proportional payout reduction under a funding ceiling.
//!
//! Operates on already-capped step outputs. Caps inside the plan are never
//! re-evaluated after scaling.

use rust_decimal::Decimal;

use crate::numeric::{self, PrecisionMode};
use crate::types::{PoolScalingError, TapeEntry, Value};

/// Computed scaling for a batch, before it is written to a tape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolScalingOutcome {
    pub pre_scaling_total: Decimal,
    pub pool_limit: Decimal,
    pub scale_factor: Decimal,
    pub applied: bool,
    /// `(employee_ref, scaled payout)`, empty when not applied.
    pub scaled: Vec<(String, Decimal)>,
    pub scaled_total: Decimal,
    pub tolerance: Decimal,
}

/// Scale `payouts` down so their sum fits under `limit`.
///
/// Payouts summing to at most `limit` are left alone (`applied = false`,
/// factor 1). Otherwise every payout becomes `round(raw * limit / total)`
/// under `precision`; the factor itself is never rounded.
pub fn apply_pool_limit(
    payouts: &[(String, Decimal)],
    limit: Decimal,
    precision: &PrecisionMode,
) -> Result<PoolScalingOutcome, PoolScalingError> {
    if limit <= Decimal::ZERO {
        return Err(PoolScalingError::NonPositiveLimit { limit });
    }
    let total = payouts
        .iter()
        .try_fold(Decimal::ZERO, |acc, (_, p)| numeric::add(acc, *p))
        .map_err(|_| PoolScalingError::Overflow)?;
    if total.is_zero() {
        return Err(PoolScalingError::ZeroTotal);
    }

    if total <= limit {
        return Ok(PoolScalingOutcome {
            pre_scaling_total: total,
            pool_limit: limit,
            scale_factor: Decimal::ONE,
            applied: false,
            scaled: Vec::new(),
            scaled_total: total,
            tolerance: Decimal::ZERO,
        });
    }

    let scale_factor = numeric::div(limit, total)
        .map_err(|_| PoolScalingError::Overflow)?
        .min(Decimal::ONE);
    let mut scaled = Vec::with_capacity(payouts.len());
    let mut scaled_total = Decimal::ZERO;
    for (employee_ref, raw) in payouts {
        let value = numeric::mul(*raw, scale_factor)
            .and_then(|v| precision.round(v))
            .map_err(|_| PoolScalingError::Overflow)?;
        scaled_total = numeric::add(scaled_total, value).map_err(|_| PoolScalingError::Overflow)?;
        scaled.push((employee_ref.clone(), value));
    }
    let tolerance = precision.unit() * Decimal::from(scaled.len() as u64);

    Ok(PoolScalingOutcome {
        pre_scaling_total: total,
        pool_limit: limit,
        scale_factor,
        applied: true,
        scaled,
        scaled_total,
        tolerance,
    })
}

/// Collect the numeric `output` of every employee from a tape.
pub fn payouts_from_tape(
    tape: &[TapeEntry],
    output: &str,
) -> Result<Vec<(String, Decimal)>, PoolScalingError> {
    tape.iter()
        .filter(|e| e.output_name == output)
        .map(|e| match &e.value {
            Value::Numeric(d) => Ok((e.employee_ref.clone(), *d)),
            _ => Err(PoolScalingError::NonNumericPayout {
                employee_ref: e.employee_ref.clone(),
                output: output.to_string(),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn payouts(values: &[&str]) -> Vec<(String, Decimal)> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("E{}", i + 1), d(v)))
            .collect()
    }

    #[test]
    fn scales_proportionally_over_limit() {
        let p = payouts(&["30000", "40000", "20000"]);
        let out = apply_pool_limit(&p, d("50000"), &PrecisionMode::standard()).unwrap();
        assert!(out.applied);
        assert_eq!(out.pre_scaling_total, d("90000"));
        assert_eq!(
            PrecisionMode::new("f", 4, crate::numeric::Rounding::HalfEven)
                .unwrap()
                .format(out.scale_factor)
                .unwrap(),
            "0.5556"
        );
        assert_eq!(out.scaled[0], ("E1".to_string(), d("16666.67")));
        assert_eq!(out.scaled[1], ("E2".to_string(), d("22222.22")));
        assert_eq!(out.scaled[2], ("E3".to_string(), d("11111.11")));
        assert!(out.scaled_total <= out.pool_limit + out.tolerance);
        assert!((out.scaled_total - out.pool_limit).abs() <= out.tolerance);
    }

    #[test]
    fn under_limit_is_a_no_op() {
        let p = payouts(&["100", "200"]);
        let out = apply_pool_limit(&p, d("300"), &PrecisionMode::standard()).unwrap();
        assert!(!out.applied);
        assert_eq!(out.scale_factor, Decimal::ONE);
        assert!(out.scaled.is_empty());
    }

    #[test]
    fn degenerate_inputs_are_errors() {
        let m = PrecisionMode::standard();
        assert_eq!(
            apply_pool_limit(&payouts(&["0", "0"]), d("10"), &m),
            Err(PoolScalingError::ZeroTotal)
        );
        assert!(matches!(
            apply_pool_limit(&payouts(&["5"]), d("0"), &m),
            Err(PoolScalingError::NonPositiveLimit { .. })
        ));
        assert_eq!(
            apply_pool_limit(&[], d("10"), &m),
            Err(PoolScalingError::ZeroTotal)
        );
    }
}
