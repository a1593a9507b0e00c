//! Step evaluator: walks the typed AST against a per-employee environment.
//!
//! Sub-expressions are evaluated at full decimal precision. Rounding is
//! applied once per output, by [`evaluate`] and [`evaluate_step`], never
//! inside the tree walk.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use payplan_core::{BinaryOp, Builtin, CompiledStep, Expr, Literal, UnaryOp};
use rust_decimal::Decimal;

use crate::numeric::{self, PrecisionMode};
use crate::types::{EvalError, Value};

/// Variable bindings visible to one step of one employee.
pub type Environment = BTreeMap<String, Value>;

/// Evaluate `expr` and round the result under `precision`.
pub fn evaluate(
    expr: &Expr,
    env: &Environment,
    precision: &PrecisionMode,
) -> Result<Value, EvalError> {
    let value = eval_expr(expr, env)?;
    round_output(value, precision)
}

/// Evaluate every output binding of a compiled step.
///
/// Bindings cannot see each other, so all of them read the same `env`.
/// Returns `(output_name, value)` in declared output order.
pub fn evaluate_step(
    step: &CompiledStep,
    env: &Environment,
    precision: &PrecisionMode,
) -> Result<Vec<(String, Value)>, EvalError> {
    step.bindings
        .iter()
        .map(|b| Ok((b.output.clone(), evaluate(&b.expr, env, precision)?)))
        .collect()
}

fn round_output(value: Value, precision: &PrecisionMode) -> Result<Value, EvalError> {
    match value {
        Value::Numeric(d) => precision.round(d).map(Value::Numeric),
        other => Ok(other),
    }
}

// ──────────────────────────────────────────────
// Tree walk
// ──────────────────────────────────────────────

/// Evaluate without any rounding.
pub fn eval_expr(expr: &Expr, env: &Environment) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(lit) => Ok(match lit {
            Literal::Number(d) => Value::Numeric(*d),
            Literal::Str(s) => Value::Text(s.clone()),
            Literal::Bool(b) => Value::Bool(*b),
        }),
        Expr::Var { name, .. } => env
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::MissingVariable { name: name.clone() }),
        Expr::Unary { op, operand } => {
            let v = eval_expr(operand, env)?;
            match (op, v) {
                (UnaryOp::Neg, Value::Numeric(d)) => Ok(Value::Numeric(-d)),
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnaryOp::Neg, other) => Err(mismatch(format!(
                    "cannot negate {}",
                    other.type_name()
                ))),
                (UnaryOp::Not, other) => Err(mismatch(format!(
                    "'not' needs bool, got {}",
                    other.type_name()
                ))),
            }
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, env),
        Expr::Conditional {
            cond,
            then,
            otherwise,
        } => match eval_expr(cond, env)? {
            Value::Bool(true) => eval_expr(then, env),
            Value::Bool(false) => eval_expr(otherwise, env),
            other => Err(mismatch(format!(
                "condition must be bool, got {}",
                other.type_name()
            ))),
        },
        Expr::Call { func, args, .. } => eval_call(*func, args, env),
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    env: &Environment,
) -> Result<Value, EvalError> {
    match op {
        BinaryOp::And | BinaryOp::Or => eval_logical(op, left, right, env),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (l, r) = (eval_expr(left, env)?, eval_expr(right, env)?);
            let (a, b) = numeric_pair(op, &l, &r)?;
            let result = match op {
                BinaryOp::Add => numeric::add(a, b),
                BinaryOp::Sub => numeric::sub(a, b),
                BinaryOp::Mul => numeric::mul(a, b),
                BinaryOp::Div => numeric::div(a, b),
                _ => numeric::rem(a, b),
            }?;
            Ok(Value::Numeric(result))
        }
        BinaryOp::Eq | BinaryOp::Neq => {
            let (l, r) = (eval_expr(left, env)?, eval_expr(right, env)?);
            let equal = values_equal(op, &l, &r)?;
            Ok(Value::Bool(if op == BinaryOp::Eq { equal } else { !equal }))
        }
        BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte => {
            let (l, r) = (eval_expr(left, env)?, eval_expr(right, env)?);
            let ord = order(op, &l, &r)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Lte => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
    }
}

/// `and`/`or` evaluate the right side only when it decides the result.
fn eval_logical(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    env: &Environment,
) -> Result<Value, EvalError> {
    let l = expect_bool(op, eval_expr(left, env)?)?;
    if (op == BinaryOp::And && !l) || (op == BinaryOp::Or && l) {
        return Ok(Value::Bool(l));
    }
    Ok(Value::Bool(expect_bool(op, eval_expr(right, env)?)?))
}

fn eval_call(func: Builtin, args: &[Expr], env: &Environment) -> Result<Value, EvalError> {
    if !func.accepts(args.len()) {
        return Err(EvalError::Arity {
            function: func.name().to_string(),
            expected: func.arity_label().to_string(),
            got: args.len(),
        });
    }
    let mut nums = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        match eval_expr(arg, env)? {
            Value::Numeric(d) => nums.push(d),
            other => {
                return Err(mismatch(format!(
                    "{}() argument {} must be numeric, got {}",
                    func.name(),
                    i + 1,
                    other.type_name()
                )))
            }
        }
    }
    let result = match func {
        Builtin::Min => nums.iter().copied().fold(nums[0], Decimal::min),
        Builtin::Max => nums.iter().copied().fold(nums[0], Decimal::max),
        Builtin::Abs => nums[0].abs(),
        Builtin::Clamp => {
            let (x, lo, hi) = (nums[0], nums[1], nums[2]);
            if lo > hi {
                return Err(mismatch(format!(
                    "clamp() lower bound {} exceeds upper bound {}",
                    lo, hi
                )));
            }
            x.max(lo).min(hi)
        }
    };
    Ok(Value::Numeric(result))
}

// ──────────────────────────────────────────────
// Operand checks
// ──────────────────────────────────────────────

fn mismatch(message: String) -> EvalError {
    EvalError::TypeMismatch { message }
}

fn expect_bool(op: BinaryOp, v: Value) -> Result<bool, EvalError> {
    match v {
        Value::Bool(b) => Ok(b),
        other => Err(mismatch(format!(
            "'{}' needs bool operands, got {}",
            op.symbol(),
            other.type_name()
        ))),
    }
}

fn numeric_pair(op: BinaryOp, l: &Value, r: &Value) -> Result<(Decimal, Decimal), EvalError> {
    match (l, r) {
        (Value::Numeric(a), Value::Numeric(b)) => Ok((*a, *b)),
        _ => Err(mismatch(format!(
            "'{}' needs numeric operands, got {} and {}",
            op.symbol(),
            l.type_name(),
            r.type_name()
        ))),
    }
}

fn values_equal(op: BinaryOp, l: &Value, r: &Value) -> Result<bool, EvalError> {
    match (l, r) {
        (Value::Numeric(a), Value::Numeric(b)) => Ok(numeric::compare(*a, *b) == Ordering::Equal),
        (Value::Text(a), Value::Text(b)) => Ok(a == b),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        _ => Err(mismatch(format!(
            "cannot compare {} with {} using '{}'",
            l.type_name(),
            r.type_name(),
            op.symbol()
        ))),
    }
}

fn order(op: BinaryOp, l: &Value, r: &Value) -> Result<Ordering, EvalError> {
    match (l, r) {
        (Value::Numeric(a), Value::Numeric(b)) => Ok(numeric::compare(*a, *b)),
        (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),
        _ => Err(mismatch(format!(
            "cannot order {} and {} using '{}'",
            l.type_name(),
            r.type_name(),
            op.symbol()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payplan_core::parse_expression;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn env(pairs: &[(&str, Value)]) -> Environment {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn eval_std(src: &str, env: &Environment) -> Result<Value, EvalError> {
        evaluate(
            &parse_expression(src).unwrap(),
            env,
            &PrecisionMode::standard(),
        )
    }

    #[test]
    fn arithmetic_rounds_only_at_the_end() {
        let v = eval_std("1 / 3 * 3", &Environment::new()).unwrap();
        assert_eq!(v.text(), "1.00");
    }

    #[test]
    fn capped_bonus() {
        let e = env(&[
            ("targetBonus", Value::Numeric(d("10000"))),
            ("combinedScore", Value::Numeric(d("1.2"))),
            ("raf", Value::Numeric(d("1.1"))),
            ("cap", Value::Numeric(d("12000"))),
        ]);
        let v = eval_std("min(targetBonus * combinedScore * raf, cap)", &e).unwrap();
        assert_eq!(v.text(), "12000.00");
    }

    #[test]
    fn ternary_and_logic() {
        let e = env(&[
            ("mrt", Value::Bool(true)),
            ("score", Value::Numeric(d("4"))),
        ]);
        assert_eq!(
            eval_std("mrt and score >= 3 ? 100 : 0", &e).unwrap().text(),
            "100.00"
        );
        assert_eq!(
            eval_std("not mrt || score < 1", &e).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn short_circuit_skips_failing_side() {
        let e = env(&[("flag", Value::Bool(false))]);
        assert_eq!(
            eval_std("flag and 1 / 0 > 0", &e).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn division_by_zero_fails() {
        let e = env(&[("x", Value::Numeric(d("0")))]);
        assert_eq!(eval_std("10 / x", &e), Err(EvalError::DivisionByZero));
    }

    #[test]
    fn comparing_string_to_number_is_type_mismatch() {
        let e = env(&[("dept", Value::Text("sales".into()))]);
        assert!(matches!(
            eval_std("dept == 3", &e),
            Err(EvalError::TypeMismatch { .. })
        ));
        assert_eq!(eval_std("dept == 'sales'", &e).unwrap(), Value::Bool(true));
    }

    #[test]
    fn numeric_equality_ignores_scale() {
        assert_eq!(
            eval_std("1.0 == 1", &Environment::new()).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn clamp_and_abs() {
        let e = Environment::new();
        assert_eq!(eval_std("clamp(150, 0, 100)", &e).unwrap().text(), "100.00");
        assert_eq!(eval_std("abs(-2.5)", &e).unwrap().text(), "2.50");
        assert!(eval_std("clamp(1, 5, 0)", &e).is_err());
    }

    #[test]
    fn arity_is_rechecked_for_hand_built_trees() {
        let call = Expr::Call {
            func: Builtin::Abs,
            args: vec![],
            pos: 0,
        };
        assert!(matches!(
            eval_expr(&call, &Environment::new()),
            Err(EvalError::Arity { got: 0, .. })
        ));
    }

    #[test]
    fn missing_variable_is_reported() {
        assert_eq!(
            eval_std("salary * 2", &Environment::new()),
            Err(EvalError::MissingVariable {
                name: "salary".into()
            })
        );
    }
}
