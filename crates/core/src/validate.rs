//! Scope resolution and step binding.
//!
//! `validate` checks one expression against a set of visible names.
//! `compile_step` binds a step's statements to its declared outputs, and
//! `validate_plan` walks every step in order so that each one sees only the
//! plan inputs and the outputs of strictly earlier steps.

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::{Expr, Statement};
use crate::error::{ValidationError, ValidationErrorKind};
use crate::parser::{is_keyword, parse_program};

/// Result of validating an expression against a scope.
#[derive(Debug, Clone)]
pub struct ValidExpression {
    pub statements: Vec<Statement>,
    /// Sorted, de-duplicated free variables. Assignment targets are excluded.
    pub variables: Vec<String>,
}

/// Names a step may see, and names it must not see yet.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// Plan inputs plus outputs of earlier steps.
    pub visible: BTreeSet<String>,
    /// Outputs of later steps, keyed to the step_order that produces them.
    pub later: BTreeMap<String, u32>,
}

impl Scope {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Scope {
            visible: names.into_iter().map(Into::into).collect(),
            later: BTreeMap::new(),
        }
    }
}

/// Source of one plan step, as handed to the validator.
#[derive(Debug, Clone, Copy)]
pub struct StepSource<'a> {
    pub step_order: u32,
    pub name: &'a str,
    pub expression: &'a str,
    pub outputs: &'a [String],
}

/// One declared output and the expression that computes it.
#[derive(Debug, Clone)]
pub struct OutputBinding {
    pub output: String,
    pub expr: Expr,
}

/// A step whose source has been parsed, scope-checked and bound.
#[derive(Debug, Clone)]
pub struct CompiledStep {
    pub step_order: u32,
    pub name: String,
    /// In declared-output order.
    pub bindings: Vec<OutputBinding>,
    pub variables: Vec<String>,
}

/// Whether `name` is usable as an input or output name.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !is_keyword(name)
}

/// Validate `expression` against the names in `scope`.
///
/// Fails on malformed text, unknown functions, wrong builtin arity, or the
/// first identifier (in source order) that `scope` does not contain.
pub fn validate(expression: &str, scope: &BTreeSet<String>) -> Result<ValidExpression, ValidationError> {
    let statements = parse_program(expression)?;
    let mut variables = BTreeSet::new();
    for stmt in &statements {
        check_arity(&stmt.expr)?;
        stmt.expr.try_for_each_var(&mut |name, pos| {
            if scope.contains(name) {
                Ok(())
            } else {
                Err(unknown_variable(name, pos))
            }
        })?;
        stmt.expr.collect_variables(&mut variables);
    }
    Ok(ValidExpression {
        statements,
        variables: variables.into_iter().collect(),
    })
}

/// Parse and bind one step against `scope`.
pub fn compile_step(step: StepSource<'_>, scope: &Scope) -> Result<CompiledStep, ValidationError> {
    let order = step.step_order;
    check_outputs(step, scope).map_err(|e| e.in_step(order))?;

    let statements = parse_program(step.expression).map_err(|e| e.in_step(order))?;
    let mut variables = BTreeSet::new();
    for stmt in &statements {
        check_arity(&stmt.expr).map_err(|e| e.in_step(order))?;
        stmt.expr
            .try_for_each_var(&mut |name, pos| resolve(name, pos, step, scope))
            .map_err(|e| e.in_step(order))?;
        stmt.expr.collect_variables(&mut variables);
    }

    let bindings = bind_outputs(step, statements).map_err(|e| e.in_step(order))?;
    Ok(CompiledStep {
        step_order: order,
        name: step.name.to_string(),
        bindings,
        variables: variables.into_iter().collect(),
    })
}

/// Validate a whole plan: contiguous step orders starting at 1, no output
/// shadowing, and every reference resolving to an input or an earlier output.
///
/// Returns the compiled steps sorted by step_order.
pub fn validate_plan(
    inputs: &[String],
    steps: &[StepSource<'_>],
) -> Result<Vec<CompiledStep>, ValidationError> {
    if steps.is_empty() {
        return Err(ValidationError::new(
            ValidationErrorKind::EmptyPlan,
            "plan has no steps",
        ));
    }
    let mut declared = BTreeSet::new();
    for input in inputs {
        if !is_identifier(input) {
            return Err(ValidationError::new(
                ValidationErrorKind::Syntax,
                format!("input name '{}' is not a valid identifier", input),
            )
            .with_token(input.clone()));
        }
        if !declared.insert(input.as_str()) {
            return Err(ValidationError::new(
                ValidationErrorKind::DuplicateInput,
                format!("input '{}' is declared more than once", input),
            )
            .with_token(input.clone()));
        }
    }

    let mut ordered: Vec<StepSource<'_>> = steps.to_vec();
    ordered.sort_by_key(|s| s.step_order);
    for (i, s) in ordered.iter().enumerate() {
        let expected = i as u32 + 1;
        if s.step_order != expected {
            return Err(ValidationError::new(
                ValidationErrorKind::StepOrder,
                format!(
                    "step orders must be unique and contiguous from 1: expected {}, found {} ('{}')",
                    expected, s.step_order, s.name
                ),
            )
            .in_step(s.step_order));
        }
    }

    let mut visible: BTreeSet<String> = inputs.iter().cloned().collect();
    let mut later: BTreeMap<String, u32> = BTreeMap::new();
    for s in &ordered {
        for out in s.outputs {
            if let Some(prev) = later.insert(out.clone(), s.step_order) {
                if prev != s.step_order {
                    return Err(ValidationError::new(
                        ValidationErrorKind::OutputCollision,
                        format!(
                            "output '{}' of step {} is already produced by step {}",
                            out, s.step_order, prev
                        ),
                    )
                    .with_token(out.clone())
                    .in_step(s.step_order));
                }
            }
        }
    }

    let mut compiled = Vec::with_capacity(ordered.len());
    for s in &ordered {
        for out in s.outputs {
            later.remove(out);
        }
        let scope = Scope {
            visible: visible.clone(),
            later: later.clone(),
        };
        compiled.push(compile_step(*s, &scope)?);
        visible.extend(s.outputs.iter().cloned());
    }
    Ok(compiled)
}

// ──────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────

fn unknown_variable(name: &str, pos: usize) -> ValidationError {
    ValidationError::new(
        ValidationErrorKind::UnknownVariable,
        format!("unknown variable '{}'", name),
    )
    .with_token(name)
    .at(pos)
}

fn resolve(name: &str, pos: usize, step: StepSource<'_>, scope: &Scope) -> Result<(), ValidationError> {
    if scope.visible.contains(name) {
        return Ok(());
    }
    if step.outputs.iter().any(|o| o == name) {
        return Err(ValidationError::new(
            ValidationErrorKind::ForwardReference,
            format!(
                "'{}' is an output of this step and cannot be referenced within it",
                name
            ),
        )
        .with_token(name)
        .at(pos));
    }
    if let Some(order) = scope.later.get(name) {
        return Err(ValidationError::new(
            ValidationErrorKind::ForwardReference,
            format!(
                "'{}' is produced by step {}, which runs after step {}",
                name, order, step.step_order
            ),
        )
        .with_token(name)
        .at(pos));
    }
    Err(unknown_variable(name, pos))
}

fn check_outputs(step: StepSource<'_>, scope: &Scope) -> Result<(), ValidationError> {
    if step.outputs.is_empty() {
        return Err(ValidationError::new(
            ValidationErrorKind::MissingOutput,
            format!("step '{}' declares no outputs", step.name),
        ));
    }
    let mut seen = BTreeSet::new();
    for out in step.outputs {
        if !is_identifier(out) {
            return Err(ValidationError::new(
                ValidationErrorKind::Syntax,
                format!("output name '{}' is not a valid identifier", out),
            )
            .with_token(out.clone()));
        }
        if !seen.insert(out.as_str()) {
            return Err(ValidationError::new(
                ValidationErrorKind::DuplicateOutput,
                format!("output '{}' is declared twice", out),
            )
            .with_token(out.clone()));
        }
        if scope.visible.contains(out) {
            return Err(ValidationError::new(
                ValidationErrorKind::OutputCollision,
                format!("output '{}' would shadow an input or an earlier output", out),
            )
            .with_token(out.clone()));
        }
        if let Some(order) = scope.later.get(out) {
            return Err(ValidationError::new(
                ValidationErrorKind::OutputCollision,
                format!("output '{}' is already produced by step {}", out, order),
            )
            .with_token(out.clone()));
        }
    }
    Ok(())
}

fn bind_outputs(
    step: StepSource<'_>,
    statements: Vec<Statement>,
) -> Result<Vec<OutputBinding>, ValidationError> {
    let bare = statements.iter().any(|s| s.target.is_none());
    if bare {
        if statements.len() == 1 && step.outputs.len() == 1 {
            let expr = statements.into_iter().next().map(|s| s.expr);
            return Ok(expr
                .map(|expr| OutputBinding {
                    output: step.outputs[0].clone(),
                    expr,
                })
                .into_iter()
                .collect());
        }
        return Err(ValidationError::new(
            ValidationErrorKind::MissingOutput,
            "a bare expression is only allowed when the step declares exactly one output; \
             use 'output = expression' for each output",
        ));
    }

    let mut assigned: BTreeMap<String, Expr> = BTreeMap::new();
    for stmt in statements {
        let target = stmt.target.unwrap_or_default();
        if !step.outputs.contains(&target) {
            return Err(ValidationError::new(
                ValidationErrorKind::UndeclaredOutput,
                format!("'{}' is assigned but not declared as an output", target),
            )
            .with_token(target)
            .at(stmt.pos));
        }
        if assigned.contains_key(&target) {
            return Err(ValidationError::new(
                ValidationErrorKind::DuplicateOutput,
                format!("output '{}' is assigned more than once", target),
            )
            .with_token(target)
            .at(stmt.pos));
        }
        assigned.insert(target, stmt.expr);
    }

    let mut bindings = Vec::with_capacity(step.outputs.len());
    for out in step.outputs {
        match assigned.remove(out) {
            Some(expr) => bindings.push(OutputBinding {
                output: out.clone(),
                expr,
            }),
            None => {
                return Err(ValidationError::new(
                    ValidationErrorKind::MissingOutput,
                    format!("declared output '{}' is never assigned", out),
                )
                .with_token(out.clone()))
            }
        }
    }
    Ok(bindings)
}

fn check_arity(expr: &Expr) -> Result<(), ValidationError> {
    match expr {
        Expr::Literal(_) | Expr::Var { .. } => Ok(()),
        Expr::Unary { operand, .. } => check_arity(operand),
        Expr::Binary { left, right, .. } => {
            check_arity(left)?;
            check_arity(right)
        }
        Expr::Conditional {
            cond,
            then,
            otherwise,
        } => {
            check_arity(cond)?;
            check_arity(then)?;
            check_arity(otherwise)
        }
        Expr::Call { func, args, pos } => {
            if !func.accepts(args.len()) {
                return Err(ValidationError::new(
                    ValidationErrorKind::Arity,
                    format!(
                        "{}() takes {}, got {}",
                        func.name(),
                        func.arity_label(),
                        args.len()
                    ),
                )
                .with_token(func.name())
                .at(*pos));
            }
            args.iter().try_for_each(check_arity)
        }
    }
}
