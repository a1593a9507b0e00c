//! Typed syntax tree for plan step expressions.
//!
//! Produced by the parser, checked by the validator, and walked by the
//! evaluator in `payplan-eval`. Every variable reference and call keeps the
//! character offset it came from so errors can point back into the source.

use std::collections::BTreeSet;

use rust_decimal::Decimal;

// ──────────────────────────────────────────────
// Literals and operators
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(Decimal),
    Str(String),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Neq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// The builtin function set. Anything else is rejected by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Min,
    Max,
    Clamp,
    Abs,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Builtin> {
        match name {
            "min" => Some(Builtin::Min),
            "max" => Some(Builtin::Max),
            "clamp" => Some(Builtin::Clamp),
            "abs" => Some(Builtin::Abs),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Clamp => "clamp",
            Builtin::Abs => "abs",
        }
    }

    /// Whether `n` arguments is a valid call.
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Builtin::Min | Builtin::Max => n >= 2,
            Builtin::Clamp => n == 3,
            Builtin::Abs => n == 1,
        }
    }

    /// Human-readable arity, for error messages.
    pub fn arity_label(self) -> &'static str {
        match self {
            Builtin::Min | Builtin::Max => "at least 2 arguments",
            Builtin::Clamp => "exactly 3 arguments",
            Builtin::Abs => "exactly 1 argument",
        }
    }
}

// ──────────────────────────────────────────────
// Expressions
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Var {
        name: String,
        pos: usize,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `cond ? then : otherwise`
    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call {
        func: Builtin,
        args: Vec<Expr>,
        pos: usize,
    },
}

impl Expr {
    /// Collect every referenced variable name.
    pub fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Var { name, .. } => {
                out.insert(name.clone());
            }
            Expr::Unary { operand, .. } => operand.collect_variables(out),
            Expr::Binary { left, right, .. } => {
                left.collect_variables(out);
                right.collect_variables(out);
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                cond.collect_variables(out);
                then.collect_variables(out);
                otherwise.collect_variables(out);
            }
            Expr::Call { args, .. } => {
                for a in args {
                    a.collect_variables(out);
                }
            }
        }
    }

    /// Visit variable references in source order, stopping at the first
    /// `Err` returned by `f`.
    pub fn try_for_each_var<E>(
        &self,
        f: &mut impl FnMut(&str, usize) -> Result<(), E>,
    ) -> Result<(), E> {
        match self {
            Expr::Literal(_) => Ok(()),
            Expr::Var { name, pos } => f(name, *pos),
            Expr::Unary { operand, .. } => operand.try_for_each_var(f),
            Expr::Binary { left, right, .. } => {
                left.try_for_each_var(f)?;
                right.try_for_each_var(f)
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                cond.try_for_each_var(f)?;
                then.try_for_each_var(f)?;
                otherwise.try_for_each_var(f)
            }
            Expr::Call { args, .. } => {
                for a in args {
                    a.try_for_each_var(f)?;
                }
                Ok(())
            }
        }
    }
}

// ──────────────────────────────────────────────
// Statements
// ──────────────────────────────────────────────

/// One statement of a step program: `target = expr` or a bare `expr`.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub target: Option<String>,
    pub expr: Expr,
    /// Offset of the statement's first token.
    pub pos: usize,
}
