//! payplan-core: expression language for compensation plan steps.
//!
//! Turns formula text into a typed syntax tree and resolves its free
//! variables against a declared scope. Nothing here evaluates; that is
//! `payplan-eval`'s job.
//!
//! # Public API
//!
//! - [`validate()`] -- parse one expression and check it against a scope
//! - [`compile_step()`] -- bind a step's statements to its declared outputs
//! - [`validate_plan()`] -- check dependency ordering across all steps
//! - [`ValidationError`] -- the single error type, with a [`ValidationErrorKind`]
//! - AST types: [`Expr`], [`Statement`], [`Literal`], [`BinaryOp`],
//!   [`UnaryOp`], [`Builtin`]

pub mod ast;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod validate;

pub use ast::{BinaryOp, Builtin, Expr, Literal, Statement, UnaryOp};
pub use error::{ValidationError, ValidationErrorKind};
pub use parser::{parse_expression, parse_program};
pub use validate::{
    compile_step, is_identifier, validate, validate_plan, CompiledStep, OutputBinding, Scope,
    StepSource, ValidExpression,
};
