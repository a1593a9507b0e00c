use serde::{Deserialize, Serialize};

/// Category of a validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    /// Malformed expression text.
    Syntax,
    /// Identifier not in the declared scope.
    UnknownVariable,
    /// Call to a function outside the builtin set.
    UnknownFunction,
    /// Builtin called with the wrong number of arguments.
    Arity,
    /// Reference to an output of the same or a later step.
    ForwardReference,
    /// Assignment to a name the step does not declare.
    UndeclaredOutput,
    /// Declared output never assigned.
    MissingOutput,
    /// Output assigned or declared twice.
    DuplicateOutput,
    /// Output name shadows an input or an earlier output.
    OutputCollision,
    /// Input name declared twice.
    DuplicateInput,
    /// step_order values are not unique and contiguous from 1.
    StepOrder,
    /// Plan has no steps.
    EmptyPlan,
    /// Pool limit configuration does not fit the plan.
    PoolConfig,
}

impl ValidationErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationErrorKind::Syntax => "syntax",
            ValidationErrorKind::UnknownVariable => "unknown_variable",
            ValidationErrorKind::UnknownFunction => "unknown_function",
            ValidationErrorKind::Arity => "arity",
            ValidationErrorKind::ForwardReference => "forward_reference",
            ValidationErrorKind::UndeclaredOutput => "undeclared_output",
            ValidationErrorKind::MissingOutput => "missing_output",
            ValidationErrorKind::DuplicateOutput => "duplicate_output",
            ValidationErrorKind::OutputCollision => "output_collision",
            ValidationErrorKind::DuplicateInput => "duplicate_input",
            ValidationErrorKind::StepOrder => "step_order",
            ValidationErrorKind::EmptyPlan => "empty_plan",
            ValidationErrorKind::PoolConfig => "pool_config",
        }
    }
}

/// A validation error. Raised before any employee is evaluated.
///
/// `token` names the offending identifier or lexeme when there is one;
/// `position` is the character offset into the expression source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    /// Step the error belongs to, when raised by plan-level validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_order: Option<u32>,
}

impl ValidationError {
    pub fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        ValidationError {
            kind,
            message: message.into(),
            token: None,
            position: None,
            step_order: None,
        }
    }

    pub fn syntax(position: usize, message: impl Into<String>) -> Self {
        ValidationError::new(ValidationErrorKind::Syntax, message).at(position)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    pub fn in_step(mut self, step_order: u32) -> Self {
        self.step_order = Some(step_order);
        self
    }
}
