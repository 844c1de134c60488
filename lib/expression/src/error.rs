//! Expression error types.

use std::fmt;

/// What went wrong while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionErrorKind {
    /// The expression text is malformed.
    Syntax { position: usize, message: String },
    /// A `{{` without its closing `}}`.
    UnterminatedTemplate { position: usize },
    /// A bare identifier or `$` variable that does not resolve.
    UnknownIdentifier { name: String },
    /// `$node[...]` names a node with no recorded output.
    UnknownNode { node: String },
    /// Call to a function that is not a built-in.
    UnknownFunction { name: String },
    /// A built-in received the wrong number or kind of arguments.
    InvalidArguments { function: String, message: String },
    /// An operator was applied to values it does not support.
    TypeMismatch {
        operation: String,
        left: String,
        right: String,
    },
    /// Division or remainder by zero.
    DivisionByZero,
    /// Property or index access on `null`.
    NullAccess { property: String },
    /// A numeric result overflowed or is not a number.
    NonFiniteNumber { value: String },
}

impl fmt::Display for ExpressionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax { position, message } => {
                write!(f, "syntax error at {position}: {message}")
            }
            Self::UnterminatedTemplate { position } => {
                write!(f, "unterminated '{{{{' starting at {position}")
            }
            Self::UnknownIdentifier { name } => write!(f, "unknown identifier '{name}'"),
            Self::UnknownNode { node } => write!(f, "no output recorded for node '{node}'"),
            Self::UnknownFunction { name } => write!(f, "unknown function '{name}'"),
            Self::InvalidArguments { function, message } => {
                write!(f, "invalid arguments to {function}(): {message}")
            }
            Self::TypeMismatch {
                operation,
                left,
                right,
            } => write!(f, "cannot apply '{operation}' to {left} and {right}"),
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::NullAccess { property } => {
                write!(f, "cannot read property '{property}' of null")
            }
            Self::NonFiniteNumber { value } => {
                write!(f, "numeric result {value} cannot be represented")
            }
        }
    }
}

/// A failed expression, carrying the offending source and the parameter
/// being resolved when it failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionError {
    /// The expression or template source text.
    pub expression: String,
    /// The parameter path being resolved, e.g. `fields.total`.
    pub field: Option<String>,
    /// The failure.
    pub kind: ExpressionErrorKind,
}

impl ExpressionError {
    /// Creates an error for the given source text.
    #[must_use]
    pub fn new(expression: impl Into<String>, kind: ExpressionErrorKind) -> Self {
        Self {
            expression: expression.into(),
            field: None,
            kind,
        }
    }

    /// Attaches the parameter path, keeping an already more specific one.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        if self.field.is_none() {
            self.field = Some(field.into());
        }
        self
    }
}

impl fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(
                f,
                "expression '{}' in parameter '{field}' failed: {}",
                self.expression, self.kind
            ),
            None => write!(f, "expression '{}' failed: {}", self.expression, self.kind),
        }
    }
}

impl std::error::Error for ExpressionError {}
