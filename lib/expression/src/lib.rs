//! The `{{ }}` expression language used in node parameters.
//!
//! Parameters may hold plain JSON, or strings containing `{{ expr }}`
//! segments. Expressions are parsed into a small AST and interpreted
//! against a [`Bindings`] implementation supplied by the caller; nothing is
//! ever handed to a host evaluator.
//!
//! ```text
//! "{{ $json.price * 2 }}"            -> 42            (typed value)
//! "Hello {{ upper($json.name) }}!"    -> "Hello ADA!"  (interpolated string)
//! "plain text"                        -> "plain text"  (passthrough)
//! ```

pub mod ast;
pub mod bindings;
mod builtins;
pub mod error;
mod eval;
mod lexer;
mod parser;
pub mod template;
mod value;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use bindings::{Bindings, StaticBindings};
pub use error::{ExpressionError, ExpressionErrorKind};
pub use template::{Expression, Template, evaluate, evaluate_condition, resolve_value};
pub use value::{display, truthy};
