//! `{{ }}` templates and parameter resolution.

use crate::ast::Expr;
use crate::bindings::Bindings;
use crate::error::{ExpressionError, ExpressionErrorKind};
use crate::eval::Interpreter;
use crate::parser::parse;
use crate::value::{display, truthy};
use serde_json::{Map, Value};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// A compiled bare expression, e.g. a branch condition.
///
/// Accepts either `status == 'active'` or `{{ status == 'active' }}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parses an expression, stripping one optional `{{ }}` wrapper.
    ///
    /// # Errors
    ///
    /// Returns a syntax error carrying the source text.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let trimmed = source.trim();
        let inner = trimmed
            .strip_prefix(OPEN)
            .and_then(|s| s.strip_suffix(CLOSE))
            .unwrap_or(trimmed);
        let ast = parse(inner).map_err(|kind| ExpressionError::new(source, kind))?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Evaluates against the given bindings.
    ///
    /// # Errors
    ///
    /// Returns the evaluation failure with this expression's source.
    pub fn evaluate(&self, bindings: &dyn Bindings) -> Result<Value, ExpressionError> {
        Interpreter::new(bindings)
            .eval(&self.ast)
            .map_err(|kind| ExpressionError::new(&self.source, kind))
    }

    /// Evaluates and applies truthiness.
    ///
    /// # Errors
    ///
    /// Returns the evaluation failure with this expression's source.
    pub fn is_truthy(&self, bindings: &dyn Bindings) -> Result<bool, ExpressionError> {
        self.evaluate(bindings).map(|v| truthy(&v))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Expr(Expr),
}

/// A string parameter split into literal text and `{{ }}` segments.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Splits and parses every `{{ }}` segment.
    ///
    /// # Errors
    ///
    /// Returns an error for an unterminated `{{` or a malformed segment.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find(OPEN) {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let body_start = start + OPEN.len();
            let Some(len) = rest[body_start..].find(CLOSE) else {
                return Err(ExpressionError::new(
                    source,
                    ExpressionErrorKind::UnterminatedTemplate {
                        position: offset + start,
                    },
                ));
            };
            let body = &rest[body_start..body_start + len];
            let expr = parse(body).map_err(|kind| {
                ExpressionError::new(source, shift(kind, offset + body_start))
            })?;
            segments.push(Segment::Expr(expr));

            let consumed = body_start + len + CLOSE.len();
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// True when the template contains no `{{ }}` segment.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Text(_)))
    }

    /// Renders the template.
    ///
    /// A template that is a single expression (surrounding whitespace
    /// aside) yields that expression's typed value; anything else yields a
    /// string with each expression interpolated.
    ///
    /// # Errors
    ///
    /// Returns the first failing segment's error.
    pub fn render(&self, bindings: &dyn Bindings) -> Result<Value, ExpressionError> {
        let interpreter = Interpreter::new(bindings);
        let fail = |kind| ExpressionError::new(&self.source, kind);

        let mut exprs = self.segments.iter().filter_map(|s| match s {
            Segment::Expr(e) => Some(e),
            Segment::Text(_) => None,
        });
        let only_whitespace = self.segments.iter().all(|s| match s {
            Segment::Text(t) => t.trim().is_empty(),
            Segment::Expr(_) => true,
        });
        if let (Some(single), None) = (exprs.next(), exprs.next()) {
            if only_whitespace {
                return interpreter.eval(single).map_err(fail);
            }
        }

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr(expr) => out.push_str(&display(&interpreter.eval(expr).map_err(fail)?)),
            }
        }
        Ok(Value::String(out))
    }
}

fn shift(kind: ExpressionErrorKind, by: usize) -> ExpressionErrorKind {
    match kind {
        ExpressionErrorKind::Syntax { position, message } => ExpressionErrorKind::Syntax {
            position: position + by,
            message,
        },
        other => other,
    }
}

/// Evaluates a parameter string.
///
/// Strings without `{{` are returned unchanged.
///
/// # Errors
///
/// Returns an [`ExpressionError`] carrying the source when parsing or
/// evaluation fails.
pub fn evaluate(expression: &str, bindings: &dyn Bindings) -> Result<Value, ExpressionError> {
    if !expression.contains(OPEN) {
        return Ok(Value::String(expression.to_string()));
    }
    Template::parse(expression)?.render(bindings)
}

/// Evaluates a condition and applies truthiness.
///
/// # Errors
///
/// See [`Expression::parse`] and [`Expression::evaluate`].
pub fn evaluate_condition(source: &str, bindings: &dyn Bindings) -> Result<bool, ExpressionError> {
    Expression::parse(source)?.is_truthy(bindings)
}

/// Resolves every string inside a parameter value, recursing into arrays
/// and objects. `field` names the parameter and is extended with the nested
/// path (`headers.auth`, `items[2]`) for error reporting.
///
/// # Errors
///
/// Returns the first failing expression, with its field path attached.
pub fn resolve_value(
    value: &Value,
    field: &str,
    bindings: &dyn Bindings,
) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => evaluate(s, bindings).map_err(|e| e.with_field(field)),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| resolve_value(item, &format!("{field}[{i}]"), bindings))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => fields
            .iter()
            .map(|(key, v)| {
                resolve_value(v, &format!("{field}.{key}"), bindings).map(|r| (key.clone(), r))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        scalar => Ok(scalar.clone()),
    }
}
