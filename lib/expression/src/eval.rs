//! Tree-walking interpreter.

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::bindings::Bindings;
use crate::builtins;
use crate::error::ExpressionErrorKind;
use crate::value::{coerce_f64, display, loose_eq, number, strict_eq, truthy, type_name};
use serde_json::{Map, Value};

pub(crate) struct Interpreter<'a> {
    bindings: &'a dyn Bindings,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(bindings: &'a dyn Bindings) -> Self {
        Self { bindings }
    }

    pub(crate) fn eval(&self, expr: &Expr) -> Result<Value, ExpressionErrorKind> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Array(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Identifier(name) => self.identifier(name),
            Expr::Member { object, property } => {
                if is_node_root(object) {
                    return self.node(property);
                }
                let object = self.eval(object)?;
                member(&object, property)
            }
            Expr::Index { object, index } => {
                let index = self.eval(index)?;
                if is_node_root(object) {
                    return self.node(&display(&index));
                }
                let object = self.eval(object)?;
                subscript(&object, &index)
            }
            Expr::Call { function, args } => {
                let args = self.eval_all(args)?;
                if function == "$" {
                    return match args.as_slice() {
                        [Value::String(node)] => self.node(node),
                        _ => Err(ExpressionErrorKind::InvalidArguments {
                            function: "$".to_string(),
                            message: "expected a node id".to_string(),
                        }),
                    };
                }
                builtins::call(function, args, self.bindings)
            }
            Expr::MethodCall {
                receiver,
                method,
                args,
            } => {
                let mut all = vec![self.eval(receiver)?];
                all.extend(self.eval_all(args)?);
                builtins::call(method, all, self.bindings)
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnaryOp::Negate => {
                        let n = value.as_f64().ok_or_else(|| ExpressionErrorKind::TypeMismatch {
                            operation: "-".to_string(),
                            left: type_name(&value).to_string(),
                            right: String::new(),
                        })?;
                        number(-n)
                    }
                }
            }
            Expr::Binary { op, left, right } => self.binary(*op, left, right),
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if truthy(&self.eval(test)?) {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
        }
    }

    fn eval_all(&self, exprs: &[Expr]) -> Result<Vec<Value>, ExpressionErrorKind> {
        exprs.iter().map(|e| self.eval(e)).collect()
    }

    fn identifier(&self, name: &str) -> Result<Value, ExpressionErrorKind> {
        let b = self.bindings;
        match name {
            "$json" => Ok(b.item().clone()),
            "$item" | "$itemIndex" => Ok(Value::from(b.item_index())),
            "$vars" => Ok(Value::Object(b.variables().clone())),
            "$now" => builtins::call("now", Vec::new(), b),
            "$today" => builtins::call("today", Vec::new(), b),
            "$iteration" => b
                .iteration()
                .map(Value::from)
                .ok_or_else(|| unknown(name)),
            _ => match b.item() {
                Value::Object(fields) if !name.starts_with('$') => {
                    fields.get(name).cloned().ok_or_else(|| unknown(name))
                }
                _ => Err(unknown(name)),
            },
        }
    }

    fn node(&self, node: &str) -> Result<Value, ExpressionErrorKind> {
        let items = self
            .bindings
            .node_output(node)
            .ok_or_else(|| ExpressionErrorKind::UnknownNode {
                node: node.to_string(),
            })?;
        let mut view = Map::new();
        view.insert(
            "json".to_string(),
            items.first().cloned().unwrap_or(Value::Null),
        );
        view.insert("items".to_string(), Value::Array(items));
        Ok(Value::Object(view))
    }

    fn binary(&self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Value, ExpressionErrorKind> {
        let left = self.eval(left)?;
        match op {
            BinaryOp::And if !truthy(&left) => return Ok(left),
            BinaryOp::Or if truthy(&left) => return Ok(left),
            BinaryOp::And | BinaryOp::Or => return self.eval(right),
            _ => {}
        }
        let right = self.eval(right)?;

        match op {
            BinaryOp::Equal => Ok(Value::Bool(loose_eq(&left, &right))),
            BinaryOp::NotEqual => Ok(Value::Bool(!loose_eq(&left, &right))),
            BinaryOp::StrictEqual => Ok(Value::Bool(strict_eq(&left, &right))),
            BinaryOp::StrictNotEqual => Ok(Value::Bool(!strict_eq(&left, &right))),
            BinaryOp::Add if left.is_string() || right.is_string() => {
                Ok(Value::String(display(&left) + &display(&right)))
            }
            BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => {
                compare(op, &left, &right)
            }
            _ => arithmetic(op, &left, &right),
        }
    }
}

fn is_node_root(expr: &Expr) -> bool {
    matches!(expr, Expr::Identifier(name) if name == "$node")
}

fn unknown(name: &str) -> ExpressionErrorKind {
    ExpressionErrorKind::UnknownIdentifier {
        name: name.to_string(),
    }
}

fn member(object: &Value, property: &str) -> Result<Value, ExpressionErrorKind> {
    match object {
        Value::Null => Err(ExpressionErrorKind::NullAccess {
            property: property.to_string(),
        }),
        Value::Object(fields) => Ok(fields.get(property).cloned().unwrap_or(Value::Null)),
        Value::Array(items) if property == "length" => Ok(Value::from(items.len())),
        Value::String(s) if property == "length" => Ok(Value::from(s.chars().count())),
        _ => Ok(Value::Null),
    }
}

fn subscript(object: &Value, index: &Value) -> Result<Value, ExpressionErrorKind> {
    match (object, index) {
        (Value::Null, _) => Err(ExpressionErrorKind::NullAccess {
            property: display(index),
        }),
        (Value::Array(items), Value::Number(n)) => Ok(n
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or(Value::Null)),
        (Value::String(s), Value::Number(n)) => Ok(n
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| s.chars().nth(i))
            .map_or(Value::Null, |c| Value::String(c.to_string()))),
        (other, key) => member(other, &display(key)),
    }
}

/// Relational comparison. Two strings compare lexically; other scalars are
/// coerced to numbers, and a value with no numeric form (`'abc'`) compares
/// false against everything. Arrays and objects are rejected.
fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExpressionErrorKind> {
    let ordering = match (left, right) {
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
            return Err(mismatch(op, left, right));
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => match (coerce_f64(left), coerce_f64(right)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    let result = match op {
        BinaryOp::Less => ordering.is_lt(),
        BinaryOp::LessEqual => ordering.is_le(),
        BinaryOp::Greater => ordering.is_gt(),
        _ => ordering.is_ge(),
    };
    Ok(Value::Bool(result))
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExpressionErrorKind> {
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(mismatch(op, left, right));
    };
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Subtract => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide | BinaryOp::Remainder if b == 0.0 => {
            return Err(ExpressionErrorKind::DivisionByZero);
        }
        BinaryOp::Divide => a / b,
        BinaryOp::Remainder => a % b,
        _ => return Err(mismatch(op, left, right)),
    };
    number(result)
}

fn mismatch(op: BinaryOp, left: &Value, right: &Value) -> ExpressionErrorKind {
    ExpressionErrorKind::TypeMismatch {
        operation: op.symbol().to_string(),
        left: type_name(left).to_string(),
        right: type_name(right).to_string(),
    }
}
