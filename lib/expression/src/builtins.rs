//! Built-in functions callable as `name(x)` or `x.name()`.

use crate::bindings::Bindings;
use crate::error::ExpressionErrorKind;
use crate::value::{coerce_f64, display, loose_eq, number, type_name};
use serde_json::Value;

pub(crate) fn call(
    name: &str,
    args: Vec<Value>,
    bindings: &dyn Bindings,
) -> Result<Value, ExpressionErrorKind> {
    match name {
        "now" => {
            arity(name, &args, 0)?;
            Ok(Value::String(bindings.now().to_rfc3339()))
        }
        "today" => {
            arity(name, &args, 0)?;
            Ok(Value::String(bindings.now().date_naive().to_string()))
        }
        "upper" | "toUpperCase" => Ok(Value::String(string_arg(name, &args)?.to_uppercase())),
        "lower" | "toLowerCase" => Ok(Value::String(string_arg(name, &args)?.to_lowercase())),
        "trim" => Ok(Value::String(string_arg(name, &args)?.trim().to_string())),
        "length" => {
            arity(name, &args, 1)?;
            let len = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => return Err(invalid(name, format!("{} has no length", type_name(other)))),
            };
            Ok(Value::from(len))
        }
        "string" | "toString" => {
            arity(name, &args, 1)?;
            Ok(Value::String(display(&args[0])))
        }
        "number" => {
            arity(name, &args, 1)?;
            let n = coerce_f64(&args[0])
                .ok_or_else(|| invalid(name, format!("cannot convert {} to a number", args[0])))?;
            number(n)
        }
        "abs" => {
            arity(name, &args, 1)?;
            number(number_arg(name, &args[0])?.abs())
        }
        "round" => round(name, &args),
        "isEmpty" => {
            arity(name, &args, 1)?;
            let empty = match &args[0] {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::Object(o) => o.is_empty(),
                Value::Bool(_) | Value::Number(_) => false,
            };
            Ok(Value::Bool(empty))
        }
        "includes" => {
            arity(name, &args, 2)?;
            let found = match (&args[0], &args[1]) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
                (Value::Array(items), needle) => items.iter().any(|v| loose_eq(v, needle)),
                (other, _) => {
                    return Err(invalid(name, format!("cannot search in {}", type_name(other))));
                }
            };
            Ok(Value::Bool(found))
        }
        _ => Err(ExpressionErrorKind::UnknownFunction {
            name: name.to_string(),
        }),
    }
}

fn round(name: &str, args: &[Value]) -> Result<Value, ExpressionErrorKind> {
    let (value, digits) = match args {
        [value] => (value, 0),
        [value, digits] => {
            let digits = digits
                .as_u64()
                .filter(|d| *d <= 15)
                .ok_or_else(|| invalid(name, "digits must be an integer from 0 to 15".to_string()))?;
            (value, digits)
        }
        _ => return Err(invalid(name, format!("expected 1 or 2 arguments, got {}", args.len()))),
    };
    let factor = 10_f64.powi(i32::try_from(digits).unwrap_or(0));
    number((number_arg(name, value)? * factor).round() / factor)
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), ExpressionErrorKind> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(invalid(
            name,
            format!("expected {expected} argument(s), got {}", args.len()),
        ))
    }
}

fn string_arg<'a>(name: &str, args: &'a [Value]) -> Result<&'a str, ExpressionErrorKind> {
    arity(name, args, 1)?;
    args[0]
        .as_str()
        .ok_or_else(|| invalid(name, format!("expected a string, got {}", type_name(&args[0]))))
}

fn number_arg(name: &str, value: &Value) -> Result<f64, ExpressionErrorKind> {
    value
        .as_f64()
        .ok_or_else(|| invalid(name, format!("expected a number, got {}", type_name(value))))
}

fn invalid(function: &str, message: String) -> ExpressionErrorKind {
    ExpressionErrorKind::InvalidArguments {
        function: function.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::StaticBindings;
    use chrono::TimeZone;
    use serde_json::json;

    fn bindings() -> StaticBindings {
        let now = chrono::Utc
            .with_ymd_and_hms(2024, 3, 9, 15, 30, 0)
            .single()
            .expect("valid date");
        StaticBindings::new(json!({})).with_now(now)
    }

    #[test]
    fn clock_functions_use_bound_time() {
        let b = bindings();
        assert_eq!(call("today", vec![], &b).unwrap(), json!("2024-03-09"));
        assert_eq!(
            call("now", vec![], &b).unwrap(),
            json!("2024-03-09T15:30:00+00:00")
        );
    }

    #[test]
    fn string_case_and_trim() {
        let b = bindings();
        assert_eq!(call("upper", vec![json!("abc")], &b).unwrap(), json!("ABC"));
        assert_eq!(call("toLowerCase", vec![json!("AbC")], &b).unwrap(), json!("abc"));
        assert_eq!(call("trim", vec![json!("  x ")], &b).unwrap(), json!("x"));
    }

    #[test]
    fn round_with_digits() {
        let b = bindings();
        assert_eq!(call("round", vec![json!(2.346), json!(2)], &b).unwrap(), json!(2.35));
        assert_eq!(call("round", vec![json!(2.5)], &b).unwrap(), json!(3));
    }

    #[test]
    fn wrong_argument_type_is_an_error() {
        let err = call("upper", vec![json!(1)], &bindings()).unwrap_err();
        assert!(matches!(err, ExpressionErrorKind::InvalidArguments { .. }));
    }

    #[test]
    fn unknown_function_is_an_error() {
        let err = call("eval", vec![json!("1")], &bindings()).unwrap_err();
        assert_eq!(
            err,
            ExpressionErrorKind::UnknownFunction {
                name: "eval".to_string()
            }
        );
    }

    #[test]
    fn includes_and_is_empty() {
        let b = bindings();
        assert_eq!(
            call("includes", vec![json!([1, 2]), json!("2")], &b).unwrap(),
            json!(true)
        );
        assert_eq!(call("isEmpty", vec![json!({})], &b).unwrap(), json!(true));
    }
}
