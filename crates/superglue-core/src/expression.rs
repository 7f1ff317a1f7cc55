// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A small JSONata-flavored expression language used for `inputMapping`,
//! `responseMapping`, `finalTransform`, and `stopCondition`.
//!
//! This is not a full JSONata implementation — just enough of its surface
//! (path navigation, object/array construction, comparisons, a ternary, and
//! a handful of `$`-prefixed built-ins) to express the mappings this engine
//! needs. Expressions are compiled once into an AST and can be evaluated
//! repeatedly against different contexts.

use crate::error::{OrchestratorError, Result};
use serde_json::{Map, Value};
use std::time::Duration;

mod lexer;
mod parser;

pub use parser::Expr;

/// A compiled expression, ready to evaluate against a JSON context.
#[derive(Debug, Clone)]
pub struct Expression {
    ast: Expr,
}

impl Expression {
    /// Compiles a JSONata-style expression string.
    pub fn compile(source: &str) -> Result<Self> {
        let tokens = lexer::tokenize(source)
            .map_err(|e| OrchestratorError::ExpressionError(format!("lex error: {e}")))?;
        let ast = parser::parse(&tokens)
            .map_err(|e| OrchestratorError::ExpressionError(format!("parse error: {e}")))?;
        Ok(Self { ast })
    }

    /// Evaluates the expression against `context`.
    pub fn evaluate(&self, context: &Value) -> Result<Value> {
        eval(&self.ast, context)
    }

    /// Evaluates, bounding wall-clock time via a blocking-task timeout so a
    /// pathological expression can't stall the async runtime. Expression
    /// evaluation in this engine is pure CPU-bound recursion, so a blocking
    /// thread plus a timeout is sufficient; there's no cooperative
    /// cancellation inside `eval` itself.
    pub async fn evaluate_timed(&self, context: Value, timeout: Duration) -> Result<Value> {
        let ast = self.ast.clone();
        let handle = tokio::task::spawn_blocking(move || eval(&ast, &context));
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(OrchestratorError::ExpressionError(join_err.to_string())),
            Err(_) => Err(OrchestratorError::Timeout { duration: timeout }),
        }
    }
}

/// Compiles and evaluates in one call — convenient for one-shot mappings
/// where the caller doesn't hold onto the compiled form.
pub fn evaluate(source: &str, context: &Value) -> Result<Value> {
    Expression::compile(source)?.evaluate(context)
}

/// Default wall-clock bound on a single expression evaluation, matching
/// `ServerDefaults::timeout`'s default (spec.md §5: "JSONata expression
/// evaluation ... runs in a worker with a timeout bounded by
/// `server_defaults.TIMEOUT`, default 30 s").
pub const DEFAULT_EVALUATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Compiles and evaluates off the calling task, bounded by `timeout`
/// (spec.md §4.2/§9: "sandboxed timeout", "run off the main request
/// path"). The one-shot counterpart to [`evaluate`] used by every
/// production call site — `inputMapping`/`responseMapping`/
/// `finalTransform`/`stopCondition` — so a pathological expression can't
/// stall the workflow it's evaluated for.
pub async fn evaluate_bounded(source: &str, context: &Value, timeout: Duration) -> Result<Value> {
    Expression::compile(source)?.evaluate_timed(context.clone(), timeout).await
}

fn eval(expr: &Expr, ctx: &Value) -> Result<Value> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => Ok(serde_json::json!(n)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Root => Ok(ctx.clone()),
        Expr::Ident(name) => Ok(lookup(ctx, name)),
        Expr::Path { base, field } => {
            let base_val = eval(base, ctx)?;
            Ok(lookup(&base_val, field))
        }
        Expr::Index { base, index } => {
            let base_val = eval(base, ctx)?;
            let idx_val = eval(index, ctx)?;
            Ok(index_into(&base_val, &idx_val))
        }
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Object(pairs) => {
            let mut map = Map::new();
            for (key, value_expr) in pairs {
                map.insert(key.clone(), eval(value_expr, ctx)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Unary { op, operand } => {
            let val = eval(operand, ctx)?;
            eval_unary(op, &val)
        }
        Expr::Binary { op, left, right } => eval_binary(op, left, right, ctx),
        Expr::Ternary {
            condition,
            if_true,
            if_false,
        } => {
            let cond = eval(condition, ctx)?;
            if is_truthy(&cond) {
                eval(if_true, ctx)
            } else {
                eval(if_false, ctx)
            }
        }
        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                values.push(eval(a, ctx)?);
            }
            call_builtin(name, &values)
        }
    }
}

fn lookup(value: &Value, field: &str) -> Value {
    match value {
        Value::Object(map) => map.get(field).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn index_into(base: &Value, index: &Value) -> Value {
    match (base, index) {
        (Value::Array(arr), Value::Number(n)) => {
            let i = n.as_i64().unwrap_or(-1);
            if i < 0 {
                Value::Null
            } else {
                arr.get(i as usize).cloned().unwrap_or(Value::Null)
            }
        }
        (Value::Object(map), Value::String(key)) => map.get(key).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(arr) => !arr.is_empty(),
        Value::Object(obj) => !obj.is_empty(),
    }
}

fn as_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s.parse().unwrap_or(f64::NAN),
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => f64::NAN,
    }
}

fn num_value(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn values_equal(left: &Value, right: &Value) -> bool {
    left == right
}

fn eval_unary(op: &parser::UnaryOp, val: &Value) -> Result<Value> {
    use parser::UnaryOp::*;
    Ok(match op {
        Not => Value::Bool(!is_truthy(val)),
        Neg => num_value(-as_number(val)),
    })
}

fn eval_binary(op: &parser::BinOp, left: &Expr, right: &Expr, ctx: &Value) -> Result<Value> {
    use parser::BinOp::*;

    // Short-circuit logical operators.
    match op {
        And => {
            let l = eval(left, ctx)?;
            return if !is_truthy(&l) {
                Ok(Value::Bool(false))
            } else {
                Ok(Value::Bool(is_truthy(&eval(right, ctx)?)))
            };
        }
        Or => {
            let l = eval(left, ctx)?;
            return if is_truthy(&l) {
                Ok(Value::Bool(true))
            } else {
                Ok(Value::Bool(is_truthy(&eval(right, ctx)?)))
            };
        }
        _ => {}
    }

    let l = eval(left, ctx)?;
    let r = eval(right, ctx)?;

    Ok(match op {
        Add => match (&l, &r) {
            (Value::String(a), _) => Value::String(format!("{a}{}", string_of(&r))),
            (_, Value::String(b)) => Value::String(format!("{}{b}", string_of(&l))),
            (Value::Array(a), Value::Array(b)) => {
                let mut out = a.clone();
                out.extend(b.clone());
                Value::Array(out)
            }
            _ => num_value(as_number(&l) + as_number(&r)),
        },
        Concat => Value::String(format!("{}{}", string_of(&l), string_of(&r))),
        Sub => num_value(as_number(&l) - as_number(&r)),
        Mul => num_value(as_number(&l) * as_number(&r)),
        Div => num_value(as_number(&l) / as_number(&r)),
        Mod => num_value(as_number(&l) % as_number(&r)),
        Eq => Value::Bool(values_equal(&l, &r)),
        Ne => Value::Bool(!values_equal(&l, &r)),
        Lt => Value::Bool(as_number(&l) < as_number(&r)),
        Le => Value::Bool(as_number(&l) <= as_number(&r)),
        Gt => Value::Bool(as_number(&l) > as_number(&r)),
        Ge => Value::Bool(as_number(&l) >= as_number(&r)),
        And | Or => unreachable!("handled above"),
    })
}

fn string_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "count" => Ok(serde_json::json!(args.first().map(array_len).unwrap_or(0))),
        "keys" => Ok(match args.first() {
            Some(Value::Object(map)) => {
                Value::Array(map.keys().map(|k| Value::String(k.clone())).collect())
            }
            _ => Value::Array(vec![]),
        }),
        "string" => Ok(Value::String(string_of(args.first().unwrap_or(&Value::Null)))),
        "number" => Ok(num_value(as_number(args.first().unwrap_or(&Value::Null)))),
        "boolean" => Ok(Value::Bool(is_truthy(args.first().unwrap_or(&Value::Null)))),
        "exists" => Ok(Value::Bool(!matches!(args.first(), None | Some(Value::Null)))),
        "not" => Ok(Value::Bool(!is_truthy(args.first().unwrap_or(&Value::Null)))),
        "sum" => Ok(num_value(sum_numeric(args.first()))),
        "length" => Ok(serde_json::json!(string_or_array_len(args.first()))),
        "lowercase" => Ok(Value::String(string_of(args.first().unwrap_or(&Value::Null)).to_lowercase())),
        "uppercase" => Ok(Value::String(string_of(args.first().unwrap_or(&Value::Null)).to_uppercase())),
        "merge" => Ok(merge_objects(args.first())),
        "sort" => Ok(sort_value(args.first())),
        "isArray" => Ok(Value::Bool(matches!(args.first(), Some(Value::Array(_))))),
        other => Err(OrchestratorError::ExpressionError(format!(
            "unknown built-in function: ${other}"
        ))),
    }
}

fn array_len(value: &Value) -> usize {
    match value {
        Value::Array(arr) => arr.len(),
        Value::Null => 0,
        _ => 1,
    }
}

fn string_or_array_len(value: Option<&Value>) -> usize {
    match value {
        Some(Value::Array(arr)) => arr.len(),
        Some(Value::String(s)) => s.chars().count(),
        _ => 0,
    }
}

fn sum_numeric(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Array(arr)) => arr.iter().map(as_number).filter(|n| !n.is_nan()).sum(),
        Some(other) => as_number(other),
        None => 0.0,
    }
}

fn merge_objects(value: Option<&Value>) -> Value {
    let mut map = Map::new();
    if let Some(Value::Array(arr)) = value {
        for item in arr {
            if let Value::Object(obj) = item {
                for (k, v) in obj {
                    map.insert(k.clone(), v.clone());
                }
            }
        }
    }
    Value::Object(map)
}

fn sort_value(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Array(arr)) => {
            let mut sorted = arr.clone();
            sorted.sort_by(|a, b| {
                let (na, nb) = (as_number(a), as_number(b));
                if na.is_nan() || nb.is_nan() {
                    string_of(a).cmp(&string_of(b))
                } else {
                    na.partial_cmp(&nb).unwrap_or(std::cmp::Ordering::Equal)
                }
            });
            Value::Array(sorted)
        }
        other => other.cloned().unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evaluates_path_navigation() {
        let ctx = json!({"payload": {"id": 42}});
        let result = evaluate("payload.id", &ctx).unwrap();
        assert_eq!(result, json!(42));
    }

    #[test]
    fn evaluates_ternary() {
        let ctx = json!({"payload": {"ok": true}});
        let result = evaluate("payload.ok ? 1 : 2", &ctx).unwrap();
        assert_eq!(result, json!(1));
    }

    #[test]
    fn evaluates_object_and_array_construction() {
        let ctx = json!({"payload": {"a": 1, "b": 2}});
        let result = evaluate("{ \"sum\": payload.a + payload.b, \"list\": [payload.a, payload.b] }", &ctx).unwrap();
        assert_eq!(result, json!({"sum": 3, "list": [1, 2]}));
    }

    #[test]
    fn evaluates_builtin_count() {
        let ctx = json!({"payload": {"items": [1, 2, 3]}});
        let result = evaluate("$count(payload.items)", &ctx).unwrap();
        assert_eq!(result, json!(3));
    }

    #[test]
    fn missing_path_segments_resolve_to_null() {
        let ctx = json!({"payload": {}});
        let result = evaluate("payload.missing.deeper", &ctx).unwrap();
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn evaluates_comparison_and_logical() {
        let ctx = json!({"page": 3});
        let result = evaluate("page > 1 and page < 5", &ctx).unwrap();
        assert_eq!(result, json!(true));
    }

    #[tokio::test]
    async fn evaluate_timed_respects_timeout() {
        let expr = Expression::compile("1 + 1").unwrap();
        let result = expr
            .evaluate_timed(json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, json!(2));
    }
}
