// landscape-expr/src/eval.rs
// ============================================================================
// Module: Expression Evaluator
// Description: Walks a parsed [`crate::ast::Expr`] against a `row` value.
// Purpose: Turn a whitelisted AST plus a JSON row into a boolean gate
//          decision, failing loudly on anything ambiguous (missing keys,
//          division by zero, non-boolean results) rather than defaulting.
// Dependencies: crate::ast, crate::error, serde_json
// ============================================================================

use serde_json::Value;

use crate::ast::ArithOp;
use crate::ast::CompareOp;
use crate::ast::Expr;
use crate::ast::Literal;
use crate::ast::Subscript;
use crate::error::ExpressionError;

/// Evaluates `expr` against `row`, requiring the result to be a boolean.
///
/// # Errors
/// Returns [`ExpressionError::NonBooleanResult`] if the expression evaluates
/// to anything other than `true`/`false`, or any evaluation error
/// (`MissingKey`, `DivisionByZero`, `ModuloByZero`, `TypeMismatch`)
/// encountered along the way.
pub fn evaluate_bool(expr: &Expr, row: &Value) -> Result<bool, ExpressionError> {
    match evaluate_value(expr, row)? {
        Value::Bool(b) => Ok(b),
        _ => Err(ExpressionError::NonBooleanResult),
    }
}

fn evaluate_value(expr: &Expr, row: &Value) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(lit) => Ok(literal_to_value(lit)),
        Expr::List(items) => {
            let values = items
                .iter()
                .map(|item| evaluate_value(item, row))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(values))
        }
        Expr::Row(subscripts) => resolve_row(row, subscripts),
        Expr::And(lhs, rhs) => Ok(Value::Bool(require_bool(lhs, row, "and")? && require_bool(rhs, row, "and")?)),
        Expr::Or(lhs, rhs) => Ok(Value::Bool(require_bool(lhs, row, "or")? || require_bool(rhs, row, "or")?)),
        Expr::Not(inner) => Ok(Value::Bool(!require_bool(inner, row, "not")?)),
        Expr::Neg(inner) => negate(evaluate_value(inner, row)?),
        Expr::Compare(op, lhs, rhs) => {
            let lhs = evaluate_value(lhs, row)?;
            let rhs = evaluate_value(rhs, row)?;
            Ok(Value::Bool(compare(*op, &lhs, &rhs)?))
        }
        Expr::Arith(op, lhs, rhs) => {
            let lhs = evaluate_value(lhs, row)?;
            let rhs = evaluate_value(rhs, row)?;
            arithmetic(*op, &lhs, &rhs)
        }
    }
}

fn require_bool(expr: &Expr, row: &Value, op: &'static str) -> Result<bool, ExpressionError> {
    match evaluate_value(expr, row)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExpressionError::TypeMismatch {
            op,
            detail: format!("non-boolean operand {other}"),
        }),
    }
}

fn literal_to_value(lit: &Literal) -> Value {
    match lit {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::from(*i),
        Literal::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Literal::Str(s) => Value::String(s.clone()),
    }
}

fn resolve_row(row: &Value, subscripts: &[Subscript]) -> Result<Value, ExpressionError> {
    let mut current = row;
    let mut path = String::from("row");
    for subscript in subscripts {
        match subscript {
            Subscript::Key(key) => {
                path.push_str(&format!("['{key}']"));
                current = current
                    .as_object()
                    .and_then(|map| map.get(key))
                    .ok_or_else(|| ExpressionError::MissingKey { path: path.clone() })?;
            }
            Subscript::Index(index) => {
                path.push_str(&format!("[{index}]"));
                let array = current.as_array().ok_or_else(|| ExpressionError::MissingKey { path: path.clone() })?;
                let resolved_index = usize::try_from(*index).ok().filter(|i| *i < array.len());
                current = resolved_index
                    .and_then(|i| array.get(i))
                    .ok_or_else(|| ExpressionError::MissingKey { path: path.clone() })?;
            }
        }
    }
    Ok(current.clone())
}

fn negate(value: Value) -> Result<Value, ExpressionError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::from(i.wrapping_neg()))
            } else if let Some(f) = n.as_f64() {
                Ok(serde_json::Number::from_f64(-f).map_or(Value::Null, Value::Number))
            } else {
                Err(ExpressionError::TypeMismatch {
                    op: "-",
                    detail: "a number outside the supported range".to_string(),
                })
            }
        }
        other => Err(ExpressionError::TypeMismatch {
            op: "-",
            detail: format!("{other}"),
        }),
    }
}

fn as_f64(value: &Value, op: &'static str) -> Result<f64, ExpressionError> {
    value.as_f64().ok_or_else(|| ExpressionError::TypeMismatch {
        op,
        detail: format!("non-numeric operand {value}"),
    })
}

/// A strict ordering comparison, excluding equality and membership — kept
/// separate from [`CompareOp`] so the ordered-comparison match is exhaustive
/// without a catch-all arm.
#[derive(Clone, Copy)]
enum OrderOp {
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
}

fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> Result<bool, ExpressionError> {
    match op {
        CompareOp::Eq => Ok(lhs == rhs),
        CompareOp::NotEq => Ok(lhs != rhs),
        CompareOp::Lt => ordered_compare(OrderOp::Lt, lhs, rhs),
        CompareOp::LtEq => ordered_compare(OrderOp::LtEq, lhs, rhs),
        CompareOp::Gt => ordered_compare(OrderOp::Gt, lhs, rhs),
        CompareOp::GtEq => ordered_compare(OrderOp::GtEq, lhs, rhs),
        CompareOp::In => membership(lhs, rhs),
        CompareOp::NotIn => membership(lhs, rhs).map(|found| !found),
    }
}

fn ordered_compare(op: OrderOp, lhs: &Value, rhs: &Value) -> Result<bool, ExpressionError> {
    if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
        return Ok(match op {
            OrderOp::Lt => a < b,
            OrderOp::LtEq => a <= b,
            OrderOp::Gt => a > b,
            OrderOp::GtEq => a >= b,
        });
    }
    let a = as_f64(lhs, "comparison")?;
    let b = as_f64(rhs, "comparison")?;
    Ok(match op {
        OrderOp::Lt => a < b,
        OrderOp::LtEq => a <= b,
        OrderOp::Gt => a > b,
        OrderOp::GtEq => a >= b,
    })
}

fn membership(needle: &Value, haystack: &Value) -> Result<bool, ExpressionError> {
    match haystack {
        Value::Array(items) => Ok(items.contains(needle)),
        Value::String(s) => match needle {
            Value::String(n) => Ok(s.contains(n.as_str())),
            other => Err(ExpressionError::TypeMismatch {
                op: "in",
                detail: format!("searching a string for non-string {other}"),
            }),
        },
        other => Err(ExpressionError::TypeMismatch {
            op: "in",
            detail: format!("{other} is not a list or string"),
        }),
    }
}

fn arithmetic(op: ArithOp, lhs: &Value, rhs: &Value) -> Result<Value, ExpressionError> {
    let symbol = match op {
        ArithOp::Add => "+",
        ArithOp::Sub => "-",
        ArithOp::Mul => "*",
        ArithOp::Div => "/",
        ArithOp::Mod => "%",
    };

    if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
        return match op {
            ArithOp::Add => Ok(Value::from(a.wrapping_add(b))),
            ArithOp::Sub => Ok(Value::from(a.wrapping_sub(b))),
            ArithOp::Mul => Ok(Value::from(a.wrapping_mul(b))),
            ArithOp::Div => {
                if b == 0 {
                    Err(ExpressionError::DivisionByZero)
                } else {
                    Ok(Value::from(a / b))
                }
            }
            ArithOp::Mod => {
                if b == 0 {
                    Err(ExpressionError::ModuloByZero)
                } else {
                    Ok(Value::from(a % b))
                }
            }
        };
    }

    let a = as_f64(lhs, symbol)?;
    let b = as_f64(rhs, symbol)?;
    let result = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => {
            if b == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            a / b
        }
        ArithOp::Mod => {
            if b == 0.0 {
                return Err(ExpressionError::ModuloByZero);
            }
            a % b
        }
    };
    Ok(serde_json::Number::from_f64(result).map_or(Value::Null, Value::Number))
}
