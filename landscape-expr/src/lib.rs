// landscape-expr/src/lib.rs
// ============================================================================
// Module: Landscape Expr
// Description: Whitelisted boolean expression language used by
//              condition-driven gates.
// Purpose: Let a gate's `config.condition` reference row fields and combine
//          them with a small, fixed set of safe operators, without ever
//          exposing attribute access, function calls, or anything else that
//          could turn a gate condition into arbitrary code.
// Dependencies: landscape-core, serde_json
// ============================================================================

//! ## Overview
//! A hand-rolled lexer and recursive-descent parser turn expression text
//! into a typed [`ast::Expr`]; the grammar has no production for anything
//! outside the whitelist (§4.5), so there is nothing to sandbox at
//! evaluation time. [`Evaluator`] implements
//! [`landscape_core::ExpressionEvaluator`] by parsing and evaluating fresh
//! on every call — gate conditions are short, parsing is not a bottleneck,
//! and a fresh parse means there is no cached AST to ever get out of sync
//! with a mutated expression string.

pub mod ast;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod parser;

pub use ast::Expr;
pub use error::ExpressionError;
pub use eval::evaluate_bool;
pub use parser::parse;

use landscape_core::ExprEvalError;
use landscape_core::ExpressionEvaluator;
use serde_json::Value;

/// The whitelisted expression evaluator, implementing
/// [`landscape_core::ExpressionEvaluator`] for condition-driven gates.
#[derive(Debug, Clone, Copy, Default)]
pub struct Evaluator;

impl ExpressionEvaluator for Evaluator {
    fn evaluate(&self, expression: &str, row: &Value) -> Result<bool, ExprEvalError> {
        let expr = parse(expression).map_err(|err| ExprEvalError(err.to_string()))?;
        evaluate_bool(&expr, row).map_err(|err| ExprEvalError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test assertions only")]

    use serde_json::json;

    use super::*;

    fn eval(expr: &str, row: &Value) -> bool {
        Evaluator.evaluate(expr, row).unwrap()
    }

    #[test]
    fn compares_row_field_against_literal() {
        let row = json!({"age": 42});
        assert!(eval("row['age'] == 42", &row));
        assert!(!eval("row['age'] < 42", &row));
    }

    #[test]
    fn nested_subscripts_resolve_through_objects() {
        let row = json!({"a": {"b": 7}});
        assert!(eval("row['a']['b'] == 7", &row));
    }

    #[test]
    fn boolean_operators_short_circuit_structurally() {
        let row = json!({"flag": true, "n": 3});
        assert!(eval("row['flag'] and row['n'] > 1", &row));
        assert!(eval("not row['flag'] or row['n'] == 3", &row));
    }

    #[test]
    fn arithmetic_and_membership_are_supported() {
        let row = json!({"n": 10, "tags": ["a", "b"]});
        assert!(eval("row['n'] % 3 == 1", &row));
        assert!(eval("'a' in row['tags']", &row));
        assert!(eval("'c' not in row['tags']", &row));
    }

    #[test]
    fn missing_key_is_an_error_not_a_silent_false() {
        let row = json!({});
        let err = Evaluator.evaluate("row['missing'] == 1", &row).unwrap_err();
        assert!(err.0.contains("not present"));
    }

    #[test]
    fn division_by_zero_is_a_typed_error() {
        let row = json!({"n": 0});
        let err = Evaluator.evaluate("10 / row['n'] == 1", &row).unwrap_err();
        assert!(err.0.contains("division by zero"));
    }

    #[test]
    fn non_boolean_result_is_rejected() {
        let row = json!({"n": 1});
        let err = Evaluator.evaluate("row['n'] + 1", &row).unwrap_err();
        assert!(err.0.contains("did not evaluate to a boolean"));
    }

    #[test]
    fn disallowed_identifiers_are_rejected_at_parse_time() {
        let err = parse("other_name == 1").unwrap_err();
        assert!(matches!(err, ExpressionError::DisallowedIdentifier { .. }));
    }

    #[test]
    fn attribute_access_and_calls_have_no_grammar_production() {
        assert!(parse("row.field").is_err());
        assert!(parse("len(row)").is_err());
    }

    #[test]
    fn nesting_beyond_the_limit_is_rejected() {
        let deeply_nested = "(".repeat(40) + "row['x']" + &")".repeat(40);
        let err = parse(&deeply_nested).unwrap_err();
        assert!(matches!(err, ExpressionError::NestingTooDeep { .. }));
    }
}
