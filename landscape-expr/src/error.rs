// landscape-expr/src/error.rs
// ============================================================================
// Module: Expression Errors
// Description: Structured diagnostics for lexing, parsing, and evaluating
//              gate expressions.
// Purpose: Distinguish parse-time security rejections from run-time
//          evaluation failures so callers can tell "this expression is not
//          allowed" from "this row does not have the field it asks for".
// Dependencies: std::fmt
// ============================================================================

use std::fmt;

/// Errors that can occur while lexing, parsing, or evaluating a gate
/// expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionError {
    /// Input was empty or contained only whitespace.
    EmptyInput,
    /// Input exceeded [`crate::lexer::MAX_EXPR_INPUT_BYTES`].
    InputTooLarge {
        /// Maximum allowed bytes.
        max_bytes: usize,
        /// Actual input length in bytes.
        actual_bytes: usize,
    },
    /// Input exceeded the configured nesting depth.
    NestingTooDeep {
        /// Maximum allowed nesting depth.
        max_depth: usize,
        /// Actual nesting depth when the error occurred.
        actual_depth: usize,
        /// Byte offset in the original input.
        position: usize,
    },
    /// Unexpected token encountered during parsing.
    UnexpectedToken {
        /// Human-friendly expectation summary.
        expected: &'static str,
        /// The token that was actually seen.
        found: String,
        /// Byte offset in the original input.
        position: usize,
    },
    /// An identifier other than `row`, or a double-underscore identifier,
    /// was referenced. The whitelisted grammar has no other names.
    DisallowedIdentifier {
        /// The rejected identifier.
        name: String,
        /// Byte offset in the original input.
        position: usize,
    },
    /// A numeric literal failed to parse or overflowed.
    InvalidNumber {
        /// The raw numeric text.
        raw: String,
        /// Byte offset in the original input.
        position: usize,
    },
    /// Unexpected trailing input after a complete expression.
    TrailingInput {
        /// Byte offset where unexpected input begins.
        position: usize,
    },
    /// `row[...]` referenced a key or index that was not present.
    MissingKey {
        /// The dotted/bracketed path that could not be resolved, e.g.
        /// `row['a']['b']`.
        path: String,
    },
    /// Division by zero.
    DivisionByZero,
    /// Modulo by zero.
    ModuloByZero,
    /// An operator was applied to operand types it does not support.
    TypeMismatch {
        /// The operator symbol, e.g. `"+"` or `"<"`.
        op: &'static str,
        /// A human-readable description of the offending operand(s).
        detail: String,
    },
    /// The expression evaluated to a non-boolean value where a gate
    /// condition requires `true`/`false`.
    NonBooleanResult,
}

impl fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyInput => write!(f, "expression is empty"),
            Self::InputTooLarge {
                max_bytes,
                actual_bytes,
            } => {
                write!(f, "expression exceeds size limit: {actual_bytes} bytes (max {max_bytes})")
            }
            Self::NestingTooDeep {
                max_depth,
                actual_depth,
                position,
            } => write!(
                f,
                "expression nesting exceeds limit: depth {actual_depth} (max {max_depth}) at {position}"
            ),
            Self::UnexpectedToken {
                expected,
                found,
                position,
            } => {
                write!(f, "unexpected token `{found}` at {position}, expected {expected}")
            }
            Self::DisallowedIdentifier { name, position } => {
                write!(f, "identifier `{name}` is not allowed at {position}; only `row` may be referenced")
            }
            Self::InvalidNumber { raw, position } => {
                write!(f, "invalid number `{raw}` at {position}")
            }
            Self::TrailingInput { position } => {
                write!(f, "unexpected trailing input at {position}")
            }
            Self::MissingKey { path } => write!(f, "{path} is not present"),
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::ModuloByZero => write!(f, "modulo by zero"),
            Self::TypeMismatch { op, detail } => {
                write!(f, "operator `{op}` cannot be applied to {detail}")
            }
            Self::NonBooleanResult => write!(f, "expression did not evaluate to a boolean"),
        }
    }
}

impl std::error::Error for ExpressionError {}
