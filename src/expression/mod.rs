//! Policy condition expression validator
//!
//! Rejects malformed policy conditions at plan time instead of letting the
//! remote API reject them at apply time. Only syntax and structure are
//! checked; whether a referenced attribute exists is left to the server.
//!
//! ```text
//! Expression   = Term [ BinaryOp Term ]
//! Term         = Literal | Reference | FunctionCall | "(" Expression ")"
//! Reference    = Identifier ( "." Identifier )*
//! FunctionCall = [ Identifier "." ] Identifier "(" [ Term ( "," Term )* ] ")"
//! ```

mod ast;
mod error;
mod lexer;
mod parser;

pub use ast::{BinaryOperation, Expression, FunctionCall, Literal, Operator, Reference, Term};
pub use error::{ExpressionError, ExpressionErrorKind};

use lexer::Lexer;
use parser::Parser;

/// Validate an expression, discarding the tree.
///
/// # Errors
///
/// Returns the first syntax or structural problem found.
pub fn validate_expression(input: &str) -> Result<(), ExpressionError> {
    parse_expression(input).map(|_| ())
}

/// Parse and structurally validate an expression.
///
/// # Errors
///
/// Returns an [`ExpressionError`] carrying the offending position, token and
/// surrounding context.
pub fn parse_expression(input: &str) -> Result<Expression, ExpressionError> {
    if input.trim().is_empty() {
        return Err(ExpressionError::new(
            ExpressionErrorKind::Empty,
            "expression is empty",
            input,
            None,
            None,
        ));
    }

    // Reported before parsing so the position names the opener rather than
    // the end of input.
    check_delimiters(input)?;

    let tokens = Lexer::new(input).tokenize()?;
    let expr = Parser::new(input, tokens).parse()?;
    expr.validate(input)?;
    Ok(expr)
}

/// Find the leftmost unclosed `(` or an unterminated string.
fn check_delimiters(input: &str) -> Result<(), ExpressionError> {
    let mut open_parens: Vec<usize> = Vec::new();
    let mut string_start: Option<usize> = None;
    let mut escaped = false;

    for (i, c) in input.char_indices() {
        if string_start.is_some() {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => string_start = None,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => string_start = Some(i),
            '(' => open_parens.push(i),
            ')' => {
                open_parens.pop();
            }
            _ => {}
        }
    }

    if let Some(start) = string_start {
        return Err(ExpressionError::new(
            ExpressionErrorKind::UnclosedString,
            "unclosed string literal",
            input,
            Some(start),
            Some("\"".to_string()),
        ));
    }
    if let Some(&first) = open_parens.first() {
        return Err(ExpressionError::new(
            ExpressionErrorKind::UnclosedParen,
            "unclosed parenthesis",
            input,
            Some(first),
            Some("(".to_string()),
        ));
    }
    Ok(())
}
