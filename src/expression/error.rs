//! Positioned expression errors

use std::fmt;

/// Characters of surrounding input captured on each side of an error.
const CONTEXT_RADIUS: usize = 10;

/// Category of an expression failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionErrorKind {
    /// Input was empty or whitespace only
    Empty,
    /// An opening parenthesis was never closed
    UnclosedParen,
    /// A string literal was never terminated
    UnclosedString,
    /// Parsed tree violates a structural rule
    InvalidStructure,
    /// Token not allowed at this position
    UnexpectedToken,
    /// Binary operator without a right-hand operand
    MissingOperand,
}

impl ExpressionErrorKind {
    /// Short machine-friendly name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty_expression",
            Self::UnclosedParen => "unclosed_parenthesis",
            Self::UnclosedString => "unclosed_string",
            Self::InvalidStructure => "invalid_structure",
            Self::UnexpectedToken => "unexpected_token",
            Self::MissingOperand => "missing_operand",
        }
    }
}

/// Expression failure with the offending position and surrounding context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionError {
    /// Failure category
    pub kind: ExpressionErrorKind,
    /// Human-readable message
    pub message: String,
    /// Byte offset into the input, when known
    pub position: Option<usize>,
    /// Offending token text
    pub token: Option<String>,
    /// Up to ten characters of input on each side of `position`
    pub context: String,
}

impl ExpressionError {
    pub(crate) fn new(
        kind: ExpressionErrorKind,
        message: impl Into<String>,
        input: &str,
        position: Option<usize>,
        token: Option<String>,
    ) -> Self {
        let context = position.map(|p| snippet(input, p)).unwrap_or_default();
        Self {
            kind,
            message: message.into(),
            position,
            token,
            context,
        }
    }

    /// Input offset, or -1 when the position is unknown
    #[must_use]
    pub fn offset(&self) -> i64 {
        self.position
            .and_then(|p| i64::try_from(p).ok())
            .unwrap_or(-1)
    }
}

impl fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(position) = self.position {
            write!(f, " at position {position}")?;
        }
        if !self.context.is_empty() {
            write!(f, " near \"{}\"", self.context)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExpressionError {}

/// Slice of `input` around `position`, widened to char boundaries
fn snippet(input: &str, position: usize) -> String {
    let position = position.min(input.len());
    let mut start = position.saturating_sub(CONTEXT_RADIUS);
    while !input.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (position + CONTEXT_RADIUS).min(input.len());
    while !input.is_char_boundary(end) {
        end += 1;
    }
    input[start..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_is_clamped_to_input() {
        assert_eq!(snippet("abc", 1), "abc");
        assert_eq!(snippet("0123456789abcdefghijXYZ", 20), "abcdefghijXYZ");
    }

    #[test]
    fn snippet_respects_char_boundaries() {
        let input = "ééééééééé == 1";
        let s = snippet(input, 11);
        assert!(input.contains(&s));
    }

    #[test]
    fn unknown_position_reports_minus_one() {
        let err = ExpressionError::new(ExpressionErrorKind::Empty, "empty", "", None, None);
        assert_eq!(err.offset(), -1);
        assert!(err.context.is_empty());
        assert_eq!(err.to_string(), "empty");
    }
}
