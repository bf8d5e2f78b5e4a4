//! Expression syntax tree and structural validation

use std::fmt;

use super::error::{ExpressionError, ExpressionErrorKind};

/// Operators recognised by the lexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `==`, `eq`
    Eq,
    /// `!=`, `ne`
    Ne,
    /// `>`, `gt`
    Gt,
    /// `>=`, `ge`
    Ge,
    /// `<`, `lt`
    Lt,
    /// `<=`, `le`
    Le,
    /// `sw`
    StartsWith,
    /// `co`
    Contains,
    /// `pr`
    Present,
    /// `AND`, `and`
    And,
    /// `OR`, `or`
    Or,
    /// `NOT`, `not`; unary only
    Not,
}

impl Operator {
    /// Map a keyword to its operator. Upper-case forms exist only for the
    /// logical connectives.
    #[must_use]
    pub fn from_keyword(word: &str) -> Option<Self> {
        let op = match word {
            "AND" | "and" => Self::And,
            "OR" | "or" => Self::Or,
            "NOT" | "not" => Self::Not,
            "eq" => Self::Eq,
            "ne" => Self::Ne,
            "gt" => Self::Gt,
            "ge" => Self::Ge,
            "lt" => Self::Lt,
            "le" => Self::Le,
            "sw" => Self::StartsWith,
            "co" => Self::Contains,
            "pr" => Self::Present,
            _ => return None,
        };
        Some(op)
    }

    /// Whether the operator may join two terms
    #[must_use]
    pub const fn is_binary(self) -> bool {
        !matches!(self, Self::Not)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::StartsWith => "sw",
            Self::Contains => "co",
            Self::Present => "pr",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Not => "NOT",
        };
        f.write_str(s)
    }
}

/// `Term [ BinaryOp Term ]`
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    /// Left-hand term
    pub left: Term,
    /// Optional operator with its right-hand term
    pub operation: Option<BinaryOperation>,
}

/// Operator and right-hand side of an [`Expression`]
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryOperation {
    /// Operator
    pub operator: Operator,
    /// Byte offset of the operator
    pub position: usize,
    /// Right-hand term
    pub right: Term,
}

/// A single operand
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// String, number or boolean
    Literal(Literal),
    /// Dotted attribute path
    Reference(Reference),
    /// Optionally qualified function call
    FunctionCall(FunctionCall),
    /// Parenthesised sub-expression
    Grouped(Box<Expression>),
}

/// Literal values
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Double-quoted string
    String(String),
    /// Numeric literal
    Number(f64),
    /// `true` / `false`
    Boolean(bool),
}

/// `Identifier ( "." Identifier )*`
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    /// Path segments
    pub parts: Vec<String>,
    /// Byte offset of the first segment
    pub position: usize,
}

/// `[ Identifier "." ] Identifier "(" [ Term ( "," Term )* ] ")"`
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    /// Qualifier such as `String` in `String.len(x)`
    pub namespace: Option<String>,
    /// Function name
    pub name: String,
    /// Arguments
    pub args: Vec<Term>,
    /// Byte offset of the call
    pub position: usize,
}

impl Expression {
    /// Check the structural rules the grammar alone does not enforce.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidStructure` error for a `NOT` used as a binary
    /// operator, an empty reference segment or an unnamed function.
    pub fn validate(&self, input: &str) -> Result<(), ExpressionError> {
        self.left.validate(input)?;
        if let Some(op) = &self.operation {
            if !op.operator.is_binary() {
                return Err(ExpressionError::new(
                    ExpressionErrorKind::InvalidStructure,
                    format!("operator {} cannot join two operands", op.operator),
                    input,
                    Some(op.position),
                    Some(op.operator.to_string()),
                ));
            }
            op.right.validate(input)?;
        }
        Ok(())
    }
}

impl Term {
    fn validate(&self, input: &str) -> Result<(), ExpressionError> {
        match self {
            Self::Literal(_) => Ok(()),
            Self::Reference(r) => {
                if r.parts.is_empty() || r.parts.iter().any(String::is_empty) {
                    return Err(ExpressionError::new(
                        ExpressionErrorKind::InvalidStructure,
                        "reference has an empty segment",
                        input,
                        Some(r.position),
                        None,
                    ));
                }
                Ok(())
            }
            Self::FunctionCall(call) => {
                if call.name.is_empty() {
                    return Err(ExpressionError::new(
                        ExpressionErrorKind::InvalidStructure,
                        "function call has no name",
                        input,
                        Some(call.position),
                        None,
                    ));
                }
                call.args.iter().try_for_each(|arg| arg.validate(input))
            }
            Self::Grouped(inner) => inner.validate(input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(parts: &[&str]) -> Term {
        Term::Reference(Reference {
            parts: parts.iter().map(ToString::to_string).collect(),
            position: 0,
        })
    }

    #[test]
    fn not_is_rejected_as_binary() {
        let expr = Expression {
            left: reference(&["a"]),
            operation: Some(BinaryOperation {
                operator: Operator::Not,
                position: 2,
                right: reference(&["b"]),
            }),
        };
        let err = expr.validate("a NOT b").unwrap_err();
        assert_eq!(err.kind, ExpressionErrorKind::InvalidStructure);
        assert_eq!(err.position, Some(2));
    }

    #[test]
    fn empty_reference_segment_is_rejected() {
        let expr = Expression {
            left: reference(&["user", ""]),
            operation: None,
        };
        assert!(expr.validate("user.").is_err());
    }

    #[test]
    fn nested_function_arguments_are_checked() {
        let expr = Expression {
            left: Term::FunctionCall(FunctionCall {
                namespace: Some("String".to_string()),
                name: "len".to_string(),
                args: vec![reference(&[])],
                position: 0,
            }),
            operation: None,
        };
        assert!(expr.validate("String.len()").is_err());
    }

    #[test]
    fn keyword_table() {
        assert_eq!(Operator::from_keyword("AND"), Some(Operator::And));
        assert_eq!(Operator::from_keyword("EQ"), None);
        assert_eq!(Operator::from_keyword("user"), None);
    }
}
