//! Recursive-descent parser over the token stream

use super::ast::{BinaryOperation, Expression, FunctionCall, Literal, Reference, Term};
use super::error::{ExpressionError, ExpressionErrorKind};
use super::lexer::{Token, TokenKind};

/// Maximum nesting of groups and calls.
const MAX_NESTING: usize = 64;

pub(crate) struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    index: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(input: &'a str, tokens: Vec<Token>) -> Self {
        Self {
            input,
            tokens,
            index: 0,
            depth: 0,
        }
    }

    /// Parse a complete expression and require end of input.
    pub(crate) fn parse(mut self) -> Result<Expression, ExpressionError> {
        let expr = self.expression()?;
        if self.current().kind != TokenKind::Eof {
            return Err(self.unexpected(self.current(), Some("end of expression")));
        }
        Ok(expr)
    }

    fn expression(&mut self) -> Result<Expression, ExpressionError> {
        let left = self.term()?;

        let TokenKind::Operator(operator) = self.current().kind else {
            return Ok(Expression {
                left,
                operation: None,
            });
        };
        let op_token = self.current().clone();
        self.advance();

        let next = self.current();
        if next.kind == TokenKind::Eof || next.is_punct(')') || next.is_punct(',') {
            return Err(ExpressionError::new(
                ExpressionErrorKind::MissingOperand,
                format!("missing operand after \"{}\"", op_token.text),
                self.input,
                Some(op_token.position),
                Some(op_token.text),
            ));
        }

        let right = self.term()?;
        Ok(Expression {
            left,
            operation: Some(BinaryOperation {
                operator,
                position: op_token.position,
                right,
            }),
        })
    }

    fn term(&mut self) -> Result<Term, ExpressionError> {
        let token = self.current().clone();
        let term = match &token.kind {
            TokenKind::String(value) => Term::Literal(Literal::String(value.clone())),
            TokenKind::Boolean(value) => Term::Literal(Literal::Boolean(*value)),
            TokenKind::Number(raw) => {
                let value = raw.parse::<f64>().map_err(|_| {
                    ExpressionError::new(
                        ExpressionErrorKind::InvalidStructure,
                        format!("invalid number \"{raw}\""),
                        self.input,
                        Some(token.position),
                        Some(raw.clone()),
                    )
                })?;
                Term::Literal(Literal::Number(value))
            }
            TokenKind::Punct('(') => return self.grouped(&token),
            TokenKind::Ident(name) => return self.reference_or_call(name.clone(), token.position),
            _ => return Err(self.unexpected(&token, Some("operand"))),
        };
        self.advance();
        Ok(term)
    }

    fn grouped(&mut self, open: &Token) -> Result<Term, ExpressionError> {
        self.enter(open)?;
        self.advance();
        let inner = self.expression()?;
        self.expect_close(open)?;
        self.depth -= 1;
        Ok(Term::Grouped(Box::new(inner)))
    }

    fn reference_or_call(&mut self, name: String, position: usize) -> Result<Term, ExpressionError> {
        if self.peek(1).is_punct('(') {
            self.advance();
            return self.call(None, name, position);
        }

        if self.peek(1).is_punct('.') && self.peek(3).is_punct('(') {
            if let TokenKind::Ident(function) = &self.peek(2).kind {
                let function = function.clone();
                self.index += 3;
                return self.call(Some(name), function, position);
            }
        }

        self.advance();
        let mut parts = vec![name];
        while self.current().is_punct('.') {
            self.advance();
            let segment = self.current().clone();
            match &segment.kind {
                TokenKind::Ident(part) => parts.push(part.clone()),
                _ => return Err(self.unexpected(&segment, Some("identifier after \".\""))),
            }
            self.advance();
        }
        Ok(Term::Reference(Reference { parts, position }))
    }

    /// Parse an argument list; the current token is the opening parenthesis.
    fn call(
        &mut self,
        namespace: Option<String>,
        name: String,
        position: usize,
    ) -> Result<Term, ExpressionError> {
        let open = self.current().clone();
        self.enter(&open)?;
        self.advance();

        let mut args = Vec::new();
        if !self.current().is_punct(')') {
            loop {
                args.push(self.term()?);
                if self.current().is_punct(',') {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.expect_close(&open)?;
        self.depth -= 1;

        Ok(Term::FunctionCall(FunctionCall {
            namespace,
            name,
            args,
            position,
        }))
    }

    fn expect_close(&mut self, open: &Token) -> Result<(), ExpressionError> {
        let token = self.current().clone();
        if token.is_punct(')') {
            self.advance();
            return Ok(());
        }
        if token.kind == TokenKind::Eof {
            return Err(ExpressionError::new(
                ExpressionErrorKind::UnclosedParen,
                "unclosed parenthesis",
                self.input,
                Some(open.position),
                Some("(".to_string()),
            ));
        }
        Err(self.unexpected(&token, Some("\")\"")))
    }

    fn enter(&mut self, at: &Token) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ExpressionError::new(
                ExpressionErrorKind::InvalidStructure,
                format!("expression nesting exceeds {MAX_NESTING} levels"),
                self.input,
                Some(at.position),
                None,
            ));
        }
        Ok(())
    }

    fn unexpected(&self, token: &Token, expected: Option<&str>) -> ExpressionError {
        let mut message = if token.kind == TokenKind::Eof {
            "unexpected end of expression".to_string()
        } else {
            format!("unexpected token \"{}\"", token.text)
        };
        if let Some(expected) = expected {
            message.push_str(&format!(" (expected {expected})"));
        }
        let found = (token.kind != TokenKind::Eof).then(|| token.text.clone());
        ExpressionError::new(
            ExpressionErrorKind::UnexpectedToken,
            message,
            self.input,
            Some(token.position),
            found,
        )
    }

    fn current(&self) -> &Token {
        self.peek(0)
    }

    /// Token `ahead` positions from the cursor, saturating at end of input.
    fn peek(&self, ahead: usize) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.index + ahead).min(last)]
    }

    fn advance(&mut self) {
        if self.index + 1 < self.tokens.len() {
            self.index += 1;
        }
    }
}
