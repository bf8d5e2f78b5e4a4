//! Tokenizer for policy condition expressions

use super::ast::Operator;
use super::error::{ExpressionError, ExpressionErrorKind};

/// Lexical token kinds
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    /// Double-quoted string with escapes resolved
    String(String),
    /// Binary or unary operator, symbolic or keyword
    Operator(Operator),
    /// `true` / `false`
    Boolean(bool),
    /// Numeric literal, raw text
    Number(String),
    /// One of `. , ( ) { } [ ]`
    Punct(char),
    /// `[A-Za-z][A-Za-z0-9_]*` that is not reserved
    Ident(String),
    /// End of input
    Eof,
}

/// Token with its byte offset and source text
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub position: usize,
    pub text: String,
}

impl Token {
    pub(crate) fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct(c)
    }
}

pub(crate) struct Lexer<'a> {
    input: &'a str,
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Lexer<'a> {
    pub(crate) fn new(input: &'a str) -> Self {
        Self {
            input,
            bytes: input.as_bytes(),
            offset: 0,
        }
    }

    pub(crate) fn tokenize(mut self) -> Result<Vec<Token>, ExpressionError> {
        let mut tokens = Vec::new();

        while let Some(&b) = self.bytes.get(self.offset) {
            let start = self.offset;
            let kind = match b {
                b' ' | b'\t' | b'\n' | b'\r' => {
                    self.offset += 1;
                    continue;
                }
                b'"' => self.string()?,
                b'=' | b'!' | b'<' | b'>' => self.symbolic_operator()?,
                b'0'..=b'9' => self.number(),
                b'.' | b',' | b'(' | b')' | b'{' | b'}' | b'[' | b']' => {
                    self.offset += 1;
                    TokenKind::Punct(char::from(b))
                }
                b'a'..=b'z' | b'A'..=b'Z' => self.word(),
                _ => return Err(self.unexpected_char(start)),
            };
            tokens.push(Token {
                kind,
                position: start,
                text: self.input[start..self.offset].to_string(),
            });
        }

        tokens.push(Token {
            kind: TokenKind::Eof,
            position: self.input.len(),
            text: String::new(),
        });
        Ok(tokens)
    }

    fn string(&mut self) -> Result<TokenKind, ExpressionError> {
        let start = self.offset;
        self.offset += 1;
        let mut value = String::new();
        let mut chars = self.input[self.offset..].char_indices();

        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.offset += i + 1;
                    return Ok(TokenKind::String(value));
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, 'r')) => value.push('\r'),
                    Some((_, escaped)) => value.push(escaped),
                    None => break,
                },
                other => value.push(other),
            }
        }

        Err(ExpressionError::new(
            ExpressionErrorKind::UnclosedString,
            "unclosed string literal",
            self.input,
            Some(start),
            Some("\"".to_string()),
        ))
    }

    fn symbolic_operator(&mut self) -> Result<TokenKind, ExpressionError> {
        let start = self.offset;
        let first = self.bytes[start];
        let second = self.bytes.get(start + 1).copied();

        let (op, len) = match (first, second) {
            (b'=', Some(b'=')) => (Operator::Eq, 2),
            (b'!', Some(b'=')) => (Operator::Ne, 2),
            (b'>', Some(b'=')) => (Operator::Ge, 2),
            (b'<', Some(b'=')) => (Operator::Le, 2),
            (b'>', _) => (Operator::Gt, 1),
            (b'<', _) => (Operator::Lt, 1),
            _ => return Err(self.unexpected_char(start)),
        };
        self.offset += len;
        Ok(TokenKind::Operator(op))
    }

    fn number(&mut self) -> TokenKind {
        let start = self.offset;
        self.consume_digits();

        if self.peek(0) == Some(b'.') && self.peek(1).is_some_and(|b| b.is_ascii_digit()) {
            self.offset += 1;
            self.consume_digits();
        }

        if matches!(self.peek(0), Some(b'e' | b'E')) {
            let sign = usize::from(matches!(self.peek(1), Some(b'+' | b'-')));
            if self.peek(1 + sign).is_some_and(|b| b.is_ascii_digit()) {
                self.offset += 1 + sign;
                self.consume_digits();
            }
        }

        TokenKind::Number(self.input[start..self.offset].to_string())
    }

    fn word(&mut self) -> TokenKind {
        let start = self.offset;
        while self
            .peek(0)
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.offset += 1;
        }

        let word = &self.input[start..self.offset];
        if let Some(op) = Operator::from_keyword(word) {
            return TokenKind::Operator(op);
        }
        match word {
            "true" => TokenKind::Boolean(true),
            "false" => TokenKind::Boolean(false),
            _ => TokenKind::Ident(word.to_string()),
        }
    }

    fn consume_digits(&mut self) {
        while self.peek(0).is_some_and(|b| b.is_ascii_digit()) {
            self.offset += 1;
        }
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.offset + ahead).copied()
    }

    fn unexpected_char(&self, position: usize) -> ExpressionError {
        let found = self.input[position..]
            .chars()
            .next()
            .map(String::from)
            .unwrap_or_default();
        ExpressionError::new(
            ExpressionErrorKind::UnexpectedToken,
            format!("unexpected token \"{found}\""),
            self.input,
            Some(position),
            Some(found),
        )
    }
}
