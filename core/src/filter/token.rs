//! Tokenizer for filter expressions
//!
//! Scans an expression string into a flat token stream. The scanner is a
//! small state machine over a char vector; word operators (`contains`,
//! `startsWith`, …) come out as plain identifiers and are classified by the
//! parser, so the token set stays minimal.

use std::fmt;

use super::FilterError;

/// Token types produced by the scanner.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Ident(String),
    Str(String),
    Number(f64),

    // Operators
    AndAnd,
    OrOr,
    Bang,
    EqEq,
    NotEq,
    Assign,
    Greater,
    Less,
    GreaterEq,
    LessEq,

    // Delimiters
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,

    Eof,
}

/// Token with its position in the source expression.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub column: usize,
}

impl Token {
    fn new(kind: TokenKind, column: usize) -> Self {
        Token { kind, column }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} at column {}", self.kind, self.column)
    }
}

/// Scanner over a filter expression.
pub struct Lexer {
    source: Vec<char>,
    current: usize,
    column: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            current: 0,
            column: 1,
        }
    }

    /// Tokenize the whole expression, ending with `Eof`.
    pub fn tokenize(&mut self) -> Result<Vec<Token>, FilterError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let is_eof = matches!(token.kind, TokenKind::Eof);
            tokens.push(token);
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Token, FilterError> {
        self.skip_whitespace();
        let column = self.column;

        let ch = match self.peek() {
            Some(ch) => ch,
            None => return Ok(Token::new(TokenKind::Eof, column)),
        };

        match ch {
            '(' => self.single(TokenKind::LeftParen, column),
            ')' => self.single(TokenKind::RightParen, column),
            '[' => self.single(TokenKind::LeftBracket, column),
            ']' => self.single(TokenKind::RightBracket, column),
            ',' => self.single(TokenKind::Comma, column),
            '.' => self.single(TokenKind::Dot, column),
            '&' => {
                self.advance();
                if self.peek() == Some('&') {
                    self.advance();
                    Ok(Token::new(TokenKind::AndAnd, column))
                } else {
                    Err(self.error(column, "expected '&&'"))
                }
            }
            '|' => {
                self.advance();
                if self.peek() == Some('|') {
                    self.advance();
                    Ok(Token::new(TokenKind::OrOr, column))
                } else {
                    Err(self.error(column, "expected '||'"))
                }
            }
            '=' => {
                self.advance();
                if self.peek() == Some('=') {
                    self.advance();
                    Ok(Token::new(TokenKind::EqEq, column))
                } else {
                    Ok(Token::new(TokenKind::Assign, column))
                }
            }
            '!' => {
                self.advance();
                if self.peek() == Some('=') {
                    self.advance();
                    Ok(Token::new(TokenKind::NotEq, column))
                } else {
                    Ok(Token::new(TokenKind::Bang, column))
                }
            }
            '<' => {
                self.advance();
                match self.peek() {
                    Some('=') => {
                        self.advance();
                        Ok(Token::new(TokenKind::LessEq, column))
                    }
                    Some('>') => {
                        self.advance();
                        Ok(Token::new(TokenKind::NotEq, column))
                    }
                    _ => Ok(Token::new(TokenKind::Less, column)),
                }
            }
            '>' => {
                self.advance();
                if self.peek() == Some('=') {
                    self.advance();
                    Ok(Token::new(TokenKind::GreaterEq, column))
                } else {
                    Ok(Token::new(TokenKind::Greater, column))
                }
            }
            '\'' | '"' => self.string(ch, column),
            c if c.is_ascii_digit() => self.number(column),
            '-' => self.number(column),
            c if is_ident_start(c) => self.identifier(column),
            other => Err(self.error(column, format!("unexpected character '{other}'"))),
        }
    }

    fn single(&mut self, kind: TokenKind, column: usize) -> Result<Token, FilterError> {
        self.advance();
        Ok(Token::new(kind, column))
    }

    fn string(&mut self, quote: char, column: usize) -> Result<Token, FilterError> {
        self.advance(); // opening quote
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error(column, "unterminated string literal")),
                Some(c) if c == quote => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    let escaped = self
                        .peek()
                        .ok_or_else(|| self.error(column, "unterminated escape"))?;
                    self.advance();
                    match escaped {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        other => value.push(other),
                    }
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
        Ok(Token::new(TokenKind::Str(value), column))
    }

    fn number(&mut self, column: usize) -> Result<Token, FilterError> {
        let mut text = String::new();
        if self.peek() == Some('-') {
            text.push('-');
            self.advance();
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        // Fractional part: only consume the dot when a digit follows, so
        // `items[0].name` style paths keep their dots.
        if self.peek() == Some('.') && self.peek_ahead(1).is_some_and(|c| c.is_ascii_digit()) {
            text.push('.');
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        text.parse::<f64>()
            .map(|n| Token::new(TokenKind::Number(n), column))
            .map_err(|_| self.error(column, format!("invalid number '{text}'")))
    }

    fn identifier(&mut self, column: usize) -> Result<Token, FilterError> {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if is_ident_part(c) {
                name.push(c);
                self.advance();
            } else {
                break;
            }
        }
        Ok(Token::new(TokenKind::Ident(name), column))
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.current).copied()
    }

    fn peek_ahead(&self, offset: usize) -> Option<char> {
        self.source.get(self.current + offset).copied()
    }

    fn advance(&mut self) {
        self.current += 1;
        self.column += 1;
    }

    fn error(&self, column: usize, message: impl Into<String>) -> FilterError {
        FilterError::Lex {
            column,
            message: message.into(),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}
