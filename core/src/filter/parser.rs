//! Recursive-descent parser for filter expressions
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr    := or
//! or      := and ("||" and)*
//! and     := cmp ("&&" cmp)*
//! cmp     := unary (op unary?)?
//! unary   := "!" unary | primary
//! primary := literal | path | func "(" args ")" | "(" expr ")" | "[" args "]"
//! ```
//!
//! Word operators and function names are plain identifiers in the token
//! stream; they are classified here by position.

use regex::RegexBuilder;

use super::ast::{CmpOp, Expr, Literal, PathSegment};
use super::functions::Builtin;
use super::token::{Token, TokenKind};
use super::FilterError;

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, current: 0 }
    }

    pub fn parse(&mut self) -> Result<Expr, FilterError> {
        let expr = self.or()?;
        match self.peek_kind() {
            TokenKind::Eof => Ok(expr),
            _ => Err(self.error("expected end of expression")),
        }
    }

    fn or(&mut self) -> Result<Expr, FilterError> {
        let first = self.and()?;
        if !matches!(self.peek_kind(), TokenKind::OrOr) {
            return Ok(first);
        }
        let mut terms = vec![first];
        while matches!(self.peek_kind(), TokenKind::OrOr) {
            self.advance();
            terms.push(self.and()?);
        }
        Ok(Expr::Or(terms))
    }

    fn and(&mut self) -> Result<Expr, FilterError> {
        let first = self.cmp()?;
        if !matches!(self.peek_kind(), TokenKind::AndAnd) {
            return Ok(first);
        }
        let mut terms = vec![first];
        while matches!(self.peek_kind(), TokenKind::AndAnd) {
            self.advance();
            terms.push(self.cmp()?);
        }
        Ok(Expr::And(terms))
    }

    fn cmp(&mut self) -> Result<Expr, FilterError> {
        let lhs = self.unary()?;

        let op = match self.peek_kind() {
            TokenKind::EqEq | TokenKind::Assign => Some(CmpOp::Eq),
            TokenKind::NotEq => Some(CmpOp::NotEq),
            TokenKind::Greater => Some(CmpOp::Greater),
            TokenKind::Less => Some(CmpOp::Less),
            TokenKind::GreaterEq => Some(CmpOp::GreaterEq),
            TokenKind::LessEq => Some(CmpOp::LessEq),
            TokenKind::Ident(word) => CmpOp::from_word(word),
            _ => None,
        };

        let Some(op) = op else {
            return Ok(lhs);
        };
        self.advance();

        let rhs = if op.needs_rhs() {
            Some(Box::new(self.unary()?))
        } else {
            None
        };

        let regex = match (&op, rhs.as_deref()) {
            (CmpOp::Matches, Some(Expr::Literal(Literal::Str(pattern)))) => {
                // A pattern that fails to compile makes the comparison false,
                // never a parse error.
                RegexBuilder::new(pattern).case_insensitive(true).build().ok()
            }
            _ => None,
        };

        Ok(Expr::Cmp {
            op,
            lhs: Box::new(lhs),
            rhs,
            regex,
        })
    }

    fn unary(&mut self) -> Result<Expr, FilterError> {
        if matches!(self.peek_kind(), TokenKind::Bang) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, FilterError> {
        match self.peek_kind().clone() {
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Literal(Literal::Str(s)))
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Literal(Literal::Number(n)))
            }
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.or()?;
                self.expect(TokenKind::RightParen, "expected ')'")?;
                Ok(inner)
            }
            TokenKind::LeftBracket => {
                self.advance();
                let items = self.arguments(TokenKind::RightBracket)?;
                Ok(Expr::Array(items))
            }
            TokenKind::Ident(name) => {
                self.advance();
                match name.as_str() {
                    "true" => return Ok(Expr::Literal(Literal::Bool(true))),
                    "false" => return Ok(Expr::Literal(Literal::Bool(false))),
                    "null" => return Ok(Expr::Literal(Literal::Null)),
                    "undefined" => return Ok(Expr::Literal(Literal::Undefined)),
                    _ => {}
                }
                if matches!(self.peek_kind(), TokenKind::LeftParen) {
                    let func = Builtin::from_name(&name)
                        .ok_or_else(|| self.error(format!("unknown function '{name}'")))?;
                    self.advance();
                    let args = self.arguments(TokenKind::RightParen)?;
                    return Ok(Expr::Call { func, args });
                }
                self.path(name)
            }
            TokenKind::Eof => Err(self.error("unexpected end of expression")),
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }

    /// Continue a dotted/indexed path after its first key.
    fn path(&mut self, first: String) -> Result<Expr, FilterError> {
        let mut segments = vec![PathSegment::Key(first)];
        loop {
            match self.peek_kind() {
                TokenKind::Dot => {
                    self.advance();
                    match self.peek_kind().clone() {
                        TokenKind::Ident(key) => {
                            self.advance();
                            segments.push(PathSegment::Key(key));
                        }
                        _ => return Err(self.error("expected field name after '.'")),
                    }
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let index = match self.peek_kind() {
                        TokenKind::Number(n) if *n >= 0.0 && n.fract() == 0.0 => *n as usize,
                        _ => return Err(self.error("expected integer index in '[ ]'")),
                    };
                    self.advance();
                    self.expect(TokenKind::RightBracket, "expected ']'")?;
                    segments.push(PathSegment::Index(index));
                }
                _ => break,
            }
        }
        Ok(Expr::Path(segments))
    }

    fn arguments(&mut self, closing: TokenKind) -> Result<Vec<Expr>, FilterError> {
        let mut args = Vec::new();
        if *self.peek_kind() == closing {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.or()?);
            match self.peek_kind() {
                TokenKind::Comma => {
                    self.advance();
                }
                kind if *kind == closing => {
                    self.advance();
                    break;
                }
                _ => return Err(self.error("expected ',' or closing delimiter")),
            }
        }
        Ok(args)
    }

    fn peek_kind(&self) -> &TokenKind {
        self.tokens
            .get(self.current)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn advance(&mut self) {
        self.current += 1;
    }

    fn expect(&mut self, kind: TokenKind, message: &str) -> Result<(), FilterError> {
        if *self.peek_kind() == kind {
            self.advance();
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    fn error(&self, message: impl Into<String>) -> FilterError {
        let column = self.tokens.get(self.current).map(|t| t.column).unwrap_or(0);
        FilterError::Parse {
            column,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::token::Lexer;
    use super::*;

    fn parse(source: &str) -> Result<Expr, FilterError> {
        let tokens = Lexer::new(source).tokenize()?;
        Parser::new(tokens).parse()
    }

    #[test]
    fn parses_or_of_comparisons() {
        let expr = parse(r#"data.priority == "high" || data.priority == "urgent""#).unwrap();
        match expr {
            Expr::Or(terms) => assert_eq!(terms.len(), 2),
            other => panic!("expected Or, got {other:?}"),
        }
    }

    #[test]
    fn parses_postfix_predicates() {
        let expr = parse("data.assignee exists").unwrap();
        match expr {
            Expr::Cmp { op, rhs, .. } => {
                assert_eq!(op, CmpOp::Exists);
                assert!(rhs.is_none());
            }
            other => panic!("expected Cmp, got {other:?}"),
        }
    }

    #[test]
    fn parses_indexed_path() {
        let expr = parse("data.items[2].name exists").unwrap();
        match expr {
            Expr::Cmp { lhs, .. } => match *lhs {
                Expr::Path(ref segments) => {
                    assert_eq!(segments.len(), 4);
                    assert_eq!(segments[2], PathSegment::Index(2));
                }
                ref other => panic!("expected Path, got {other:?}"),
            },
            other => panic!("expected Cmp, got {other:?}"),
        }
    }

    #[test]
    fn parses_function_call_with_args() {
        let expr = parse(r#"lower(data.status) == "done""#).unwrap();
        match expr {
            Expr::Cmp { lhs, .. } => assert!(matches!(*lhs, Expr::Call { .. })),
            other => panic!("expected Cmp, got {other:?}"),
        }
    }

    #[test]
    fn parses_in_with_array_literal() {
        let expr = parse(r#"data.status in ["Open", "InProgress"]"#).unwrap();
        match expr {
            Expr::Cmp { op, rhs, .. } => {
                assert_eq!(op, CmpOp::In);
                assert!(matches!(rhs.as_deref(), Some(Expr::Array(items)) if items.len() == 2));
            }
            other => panic!("expected Cmp, got {other:?}"),
        }
    }

    #[test]
    fn precompiles_literal_regex() {
        let expr = parse(r#"data.title matches "^bug:""#).unwrap();
        match expr {
            Expr::Cmp { regex, .. } => assert!(regex.is_some()),
            other => panic!("expected Cmp, got {other:?}"),
        }
    }

    #[test]
    fn bad_literal_regex_parses_without_regex() {
        let expr = parse(r#"data.title matches "[""#).unwrap();
        match expr {
            Expr::Cmp { regex, .. } => assert!(regex.is_none()),
            other => panic!("expected Cmp, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_function() {
        assert!(parse("explode(data)").is_err());
    }

    #[test]
    fn rejects_trailing_tokens() {
        assert!(parse("data.a == 1 data.b").is_err());
    }

    #[test]
    fn double_negation() {
        let expr = parse("!!data.archived").unwrap();
        assert!(matches!(expr, Expr::Not(_)));
    }
}
