//! Filter expression AST
//!
//! The parser produces this tree; evaluation walks it against the event
//! JSON. Comparison operators are a sealed enum so classification (does the
//! operator take a right operand?) lives next to the operator itself.

use regex::Regex;

use super::functions::Builtin;

/// Literal values appearing in expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Number(f64),
    Bool(bool),
    Null,
    Undefined,
}

/// One step of a dotted path: a key or an integer index.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Comparison and predicate operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Greater,
    Less,
    GreaterEq,
    LessEq,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    In,
    NotIn,
    HasAny,
    HasAll,
    Exists,
    NotExists,
    IsString,
    IsNumber,
    IsBoolean,
    IsArray,
    IsObject,
    IsNull,
    IsUndefined,
    Before,
    After,
    Between,
}

impl CmpOp {
    /// Map a word operator to its kind. Symbolic operators are classified by
    /// the tokenizer instead.
    pub fn from_word(word: &str) -> Option<CmpOp> {
        Some(match word {
            "contains" => CmpOp::Contains,
            "startsWith" => CmpOp::StartsWith,
            "endsWith" => CmpOp::EndsWith,
            "matches" => CmpOp::Matches,
            "in" => CmpOp::In,
            "notIn" => CmpOp::NotIn,
            "hasAny" => CmpOp::HasAny,
            "hasAll" => CmpOp::HasAll,
            "exists" => CmpOp::Exists,
            "notExists" => CmpOp::NotExists,
            "isString" => CmpOp::IsString,
            "isNumber" => CmpOp::IsNumber,
            "isBoolean" => CmpOp::IsBoolean,
            "isArray" => CmpOp::IsArray,
            "isObject" => CmpOp::IsObject,
            "isNull" => CmpOp::IsNull,
            "isUndefined" => CmpOp::IsUndefined,
            "before" => CmpOp::Before,
            "after" => CmpOp::After,
            "between" => CmpOp::Between,
            _ => return None,
        })
    }

    /// Predicates like `exists` and the type checks take no right operand.
    pub fn needs_rhs(self) -> bool {
        !matches!(
            self,
            CmpOp::Exists
                | CmpOp::NotExists
                | CmpOp::IsString
                | CmpOp::IsNumber
                | CmpOp::IsBoolean
                | CmpOp::IsArray
                | CmpOp::IsObject
                | CmpOp::IsNull
                | CmpOp::IsUndefined
        )
    }
}

/// Filter expression tree.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Literal),
    Path(Vec<PathSegment>),
    Call {
        func: Builtin,
        args: Vec<Expr>,
    },
    Array(Vec<Expr>),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Cmp {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Option<Box<Expr>>,
        /// Precompiled when `op` is `matches` with a literal pattern
        regex: Option<Regex>,
    },
}
