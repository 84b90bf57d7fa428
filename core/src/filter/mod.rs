//! Filter expression engine
//!
//! Subscribers attach boolean expressions evaluated against each event, e.g.
//!
//! ```text
//! data.priority == "high" || data.priority == "urgent"
//! data.labels hasAny ["crash", "regression"] && data.status != "Done"
//! ```
//!
//! Each distinct expression string is tokenized, parsed and cached; the
//! cache is keyed by expression text, so compilation is idempotent. The
//! engine fails closed: any compile or evaluation error rejects the event
//! for that subscriber. An empty expression matches everything.

mod ast;
mod eval;
mod functions;
mod parser;
mod token;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use ast::Expr;
use parser::Parser;
use token::Lexer;

pub use eval::FilterValue;
pub use functions::Builtin;

/// Errors raised while compiling or evaluating a filter expression.
#[derive(Error, Debug, Clone)]
pub enum FilterError {
    #[error("lex error at column {column}: {message}")]
    Lex { column: usize, message: String },

    #[error("parse error at column {column}: {message}")]
    Parse { column: usize, message: String },

    #[error("evaluation error: {message}")]
    Eval { message: String },
}

/// A parsed, reusable filter expression.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    source: String,
    expr: Expr,
}

impl CompiledFilter {
    pub fn compile(source: &str) -> Result<CompiledFilter, FilterError> {
        let tokens = Lexer::new(source).tokenize()?;
        let expr = Parser::new(tokens).parse()?;
        Ok(CompiledFilter {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against an event tree, reducing to a boolean.
    pub fn evaluate(&self, event: &Value) -> Result<bool, FilterError> {
        eval::evaluate(&self.expr, event).map(|v| eval::truthy(&v))
    }
}

/// Compiles, caches and evaluates subscriber filter expressions.
pub struct FilterEngine {
    cache: RwLock<HashMap<String, Arc<CompiledFilter>>>,
    /// Expressions whose compile failure was already logged
    reported: RwLock<HashSet<String>>,
}

impl FilterEngine {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            reported: RwLock::new(HashSet::new()),
        }
    }

    /// Compile `source`, reusing the cached program when available.
    pub fn compile(&self, source: &str) -> Result<Arc<CompiledFilter>, FilterError> {
        if let Some(cached) = self.cache.read().expect("filter cache poisoned").get(source) {
            return Ok(Arc::clone(cached));
        }
        let compiled = Arc::new(CompiledFilter::compile(source)?);
        self.cache
            .write()
            .expect("filter cache poisoned")
            .insert(source.to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    /// True when the event passes `source`. Fails closed: compile or
    /// evaluation errors reject the event. An empty expression passes
    /// everything.
    pub fn matches(&self, source: &str, event: &Value) -> bool {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return true;
        }
        let compiled = match self.compile(trimmed) {
            Ok(compiled) => compiled,
            Err(error) => {
                self.report_once(trimmed, &error);
                return false;
            }
        };
        match compiled.evaluate(event) {
            Ok(matched) => matched,
            Err(error) => {
                warn!(filter = trimmed, %error, "filter evaluation failed, rejecting event");
                false
            }
        }
    }

    /// Number of cached compiled expressions.
    pub fn cached_len(&self) -> usize {
        self.cache.read().expect("filter cache poisoned").len()
    }

    /// Compile failures are logged once per expression text.
    fn report_once(&self, source: &str, error: &FilterError) {
        let mut reported = self.reported.write().expect("filter cache poisoned");
        if reported.insert(source.to_string()) {
            warn!(filter = source, %error, "filter failed to compile, rejecting events");
        }
    }
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_expression_matches_everything() {
        let engine = FilterEngine::new();
        assert!(engine.matches("", &json!({})));
        assert!(engine.matches("   ", &json!({"data": {"x": 1}})));
    }

    #[test]
    fn compilation_is_cached_and_idempotent() {
        let engine = FilterEngine::new();
        let event = json!({"data": {"priority": "high"}});
        let expr = r#"data.priority == "high""#;
        assert!(engine.matches(expr, &event));
        assert!(engine.matches(expr, &event));
        assert_eq!(engine.cached_len(), 1);

        let a = engine.compile(expr).unwrap();
        let b = engine.compile(expr).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn compile_failure_rejects() {
        let engine = FilterEngine::new();
        assert!(!engine.matches("data.a ==", &json!({"data": {"a": 1}})));
        // Second call hits the already-reported path and still rejects
        assert!(!engine.matches("data.a ==", &json!({"data": {"a": 1}})));
    }

    #[test]
    fn eval_failure_rejects() {
        let engine = FilterEngine::new();
        // 'in' with a non-array right operand is an evaluation error
        assert!(!engine.matches(r#"data.a in data.b"#, &json!({"data": {"a": 1, "b": 2}})));
    }
}
