//! Filter expression evaluation
//!
//! Walks the AST against the event JSON tree. Values are lifted into
//! `FilterValue`, which adds the `Undefined` state a JSON tree cannot
//! express (a missing path is undefined, an explicit `null` is null).
//!
//! Semantics: string comparisons are case-insensitive; `matches` is a
//! case-insensitive regex whose compile failure makes the comparison false;
//! `in`/`notIn` require an array right operand; the date operators coerce
//! both sides through `to_date`.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use regex::RegexBuilder;
use serde_json::{Map, Value};

use super::ast::{CmpOp, Expr, Literal, PathSegment};
use super::FilterError;

/// Evaluation-time value: JSON plus `Undefined`.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<FilterValue>),
    Object(Map<String, Value>),
}

impl FilterValue {
    pub fn from_json(value: &Value) -> FilterValue {
        match value {
            Value::Null => FilterValue::Null,
            Value::Bool(b) => FilterValue::Bool(*b),
            Value::Number(n) => FilterValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => FilterValue::Str(s.clone()),
            Value::Array(items) => {
                FilterValue::Array(items.iter().map(FilterValue::from_json).collect())
            }
            Value::Object(map) => FilterValue::Object(map.clone()),
        }
    }
}

/// Name of a value's type, as reported by `type()` and the `is*` predicates.
pub fn type_name(value: &FilterValue) -> &'static str {
    match value {
        FilterValue::Undefined => "undefined",
        FilterValue::Null => "null",
        FilterValue::Bool(_) => "boolean",
        FilterValue::Number(_) => "number",
        FilterValue::Str(_) => "string",
        FilterValue::Array(_) => "array",
        FilterValue::Object(_) => "object",
    }
}

/// Evaluate an expression against the event root.
pub fn evaluate(expr: &Expr, root: &Value) -> Result<FilterValue, FilterError> {
    match expr {
        Expr::Literal(literal) => Ok(match literal {
            Literal::Str(s) => FilterValue::Str(s.clone()),
            Literal::Number(n) => FilterValue::Number(*n),
            Literal::Bool(b) => FilterValue::Bool(*b),
            Literal::Null => FilterValue::Null,
            Literal::Undefined => FilterValue::Undefined,
        }),
        Expr::Path(segments) => Ok(resolve_path(segments, root)),
        Expr::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(evaluate(item, root)?);
            }
            Ok(FilterValue::Array(values))
        }
        Expr::Call { func, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(evaluate(arg, root)?);
            }
            func.call(values)
        }
        Expr::Not(inner) => {
            let value = evaluate(inner, root)?;
            Ok(FilterValue::Bool(!truthy(&value)))
        }
        Expr::And(terms) => {
            for term in terms {
                if !truthy(&evaluate(term, root)?) {
                    return Ok(FilterValue::Bool(false));
                }
            }
            Ok(FilterValue::Bool(true))
        }
        Expr::Or(terms) => {
            for term in terms {
                if truthy(&evaluate(term, root)?) {
                    return Ok(FilterValue::Bool(true));
                }
            }
            Ok(FilterValue::Bool(false))
        }
        Expr::Cmp { op, lhs, rhs, regex } => {
            let left = evaluate(lhs, root)?;
            let right = match rhs {
                Some(rhs) => Some(evaluate(rhs, root)?),
                None => None,
            };
            compare(*op, &left, right.as_ref(), regex.as_ref()).map(FilterValue::Bool)
        }
    }
}

/// Truthiness of the final expression value.
pub fn truthy(value: &FilterValue) -> bool {
    match value {
        FilterValue::Undefined | FilterValue::Null => false,
        FilterValue::Bool(b) => *b,
        FilterValue::Number(n) => *n != 0.0 && !n.is_nan(),
        FilterValue::Str(s) => !s.is_empty(),
        FilterValue::Array(_) | FilterValue::Object(_) => true,
    }
}

fn resolve_path(segments: &[PathSegment], root: &Value) -> FilterValue {
    let mut current = root;
    for segment in segments {
        let next = match segment {
            PathSegment::Key(key) => match current {
                Value::Object(map) => map.get(key),
                _ => None,
            },
            PathSegment::Index(index) => match current {
                Value::Array(items) => items.get(*index),
                _ => None,
            },
        };
        match next {
            Some(value) => current = value,
            None => return FilterValue::Undefined,
        }
    }
    FilterValue::from_json(current)
}

fn compare(
    op: CmpOp,
    left: &FilterValue,
    right: Option<&FilterValue>,
    regex: Option<&regex::Regex>,
) -> Result<bool, FilterError> {
    match op {
        CmpOp::Eq => Ok(equals(left, required(op, right)?)),
        CmpOp::NotEq => Ok(!equals(left, required(op, right)?)),
        CmpOp::Greater => Ok(ordering(left, required(op, right)?) == Some(Ordering::Greater)),
        CmpOp::Less => Ok(ordering(left, required(op, right)?) == Some(Ordering::Less)),
        CmpOp::GreaterEq => Ok(matches!(
            ordering(left, required(op, right)?),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        )),
        CmpOp::LessEq => Ok(matches!(
            ordering(left, required(op, right)?),
            Some(Ordering::Less) | Some(Ordering::Equal)
        )),
        CmpOp::Contains => {
            let right = required(op, right)?;
            match (left, right) {
                (FilterValue::Str(haystack), FilterValue::Str(needle)) => Ok(haystack
                    .to_lowercase()
                    .contains(&needle.to_lowercase())),
                (FilterValue::Array(items), needle) => {
                    Ok(items.iter().any(|item| equals(item, needle)))
                }
                _ => Ok(false),
            }
        }
        CmpOp::StartsWith => {
            let right = required(op, right)?;
            match (left, right) {
                (FilterValue::Str(s), FilterValue::Str(prefix)) => {
                    Ok(s.to_lowercase().starts_with(&prefix.to_lowercase()))
                }
                _ => Ok(false),
            }
        }
        CmpOp::EndsWith => {
            let right = required(op, right)?;
            match (left, right) {
                (FilterValue::Str(s), FilterValue::Str(suffix)) => {
                    Ok(s.to_lowercase().ends_with(&suffix.to_lowercase()))
                }
                _ => Ok(false),
            }
        }
        CmpOp::Matches => {
            let FilterValue::Str(subject) = left else {
                return Ok(false);
            };
            if let Some(compiled) = regex {
                return Ok(compiled.is_match(subject));
            }
            let FilterValue::Str(pattern) = required(op, right)? else {
                return Ok(false);
            };
            // Dynamic pattern: compile failure yields false, not an error
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(compiled) => Ok(compiled.is_match(subject)),
                Err(_) => Ok(false),
            }
        }
        CmpOp::In => {
            let FilterValue::Array(items) = required(op, right)? else {
                return Err(FilterError::Eval {
                    message: "'in' requires an array right operand".to_string(),
                });
            };
            Ok(items.iter().any(|item| equals(left, item)))
        }
        CmpOp::NotIn => {
            let FilterValue::Array(items) = required(op, right)? else {
                return Err(FilterError::Eval {
                    message: "'notIn' requires an array right operand".to_string(),
                });
            };
            Ok(!items.iter().any(|item| equals(left, item)))
        }
        CmpOp::HasAny => {
            let (FilterValue::Array(have), FilterValue::Array(want)) =
                (left, required(op, right)?)
            else {
                return Ok(false);
            };
            Ok(want.iter().any(|w| have.iter().any(|h| equals(h, w))))
        }
        CmpOp::HasAll => {
            let (FilterValue::Array(have), FilterValue::Array(want)) =
                (left, required(op, right)?)
            else {
                return Ok(false);
            };
            Ok(want.iter().all(|w| have.iter().any(|h| equals(h, w))))
        }
        CmpOp::Exists => Ok(!matches!(left, FilterValue::Undefined)),
        CmpOp::NotExists => Ok(matches!(left, FilterValue::Undefined)),
        CmpOp::IsString => Ok(matches!(left, FilterValue::Str(_))),
        CmpOp::IsNumber => Ok(matches!(left, FilterValue::Number(_))),
        CmpOp::IsBoolean => Ok(matches!(left, FilterValue::Bool(_))),
        CmpOp::IsArray => Ok(matches!(left, FilterValue::Array(_))),
        CmpOp::IsObject => Ok(matches!(left, FilterValue::Object(_))),
        CmpOp::IsNull => Ok(matches!(left, FilterValue::Null)),
        CmpOp::IsUndefined => Ok(matches!(left, FilterValue::Undefined)),
        CmpOp::Before => {
            let (l, r) = date_pair(op, left, required(op, right)?)?;
            Ok(l < r)
        }
        CmpOp::After => {
            let (l, r) = date_pair(op, left, required(op, right)?)?;
            Ok(l > r)
        }
        CmpOp::Between => {
            let FilterValue::Array(bounds) = required(op, right)? else {
                return Err(FilterError::Eval {
                    message: "'between' requires an array of two dates".to_string(),
                });
            };
            let (Some(start), Some(end)) = (bounds.first(), bounds.get(1)) else {
                return Err(FilterError::Eval {
                    message: "'between' requires an array of two dates".to_string(),
                });
            };
            let value = coerce_date(op, left)?;
            let start = coerce_date(op, start)?;
            let end = coerce_date(op, end)?;
            Ok(start <= value && value <= end)
        }
    }
}

fn required<'a>(op: CmpOp, right: Option<&'a FilterValue>) -> Result<&'a FilterValue, FilterError> {
    right.ok_or_else(|| FilterError::Eval {
        message: format!("operator {op:?} requires a right operand"),
    })
}

/// Equality: numbers by value, strings case-insensitively, null and
/// undefined equal to each other, composites by JSON equality.
pub fn equals(left: &FilterValue, right: &FilterValue) -> bool {
    match (left, right) {
        (FilterValue::Null | FilterValue::Undefined, FilterValue::Null | FilterValue::Undefined) => {
            true
        }
        (FilterValue::Bool(a), FilterValue::Bool(b)) => a == b,
        (FilterValue::Number(a), FilterValue::Number(b)) => a == b,
        (FilterValue::Str(a), FilterValue::Str(b)) => a.eq_ignore_ascii_case(b),
        (FilterValue::Array(a), FilterValue::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| equals(x, y))
        }
        (FilterValue::Object(a), FilterValue::Object(b)) => a == b,
        _ => false,
    }
}

/// Relational ordering: numbers numerically, strings case-insensitively,
/// anything else unordered.
fn ordering(left: &FilterValue, right: &FilterValue) -> Option<Ordering> {
    match (left, right) {
        (FilterValue::Number(a), FilterValue::Number(b)) => a.partial_cmp(b),
        (FilterValue::Str(a), FilterValue::Str(b)) => {
            Some(a.to_lowercase().cmp(&b.to_lowercase()))
        }
        _ => None,
    }
}

fn date_pair(
    op: CmpOp,
    left: &FilterValue,
    right: &FilterValue,
) -> Result<(DateTime<Utc>, DateTime<Utc>), FilterError> {
    Ok((coerce_date(op, left)?, coerce_date(op, right)?))
}

fn coerce_date(op: CmpOp, value: &FilterValue) -> Result<DateTime<Utc>, FilterError> {
    to_date(value).ok_or_else(|| FilterError::Eval {
        message: format!("operator {op:?}: value is not coercible to a date"),
    })
}

/// Coerce a value to a UTC datetime: RFC-3339 strings, `YYYY-MM-DD` dates,
/// or numbers as milliseconds since the epoch.
pub fn to_date(value: &FilterValue) -> Option<DateTime<Utc>> {
    match value {
        FilterValue::Str(s) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Some(parsed.with_timezone(&Utc));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        }
        FilterValue::Number(n) if n.is_finite() => {
            DateTime::<Utc>::from_timestamp_millis(*n as i64)
        }
        _ => None,
    }
}
