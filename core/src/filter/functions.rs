//! Built-in filter functions
//!
//! A sealed registry: expression text names a function, `from_name` resolves
//! it at compile time, and `call` dispatches at evaluation. All functions are
//! pure except the clock readers (`now`, `today`).

use std::fmt::Write as _;

use chrono::{SecondsFormat, Utc};

use super::eval::{to_date, type_name, FilterValue};
use super::FilterError;

/// Function identifiers accepted in filter expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Lower,
    Upper,
    Trim,
    Length,
    Size,
    First,
    Last,
    Abs,
    Floor,
    Ceil,
    Round,
    Now,
    Today,
    ToDate,
    FormatDate,
    Coalesce,
    Default,
    Type,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Builtin> {
        Some(match name {
            "lower" | "toLower" => Builtin::Lower,
            "upper" | "toUpper" => Builtin::Upper,
            "trim" => Builtin::Trim,
            "length" => Builtin::Length,
            "size" => Builtin::Size,
            "first" => Builtin::First,
            "last" => Builtin::Last,
            "abs" => Builtin::Abs,
            "floor" => Builtin::Floor,
            "ceil" => Builtin::Ceil,
            "round" => Builtin::Round,
            "now" => Builtin::Now,
            "today" => Builtin::Today,
            "toDate" => Builtin::ToDate,
            "formatDate" => Builtin::FormatDate,
            "coalesce" => Builtin::Coalesce,
            "default" => Builtin::Default,
            "type" => Builtin::Type,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Lower => "lower",
            Builtin::Upper => "upper",
            Builtin::Trim => "trim",
            Builtin::Length => "length",
            Builtin::Size => "size",
            Builtin::First => "first",
            Builtin::Last => "last",
            Builtin::Abs => "abs",
            Builtin::Floor => "floor",
            Builtin::Ceil => "ceil",
            Builtin::Round => "round",
            Builtin::Now => "now",
            Builtin::Today => "today",
            Builtin::ToDate => "toDate",
            Builtin::FormatDate => "formatDate",
            Builtin::Coalesce => "coalesce",
            Builtin::Default => "default",
            Builtin::Type => "type",
        }
    }

    /// Apply the function to already-evaluated arguments.
    pub fn call(self, args: Vec<FilterValue>) -> Result<FilterValue, FilterError> {
        match self {
            Builtin::Lower => string_arg(self, &args).map(|s| FilterValue::Str(s.to_lowercase())),
            Builtin::Upper => string_arg(self, &args).map(|s| FilterValue::Str(s.to_uppercase())),
            Builtin::Trim => string_arg(self, &args).map(|s| FilterValue::Str(s.trim().to_string())),
            Builtin::Length | Builtin::Size => match args.first() {
                Some(FilterValue::Str(s)) => Ok(FilterValue::Number(s.chars().count() as f64)),
                Some(FilterValue::Array(items)) => Ok(FilterValue::Number(items.len() as f64)),
                Some(FilterValue::Object(map)) => Ok(FilterValue::Number(map.len() as f64)),
                Some(other) => Err(type_error(self, format!("cannot take length of {}", type_name(other)))),
                None => Err(arity_error(self)),
            },
            Builtin::First => match args.into_iter().next() {
                Some(FilterValue::Array(items)) => {
                    Ok(items.into_iter().next().unwrap_or(FilterValue::Undefined))
                }
                Some(other) => Err(type_error(self, format!("expected array, got {}", type_name(&other)))),
                None => Err(arity_error(self)),
            },
            Builtin::Last => match args.into_iter().next() {
                Some(FilterValue::Array(items)) => {
                    Ok(items.into_iter().last().unwrap_or(FilterValue::Undefined))
                }
                Some(other) => Err(type_error(self, format!("expected array, got {}", type_name(&other)))),
                None => Err(arity_error(self)),
            },
            Builtin::Abs => number_arg(self, &args).map(|n| FilterValue::Number(n.abs())),
            Builtin::Floor => number_arg(self, &args).map(|n| FilterValue::Number(n.floor())),
            Builtin::Ceil => number_arg(self, &args).map(|n| FilterValue::Number(n.ceil())),
            Builtin::Round => number_arg(self, &args).map(|n| FilterValue::Number(n.round())),
            Builtin::Now => Ok(FilterValue::Str(
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            Builtin::Today => {
                let midnight = Utc::now()
                    .date_naive()
                    .and_hms_opt(0, 0, 0)
                    .expect("midnight is a valid time")
                    .and_utc();
                Ok(FilterValue::Str(
                    midnight.to_rfc3339_opts(SecondsFormat::Millis, true),
                ))
            }
            Builtin::ToDate => match args.first() {
                Some(value) => match to_date(value) {
                    Some(date) => Ok(FilterValue::Str(
                        date.to_rfc3339_opts(SecondsFormat::Millis, true),
                    )),
                    None => Err(type_error(self, "value is not coercible to a date".to_string())),
                },
                None => Err(arity_error(self)),
            },
            Builtin::FormatDate => {
                let (value, format) = match (args.first(), args.get(1)) {
                    (Some(value), Some(FilterValue::Str(format))) => (value, format.clone()),
                    (Some(_), Some(other)) => {
                        return Err(type_error(self, format!("format must be a string, got {}", type_name(other))))
                    }
                    _ => return Err(arity_error(self)),
                };
                let date = to_date(value)
                    .ok_or_else(|| type_error(self, "value is not coercible to a date".to_string()))?;
                let mut rendered = String::new();
                write!(rendered, "{}", date.format(&format)).map_err(|_| {
                    type_error(self, format!("invalid date format '{format}'"))
                })?;
                Ok(FilterValue::Str(rendered))
            }
            Builtin::Coalesce => Ok(args
                .into_iter()
                .find(|v| !matches!(v, FilterValue::Null | FilterValue::Undefined))
                .unwrap_or(FilterValue::Undefined)),
            Builtin::Default => {
                let mut iter = args.into_iter();
                let value = iter.next().unwrap_or(FilterValue::Undefined);
                let fallback = iter.next().unwrap_or(FilterValue::Undefined);
                match value {
                    FilterValue::Null | FilterValue::Undefined => Ok(fallback),
                    present => Ok(present),
                }
            }
            Builtin::Type => match args.first() {
                Some(value) => Ok(FilterValue::Str(type_name(value).to_string())),
                None => Err(arity_error(self)),
            },
        }
    }
}

fn string_arg(func: Builtin, args: &[FilterValue]) -> Result<String, FilterError> {
    match args.first() {
        Some(FilterValue::Str(s)) => Ok(s.clone()),
        Some(other) => Err(type_error(func, format!("expected string, got {}", type_name(other)))),
        None => Err(arity_error(func)),
    }
}

fn number_arg(func: Builtin, args: &[FilterValue]) -> Result<f64, FilterError> {
    match args.first() {
        Some(FilterValue::Number(n)) => Ok(*n),
        Some(other) => Err(type_error(func, format!("expected number, got {}", type_name(other)))),
        None => Err(arity_error(func)),
    }
}

fn arity_error(func: Builtin) -> FilterError {
    FilterError::Eval {
        message: format!("{}: missing argument", func.name()),
    }
}

fn type_error(func: Builtin, message: String) -> FilterError {
    FilterError::Eval {
        message: format!("{}: {message}", func.name()),
    }
}
