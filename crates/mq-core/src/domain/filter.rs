//! Directory filter language.
//!
//! Peers look each other up by sending `{"$query": <filter>}`.  The filter is
//! a JSON document in the style of a document store query:
//!
//! ```json
//! {"parameters.type": "ai.deepseek.server"}
//! {"parameters.type": {"$regex": "tiktok", "$options": "i"}}
//! {"$or": [{"receive.1": {"$gte": 8000}}, {"verified": false}]}
//! ```
//!
//! # Semantics
//!
//! - Every top-level key is a dotted field path.  Numeric segments index
//!   into arrays, so `receive.1` is the port of an address.
//! - All top-level clauses must match (implicit AND).
//! - A literal value matches by equality.  Numbers compare numerically
//!   (`2` equals `2.0`).  If the field holds an array, a literal also matches
//!   when any element equals it.  A `null` literal matches a missing field.
//! - An object whose keys all start with `$` is an operator document.
//!
//! A filter is compiled once by [`Filter::parse`] and then evaluated against
//! any number of records with [`Filter::matches`].

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors produced while compiling a filter document.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The filter (or a nested sub-filter) was not a JSON object.
    #[error("filter must be a JSON object, got {0}")]
    NotAnObject(String),

    /// An operator this evaluator does not implement.
    #[error("unsupported filter operator '{0}'")]
    UnsupportedOperator(String),

    /// An operator received an operand of the wrong shape.
    #[error("invalid operand for '{operator}': {reason}")]
    InvalidOperand {
        operator: String,
        reason: String,
    },

    /// A `$regex` pattern failed to compile.
    #[error("invalid regular expression: {0}")]
    InvalidRegex(#[from] regex::Error),
}

/// A compiled filter document.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone)]
enum Clause {
    Field { path: String, condition: Condition },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
}

#[derive(Debug, Clone)]
enum Condition {
    Literal(Value),
    Operators(Vec<Operator>),
}

#[derive(Debug, Clone)]
enum Operator {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
    Not(Box<Condition>),
}

impl Filter {
    /// The empty filter: matches every record.
    pub fn match_all() -> Self {
        Self::default()
    }

    /// A single-clause equality filter, e.g. `{"receive": ["1.2.3.4", 1]}`.
    pub fn field_equals(path: impl Into<String>, value: Value) -> Self {
        Self {
            clauses: vec![Clause::Field {
                path: path.into(),
                condition: Condition::Literal(value),
            }],
        }
    }

    /// Compiles a filter document.
    ///
    /// # Errors
    ///
    /// Returns a [`FilterError`] if `document` is not an object, uses an
    /// unknown operator, or carries a malformed operand.
    pub fn parse(document: &Value) -> Result<Self, FilterError> {
        let object = document
            .as_object()
            .ok_or_else(|| FilterError::NotAnObject(document.to_string()))?;

        let mut clauses = Vec::with_capacity(object.len());
        for (key, value) in object {
            let clause = match key.as_str() {
                "$and" => Clause::And(parse_filter_list(key, value)?),
                "$or" => Clause::Or(parse_filter_list(key, value)?),
                "$nor" => Clause::Nor(parse_filter_list(key, value)?),
                op if op.starts_with('$') => {
                    return Err(FilterError::UnsupportedOperator(op.to_string()))
                }
                path => Clause::Field {
                    path: path.to_string(),
                    condition: parse_condition(value)?,
                },
            };
            clauses.push(clause);
        }
        Ok(Self { clauses })
    }

    /// `true` for the match-all filter `{}`.
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Returns `true` when `record` satisfies every clause.
    pub fn matches(&self, record: &Value) -> bool {
        self.matches_root(Root::Value(record))
    }

    /// [`Filter::matches`] for a record already held as a JSON object.
    pub fn matches_document(&self, document: &Map<String, Value>) -> bool {
        self.matches_root(Root::Object(document))
    }

    fn matches_root(&self, record: Root<'_>) -> bool {
        self.clauses.iter().all(|clause| clause.matches(record))
    }

    /// Every field path referenced anywhere in the filter, including inside
    /// `$and` / `$or` / `$nor`.  Used to enforce a field allow-list.
    pub fn field_paths(&self) -> Vec<&str> {
        let mut paths = Vec::new();
        for clause in &self.clauses {
            match clause {
                Clause::Field { path, .. } => paths.push(path.as_str()),
                Clause::And(subs) | Clause::Or(subs) | Clause::Nor(subs) => {
                    for sub in subs {
                        paths.extend(sub.field_paths());
                    }
                }
            }
        }
        paths
    }
}

fn parse_filter_list(operator: &str, value: &Value) -> Result<Vec<Filter>, FilterError> {
    let items = value.as_array().ok_or_else(|| FilterError::InvalidOperand {
        operator: operator.to_string(),
        reason: "expected an array of filters".to_string(),
    })?;
    if items.is_empty() {
        return Err(FilterError::InvalidOperand {
            operator: operator.to_string(),
            reason: "array must not be empty".to_string(),
        });
    }
    items.iter().map(Filter::parse).collect()
}

fn is_operator_document(object: &Map<String, Value>) -> bool {
    !object.is_empty() && object.keys().all(|k| k.starts_with('$'))
}

fn parse_condition(value: &Value) -> Result<Condition, FilterError> {
    match value {
        Value::Object(object) if is_operator_document(object) => {
            Ok(Condition::Operators(parse_operators(object)?))
        }
        Value::Object(object) if object.keys().any(|k| k.starts_with('$')) => {
            Err(FilterError::InvalidOperand {
                operator: "$".to_string(),
                reason: "cannot mix operators and literal fields".to_string(),
            })
        }
        literal => Ok(Condition::Literal(literal.clone())),
    }
}

fn parse_operators(object: &Map<String, Value>) -> Result<Vec<Operator>, FilterError> {
    let options = match object.get("$options") {
        None => None,
        Some(Value::String(opts)) => Some(opts.as_str()),
        Some(_) => {
            return Err(FilterError::InvalidOperand {
                operator: "$options".to_string(),
                reason: "expected a string".to_string(),
            })
        }
    };
    if options.is_some() && !object.contains_key("$regex") {
        return Err(FilterError::InvalidOperand {
            operator: "$options".to_string(),
            reason: "requires $regex".to_string(),
        });
    }

    let mut operators = Vec::with_capacity(object.len());
    for (key, operand) in object {
        let operator = match key.as_str() {
            "$eq" => Operator::Eq(operand.clone()),
            "$ne" => Operator::Ne(operand.clone()),
            "$gt" => Operator::Gt(operand.clone()),
            "$gte" => Operator::Gte(operand.clone()),
            "$lt" => Operator::Lt(operand.clone()),
            "$lte" => Operator::Lte(operand.clone()),
            "$in" => Operator::In(operand_array(key, operand)?),
            "$nin" => Operator::Nin(operand_array(key, operand)?),
            "$exists" => Operator::Exists(truthy(operand)),
            "$regex" => Operator::Regex(compile_regex(operand, options.unwrap_or(""))?),
            "$options" => continue,
            "$not" => match operand {
                Value::Object(inner) if is_operator_document(inner) => {
                    Operator::Not(Box::new(Condition::Operators(parse_operators(inner)?)))
                }
                _ => {
                    return Err(FilterError::InvalidOperand {
                        operator: key.clone(),
                        reason: "expected an operator document".to_string(),
                    })
                }
            },
            other => return Err(FilterError::UnsupportedOperator(other.to_string())),
        };
        operators.push(operator);
    }
    Ok(operators)
}

fn operand_array(operator: &str, operand: &Value) -> Result<Vec<Value>, FilterError> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| FilterError::InvalidOperand {
            operator: operator.to_string(),
            reason: "expected an array".to_string(),
        })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

fn compile_regex(pattern: &Value, options: &str) -> Result<Regex, FilterError> {
    let pattern = pattern.as_str().ok_or_else(|| FilterError::InvalidOperand {
        operator: "$regex".to_string(),
        reason: "expected a string pattern".to_string(),
    })?;
    let mut builder = RegexBuilder::new(pattern);
    for flag in options.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => {
                return Err(FilterError::InvalidOperand {
                    operator: "$options".to_string(),
                    reason: format!("unknown flag '{other}'"),
                })
            }
        };
    }
    Ok(builder.build()?)
}

// ── Evaluation ────────────────────────────────────────────────────────────────

/// The record a filter is evaluated against.
#[derive(Clone, Copy)]
enum Root<'a> {
    Value(&'a Value),
    Object(&'a Map<String, Value>),
}

impl Clause {
    fn matches(&self, record: Root<'_>) -> bool {
        match self {
            Clause::Field { path, condition } => condition.matches(resolve(record, path)),
            Clause::And(subs) => subs.iter().all(|f| f.matches_root(record)),
            Clause::Or(subs) => subs.iter().any(|f| f.matches_root(record)),
            Clause::Nor(subs) => !subs.iter().any(|f| f.matches_root(record)),
        }
    }
}

impl Condition {
    fn matches(&self, field: Option<&Value>) -> bool {
        match self {
            Condition::Literal(expected) => equals_field(field, expected),
            Condition::Operators(ops) => ops.iter().all(|op| op.matches(field)),
        }
    }
}

impl Operator {
    fn matches(&self, field: Option<&Value>) -> bool {
        match self {
            Operator::Eq(v) => equals_field(field, v),
            Operator::Ne(v) => !equals_field(field, v),
            Operator::Gt(v) => compares(field, v, |o| o == Ordering::Greater),
            Operator::Gte(v) => compares(field, v, |o| o != Ordering::Less),
            Operator::Lt(v) => compares(field, v, |o| o == Ordering::Less),
            Operator::Lte(v) => compares(field, v, |o| o != Ordering::Greater),
            Operator::In(vs) => vs.iter().any(|v| equals_field(field, v)),
            Operator::Nin(vs) => !vs.iter().any(|v| equals_field(field, v)),
            Operator::Exists(want) => field.is_some() == *want,
            Operator::Regex(re) => match field {
                Some(Value::String(s)) => re.is_match(s),
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| item.as_str().is_some_and(|s| re.is_match(s))),
                _ => false,
            },
            Operator::Not(inner) => !inner.matches(field),
        }
    }
}

/// Follows a dotted path through objects and (by numeric segment) arrays.
fn resolve<'a>(record: Root<'a>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let start = match record {
        Root::Value(value) => value,
        Root::Object(map) => map.get(segments.next()?)?,
    };
    segments.try_fold(start, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn equals_field(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        None => expected.is_null(),
        Some(actual) => {
            json_eq(actual, expected)
                || matches!(actual, Value::Array(items) if items.iter().any(|i| json_eq(i, expected)))
        }
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| json_eq(x, y)))
        }
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compares(field: Option<&Value>, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match field {
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| compare(item, bound).is_some_and(&accept)),
        Some(actual) => compare(actual, bound).is_some_and(accept),
        None => false,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
