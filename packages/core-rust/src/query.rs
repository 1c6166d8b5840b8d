//! Query predicates, ordering, and in-memory evaluation.
//!
//! A caller query is an object of `field → value` (equality) or
//! `field → {"$op": operand}`. Relationship aliases are translated with
//! [`to_physical`](crate::relationships::to_physical) before compilation, so a
//! compiled [`Filter`] only ever names physical columns.

use std::cmp::Ordering;

use crate::error::QueryError;
use crate::types::{Object, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl CompareOp {
    fn parse(field: &str, operator: &str) -> Result<Self, QueryError> {
        match operator {
            "$eq" => Ok(Self::Eq),
            "$ne" => Ok(Self::Ne),
            "$gt" => Ok(Self::Gt),
            "$gte" => Ok(Self::Gte),
            "$lt" => Ok(Self::Lt),
            "$lte" => Ok(Self::Lte),
            "$in" => Ok(Self::In),
            _ => Err(QueryError::UnknownOperator {
                field: field.to_string(),
                operator: operator.to_string(),
            }),
        }
    }

    /// SQL comparison operator for the scalar operators.
    #[must_use]
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::In => "IN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Condition {
    #[must_use]
    pub fn matches(&self, row: &Object) -> bool {
        let actual = row.get(&self.field).unwrap_or(&Value::Null);
        match self.op {
            CompareOp::Eq => values_equal(actual, &self.value),
            CompareOp::Ne => !values_equal(actual, &self.value),
            CompareOp::In => self
                .value
                .as_array()
                .is_some_and(|candidates| candidates.iter().any(|c| values_equal(actual, c))),
            CompareOp::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            CompareOp::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            CompareOp::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            CompareOp::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

/// Conjunction of conditions. The empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    /// Compiles a (physical) caller query.
    ///
    /// # Errors
    ///
    /// [`QueryError::UnknownOperator`] for an unsupported `$op`, and
    /// [`QueryError::InvalidOperand`] when `$in` is not given an array.
    pub fn from_query(query: &Object) -> Result<Self, QueryError> {
        let mut conditions = Vec::with_capacity(query.len());
        for (field, value) in query {
            match value {
                Value::Object(ops) if is_operator_object(ops) => {
                    for (operator, operand) in ops {
                        let op = CompareOp::parse(field, operator)?;
                        if op == CompareOp::In && !operand.is_array() {
                            return Err(QueryError::InvalidOperand {
                                field: field.clone(),
                                operator: operator.clone(),
                                expected: "an array",
                            });
                        }
                        conditions.push(Condition {
                            field: field.clone(),
                            op,
                            value: operand.clone(),
                        });
                    }
                }
                _ => conditions.push(Condition {
                    field: field.clone(),
                    op: CompareOp::Eq,
                    value: value.clone(),
                }),
            }
        }
        Ok(Self { conditions })
    }

    #[must_use]
    pub fn matches(&self, row: &Object) -> bool {
        self.conditions.iter().all(|condition| condition.matches(row))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

fn is_operator_object(ops: &Object) -> bool {
    !ops.is_empty() && ops.keys().all(|key| key.starts_with('$'))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    #[must_use]
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    #[must_use]
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

/// Sorts rows by the given keys; nulls sort first in ascending order.
pub fn sort_rows(rows: &mut [Object], order: &[OrderBy]) {
    if order.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for key in order {
            let left = a.get(&key.field).unwrap_or(&Value::Null);
            let right = b.get(&key.field).unwrap_or(&Value::Null);
            let ordering = total_order(left, right);
            let ordering = match key.direction {
                Direction::Asc => ordering,
                Direction::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
            _ => a == b,
        },
        _ => left == right,
    }
}

/// Ordering between comparable scalars of the same kind.
fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn total_order(left: &Value, right: &Value) -> Ordering {
    compare(left, right).unwrap_or_else(|| rank(left).cmp(&rank(right)))
}
