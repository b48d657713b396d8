//! Typed query criteria
//!
//! A closed set of operators evaluated against the properties an entity
//! exposes through [`StatefulEntity::property`]. Stores use the same
//! interpreter for `query` and for the extra filter of a claim, so a filter
//! means the same thing regardless of backend.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

use crate::entity::StatefulEntity;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("Unknown property '{property}' for {kind}")]
    UnknownProperty { kind: &'static str, property: String },

    #[error("Operator '{op}' needs {expected} on the right-hand side")]
    BadOperand { op: Operator, expected: &'static str },

    #[error("Unknown operator: {0}")]
    UnknownOperator(String),
}

/// Value of an entity property, or a criterion operand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    fn rank(&self) -> u8 {
        match self {
            PropertyValue::Null => 0,
            PropertyValue::Bool(_) => 1,
            PropertyValue::Int(_) => 2,
            PropertyValue::Str(_) => 3,
            PropertyValue::List(_) => 4,
        }
    }

    /// Total order used for sorting: Null < Bool < Int < Str < List
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PropertyValue::Bool(a), PropertyValue::Bool(b)) => a.cmp(b),
            (PropertyValue::Int(a), PropertyValue::Int(b)) => a.cmp(b),
            (PropertyValue::Str(a), PropertyValue::Str(b)) => a.cmp(b),
            (PropertyValue::List(a), PropertyValue::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.total_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Ordering only between comparable values of the same kind
    fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (PropertyValue::Int(a), PropertyValue::Int(b)) => Some(a.cmp(b)),
            (PropertyValue::Str(a), PropertyValue::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Str(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Str(v.to_string())
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v as i64)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<Option<String>> for PropertyValue {
    fn from(v: Option<String>) -> Self {
        v.map(PropertyValue::Str).unwrap_or(PropertyValue::Null)
    }
}

impl<T: Into<PropertyValue>> From<Vec<T>> for PropertyValue {
    fn from(v: Vec<T>) -> Self {
        PropertyValue::List(v.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Ne,
    In,
    Like,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::In => "in",
            Operator::Like => "like",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        }
    }

    pub fn parse(s: &str) -> Result<Self, QueryError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "=" | "==" => Ok(Operator::Eq),
            "!=" | "<>" => Ok(Operator::Ne),
            "in" => Ok(Operator::In),
            "like" | "ilike" => Ok(Operator::Like),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Ge),
            other => Err(QueryError::UnknownOperator(other.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One `left <op> right` predicate on a property path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub left: String,
    pub op: Operator,
    pub right: PropertyValue,
}

impl Criterion {
    pub fn new(left: impl Into<String>, op: Operator, right: impl Into<PropertyValue>) -> Self {
        Self {
            left: left.into(),
            op,
            right: right.into(),
        }
    }

    pub fn equal(left: impl Into<String>, right: impl Into<PropertyValue>) -> Self {
        Self::new(left, Operator::Eq, right)
    }

    /// Evaluate against an entity
    pub fn matches<T: StatefulEntity>(&self, entity: &T) -> Result<bool, QueryError> {
        let value = entity
            .property(&self.left)
            .ok_or_else(|| QueryError::UnknownProperty {
                kind: T::KIND,
                property: self.left.clone(),
            })?;
        self.test_value(&value)
    }

    /// Evaluate against a resolved property value
    pub fn test_value(&self, value: &PropertyValue) -> Result<bool, QueryError> {
        // collection-valued properties match when any element does
        if let PropertyValue::List(items) = value
            && self.op != Operator::In
        {
            for item in items {
                if self.test_value(item)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }

        let result = match self.op {
            Operator::Eq => value == &self.right,
            Operator::Ne => value != &self.right,
            Operator::In => match &self.right {
                PropertyValue::List(options) => match value {
                    PropertyValue::List(items) => items.iter().any(|i| options.contains(i)),
                    v => options.contains(v),
                },
                _ => {
                    return Err(QueryError::BadOperand {
                        op: self.op,
                        expected: "a list",
                    });
                }
            },
            Operator::Like => match (&self.right, value) {
                (PropertyValue::Str(pattern), PropertyValue::Str(s)) => like(pattern, s),
                (PropertyValue::Str(_), _) => false,
                _ => {
                    return Err(QueryError::BadOperand {
                        op: self.op,
                        expected: "a string pattern",
                    });
                }
            },
            Operator::Lt => value.compare(&self.right) == Some(Ordering::Less),
            Operator::Le => matches!(
                value.compare(&self.right),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Gt => value.compare(&self.right) == Some(Ordering::Greater),
            Operator::Ge => matches!(
                value.compare(&self.right),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        };
        Ok(result)
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:?}", self.left, self.op, self.right)
    }
}

/// SQL-style LIKE with `%` (any run) and `_` (any single char)
fn like(pattern: &str, s: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = s.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '_' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '%' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '%' {
        pi += 1;
    }
    pi == p.len()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Filter + sort + paging for read APIs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub filter: Vec<Criterion>,
    pub sort_field: Option<String>,
    pub sort_order: SortOrder,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl QuerySpec {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filtered(filter: Vec<Criterion>) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn sorted_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_field = Some(field.into());
        self.sort_order = order;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// All filter criteria hold for `entity`
    pub fn matches<T: StatefulEntity>(&self, entity: &T) -> Result<bool, QueryError> {
        matches_all(&self.filter, entity)
    }

    /// Run the whole query over an in-memory candidate set
    pub fn apply<T: StatefulEntity>(
        &self,
        candidates: impl IntoIterator<Item = T>,
    ) -> Result<Vec<T>, QueryError> {
        let mut selected = Vec::new();
        for entity in candidates {
            if self.matches(&entity)? {
                selected.push(entity);
            }
        }

        if let Some(field) = &self.sort_field {
            let mut keyed = Vec::with_capacity(selected.len());
            for entity in selected {
                let key = entity
                    .property(field)
                    .ok_or_else(|| QueryError::UnknownProperty {
                        kind: T::KIND,
                        property: field.clone(),
                    })?;
                keyed.push((key, entity));
            }
            keyed.sort_by(|(a, _), (b, _)| match self.sort_order {
                SortOrder::Asc => a.total_cmp(b),
                SortOrder::Desc => b.total_cmp(a),
            });
            selected = keyed.into_iter().map(|(_, e)| e).collect();
        }

        let limit = self.limit.unwrap_or(usize::MAX);
        Ok(selected.into_iter().skip(self.offset).take(limit).collect())
    }
}

/// All criteria hold for `entity` (empty filter matches everything)
pub fn matches_all<T: StatefulEntity>(
    filter: &[Criterion],
    entity: &T,
) -> Result<bool, QueryError> {
    for criterion in filter {
        if !criterion.matches(entity)? {
            return Ok(false);
        }
    }
    Ok(true)
}
