//! The query algebra.
//!
//! Filters are plain data: a tree of logical connectives over per-field
//! operators, with type-erased [`Value`] payloads. The constructors below
//! are the public way to build trees; [`translate`](crate::query::translate)
//! lowers them to parameterised SQL against a schema.

use serde::{Deserialize, Serialize};

use crate::value::Value;

pub(crate) mod cache;
pub mod translate;

/// A filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Query {
    /// Matches every document.
    Empty,
    /// An operator applied to one field. The name may be dotted for nested
    /// extraction (`address.city`).
    Field { field: String, op: FieldOp },
    And(Vec<Query>),
    Or(Vec<Query>),
    Nor(Vec<Query>),
    Not(Box<Query>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldOp {
    Compare(CompareOp),
    String(StringOp),
    Array(ArrayOp),
    Exists(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StringOp {
    /// Raw SQL LIKE pattern, caller-supplied wildcards.
    Like(String),
    /// Case-insensitive LIKE.
    ILike(String),
    /// Substring match; the value is wrapped in `%...%`.
    Contains(String),
    StartsWith(String),
    EndsWith(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayOp {
    /// Every listed value is an element of the array.
    All(Vec<Value>),
    /// The array has exactly `n` elements.
    Size(u32),
    /// Some element of the array matches the inner filter.
    ElemMatch(Box<Query>),
    /// The element at a fixed index equals the value.
    Index(u32, Value),
}

impl Query {
    fn field(name: impl Into<String>, op: FieldOp) -> Query {
        Query::Field {
            field: name.into(),
            op,
        }
    }

    /// True when the tree contains a node the translation cache must not
    /// memoise (inner filters and positional array access).
    pub(crate) fn bypasses_cache(&self) -> bool {
        match self {
            Query::Empty => false,
            Query::Field { op, .. } => matches!(
                op,
                FieldOp::Array(ArrayOp::ElemMatch(_)) | FieldOp::Array(ArrayOp::Index(..))
            ),
            Query::And(qs) | Query::Or(qs) | Query::Nor(qs) => {
                qs.iter().any(Query::bypasses_cache)
            }
            Query::Not(q) => q.bypasses_cache(),
        }
    }
}

pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Query {
    Query::field(field, FieldOp::Compare(CompareOp::Eq(value.into())))
}

pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Query {
    Query::field(field, FieldOp::Compare(CompareOp::Ne(value.into())))
}

pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Query {
    Query::field(field, FieldOp::Compare(CompareOp::Gt(value.into())))
}

pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Query {
    Query::field(field, FieldOp::Compare(CompareOp::Gte(value.into())))
}

pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Query {
    Query::field(field, FieldOp::Compare(CompareOp::Lt(value.into())))
}

pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Query {
    Query::field(field, FieldOp::Compare(CompareOp::Lte(value.into())))
}

pub fn is_in(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<Value>>) -> Query {
    let values = values.into_iter().map(Into::into).collect();
    Query::field(field, FieldOp::Compare(CompareOp::In(values)))
}

pub fn not_in(
    field: impl Into<String>,
    values: impl IntoIterator<Item = impl Into<Value>>,
) -> Query {
    let values = values.into_iter().map(Into::into).collect();
    Query::field(field, FieldOp::Compare(CompareOp::NotIn(values)))
}

pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Query {
    Query::field(field, FieldOp::String(StringOp::Like(pattern.into())))
}

pub fn ilike(field: impl Into<String>, pattern: impl Into<String>) -> Query {
    Query::field(field, FieldOp::String(StringOp::ILike(pattern.into())))
}

pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Query {
    Query::field(field, FieldOp::String(StringOp::Contains(needle.into())))
}

pub fn starts_with(field: impl Into<String>, prefix: impl Into<String>) -> Query {
    Query::field(field, FieldOp::String(StringOp::StartsWith(prefix.into())))
}

pub fn ends_with(field: impl Into<String>, suffix: impl Into<String>) -> Query {
    Query::field(field, FieldOp::String(StringOp::EndsWith(suffix.into())))
}

pub fn exists(field: impl Into<String>, present: bool) -> Query {
    Query::field(field, FieldOp::Exists(present))
}

pub fn all(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<Value>>) -> Query {
    let values = values.into_iter().map(Into::into).collect();
    Query::field(field, FieldOp::Array(ArrayOp::All(values)))
}

pub fn size(field: impl Into<String>, len: u32) -> Query {
    Query::field(field, FieldOp::Array(ArrayOp::Size(len)))
}

pub fn elem_match(field: impl Into<String>, inner: Query) -> Query {
    Query::field(field, FieldOp::Array(ArrayOp::ElemMatch(Box::new(inner))))
}

pub fn at_index(field: impl Into<String>, index: u32, value: impl Into<Value>) -> Query {
    Query::field(field, FieldOp::Array(ArrayOp::Index(index, value.into())))
}

pub fn and(queries: impl IntoIterator<Item = Query>) -> Query {
    Query::And(queries.into_iter().collect())
}

pub fn or(queries: impl IntoIterator<Item = Query>) -> Query {
    Query::Or(queries.into_iter().collect())
}

pub fn nor(queries: impl IntoIterator<Item = Query>) -> Query {
    Query::Nor(queries.into_iter().collect())
}

pub fn not(query: Query) -> Query {
    Query::Not(Box::new(query))
}

/// Normalises a tree before lowering: flattens nested `And`/`Or` of the
/// same constructor, drops singleton connectives, rewrites empty
/// connectives to `Empty` and cancels double negation. Idempotent.
pub fn simplify(query: Query) -> Query {
    match query {
        Query::And(qs) => simplify_connective(qs, true),
        Query::Or(qs) => simplify_connective(qs, false),
        Query::Nor(qs) => {
            let inner: Vec<Query> = qs.into_iter().map(simplify).collect();
            if inner.is_empty() {
                Query::Empty
            } else {
                Query::Nor(inner)
            }
        }
        Query::Not(q) => match simplify(*q) {
            Query::Not(inner) => *inner,
            q => Query::Not(Box::new(q)),
        },
        q => q,
    }
}

fn simplify_connective(queries: Vec<Query>, is_and: bool) -> Query {
    let mut flat = Vec::with_capacity(queries.len());
    for q in queries {
        match simplify(q) {
            Query::And(inner) if is_and => flat.extend(inner),
            Query::Or(inner) if !is_and => flat.extend(inner),
            q => flat.push(q),
        }
    }
    match flat.len() {
        0 => Query::Empty,
        1 => flat.remove(0),
        _ if is_and => Query::And(flat),
        _ => Query::Or(flat),
    }
}
