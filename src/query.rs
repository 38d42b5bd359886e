//! Typed search predicates and their translation into parameterized SQL.
//!
//! A [`Predicate`] is built once, validated at construction, and compiled by a
//! [`Compiler`] against a [`Schema`] and a [`Dialect`](crate::dialect::Dialect).
//! Compilation is pure: no connection is needed to inspect the produced statement.

mod compile;
mod field;
mod order;
mod page;
mod predicate;

pub use compile::{CompiledQuery, Compiler, PostProcess, Record};
pub(crate) use compile::from_epoch;
pub use field::{Field, FieldType, Schema, Value};
pub use order::{Direction, Nulls, OrderSpec, OrderTerm};
pub use page::{Pagination, Span, SpanAnchor, SpanUnit, first_run};
pub use predicate::{
    Comparator, Comparison, Group, Membership, Predicate, TagMatch, Visitor,
};

use thiserror::Error;

/// Why a literal or comparator does not fit a field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Mismatch {
    #[error("expected a {expected} literal, found {found}")]
    Literal { expected: FieldType, found: FieldType },

    #[error("`{comparator}` is not defined for {ty} fields")]
    Comparator { ty: FieldType, comparator: Comparator },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("type mismatch on field `{field}`: {mismatch}")]
    TypeMismatch { field: String, mismatch: Mismatch },

    #[error("table `{table}` has no searchable field `{field}`")]
    UnknownField { field: String, table: String },

    #[error("the {dialect} dialect does not support {operation}")]
    UnsupportedOperation {
        dialect: &'static str,
        operation: String,
    },

    #[error("a predicate group needs at least one child")]
    EmptyGroup,

    #[error("invalid order term `{term}`: {reason}")]
    InvalidOrder { term: String, reason: &'static str },

    #[error("invalid span `{span}`: {reason}")]
    InvalidSpan { span: String, reason: &'static str },
}
