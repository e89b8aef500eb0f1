//! Typed column values (§3, §9).
//!
//! One sum type covers the fixed taxonomy in §2; `Null` is a variant of it,
//! not a sentinel of another type. `BigInt` is carried as `i128` rather than
//! `f64` so large values never get silently narrowed.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CompareOp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ColumnValue {
    Integer(i32),
    BigInt(i128),
    Float(f64),
    String(String),
    Uuid(Uuid),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Boolean(bool),
    /// Opaque encoded JSON text, passed through without interpretation.
    Json(String),
    /// Opaque encoded array text, passed through without interpretation.
    Array(String),
    Null,
}

impl ColumnValue {
    /// A stable string form used to build primary-key `Key`s and for
    /// debugging. Not intended to round-trip.
    pub fn canonical_key(&self) -> String {
        match self {
            ColumnValue::Integer(v) => v.to_string(),
            ColumnValue::BigInt(v) => v.to_string(),
            ColumnValue::Float(v) => v.to_string(),
            ColumnValue::String(v) => v.clone(),
            ColumnValue::Uuid(v) => v.to_string(),
            ColumnValue::Timestamp(v) => v.to_string(),
            ColumnValue::Date(v) => v.to_string(),
            ColumnValue::Time(v) => v.to_string(),
            ColumnValue::Boolean(v) => v.to_string(),
            ColumnValue::Json(v) | ColumnValue::Array(v) => v.clone(),
            ColumnValue::Null => String::new(),
        }
    }

    /// Compare `self` against `other` under `op`. Mismatched types, and
    /// ordering comparisons on types with no total order (`Uuid`, `Json`,
    /// `Array`, `Boolean`), evaluate to `false` rather than panicking.
    pub fn compare(&self, op: &CompareOp, other: &ColumnValue) -> bool {
        use std::cmp::Ordering;

        if matches!(op, CompareOp::Eq) {
            return self == other;
        }
        if matches!(op, CompareOp::Ne) {
            return self != other;
        }

        let ordering = match (self, other) {
            (ColumnValue::Integer(a), ColumnValue::Integer(b)) => a.partial_cmp(b),
            (ColumnValue::BigInt(a), ColumnValue::BigInt(b)) => a.partial_cmp(b),
            (ColumnValue::Integer(a), ColumnValue::BigInt(b)) => (*a as i128).partial_cmp(b),
            (ColumnValue::BigInt(a), ColumnValue::Integer(b)) => a.partial_cmp(&(*b as i128)),
            (ColumnValue::Float(a), ColumnValue::Float(b)) => a.partial_cmp(b),
            (ColumnValue::String(a), ColumnValue::String(b)) => a.partial_cmp(b),
            (ColumnValue::Timestamp(a), ColumnValue::Timestamp(b)) => a.partial_cmp(b),
            (ColumnValue::Date(a), ColumnValue::Date(b)) => a.partial_cmp(b),
            (ColumnValue::Time(a), ColumnValue::Time(b)) => a.partial_cmp(b),
            _ => None,
        };

        match ordering {
            Some(Ordering::Less) => matches!(op, CompareOp::Lt | CompareOp::Le),
            Some(Ordering::Equal) => matches!(op, CompareOp::Le | CompareOp::Ge),
            Some(Ordering::Greater) => matches!(op, CompareOp::Gt | CompareOp::Ge),
            None => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }
}
