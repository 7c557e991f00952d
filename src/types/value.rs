// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::cmp::Ordering;
use std::fmt;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use super::DataType;

/// A wrapper around floats providing implementations of `Eq`, `Ord`, and `Hash`.
pub type F64 = OrderedFloat<f64>;

/// A scalar value.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataValue {
    // NOTE: Null comes first.
    // => NULL is less than any non-NULL values
    #[default]
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(F64),
    String(String),
}

/// A row of values, ordered as the columns of some schema.
pub type Row = Vec<DataValue>;

impl DataValue {
    /// Returns `true` if value is null.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type of value. `None` for NULL.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(DataType::Bool),
            Self::Int32(_) => Some(DataType::Int32),
            Self::Int64(_) => Some(DataType::Int64),
            Self::Float64(_) => Some(DataType::Float64),
            Self::String(_) => Some(DataType::String),
        }
    }

    /// Sum of two values. NULL is the identity. Integer sums wrap on overflow.
    pub fn sum(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Null, v) | (v, Self::Null) => v.clone(),
            (Self::Int32(a), Self::Int32(b)) => Self::Int32(a.wrapping_add(*b)),
            (Self::Int64(a), Self::Int64(b)) => Self::Int64(a.wrapping_add(*b)),
            (Self::Float64(a), Self::Float64(b)) => Self::Float64(OrderedFloat(a.0 + b.0)),
            // not summable, keep the newer value
            (_, v) => v.clone(),
        }
    }

    /// Compares and returns the minimum of two values, ignoring NULL.
    pub fn min_non_null(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Null, v) | (v, Self::Null) => v.clone(),
            (a, b) if b < a => b.clone(),
            (a, _) => a.clone(),
        }
    }

    /// Compares and returns the maximum of two values, ignoring NULL.
    pub fn max_non_null(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Null, v) | (v, Self::Null) => v.clone(),
            (a, b) if b > a => b.clone(),
            (a, _) => a.clone(),
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "'{v}'"),
        }
    }
}

impl From<i32> for DataValue {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        Self::Float64(OrderedFloat(v))
    }
}

impl From<bool> for DataValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl<T: Into<DataValue>> From<Option<T>> for DataValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Compares two rows lexicographically on their first `key_len` values.
pub fn compare_key_prefix(left: &[DataValue], right: &[DataValue], key_len: usize) -> Ordering {
    left[..key_len].cmp(&right[..key_len])
}
