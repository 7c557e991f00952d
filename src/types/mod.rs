// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Logical types of the storage layer.

use std::fmt;

use serde::{Deserialize, Serialize};

mod value;

pub use self::value::*;

/// Unique id of a column inside a tablet schema. Ids are never reused by schema changes.
pub type ColumnId = u32;

/// Id of a tablet (a table/partition shard).
pub type TabletId = u64;

/// Id of a schema version.
pub type SchemaId = u32;

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int32,
    Int64,
    Float64,
    String,
}

impl DataType {
    /// Width of a value in a fixed-width encoding. `None` for variable-length types.
    pub const fn fixed_width(&self) -> Option<usize> {
        match self {
            Self::Bool => Some(1),
            Self::Int32 => Some(4),
            Self::Int64 => Some(8),
            Self::Float64 => Some(8),
            Self::String => None,
        }
    }

    /// Whether values of this type can be summed.
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Int32 | Self::Int64 | Self::Float64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "BOOLEAN",
            Self::Int32 => "INT",
            Self::Int64 => "BIGINT",
            Self::Float64 => "DOUBLE",
            Self::String => "VARCHAR",
        };
        write!(f, "{name}")
    }
}
