// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Tablet schemas and column descriptions.

use std::sync::Arc;

pub use self::column::*;
pub use self::schema::*;
use crate::types::{ColumnId, DataType};

mod column;
mod schema;

pub type TabletSchemaRef = Arc<TabletSchema>;

/// The error type of schema validation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema has no column")]
    NoColumn,
    #[error("schema has no key column")]
    NoKeyColumn,
    #[error("key column {0} must be placed before value columns")]
    KeyNotPrefix(String),
    #[error("duplicated column id {0}")]
    DuplicatedColumnId(ColumnId),
    #[error("key column {0} cannot have an aggregation")]
    KeyWithAggregation(String),
    #[error("value column {0} of an aggregate table needs an aggregation")]
    MissingAggregation(String),
    #[error("aggregation {1} of column {0} does not apply to {2}")]
    InvalidAggregation(String, AggregationKind, DataType),
    #[error("short key column count {0} not in 1..={1}")]
    InvalidShortKey(usize, usize),
    #[error("unknown column id {0}")]
    UnknownColumn(ColumnId),
    #[error("null value in not null column {0}")]
    NullInNotNull(String),
}
