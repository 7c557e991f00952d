// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ColumnId, DataType, DataValue};

/// How values of a non-key column are combined when two rows share a key.
///
/// The set is closed: every merge path matches it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AggregationKind {
    #[default]
    None,
    Sum,
    Replace,
    ReplaceIfNotNull,
    Min,
    Max,
}

impl AggregationKind {
    /// Combine an `older` value with a `newer` one.
    ///
    /// `None` behaves as `Replace`; it only reaches here for key-less merges.
    pub fn combine(&self, older: &DataValue, newer: &DataValue) -> DataValue {
        match self {
            Self::None | Self::Replace => newer.clone(),
            Self::ReplaceIfNotNull if newer.is_null() => older.clone(),
            Self::ReplaceIfNotNull => newer.clone(),
            Self::Sum => older.sum(newer),
            Self::Min => older.min_non_null(newer),
            Self::Max => older.max_non_null(newer),
        }
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Sum => "SUM",
            Self::Replace => "REPLACE",
            Self::ReplaceIfNotNull => "REPLACE_IF_NOT_NULL",
            Self::Min => "MIN",
            Self::Max => "MAX",
        };
        write!(f, "{name}")
    }
}

/// A column of a tablet schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletColumn {
    unique_id: ColumnId,
    name: String,
    data_type: DataType,
    is_nullable: bool,
    is_key: bool,
    aggregation: AggregationKind,
}

impl TabletColumn {
    /// A non-key, non-nullable column without aggregation.
    pub fn new(unique_id: ColumnId, name: impl Into<String>, data_type: DataType) -> Self {
        TabletColumn {
            unique_id,
            name: name.into(),
            data_type,
            is_nullable: false,
            is_key: false,
            aggregation: AggregationKind::None,
        }
    }

    /// Mark the column as a key column.
    pub fn key(mut self) -> Self {
        self.is_key = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.is_nullable = true;
        self
    }

    pub fn with_aggregation(mut self, aggregation: AggregationKind) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn unique_id(&self) -> ColumnId {
        self.unique_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn is_nullable(&self) -> bool {
        self.is_nullable
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }

    /// The declared aggregation. See [`TabletSchema::aggregation`] for the effective one.
    ///
    /// [`TabletSchema::aggregation`]: super::TabletSchema::aggregation
    pub fn aggregation(&self) -> AggregationKind {
        self.aggregation
    }
}
