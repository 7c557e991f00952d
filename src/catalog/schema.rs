// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::collections::HashSet;
use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{AggregationKind, SchemaError, TabletColumn};
use crate::types::{ColumnId, DataType, DataValue, Row, SchemaId};

/// Update semantics of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeysType {
    /// Rows sharing a key are all kept.
    Duplicate,
    /// Rows sharing a key are combined column by column.
    Aggregate,
    /// Last write wins.
    Unique,
    /// Last write wins, tracked by a primary index.
    Primary,
}

impl fmt::Display for KeysType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Duplicate => "DUP_KEYS",
            Self::Aggregate => "AGG_KEYS",
            Self::Unique => "UNIQUE_KEYS",
            Self::Primary => "PRIMARY_KEYS",
        };
        write!(f, "{name}")
    }
}

/// The column layout and key semantics of a tablet. Immutable once created.
///
/// Key columns always form a prefix of `columns`, except in projections made for output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletSchema {
    schema_id: SchemaId,
    keys_type: KeysType,
    columns: Vec<TabletColumn>,
    num_key_columns: usize,
    num_short_key_columns: usize,
}

impl TabletSchema {
    /// Create a validated schema.
    pub fn new(
        schema_id: SchemaId,
        keys_type: KeysType,
        columns: Vec<TabletColumn>,
        num_short_key_columns: usize,
    ) -> Result<Self, SchemaError> {
        if columns.is_empty() {
            return Err(SchemaError::NoColumn);
        }
        let num_key_columns = columns.iter().take_while(|c| c.is_key()).count();
        if num_key_columns == 0 {
            return Err(SchemaError::NoKeyColumn);
        }
        if let Some(col) = columns[num_key_columns..].iter().find(|c| c.is_key()) {
            return Err(SchemaError::KeyNotPrefix(col.name().into()));
        }
        let mut ids = HashSet::new();
        for col in &columns {
            if !ids.insert(col.unique_id()) {
                return Err(SchemaError::DuplicatedColumnId(col.unique_id()));
            }
            if col.is_key() && col.aggregation() != AggregationKind::None {
                return Err(SchemaError::KeyWithAggregation(col.name().into()));
            }
            if !col.is_key()
                && keys_type == KeysType::Aggregate
                && col.aggregation() == AggregationKind::None
            {
                return Err(SchemaError::MissingAggregation(col.name().into()));
            }
            if col.aggregation() == AggregationKind::Sum && !col.data_type().is_numeric() {
                return Err(SchemaError::InvalidAggregation(
                    col.name().into(),
                    col.aggregation(),
                    col.data_type(),
                ));
            }
        }
        if num_short_key_columns == 0 || num_short_key_columns > num_key_columns {
            return Err(SchemaError::InvalidShortKey(num_short_key_columns, num_key_columns));
        }
        Ok(TabletSchema {
            schema_id,
            keys_type,
            columns,
            num_key_columns,
            num_short_key_columns,
        })
    }

    pub fn schema_id(&self) -> SchemaId {
        self.schema_id
    }

    pub fn keys_type(&self) -> KeysType {
        self.keys_type
    }

    pub fn columns(&self) -> &[TabletColumn] {
        &self.columns
    }

    pub fn column(&self, idx: usize) -> &TabletColumn {
        &self.columns[idx]
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    pub fn num_short_key_columns(&self) -> usize {
        self.num_short_key_columns
    }

    /// Whether rows sharing a key must be reconciled on merge.
    pub fn need_reconcile(&self) -> bool {
        self.keys_type != KeysType::Duplicate
    }

    /// Unique ids of all columns, in schema order.
    pub fn column_ids(&self) -> Vec<ColumnId> {
        self.columns.iter().map(|c| c.unique_id()).collect()
    }

    pub fn key_column_ids(&self) -> Vec<ColumnId> {
        self.columns[..self.num_key_columns]
            .iter()
            .map(|c| c.unique_id())
            .collect()
    }

    pub fn data_types(&self) -> Vec<DataType> {
        self.columns.iter().map(|c| c.data_type()).collect()
    }

    /// Position of the column with `unique_id`.
    pub fn column_index(&self, unique_id: ColumnId) -> Option<usize> {
        self.columns.iter().position(|c| c.unique_id() == unique_id)
    }

    pub fn column_by_id(&self, unique_id: ColumnId) -> Option<&TabletColumn> {
        self.columns.iter().find(|c| c.unique_id() == unique_id)
    }

    /// The effective aggregation of the column at `idx`.
    ///
    /// Value columns of UNIQUE and PRIMARY tables always combine with `Replace`.
    pub fn aggregation(&self, idx: usize) -> AggregationKind {
        let col = &self.columns[idx];
        if col.is_key() {
            return AggregationKind::None;
        }
        match self.keys_type {
            KeysType::Aggregate => col.aggregation(),
            KeysType::Unique | KeysType::Primary => AggregationKind::Replace,
            KeysType::Duplicate => AggregationKind::None,
        }
    }

    /// Whether a chunk of `types` matches the columns of this schema.
    pub fn is_compatible_with(&self, types: &[DataType]) -> bool {
        self.columns.len() == types.len()
            && self
                .columns
                .iter()
                .zip(types)
                .all(|(c, ty)| c.data_type() == *ty)
    }

    /// The short key of a row laid out in this schema.
    pub fn short_key(&self, row: &[DataValue]) -> Row {
        row[..self.num_short_key_columns].to_vec()
    }

    /// Build the partial view referenced by a partial-column rowset.
    ///
    /// Key columns are always kept. Columns keep their order in this schema.
    pub fn partial(&self, column_ids: &[ColumnId]) -> Result<Self, SchemaError> {
        if let Some(id) = column_ids.iter().find(|id| self.column_index(**id).is_none()) {
            return Err(SchemaError::UnknownColumn(*id));
        }
        let columns = self
            .columns
            .iter()
            .filter(|c| c.is_key() || column_ids.contains(&c.unique_id()))
            .cloned()
            .collect_vec();
        Ok(TabletSchema {
            schema_id: self.schema_id,
            keys_type: self.keys_type,
            columns,
            num_key_columns: self.num_key_columns,
            num_short_key_columns: self.num_short_key_columns,
        })
    }

    /// Build an arbitrary projection in the requested order.
    pub fn project(&self, column_ids: &[ColumnId]) -> Result<Self, SchemaError> {
        let columns = column_ids
            .iter()
            .map(|id| {
                self.column_by_id(*id)
                    .cloned()
                    .ok_or(SchemaError::UnknownColumn(*id))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let num_key_columns = columns.iter().take_while(|c| c.is_key()).count();
        Ok(TabletSchema {
            schema_id: self.schema_id,
            keys_type: self.keys_type,
            columns,
            num_key_columns,
            num_short_key_columns: self.num_short_key_columns.min(num_key_columns),
        })
    }

    /// Split the columns into groups for a vertical write.
    ///
    /// The first group holds every key column. Value columns follow in groups of at most
    /// `max_columns_per_group`.
    pub fn column_groups(&self, max_columns_per_group: usize) -> Vec<Vec<ColumnId>> {
        let max = max_columns_per_group.max(1);
        let mut groups = vec![self.key_column_ids()];
        for chunk in &self.columns[self.num_key_columns..].iter().chunks(max) {
            groups.push(chunk.map(|c| c.unique_id()).collect());
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<TabletColumn> {
        vec![
            TabletColumn::new(0, "k1", DataType::Int32).key(),
            TabletColumn::new(1, "k2", DataType::Int32).key(),
            TabletColumn::new(2, "v1", DataType::Int64).with_aggregation(AggregationKind::Sum),
            TabletColumn::new(3, "v2", DataType::String)
                .nullable()
                .with_aggregation(AggregationKind::Replace),
            TabletColumn::new(4, "v3", DataType::Int32).with_aggregation(AggregationKind::Max),
        ]
    }

    #[test]
    fn test_validate() {
        let schema = TabletSchema::new(1, KeysType::Aggregate, columns(), 1).unwrap();
        assert_eq!(schema.num_key_columns(), 2);
        assert_eq!(schema.aggregation(2), AggregationKind::Sum);

        let mut cols = columns();
        cols.swap(0, 2);
        assert!(matches!(
            TabletSchema::new(1, KeysType::Aggregate, cols, 1),
            Err(SchemaError::NoKeyColumn)
        ));

        let cols = vec![
            TabletColumn::new(0, "k1", DataType::Int32).key(),
            TabletColumn::new(1, "v1", DataType::Int32),
        ];
        assert!(matches!(
            TabletSchema::new(1, KeysType::Aggregate, cols.clone(), 1),
            Err(SchemaError::MissingAggregation(_))
        ));
        assert!(TabletSchema::new(1, KeysType::Duplicate, cols.clone(), 1).is_ok());
        assert!(matches!(
            TabletSchema::new(1, KeysType::Duplicate, cols, 2),
            Err(SchemaError::InvalidShortKey(2, 1))
        ));
    }

    #[test]
    fn test_replace_for_unique() {
        let schema = TabletSchema::new(1, KeysType::Primary, columns(), 2).unwrap();
        assert_eq!(schema.aggregation(2), AggregationKind::Replace);
        assert_eq!(schema.aggregation(0), AggregationKind::None);
    }

    #[test]
    fn test_partial_and_project() {
        let schema = TabletSchema::new(1, KeysType::Unique, columns(), 1).unwrap();
        let partial = schema.partial(&[4, 2]).unwrap();
        assert_eq!(partial.column_ids(), vec![0, 1, 2, 4]);
        assert_eq!(partial.num_key_columns(), 2);

        let projected = schema.project(&[3, 0]).unwrap();
        assert_eq!(projected.column_ids(), vec![3, 0]);
        assert_eq!(projected.num_key_columns(), 0);
        assert!(matches!(schema.project(&[9]), Err(SchemaError::UnknownColumn(9))));
    }

    #[test]
    fn test_column_groups() {
        let schema = TabletSchema::new(1, KeysType::Unique, columns(), 1).unwrap();
        assert_eq!(schema.column_groups(1), vec![vec![0, 1], vec![2], vec![3], vec![4]]);
        assert_eq!(schema.column_groups(2), vec![vec![0, 1], vec![2, 3], vec![4]]);
    }
}
