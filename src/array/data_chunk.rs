// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::ops::Range;

use smallvec::SmallVec;

use super::*;
use crate::types::{DataValue, Row};

/// A collection of arrays.
///
/// A chunk is a horizontal subset of a rowset, with one array per column.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DataChunk {
    arrays: SmallVec<[ArrayImpl; 16]>,
    cardinality: usize,
}

impl FromIterator<ArrayImpl> for DataChunk {
    fn from_iter<I: IntoIterator<Item = ArrayImpl>>(iter: I) -> Self {
        let arrays: SmallVec<[ArrayImpl; 16]> = iter.into_iter().collect();
        let cardinality = arrays.first().map_or(0, ArrayImpl::len);
        assert!(
            arrays.iter().map(|a| a.len()).all(|l| l == cardinality),
            "all arrays must have the same length"
        );
        DataChunk {
            arrays,
            cardinality,
        }
    }
}

impl DataChunk {
    /// Create a chunk with no columns but `cardinality` rows.
    pub fn no_column(cardinality: usize) -> Self {
        DataChunk {
            arrays: SmallVec::new(),
            cardinality,
        }
    }

    /// Build a chunk from rows. All rows must match `types`.
    pub fn from_rows<'a>(
        types: &[DataType],
        rows: impl IntoIterator<Item = &'a [DataValue]>,
    ) -> Self {
        let mut builders = types
            .iter()
            .map(|ty| ArrayBuilderImpl::with_capacity(0, *ty))
            .collect::<Vec<_>>();
        let mut cardinality = 0;
        for row in rows {
            for (builder, value) in builders.iter_mut().zip(row) {
                builder.push(value);
            }
            cardinality += 1;
        }
        if builders.is_empty() {
            return Self::no_column(cardinality);
        }
        builders.into_iter().map(|b| b.finish()).collect()
    }

    /// Return the number of rows in the chunk.
    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    pub fn is_empty(&self) -> bool {
        self.cardinality == 0
    }

    pub fn column_count(&self) -> usize {
        self.arrays.len()
    }

    /// Get the reference of array by index.
    pub fn array_at(&self, idx: usize) -> &ArrayImpl {
        &self.arrays[idx]
    }

    /// Get all arrays.
    pub fn arrays(&self) -> &[ArrayImpl] {
        &self.arrays
    }

    /// Logical types of all columns.
    pub fn data_types(&self) -> Vec<DataType> {
        self.arrays.iter().map(|a| a.data_type()).collect()
    }

    /// Get the values of a row.
    pub fn row(&self, idx: usize) -> Row {
        self.arrays.iter().map(|arr| arr.get(idx)).collect()
    }

    /// Get the values of the first `len` columns of a row.
    pub fn row_prefix(&self, idx: usize, len: usize) -> Row {
        self.arrays[..len].iter().map(|arr| arr.get(idx)).collect()
    }

    /// Iterate over all rows.
    pub fn rows(&self) -> impl Iterator<Item = Row> + '_ {
        (0..self.cardinality).map(|idx| self.row(idx))
    }

    /// Filter elements and create a new chunk.
    pub fn filter(&self, visibility: &[bool]) -> Self {
        assert_eq!(visibility.len(), self.cardinality);
        let cardinality = visibility.iter().filter(|v| **v).count();
        let arrays = self.arrays.iter().map(|a| a.filter(visibility)).collect();
        DataChunk {
            arrays,
            cardinality,
        }
    }

    /// Return a slice of rows.
    pub fn slice(&self, range: Range<usize>) -> Self {
        let arrays = self.arrays.iter().map(|a| a.slice(range.clone())).collect();
        DataChunk {
            arrays,
            cardinality: range.len(),
        }
    }

    /// Gather rows at `indices`.
    pub fn take(&self, indices: &[usize]) -> Self {
        let arrays = self.arrays.iter().map(|a| a.take(indices)).collect();
        DataChunk {
            arrays,
            cardinality: indices.len(),
        }
    }

    /// Select columns by their positions.
    pub fn project(&self, indices: &[usize]) -> Self {
        DataChunk {
            arrays: indices.iter().map(|i| self.arrays[*i].clone()).collect(),
            cardinality: self.cardinality,
        }
    }

    /// Concatenate the columns of `other` to the right of `self`.
    pub fn zip(self, other: DataChunk) -> Self {
        assert_eq!(self.cardinality, other.cardinality);
        let mut arrays = self.arrays;
        arrays.extend(other.arrays);
        DataChunk {
            arrays,
            cardinality: self.cardinality,
        }
    }

    /// Concatenate multiple chunks into one, vertically.
    pub fn concat(chunks: &[DataChunk]) -> Option<Self> {
        let first = chunks.first()?;
        let cardinality = chunks.iter().map(|c| c.cardinality()).sum();
        if first.column_count() == 0 {
            return Some(Self::no_column(cardinality));
        }
        let mut builders = first
            .arrays
            .iter()
            .map(|a| ArrayBuilderImpl::with_capacity(cardinality, a.data_type()))
            .collect::<Vec<_>>();
        for chunk in chunks {
            for (builder, array) in builders.iter_mut().zip(chunk.arrays.iter()) {
                builder.append(array);
            }
        }
        Some(builders.into_iter().map(|b| b.finish()).collect())
    }
}
