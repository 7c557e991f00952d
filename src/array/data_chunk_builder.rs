// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::iter::IntoIterator;

use itertools::Itertools;

use super::{ArrayBuilderImpl, DataChunk};
use crate::types::{DataType, DataValue};

/// Accumulates rows and emits a [`DataChunk`] every `capacity` rows.
pub struct DataChunkBuilder {
    data_types: Vec<DataType>,
    array_builders: Vec<ArrayBuilderImpl>,
    size: usize,
    capacity: usize,
}

impl DataChunkBuilder {
    pub fn new(data_types: impl IntoIterator<Item = DataType>, capacity: usize) -> Self {
        assert_ne!(capacity, 0);
        let data_types = data_types.into_iter().collect_vec();
        let array_builders = Self::new_builders(&data_types, capacity);
        DataChunkBuilder {
            data_types,
            array_builders,
            size: 0,
            capacity,
        }
    }

    fn new_builders(data_types: &[DataType], capacity: usize) -> Vec<ArrayBuilderImpl> {
        data_types
            .iter()
            .map(|ty| ArrayBuilderImpl::with_capacity(capacity, *ty))
            .collect()
    }

    /// Push a row in the Iterator.
    ///
    /// The row is accepted as an iterator of [`DataValue`], and it's required that the size of row
    /// should be the same as the number of columns.
    ///
    /// A [`DataChunk`] will be returned if `size == capacity`.
    #[must_use]
    pub fn push_row(&mut self, row: impl IntoIterator<Item = DataValue>) -> Option<DataChunk> {
        self.array_builders
            .iter_mut()
            .zip_eq(row)
            .for_each(|(builder, v)| builder.push(&v));
        self.size += 1;
        self.take_if_full()
    }

    /// Push the `row`-th row of `chunk`.
    #[must_use]
    pub fn push_from(&mut self, chunk: &DataChunk, row: usize) -> Option<DataChunk> {
        for (builder, array) in self.array_builders.iter_mut().zip_eq(chunk.arrays()) {
            builder.push_from(array, row);
        }
        self.size += 1;
        self.take_if_full()
    }

    fn take_if_full(&mut self) -> Option<DataChunk> {
        if self.size == self.capacity {
            self.take()
        } else {
            None
        }
    }

    /// Number of buffered rows.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Generate a [`DataChunk`] with the remaining rows.
    ///
    /// If there are no remaining rows, `None` will be returned.
    #[must_use]
    pub fn take(&mut self) -> Option<DataChunk> {
        if self.size == 0 {
            return None;
        }
        let size = std::mem::take(&mut self.size);
        if self.data_types.is_empty() {
            return Some(DataChunk::no_column(size));
        }
        let builders = std::mem::replace(
            &mut self.array_builders,
            Self::new_builders(&self.data_types, self.capacity),
        );
        Some(builders.into_iter().map(|b| b.finish()).collect())
    }
}
