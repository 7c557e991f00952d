// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bitvec::prelude::BitVec;

use super::{ColumnPredicate, KeyRange, Segment};
use crate::array::DataChunk;
use crate::catalog::TabletSchemaRef;
use crate::storage::iterator::ChunkIterator;
use crate::storage::{DeleteVector, StorageError, StorageResult, TracedStorageError};
use crate::types::ColumnId;

/// Options of a [`SegmentIterator`].
#[derive(Debug, Clone)]
pub struct SegmentReadOptions {
    pub predicates: Vec<ColumnPredicate>,
    pub key_range: KeyRange,
    /// Key columns of the tablet. Required when `key_range` is bounded.
    pub key_column_ids: Vec<ColumnId>,
    pub delete_vector: Option<Arc<DeleteVector>>,
    pub chunk_size: usize,
}

impl SegmentReadOptions {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            predicates: vec![],
            key_range: KeyRange::default(),
            key_column_ids: vec![],
            delete_vector: None,
            chunk_size,
        }
    }
}

/// Iterates the rows of a segment in the layout of `schema`.
///
/// Rows outside the key range, rows marked in the delete vector and rows failing a predicate
/// are skipped. Zone maps and the short-key index narrow the row ranges before any page
/// is read.
pub struct SegmentIterator {
    segment: Arc<Segment>,
    schema: TabletSchemaRef,
    /// Positions in the segment footer of the output columns, then of extra columns.
    column_positions: Vec<usize>,
    num_output_columns: usize,
    /// Predicates with the index of their column in a read batch.
    predicates: Vec<(usize, ColumnPredicate)>,
    key_range: KeyRange,
    key_indices: Vec<usize>,
    delete_vector: Option<Arc<DeleteVector>>,
    ranges: VecDeque<Range<u64>>,
    chunk_size: u64,
}

impl SegmentIterator {
    pub fn new(
        segment: Arc<Segment>,
        schema: TabletSchemaRef,
        options: SegmentReadOptions,
    ) -> StorageResult<Self> {
        let footer = segment.footer();
        let mut column_positions = vec![];
        let mut column_ids = vec![];
        for column in schema.columns() {
            let (pos, meta) = footer
                .column(column.unique_id())
                .ok_or(StorageError::InvalidColumn(column.unique_id()))?;
            if meta.data_type != column.data_type() {
                return Err(TracedStorageError::schema_mismatch(format!(
                    "column {} is {} in segment {}, requested {}",
                    column.unique_id(),
                    meta.data_type,
                    segment.path().display(),
                    column.data_type()
                )));
            }
            column_positions.push(pos);
            column_ids.push(column.unique_id());
        }
        let num_output_columns = column_positions.len();

        let mut batch_index = |id: ColumnId| -> StorageResult<usize> {
            if let Some(idx) = column_ids.iter().position(|c| *c == id) {
                return Ok(idx);
            }
            let (pos, _) = footer.column(id).ok_or(StorageError::InvalidColumn(id))?;
            column_positions.push(pos);
            column_ids.push(id);
            Ok(column_ids.len() - 1)
        };

        let mut predicates = vec![];
        for predicate in options.predicates {
            let idx = batch_index(predicate.column_id)?;
            let (_, meta) = footer
                .column(predicate.column_id)
                .ok_or(StorageError::InvalidColumn(predicate.column_id))?;
            if !predicate.applies_to(meta.data_type) {
                return Err(TracedStorageError::schema_mismatch(format!(
                    "predicate {predicate} on {} column",
                    meta.data_type
                )));
            }
            predicates.push((idx, predicate));
        }
        let key_indices = if options.key_range.is_full() {
            vec![]
        } else {
            options
                .key_column_ids
                .iter()
                .map(|id| batch_index(*id))
                .collect::<StorageResult<Vec<_>>>()?
        };

        let mut iter = Self {
            segment,
            schema,
            column_positions,
            num_output_columns,
            predicates,
            key_range: options.key_range,
            key_indices,
            delete_vector: options.delete_vector,
            ranges: VecDeque::new(),
            chunk_size: options.chunk_size.max(1) as u64,
        };
        iter.ranges = iter.candidate_ranges().into();
        Ok(iter)
    }

    /// Row ranges that may contain matching rows.
    fn candidate_ranges(&self) -> Vec<Range<u64>> {
        let footer = self.segment.footer();
        let num_rows = footer.num_rows;
        if num_rows == 0 || !self.key_range.overlaps(&footer.min_key, &footer.max_key) {
            return vec![];
        }
        let index = &footer.short_key_index;
        let start = match &self.key_range.lower {
            Some(lower) if index.interval > 0 => index.seek_lower(lower),
            _ => 0,
        };
        let end = match &self.key_range.upper {
            Some(upper) if index.interval > 0 => index.seek_upper(upper, num_rows),
            _ => num_rows,
        };
        let mut ranges = if start < end { vec![start..end] } else { vec![] };

        for (idx, predicate) in &self.predicates {
            let column = self.segment.column_meta(self.column_positions[*idx]);
            if !predicate.may_match(&column.zone_map) {
                return vec![];
            }
            let matching = column
                .pages
                .iter()
                .filter(|page| predicate.may_match(&page.zone_map()))
                .map(|page| page.first_ordinal..page.first_ordinal + page.row_count)
                .collect::<Vec<_>>();
            ranges = intersect_ranges(&ranges, &matching);
        }
        ranges
    }

    /// Read the next batch of candidate rows without filtering.
    async fn read_next(&mut self) -> StorageResult<Option<(u64, DataChunk)>> {
        let Some(range) = self.ranges.pop_front() else {
            return Ok(None);
        };
        let end = range.end.min(range.start + self.chunk_size);
        if end < range.end {
            self.ranges.push_front(end..range.end);
        }
        let mut arrays = Vec::with_capacity(self.column_positions.len());
        for pos in &self.column_positions {
            arrays.push(self.segment.read_column(*pos, range.start..end).await?);
        }
        let chunk = if arrays.is_empty() {
            DataChunk::no_column((end - range.start) as usize)
        } else {
            arrays.into_iter().collect()
        };
        Ok(Some((range.start, chunk)))
    }
}

#[async_trait]
impl ChunkIterator for SegmentIterator {
    fn schema(&self) -> &TabletSchemaRef {
        &self.schema
    }

    async fn next_batch(&mut self) -> StorageResult<Option<DataChunk>> {
        while let Some((start, chunk)) = self.read_next().await? {
            let mut visibility = BitVec::new();
            visibility.resize(chunk.cardinality(), true);
            if let Some(dv) = &self.delete_vector {
                dv.apply_to(&mut visibility, start as u32);
            }
            let mut visibility = visibility.iter().by_vals().collect::<Vec<bool>>();
            for (idx, predicate) in &self.predicates {
                predicate.filter(chunk.array_at(*idx), &mut visibility);
            }
            if !self.key_indices.is_empty() {
                for (row, visible) in visibility.iter_mut().enumerate() {
                    if *visible {
                        let key = self
                            .key_indices
                            .iter()
                            .map(|idx| chunk.array_at(*idx).get(row))
                            .collect::<Vec<_>>();
                        *visible = self.key_range.contains(&key);
                    }
                }
            }
            let output = (0..self.num_output_columns).collect::<Vec<_>>();
            let chunk = chunk.filter(&visibility).project(&output);
            if !chunk.is_empty() {
                return Ok(Some(chunk));
            }
        }
        Ok(None)
    }
}

/// Intersect two sorted lists of disjoint ranges.
fn intersect_ranges(left: &[Range<u64>], right: &[Range<u64>]) -> Vec<Range<u64>> {
    let mut output: Vec<Range<u64>> = vec![];
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        let start = left[i].start.max(right[j].start);
        let end = left[i].end.min(right[j].end);
        if start < end {
            match output.last_mut() {
                Some(last) if last.end == start => last.end = end,
                _ => output.push(start..end),
            }
        }
        if left[i].end < right[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }
    output
}
