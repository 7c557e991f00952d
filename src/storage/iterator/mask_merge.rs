// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use async_trait::async_trait;

use super::aggregate::combine_row;
use super::{BoxedChunkIterator, ChunkIterator, RowSourcePlan};
use crate::array::DataChunk;
use crate::catalog::{AggregationKind, TabletSchemaRef};
use crate::storage::{StorageResult, TracedStorageError};
use crate::types::Row;

/// [`MaskMergeIterator`] merges one value group of a vertical compaction by replaying the
/// [`RowSourcePlan`] recorded while merging the key group.
///
/// Children must be the same sources, in the same order, as the key group merge.
pub struct MaskMergeIterator {
    schema: TabletSchemaRef,
    iters: Vec<BoxedChunkIterator>,
    buffers: Vec<Option<(DataChunk, usize)>>,
    plan: Arc<RowSourcePlan>,
    pos: usize,
    aggregations: Vec<AggregationKind>,
    pending: Option<Row>,
    chunk_size: usize,
}

impl MaskMergeIterator {
    pub fn new(
        schema: TabletSchemaRef,
        iters: Vec<BoxedChunkIterator>,
        plan: Arc<RowSourcePlan>,
        chunk_size: usize,
    ) -> Self {
        Self {
            aggregations: (0..schema.num_columns()).map(|i| schema.aggregation(i)).collect(),
            schema,
            buffers: (0..iters.len()).map(|_| None).collect(),
            iters,
            plan,
            pos: 0,
            pending: None,
            chunk_size: chunk_size.max(1),
        }
    }

    async fn next_row(&mut self, source: usize) -> StorageResult<Row> {
        loop {
            if let Some((chunk, row)) = &mut self.buffers[source] {
                if *row < chunk.cardinality() {
                    let output = chunk.row(*row);
                    *row += 1;
                    return Ok(output);
                }
            }
            let iter = self.iters.get_mut(source).ok_or_else(|| {
                TracedStorageError::invalid_state(format!("row source {source} out of range"))
            })?;
            match iter.next_batch().await? {
                Some(chunk) => self.buffers[source] = Some((chunk, 0)),
                None => {
                    return Err(TracedStorageError::invalid_state(format!(
                        "row source {source} exhausted before the plan"
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl ChunkIterator for MaskMergeIterator {
    fn schema(&self) -> &TabletSchemaRef {
        &self.schema
    }

    async fn next_batch(&mut self) -> StorageResult<Option<DataChunk>> {
        let mut output: Vec<Row> = vec![];
        while output.len() < self.chunk_size {
            let Some(source) = self.plan.sources().get(self.pos).copied() else {
                output.extend(self.pending.take());
                break;
            };
            self.pos += 1;
            let row = self.next_row(source.source as usize).await?;
            if source.agg_flag {
                if let Some(acc) = &mut self.pending {
                    combine_row(acc, row, &self.aggregations);
                    continue;
                }
            }
            output.extend(self.pending.replace(row));
        }
        if output.is_empty() {
            return Ok(None);
        }
        Ok(Some(DataChunk::from_rows(
            &self.schema.data_types(),
            output.iter().map(|r| r.as_slice()),
        )))
    }
}
