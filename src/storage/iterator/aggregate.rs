// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use async_trait::async_trait;

use super::{ChunkIterator, MergeIterator};
use crate::array::DataChunk;
use crate::catalog::{AggregationKind, TabletSchemaRef};
use crate::storage::{StorageResult, TracedStorageError};
use crate::types::Row;

/// Where a merged input row came from, and whether it is folded into the row before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSource {
    pub source: u32,
    pub agg_flag: bool,
}

/// The survivorship decision of a merge, one [`RowSource`] per input row in merge order.
///
/// The plan is computed once from the key columns and replayed for every value group of a
/// vertical compaction, so that all groups keep the same rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSourcePlan {
    sources: Vec<RowSource>,
}

impl RowSourcePlan {
    pub fn push(&mut self, source: usize, agg_flag: bool) -> StorageResult<()> {
        let source = u32::try_from(source).map_err(|_| {
            TracedStorageError::invalid_state(format!("row source {source} out of range"))
        })?;
        self.sources.push(RowSource { source, agg_flag });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn sources(&self) -> &[RowSource] {
        &self.sources
    }

    /// Number of rows produced by replaying the plan.
    pub fn num_output_rows(&self) -> usize {
        self.sources.iter().filter(|s| !s.agg_flag).count()
    }
}

/// Combine `newer` into `acc` column by column.
pub fn combine_row(acc: &mut Row, newer: Row, aggregations: &[AggregationKind]) {
    for ((value, newer), kind) in acc.iter_mut().zip(newer).zip(aggregations) {
        if *kind != AggregationKind::None {
            *value = kind.combine(value, &newer);
        }
    }
}

/// [`AggregateIterator`] reconciles rows sharing a key after a merge, following the keys
/// type of the schema. Duplicate tables pass rows through.
pub struct AggregateIterator {
    merge: MergeIterator,
    aggregations: Vec<AggregationKind>,
    reconcile: bool,
    pending: Option<Row>,
    plan: Option<RowSourcePlan>,
    finished: bool,
    chunk_size: usize,
}

impl AggregateIterator {
    pub fn new(merge: MergeIterator, chunk_size: usize) -> Self {
        let schema = merge.schema().clone();
        Self {
            aggregations: (0..schema.num_columns()).map(|i| schema.aggregation(i)).collect(),
            reconcile: schema.need_reconcile(),
            merge,
            pending: None,
            plan: None,
            finished: false,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Record the row-source plan while iterating.
    pub fn with_plan(mut self) -> Self {
        self.plan = Some(RowSourcePlan::default());
        self
    }

    /// Take the recorded plan. Call after the iterator is drained.
    pub fn take_plan(&mut self) -> Option<RowSourcePlan> {
        self.plan.take()
    }

    fn record(&mut self, source: usize, agg_flag: bool) -> StorageResult<()> {
        match &mut self.plan {
            Some(plan) => plan.push(source, agg_flag),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChunkIterator for AggregateIterator {
    fn schema(&self) -> &TabletSchemaRef {
        self.merge.schema()
    }

    async fn next_batch(&mut self) -> StorageResult<Option<DataChunk>> {
        if self.finished {
            return Ok(None);
        }
        let num_keys = self.merge.schema().num_key_columns();
        let mut output: Vec<Row> = vec![];
        while output.len() < self.chunk_size {
            let Some((chunk, sources)) = self.merge.next_batch_with_sources().await? else {
                output.extend(self.pending.take());
                self.finished = true;
                break;
            };
            for (row, source) in chunk.rows().zip(sources) {
                let same_key = self.reconcile
                    && matches!(&self.pending, Some(acc) if acc[..num_keys] == row[..num_keys]);
                if same_key {
                    if let Some(acc) = &mut self.pending {
                        combine_row(acc, row, &self.aggregations);
                    }
                    self.record(source, true)?;
                } else {
                    output.extend(self.pending.replace(row));
                    self.record(source, false)?;
                }
            }
        }
        if output.is_empty() {
            return Ok(None);
        }
        let types = self.merge.schema().data_types();
        Ok(Some(DataChunk::from_rows(
            &types,
            output.iter().map(|r| r.as_slice()),
        )))
    }
}
