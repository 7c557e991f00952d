// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use async_trait::async_trait;

use super::{BoxedChunkIterator, ChunkIterator};
use crate::array::{DataChunk, DataChunkBuilder};
use crate::catalog::TabletSchemaRef;
use crate::storage::StorageResult;
use crate::types::Row;

/// A pending row in the merge heap. Rows are ordered by key, then by source.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    key: Row,
    source: usize,
    row: usize,
}

/// [`MergeIterator`] merges sorted children into one stream sorted by the key columns.
///
/// Rows sharing a key are returned in the order of their sources, so children should be
/// passed from the oldest to the newest.
pub struct MergeIterator {
    schema: TabletSchemaRef,
    iters: Vec<BoxedChunkIterator>,

    /// Current chunk of each child
    buffers: Vec<Option<DataChunk>>,

    /// The min-heap of the next row of each child. Never larger than `iters.len()`.
    heap: BinaryHeap<Reverse<HeapEntry>>,

    initialized: bool,
    chunk_size: usize,
}

impl MergeIterator {
    pub fn new(schema: TabletSchemaRef, iters: Vec<BoxedChunkIterator>, chunk_size: usize) -> Self {
        Self {
            schema,
            buffers: (0..iters.len()).map(|_| None).collect(),
            iters,
            heap: BinaryHeap::new(),
            initialized: false,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn num_sources(&self) -> usize {
        self.iters.len()
    }

    /// Fetch the next non-empty chunk of a child and push its first row.
    async fn fill(&mut self, source: usize) -> StorageResult<()> {
        self.buffers[source] = None;
        while let Some(chunk) = self.iters[source].next_batch().await? {
            if chunk.is_empty() {
                continue;
            }
            self.push_entry(source, &chunk, 0);
            self.buffers[source] = Some(chunk);
            break;
        }
        Ok(())
    }

    fn push_entry(&mut self, source: usize, chunk: &DataChunk, row: usize) {
        let key = chunk.row_prefix(row, self.schema.num_key_columns());
        self.heap.push(Reverse(HeapEntry { key, source, row }));
    }

    /// Return the next batch, with the source of every row.
    pub async fn next_batch_with_sources(&mut self) -> StorageResult<Option<(DataChunk, Vec<usize>)>> {
        if !self.initialized {
            for source in 0..self.iters.len() {
                self.fill(source).await?;
            }
            self.initialized = true;
        }

        let mut builder = DataChunkBuilder::new(self.schema.data_types(), self.chunk_size);
        let mut sources = Vec::with_capacity(self.chunk_size);
        while let Some(Reverse(entry)) = self.heap.pop() {
            let HeapEntry { source, row, .. } = entry;
            let Some(chunk) = self.buffers[source].take() else {
                unreachable!("heap entry without buffered chunk");
            };
            sources.push(source);
            let full = builder.push_from(&chunk, row);
            if row + 1 < chunk.cardinality() {
                self.push_entry(source, &chunk, row + 1);
                self.buffers[source] = Some(chunk);
            } else {
                self.fill(source).await?;
            }
            if let Some(output) = full {
                return Ok(Some((output, sources)));
            }
        }
        Ok(builder.take().map(|output| (output, sources)))
    }
}

#[async_trait]
impl ChunkIterator for MergeIterator {
    fn schema(&self) -> &TabletSchemaRef {
        &self.schema
    }

    async fn next_batch(&mut self) -> StorageResult<Option<DataChunk>> {
        Ok(self.next_batch_with_sources().await?.map(|(chunk, _)| chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::KeysType;
    use crate::storage::iterator::test_util::*;

    #[tokio::test]
    async fn test_merge() {
        let schema = kv_schema(KeysType::Duplicate);
        let mut iter = MergeIterator::new(
            schema.clone(),
            vec![
                MockIterator::boxed(schema.clone(), vec![vec![kv(1, 0), kv(3, 0)], vec![kv(5, 0)]]),
                MockIterator::boxed(schema.clone(), vec![vec![kv(1, 1), kv(2, 1)], vec![kv(6, 1)]]),
                MockIterator::boxed(schema, vec![vec![kv(0, 2)]]),
            ],
            2,
        );
        let mut rows = vec![];
        let mut all_sources = vec![];
        while let Some((chunk, sources)) = iter.next_batch_with_sources().await.unwrap() {
            assert!(chunk.cardinality() <= 2);
            assert_eq!(chunk.cardinality(), sources.len());
            rows.extend(chunk.rows());
            all_sources.extend(sources);
        }
        assert_eq!(
            rows,
            vec![kv(0, 2), kv(1, 0), kv(1, 1), kv(2, 1), kv(3, 0), kv(5, 0), kv(6, 1)]
        );
        assert_eq!(all_sources, vec![2, 0, 1, 1, 0, 0, 1]);
    }
}
