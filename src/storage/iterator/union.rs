// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use async_trait::async_trait;

use super::{BoxedChunkIterator, ChunkIterator};
use crate::array::DataChunk;
use crate::catalog::TabletSchemaRef;
use crate::storage::StorageResult;

/// [`UnionIterator`] concatenates the outputs of its children in order.
///
/// This iterator should be used when the children do not overlap, or when the order of
/// rows does not matter.
pub struct UnionIterator {
    schema: TabletSchemaRef,
    iters: Vec<BoxedChunkIterator>,
    current: usize,
}

impl UnionIterator {
    pub fn new(schema: TabletSchemaRef, iters: Vec<BoxedChunkIterator>) -> Self {
        Self {
            schema,
            iters,
            current: 0,
        }
    }
}

#[async_trait]
impl ChunkIterator for UnionIterator {
    fn schema(&self) -> &TabletSchemaRef {
        &self.schema
    }

    async fn next_batch(&mut self) -> StorageResult<Option<DataChunk>> {
        while let Some(iter) = self.iters.get_mut(self.current) {
            match iter.next_batch().await? {
                Some(chunk) if !chunk.is_empty() => return Ok(Some(chunk)),
                Some(_) => continue,
                None => self.current += 1,
            }
        }
        Ok(None)
    }
}
