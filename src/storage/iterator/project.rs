// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use async_trait::async_trait;

use super::{BoxedChunkIterator, ChunkIterator};
use crate::array::DataChunk;
use crate::catalog::TabletSchemaRef;
use crate::storage::{StorageError, StorageResult};
use crate::types::ColumnId;

/// [`ProjectIterator`] keeps the columns of `output` from the chunks of its child.
pub struct ProjectIterator {
    schema: TabletSchemaRef,
    inner: BoxedChunkIterator,
    indices: Vec<usize>,
}

impl ProjectIterator {
    pub fn new(inner: BoxedChunkIterator, column_ids: &[ColumnId]) -> StorageResult<Self> {
        let indices = column_ids
            .iter()
            .map(|id| {
                inner
                    .schema()
                    .column_index(*id)
                    .ok_or_else(|| StorageError::InvalidColumn(*id).into())
            })
            .collect::<StorageResult<Vec<_>>>()?;
        let schema = Arc::new(inner.schema().project(column_ids)?);
        Ok(Self {
            schema,
            inner,
            indices,
        })
    }

    /// Project only if the child does not already return `column_ids` in order.
    pub fn new_if_needed(
        inner: BoxedChunkIterator,
        column_ids: &[ColumnId],
    ) -> StorageResult<BoxedChunkIterator> {
        if inner.schema().column_ids() == column_ids {
            return Ok(inner);
        }
        Ok(Box::new(Self::new(inner, column_ids)?))
    }
}

#[async_trait]
impl ChunkIterator for ProjectIterator {
    fn schema(&self) -> &TabletSchemaRef {
        &self.schema
    }

    async fn next_batch(&mut self) -> StorageResult<Option<DataChunk>> {
        let chunk = self.inner.next_batch().await?;
        Ok(chunk.map(|c| c.project(&self.indices)))
    }
}
