// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Chunk iterators composed by rowset readers, tablet readers and compaction.

mod aggregate;
mod filter;
mod mask_merge;
mod merge;
mod project;
mod union;

use async_trait::async_trait;

pub use self::aggregate::*;
pub use self::filter::*;
pub use self::mask_merge::*;
pub use self::merge::*;
pub use self::project::*;
pub use self::union::*;
use super::StorageResult;
use crate::array::DataChunk;
use crate::catalog::TabletSchemaRef;

/// An iterator over chunks laid out in [`ChunkIterator::schema`].
///
/// End of stream is `Ok(None)`. Returned chunks are never empty.
#[async_trait]
pub trait ChunkIterator: Send {
    fn schema(&self) -> &TabletSchemaRef;

    async fn next_batch(&mut self) -> StorageResult<Option<DataChunk>>;
}

pub type BoxedChunkIterator = Box<dyn ChunkIterator>;

/// Iterator that returns nothing.
pub struct EmptyIterator {
    schema: TabletSchemaRef,
}

impl EmptyIterator {
    pub fn new(schema: TabletSchemaRef) -> Self {
        Self { schema }
    }
}

#[async_trait]
impl ChunkIterator for EmptyIterator {
    fn schema(&self) -> &TabletSchemaRef {
        &self.schema
    }

    async fn next_batch(&mut self) -> StorageResult<Option<DataChunk>> {
        Ok(None)
    }
}

/// Drain an iterator into a list of chunks.
pub async fn collect_chunks(iter: &mut dyn ChunkIterator) -> StorageResult<Vec<DataChunk>> {
    let mut chunks = vec![];
    while let Some(chunk) = iter.next_batch().await? {
        chunks.push(chunk);
    }
    Ok(chunks)
}
