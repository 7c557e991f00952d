// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Rowsets: immutable, versioned collections of segments.

mod meta;
mod sink;
mod writer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::debug;

pub use self::meta::*;
pub use self::writer::*;
use super::iterator::{
    AggregateIterator, BoxedChunkIterator, EmptyIterator, MergeIterator, UnionIterator,
};
use super::page::PageCache;
use super::segment::{
    segment_file_name, ColumnPredicate, KeyRange, Segment, SegmentIterator, SegmentReadOptions,
};
use super::{DeleteVectors, IOBackend, StorageResult, TracedStorageError};
use crate::catalog::TabletSchemaRef;

/// Options of a rowset scan.
#[derive(Debug, Clone)]
pub struct RowsetReadOptions {
    /// Whether rows must be returned in key order across segments.
    pub sorted: bool,
    /// Tablet version read, selecting delete vectors.
    pub version: i64,
    pub predicates: Vec<ColumnPredicate>,
    pub key_range: KeyRange,
    pub chunk_size: usize,
    pub delvecs: Option<Arc<DeleteVectors>>,
}

impl RowsetReadOptions {
    pub fn new(version: i64, chunk_size: usize) -> Self {
        Self {
            sorted: false,
            version,
            predicates: vec![],
            key_range: KeyRange::default(),
            chunk_size,
            delvecs: None,
        }
    }
}

/// A built rowset. Its segments are opened on first read.
pub struct Rowset {
    meta: RowsetMeta,
    state: Mutex<RowsetState>,
    dir: PathBuf,
    /// Columns stored in the segments.
    schema: TabletSchemaRef,
    io_backend: IOBackend,
    page_cache: PageCache,
    segments: OnceCell<Vec<Arc<Segment>>>,
}

pub type RowsetRef = Arc<Rowset>;

impl Rowset {
    pub fn new(
        meta: RowsetMeta,
        dir: impl AsRef<Path>,
        tablet_schema: TabletSchemaRef,
        io_backend: IOBackend,
        page_cache: PageCache,
    ) -> StorageResult<Self> {
        let schema = match &meta.referenced_column_ids {
            Some(ids) => Arc::new(tablet_schema.partial(ids)?),
            None => tablet_schema,
        };
        Ok(Self {
            state: Mutex::new(meta.state),
            meta,
            dir: dir.as_ref().to_path_buf(),
            schema,
            io_backend,
            page_cache,
            segments: OnceCell::new(),
        })
    }

    pub fn id(&self) -> RowsetId {
        self.meta.rowset_id
    }

    pub fn version(&self) -> Version {
        self.meta.version
    }

    pub fn num_rows(&self) -> u64 {
        self.meta.num_rows
    }

    pub fn num_segments(&self) -> usize {
        self.meta.num_segments
    }

    pub fn schema(&self) -> &TabletSchemaRef {
        &self.schema
    }

    pub fn state(&self) -> RowsetState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: RowsetState) {
        *self.state.lock() = state;
    }

    /// Metadata with the current state.
    pub fn meta(&self) -> RowsetMeta {
        RowsetMeta {
            state: self.state(),
            ..self.meta.clone()
        }
    }

    /// Whether the rowset stores only some columns of the tablet.
    pub fn is_partial(&self) -> bool {
        self.meta.referenced_column_ids.is_some()
    }

    pub fn segments_overlap(&self) -> SegmentsOverlap {
        self.meta.segments_overlap
    }

    pub fn segment_path(&self, segment_id: u32) -> PathBuf {
        self.dir.join(segment_file_name(self.id().0, segment_id))
    }

    /// Open every segment, once.
    pub async fn segments(&self) -> StorageResult<&[Arc<Segment>]> {
        let segments = self
            .segments
            .get_or_try_init(|| async {
                let segments = (0..self.meta.num_segments as u32).map(|id| async move {
                    let segment = Segment::open(
                        self.segment_path(id),
                        self.id(),
                        id,
                        self.io_backend,
                        self.page_cache.clone(),
                    )
                    .await?;
                    Ok::<_, TracedStorageError>(Arc::new(segment))
                });
                try_join_all(segments).await
            })
            .await?;
        Ok(segments)
    }

    /// One iterator per segment, in segment order.
    pub async fn get_segment_iterators(
        &self,
        schema: &TabletSchemaRef,
        options: &RowsetReadOptions,
    ) -> StorageResult<Vec<BoxedChunkIterator>> {
        let mut iters: Vec<BoxedChunkIterator> = vec![];
        for segment in self.segments().await? {
            let delete_vector = options
                .delvecs
                .as_ref()
                .and_then(|dvs| dvs.get(self.id(), segment.segment_id(), options.version));
            let read_options = SegmentReadOptions {
                predicates: options.predicates.clone(),
                key_range: options.key_range.clone(),
                key_column_ids: self.schema.key_column_ids(),
                delete_vector,
                chunk_size: options.chunk_size,
            };
            let iter = SegmentIterator::new(segment.clone(), schema.clone(), read_options)?;
            iters.push(Box::new(iter));
        }
        Ok(iters)
    }

    /// A scan over the whole rowset.
    ///
    /// When `options.sorted` is set and segments may overlap, segments are merged by key and
    /// reconciled following the keys type of `schema`.
    pub async fn new_iterator(
        &self,
        schema: &TabletSchemaRef,
        options: &RowsetReadOptions,
    ) -> StorageResult<BoxedChunkIterator> {
        let mut iters = self.get_segment_iterators(schema, options).await?;
        let iter: BoxedChunkIterator = match iters.len() {
            0 => Box::new(EmptyIterator::new(schema.clone())),
            1 => iters.remove(0),
            _ if options.sorted
                && self.segments_overlap() != SegmentsOverlap::NonOverlapping
                && schema.num_key_columns() > 0 =>
            {
                let merge = MergeIterator::new(schema.clone(), iters, options.chunk_size);
                if schema.need_reconcile() {
                    Box::new(AggregateIterator::new(merge, options.chunk_size))
                } else {
                    Box::new(merge)
                }
            }
            _ => Box::new(UnionIterator::new(schema.clone(), iters)),
        };
        Ok(iter)
    }

    /// Remove the segment files of the rowset. Missing files are ignored.
    pub async fn remove_files(&self) -> StorageResult<()> {
        for id in 0..self.meta.num_segments as u32 {
            let path = self.segment_path(id);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        debug!(rowset_id = %self.id(), version = %self.version(), "rowset files removed");
        Ok(())
    }
}

impl std::fmt::Debug for Rowset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rowset")
            .field("rowset_id", &self.id())
            .field("version", &self.version())
            .field("num_rows", &self.num_rows())
            .field("state", &self.state())
            .finish()
    }
}
