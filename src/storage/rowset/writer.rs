// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use itertools::Itertools;
use tracing::{debug, info, warn};

use super::sink::SegmentSink;
use super::{Rowset, RowsetId, RowsetMeta, RowsetRef, RowsetState, SegmentsOverlap, Version};
use crate::array::DataChunk;
use crate::catalog::{AggregationKind, SchemaError, TabletSchema, TabletSchemaRef};
use crate::storage::iterator::{
    combine_row, AggregateIterator, BoxedChunkIterator, ChunkIterator, MaskMergeIterator,
    MergeIterator,
};
use crate::storage::page::PageCache;
use crate::storage::segment::{
    segment_file_name, Segment, SegmentIterator, SegmentMeta, SegmentReadOptions, SegmentWriter,
    SegmentWriterOptions,
};
use crate::storage::{IOBackend, StorageOptions, StorageResult, TracedStorageError};
use crate::types::{ColumnId, Row, TabletId};

/// Pages of the segments read by a final merge. Kept apart from the engine cache, since
/// the merged segments reuse the ids of their inputs.
const FINAL_MERGE_CACHE_CAPACITY: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowsetWriterType {
    /// Every chunk holds all columns.
    Horizontal,
    /// Columns arrive group by group, keys first.
    Vertical,
}

/// Everything a [`RowsetWriter`] needs to know about the rowset it builds.
#[derive(Debug, Clone)]
pub struct RowsetWriterContext {
    pub rowset_id: RowsetId,
    pub tablet_id: TabletId,
    pub tablet_schema: TabletSchemaRef,
    /// Columns written by a partial-column rowset.
    pub referenced_column_ids: Option<Vec<ColumnId>>,
    /// Directory of the segment files.
    pub rowset_path_prefix: PathBuf,
    pub version: Version,
    pub segments_overlap: SegmentsOverlap,
    pub writer_type: RowsetWriterType,
    /// Overrides `StorageOptions::max_rows_per_segment`.
    pub max_rows_per_segment: Option<usize>,
    /// State of the built rowset.
    pub state: RowsetState,
}

impl RowsetWriterContext {
    pub fn new(
        rowset_id: RowsetId,
        tablet_id: TabletId,
        tablet_schema: TabletSchemaRef,
        rowset_path_prefix: impl AsRef<Path>,
        version: Version,
    ) -> Self {
        Self {
            rowset_id,
            tablet_id,
            tablet_schema,
            referenced_column_ids: None,
            rowset_path_prefix: rowset_path_prefix.as_ref().to_path_buf(),
            version,
            segments_overlap: SegmentsOverlap::Unknown,
            writer_type: RowsetWriterType::Horizontal,
            max_rows_per_segment: None,
            state: RowsetState::Committed,
        }
    }

    pub fn with_writer_type(mut self, writer_type: RowsetWriterType) -> Self {
        self.writer_type = writer_type;
        self
    }

    pub fn with_referenced_column_ids(mut self, column_ids: Vec<ColumnId>) -> Self {
        self.referenced_column_ids = Some(column_ids);
        self
    }

    pub fn with_segments_overlap(mut self, overlap: SegmentsOverlap) -> Self {
        self.segments_overlap = overlap;
        self
    }

    pub fn with_max_rows_per_segment(mut self, max_rows: usize) -> Self {
        self.max_rows_per_segment = Some(max_rows);
        self
    }

    pub fn with_state(mut self, state: RowsetState) -> Self {
        self.state = state;
        self
    }
}

/// Builds a rowset from chunks.
///
/// A horizontal writer takes whole rows with [`RowsetWriter::add_chunk`], buffering one
/// segment in memory and sorting it by key when it is sealed. A vertical writer takes column
/// groups with [`RowsetWriter::add_columns`], the key group first.
///
/// Nothing becomes visible before [`RowsetWriter::build`]. A writer dropped before that
/// removes its files.
pub struct RowsetWriter {
    context: RowsetWriterContext,
    /// Columns stored by this rowset.
    schema: TabletSchemaRef,
    segment_options: SegmentWriterOptions,
    io_backend: IOBackend,
    page_cache: PageCache,
    max_rows_per_segment: usize,
    max_columns_per_group: usize,
    chunk_size: usize,

    buffer: Vec<DataChunk>,
    buffered_rows: usize,

    sink: Option<SegmentSink>,
    written_columns: Vec<ColumnId>,
    active_columns: Option<Vec<ColumnId>>,
    final_flushed: bool,

    segments: Vec<SegmentMeta>,
    files: Vec<PathBuf>,
    finished: bool,
}

impl RowsetWriter {
    pub fn new(
        context: RowsetWriterContext,
        options: &StorageOptions,
        page_cache: PageCache,
    ) -> StorageResult<Self> {
        let schema = match &context.referenced_column_ids {
            Some(ids) => Arc::new(context.tablet_schema.partial(ids)?),
            None => context.tablet_schema.clone(),
        };
        let max_rows_per_segment = context
            .max_rows_per_segment
            .unwrap_or(options.max_rows_per_segment)
            .max(1);
        let segment_options = SegmentWriterOptions::from_storage_options(options);
        let sink = match context.writer_type {
            RowsetWriterType::Vertical => Some(SegmentSink::new(
                &context.rowset_path_prefix,
                context.rowset_id,
                false,
                segment_options.clone(),
                max_rows_per_segment,
            )),
            RowsetWriterType::Horizontal => None,
        };
        Ok(Self {
            context,
            schema,
            segment_options,
            io_backend: options.io_backend,
            page_cache,
            max_rows_per_segment,
            max_columns_per_group: options.vertical_compaction_max_columns_per_group.max(1),
            chunk_size: options.chunk_size.max(1),
            buffer: vec![],
            buffered_rows: 0,
            sink,
            written_columns: vec![],
            active_columns: None,
            final_flushed: false,
            segments: vec![],
            files: vec![],
            finished: false,
        })
    }

    pub fn context(&self) -> &RowsetWriterContext {
        &self.context
    }

    pub fn rowset_id(&self) -> RowsetId {
        self.context.rowset_id
    }

    /// Columns the writer expects, in order.
    pub fn schema(&self) -> &TabletSchemaRef {
        &self.schema
    }

    /// Rows written so far, including rows not yet sealed.
    pub fn num_rows(&self) -> u64 {
        let sealed: u64 = self.segments.iter().map(|s| s.num_rows).sum();
        let staged = self.sink.as_ref().map_or(0, |s| s.num_rows());
        sealed + staged + self.buffered_rows as u64
    }

    fn dir(&self) -> &Path {
        &self.context.rowset_path_prefix
    }

    fn check_writer_type(&self, expected: RowsetWriterType) -> StorageResult<()> {
        if self.finished {
            return Err(TracedStorageError::invalid_state("rowset writer is finished"));
        }
        if self.context.writer_type != expected {
            return Err(TracedStorageError::invalid_state(format!(
                "{:?} writer cannot accept {:?} writes",
                self.context.writer_type, expected
            )));
        }
        Ok(())
    }

    fn check_nulls(schema: &TabletSchema, chunk: &DataChunk) -> StorageResult<()> {
        for (column, array) in schema.columns().iter().zip(chunk.arrays()) {
            if !column.is_nullable() && array.null_count() > 0 {
                return Err(SchemaError::NullInNotNull(column.name().into()).into());
            }
        }
        Ok(())
    }

    /// Append whole rows. A chunk that would make the current segment exceed the row limit
    /// seals the segment first.
    pub async fn add_chunk(&mut self, chunk: &DataChunk) -> StorageResult<()> {
        self.check_writer_type(RowsetWriterType::Horizontal)?;
        if !self.schema.is_compatible_with(&chunk.data_types()) {
            return Err(TracedStorageError::schema_mismatch(format!(
                "chunk of {:?} does not match rowset columns {:?}",
                chunk.data_types(),
                self.schema.data_types()
            )));
        }
        Self::check_nulls(&self.schema, chunk)?;

        let card = chunk.cardinality();
        let mut offset = 0;
        while offset < card {
            let take = (card - offset).min(self.max_rows_per_segment);
            if self.buffered_rows > 0 && self.buffered_rows + take > self.max_rows_per_segment {
                self.flush().await?;
            }
            let part = if offset == 0 && take == card {
                chunk.clone()
            } else {
                chunk.slice(offset..offset + take)
            };
            self.buffer.push(part);
            self.buffered_rows += take;
            offset += take;
        }
        Ok(())
    }

    /// Seal the buffered rows into a segment. Does nothing if no row is buffered.
    pub async fn flush(&mut self) -> StorageResult<()> {
        self.check_writer_type(RowsetWriterType::Horizontal)?;
        if self.buffered_rows == 0 {
            return Ok(());
        }
        let chunks = std::mem::take(&mut self.buffer);
        self.buffered_rows = 0;
        let Some(chunk) = DataChunk::concat(&chunks) else {
            return Ok(());
        };
        let chunk = sort_and_reconcile(&self.schema, &chunk);

        let segment_id = self.segments.len() as u32;
        let path = self
            .dir()
            .join(segment_file_name(self.context.rowset_id.0, segment_id));
        let mut writer =
            SegmentWriter::create(&path, segment_id, self.segment_options.clone()).await?;
        self.files.push(path);
        writer.start_group(&self.schema, true)?;
        writer.append(&chunk)?;
        writer.finish_group().await?;
        self.segments.push(writer.finalize().await?);
        Ok(())
    }

    /// Append a column group chunk of a vertical write.
    ///
    /// The first group must be the key group and hold every key column first. Every chunk
    /// of a group passes the same `column_ids` until [`RowsetWriter::flush_columns`].
    pub async fn add_columns(
        &mut self,
        chunk: &DataChunk,
        column_ids: &[ColumnId],
        is_key: bool,
    ) -> StorageResult<()> {
        self.check_writer_type(RowsetWriterType::Vertical)?;
        if self.final_flushed {
            return Err(TracedStorageError::invalid_state(
                "columns added after final flush",
            ));
        }
        match &self.active_columns {
            Some(active) if active.as_slice() != column_ids => {
                return Err(TracedStorageError::invalid_state(format!(
                    "columns {column_ids:?} added while group {active:?} is not flushed"
                )));
            }
            Some(_) => {}
            None => self.start_group(column_ids, is_key)?,
        }
        let group_schema = self.schema.project(column_ids)?;
        if !group_schema.is_compatible_with(&chunk.data_types()) {
            return Err(TracedStorageError::schema_mismatch(format!(
                "chunk of {:?} does not match columns {:?}",
                chunk.data_types(),
                column_ids
            )));
        }
        Self::check_nulls(&group_schema, chunk)?;
        let sink = self.sink_mut()?;
        sink.append(chunk).await
    }

    fn start_group(&mut self, column_ids: &[ColumnId], is_key: bool) -> StorageResult<()> {
        let key_ids = self.schema.key_column_ids();
        if is_key && !column_ids.starts_with(&key_ids) {
            return Err(TracedStorageError::invalid_state(format!(
                "key group {column_ids:?} must start with key columns {key_ids:?}"
            )));
        }
        if !is_key && column_ids.iter().any(|id| key_ids.contains(id)) {
            return Err(TracedStorageError::invalid_state(format!(
                "value group {column_ids:?} holds key columns"
            )));
        }
        if let Some(id) = column_ids
            .iter()
            .find(|id| self.written_columns.contains(id))
        {
            return Err(TracedStorageError::duplicated("column", id));
        }
        let group_schema = self.schema.project(column_ids)?;
        self.sink_mut()?.start_group(&group_schema, is_key)?;
        self.active_columns = Some(column_ids.to_vec());
        Ok(())
    }

    fn sink_mut(&mut self) -> StorageResult<&mut SegmentSink> {
        self.sink
            .as_mut()
            .ok_or_else(|| TracedStorageError::invalid_state("segment sink is closed"))
    }

    /// Finish the active column group. Fails if its row count differs from the key group.
    pub async fn flush_columns(&mut self) -> StorageResult<()> {
        self.check_writer_type(RowsetWriterType::Vertical)?;
        let Some(columns) = self.active_columns.take() else {
            return Err(TracedStorageError::invalid_state("no column group to flush"));
        };
        self.sink_mut()?.finish_group().await?;
        self.written_columns.extend(columns);
        Ok(())
    }

    /// Write the footer of every segment of a vertical write.
    pub async fn final_flush(&mut self) -> StorageResult<()> {
        self.check_writer_type(RowsetWriterType::Vertical)?;
        if self.active_columns.is_some() {
            return Err(TracedStorageError::invalid_state("column group is not flushed"));
        }
        if let Some(column) = self
            .schema
            .columns()
            .iter()
            .find(|c| !self.written_columns.contains(&c.unique_id()))
        {
            return Err(TracedStorageError::invalid_state(format!(
                "column {} is not written",
                column.name()
            )));
        }
        let Some(sink) = self.sink.take() else {
            return Err(TracedStorageError::invalid_state("final flush called twice"));
        };
        self.files.extend(sink.files().iter().cloned());
        self.segments = sink.finish().await?;
        self.final_flushed = true;
        Ok(())
    }

    /// Seal the rowset. Overlapping segments of a horizontal write to a table that reconciles
    /// keys are merged first.
    pub async fn build(mut self) -> StorageResult<RowsetRef> {
        if self.finished {
            return Err(TracedStorageError::invalid_state("rowset writer is finished"));
        }
        match self.context.writer_type {
            RowsetWriterType::Horizontal => self.flush().await?,
            RowsetWriterType::Vertical if !self.final_flushed => {
                return Err(TracedStorageError::invalid_state(
                    "vertical rowset built before final flush",
                ));
            }
            RowsetWriterType::Vertical => {}
        }

        let mut overlap = match self.context.segments_overlap {
            SegmentsOverlap::Unknown => detect_overlap(&self.segments),
            given => given,
        };
        if self.context.writer_type == RowsetWriterType::Horizontal
            && self.context.segments_overlap == SegmentsOverlap::Unknown
            && self.schema.need_reconcile()
            && self.segments.len() > 1
            && overlap == SegmentsOverlap::Overlapping
        {
            self.final_merge().await?;
            overlap = SegmentsOverlap::NonOverlapping;
        }

        let meta = RowsetMeta {
            rowset_id: self.context.rowset_id,
            tablet_id: self.context.tablet_id,
            version: self.context.version,
            num_rows: self.segments.iter().map(|s| s.num_rows).sum(),
            num_segments: self.segments.len(),
            total_disk_size: self.segments.iter().map(|s| s.data_size).sum(),
            schema_id: self.context.tablet_schema.schema_id(),
            state: self.context.state,
            segments_overlap: overlap,
            referenced_column_ids: self.context.referenced_column_ids.clone(),
            segments: self.segments.clone(),
            creation_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
        };
        let rowset = Rowset::new(
            meta,
            self.dir(),
            self.context.tablet_schema.clone(),
            self.io_backend,
            self.page_cache.clone(),
        )?;
        self.finished = true;
        info!(
            tablet_id = self.context.tablet_id,
            rowset_id = %rowset.id(),
            version = %rowset.version(),
            num_rows = rowset.num_rows(),
            num_segments = rowset.num_segments(),
            "rowset built"
        );
        Ok(Arc::new(rowset))
    }

    /// Merge the overlapping segments into non-overlapping ones, later flushes winning.
    async fn final_merge(&mut self) -> StorageResult<()> {
        let rowset_id = self.context.rowset_id;
        info!(
            %rowset_id,
            num_segments = self.segments.len(),
            "final merge started"
        );
        let cache = PageCache::new(FINAL_MERGE_CACHE_CAPACITY);
        let mut inputs = Vec::with_capacity(self.segments.len());
        for segment_id in 0..self.segments.len() as u32 {
            let path = self.dir().join(segment_file_name(rowset_id.0, segment_id));
            let segment = Segment::open(path, rowset_id, segment_id, self.io_backend, cache.clone())
                .await?;
            inputs.push(Arc::new(segment));
        }

        let mut sink = SegmentSink::new(
            self.dir(),
            rowset_id,
            true,
            self.segment_options.clone(),
            self.max_rows_per_segment,
        );
        let temp_files = match self.merge_segments(&inputs, &mut sink).await {
            Ok(()) => sink.files().to_vec(),
            Err(err) => {
                remove_files_quietly(sink.files());
                return Err(err);
            }
        };
        let metas = match sink.finish().await {
            Ok(metas) => metas,
            Err(err) => {
                remove_files_quietly(&temp_files);
                return Err(err);
            }
        };
        drop(inputs);

        for path in self.files.drain(..) {
            tokio::fs::remove_file(&path).await?;
        }
        for (segment_id, temp) in temp_files.iter().enumerate() {
            let path = self
                .dir()
                .join(segment_file_name(rowset_id.0, segment_id as u32));
            tokio::fs::rename(temp, &path).await?;
            self.files.push(path);
        }
        info!(
            %rowset_id,
            from = self.segments.len(),
            to = metas.len(),
            "final merge finished"
        );
        self.segments = metas;
        Ok(())
    }

    async fn merge_segments(
        &self,
        inputs: &[Arc<Segment>],
        sink: &mut SegmentSink,
    ) -> StorageResult<()> {
        let schema = &self.schema;
        if schema.num_columns() <= self.max_columns_per_group {
            let iters = self.open_inputs(inputs, schema)?;
            let merge = MergeIterator::new(schema.clone(), iters, self.chunk_size);
            let mut iter = AggregateIterator::new(merge, self.chunk_size);
            sink.start_group(schema, true)?;
            drain_into(&mut iter, sink).await?;
            return sink.finish_group().await;
        }

        let groups = schema.column_groups(self.max_columns_per_group);
        let mut plan = None;
        for (idx, group) in groups.iter().enumerate() {
            let group_schema = Arc::new(schema.project(group)?);
            let iters = self.open_inputs(inputs, &group_schema)?;
            let is_key = idx == 0;
            sink.start_group(&group_schema, is_key)?;
            if is_key {
                let merge = MergeIterator::new(group_schema.clone(), iters, self.chunk_size);
                let mut iter = AggregateIterator::new(merge, self.chunk_size).with_plan();
                drain_into(&mut iter, sink).await?;
                plan = iter.take_plan().map(Arc::new);
            } else {
                let plan = plan
                    .clone()
                    .ok_or_else(|| TracedStorageError::invalid_state("row source plan missing"))?;
                let mut iter =
                    MaskMergeIterator::new(group_schema.clone(), iters, plan, self.chunk_size);
                drain_into(&mut iter, sink).await?;
            }
            sink.finish_group().await?;
        }
        Ok(())
    }

    fn open_inputs(
        &self,
        inputs: &[Arc<Segment>],
        schema: &TabletSchemaRef,
    ) -> StorageResult<Vec<BoxedChunkIterator>> {
        inputs
            .iter()
            .map(|segment| {
                let iter = SegmentIterator::new(
                    segment.clone(),
                    schema.clone(),
                    SegmentReadOptions::new(self.chunk_size),
                )?;
                Ok(Box::new(iter) as BoxedChunkIterator)
            })
            .collect()
    }

    fn all_files(&self) -> Vec<PathBuf> {
        let mut files = self.files.clone();
        if let Some(sink) = &self.sink {
            files.extend(sink.files().iter().cloned());
        }
        files
    }

    /// Drop everything written so far.
    pub async fn abort(mut self) -> StorageResult<()> {
        self.finished = true;
        for path in self.all_files() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        debug!(rowset_id = %self.context.rowset_id, "rowset writer aborted");
        Ok(())
    }
}

impl Drop for RowsetWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let files = self.all_files();
        if !files.is_empty() {
            warn!(
                rowset_id = %self.context.rowset_id,
                num_files = files.len(),
                "rowset writer dropped before build, removing its files"
            );
            remove_files_quietly(&files);
        }
    }
}

fn remove_files_quietly(files: &[PathBuf]) {
    for path in files {
        if let Err(err) = std::fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), %err, "failed to remove file");
            }
        }
    }
}

async fn drain_into(iter: &mut dyn ChunkIterator, sink: &mut SegmentSink) -> StorageResult<()> {
    while let Some(chunk) = iter.next_batch().await? {
        sink.append(&chunk).await?;
    }
    Ok(())
}

/// Segments overlap unless each one ends before the next one starts.
pub fn detect_overlap(segments: &[SegmentMeta]) -> SegmentsOverlap {
    if segments
        .iter()
        .tuple_windows()
        .all(|(a, b)| a.max_key < b.min_key)
    {
        SegmentsOverlap::NonOverlapping
    } else {
        SegmentsOverlap::Overlapping
    }
}

/// Sort rows by key, keeping the input order of equal keys. Tables that reconcile keys
/// fold equal keys into one row, later rows being newer.
fn sort_and_reconcile(schema: &TabletSchema, chunk: &DataChunk) -> DataChunk {
    let num_keys = schema.num_key_columns();
    let mut rows: Vec<Row> = chunk.rows().collect();
    rows.sort_by(|a, b| a[..num_keys].cmp(&b[..num_keys]));
    if schema.need_reconcile() {
        let aggregations: Vec<AggregationKind> =
            (0..schema.num_columns()).map(|i| schema.aggregation(i)).collect();
        let mut folded: Vec<Row> = Vec::with_capacity(rows.len());
        for row in rows {
            match folded.last_mut() {
                Some(acc) if acc[..num_keys] == row[..num_keys] => {
                    combine_row(acc, row, &aggregations)
                }
                _ => folded.push(row),
            }
        }
        rows = folded;
    }
    DataChunk::from_rows(&schema.data_types(), rows.iter().map(|r| r.as_slice()))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::catalog::{KeysType, TabletColumn};
    use crate::storage::iterator::collect_chunks;
    use crate::storage::{RowsetReadOptions, StorageError};
    use crate::types::{DataType, DataValue};

    fn schema(keys_type: KeysType) -> TabletSchemaRef {
        let agg = match keys_type {
            KeysType::Aggregate => AggregationKind::Sum,
            _ => AggregationKind::None,
        };
        let v2_agg = match keys_type {
            KeysType::Aggregate => AggregationKind::Replace,
            _ => AggregationKind::None,
        };
        Arc::new(
            TabletSchema::new(
                1,
                keys_type,
                vec![
                    TabletColumn::new(0, "k1", DataType::Int32).key(),
                    TabletColumn::new(1, "k2", DataType::Int32).key(),
                    TabletColumn::new(2, "v1", DataType::Int64).with_aggregation(agg),
                    TabletColumn::new(3, "v2", DataType::String)
                        .nullable()
                        .with_aggregation(v2_agg),
                ],
                1,
            )
            .unwrap(),
        )
    }

    fn row(k: i32, v: i64) -> Row {
        vec![
            DataValue::Int32(k),
            DataValue::Int32(k),
            DataValue::Int64(v),
            DataValue::String(format!("s{k}_{v}")),
        ]
    }

    fn chunk(schema: &TabletSchema, keys: std::ops::Range<i32>, v: i64) -> DataChunk {
        let rows = keys.map(|k| row(k, v)).collect::<Vec<_>>();
        DataChunk::from_rows(&schema.data_types(), rows.iter().map(|r| r.as_slice()))
    }

    fn context(schema: TabletSchemaRef, dir: &Path) -> RowsetWriterContext {
        RowsetWriterContext::new(RowsetId(7), 1, schema, dir, Version::single(2))
    }

    async fn read_all(rowset: &Rowset) -> Vec<Row> {
        let options = RowsetReadOptions {
            sorted: true,
            ..RowsetReadOptions::new(2, 1000)
        };
        let mut iter = rowset.new_iterator(rowset.schema(), &options).await.unwrap();
        collect_chunks(iter.as_mut())
            .await
            .unwrap()
            .iter()
            .flat_map(|c| c.rows().collect::<Vec<_>>())
            .collect()
    }

    fn expected_final_merge() -> Vec<Row> {
        (0..2048)
            .map(|k| match k {
                0..=511 => row(k, 1),
                512..=1023 => row(k, 2),
                _ => row(k, 3),
            })
            .collect()
    }

    #[test_case(5; "horizontal")]
    #[test_case(1; "vertical")]
    #[tokio::test]
    async fn test_final_merge(max_columns_per_group: usize) {
        let dir = tempfile::tempdir().unwrap();
        let mut options = StorageOptions::default_for_test(dir.path().to_path_buf());
        options.vertical_compaction_max_columns_per_group = max_columns_per_group;
        let schema = schema(KeysType::Unique);
        let mut writer =
            RowsetWriter::new(context(schema.clone(), dir.path()), &options, PageCache::new(64))
                .unwrap();
        writer.add_chunk(&chunk(&schema, 0..1024, 1)).await.unwrap();
        writer.flush().await.unwrap();
        writer.add_chunk(&chunk(&schema, 512..1536, 2)).await.unwrap();
        writer.flush().await.unwrap();
        writer.add_chunk(&chunk(&schema, 1024..2048, 3)).await.unwrap();
        let rowset = writer.build().await.unwrap();

        assert_eq!(rowset.num_segments(), 1);
        assert_eq!(rowset.num_rows(), 2048);
        assert_eq!(rowset.segments_overlap(), SegmentsOverlap::NonOverlapping);
        assert_eq!(read_all(&rowset).await, expected_final_merge());

        let mut names = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec!["7_0.dat".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_keeps_overlapping_segments() {
        let dir = tempfile::tempdir().unwrap();
        let options = StorageOptions::default_for_test(dir.path().to_path_buf());
        let schema = schema(KeysType::Duplicate);
        let mut writer =
            RowsetWriter::new(context(schema.clone(), dir.path()), &options, PageCache::new(64))
                .unwrap();
        writer.add_chunk(&chunk(&schema, 0..100, 1)).await.unwrap();
        writer.flush().await.unwrap();
        writer.add_chunk(&chunk(&schema, 50..150, 2)).await.unwrap();
        let rowset = writer.build().await.unwrap();
        assert_eq!(rowset.num_segments(), 2);
        assert_eq!(rowset.segments_overlap(), SegmentsOverlap::Overlapping);
        let rows = read_all(&rowset).await;
        assert_eq!(rows.len(), 200);
        assert!(rows.windows(2).all(|w| w[0][..2] <= w[1][..2]));
    }

    #[tokio::test]
    async fn test_sort_within_segment() {
        let dir = tempfile::tempdir().unwrap();
        let options = StorageOptions::default_for_test(dir.path().to_path_buf());
        let schema = schema(KeysType::Aggregate);
        let mut writer =
            RowsetWriter::new(context(schema.clone(), dir.path()), &options, PageCache::new(64))
                .unwrap();
        writer.add_chunk(&chunk(&schema, 5..10, 1)).await.unwrap();
        writer.add_chunk(&chunk(&schema, 0..7, 2)).await.unwrap();
        let rowset = writer.build().await.unwrap();
        assert_eq!(rowset.num_segments(), 1);
        let rows = read_all(&rowset).await;
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0][2], DataValue::Int64(2));
        assert_eq!(rows[5][2], DataValue::Int64(3));
        assert_eq!(rows[5][3], DataValue::from("s5_2"));
        assert_eq!(rows[9][2], DataValue::Int64(1));
    }

    #[tokio::test]
    async fn test_vertical_write() {
        let dir = tempfile::tempdir().unwrap();
        let options = StorageOptions::default_for_test(dir.path().to_path_buf());
        let schema = schema(KeysType::Duplicate);
        let ctx = context(schema.clone(), dir.path())
            .with_writer_type(RowsetWriterType::Vertical)
            .with_max_rows_per_segment(5000);
        let mut writer = RowsetWriter::new(ctx, &options, PageCache::new(64)).unwrap();
        let data = chunk(&schema, 0..10000, 1);

        let mut offset = 0;
        for len in [3000, 3000, 3000, 1000] {
            let part = data.slice(offset..offset + len).project(&[0, 1]);
            writer.add_columns(&part, &[0, 1], true).await.unwrap();
            offset += len;
        }
        writer.flush_columns().await.unwrap();
        for start in (0..10000).step_by(2500) {
            let part = data.slice(start..start + 2500).project(&[2, 3]);
            writer.add_columns(&part, &[2, 3], false).await.unwrap();
        }
        writer.flush_columns().await.unwrap();
        writer.final_flush().await.unwrap();
        let rowset = writer.build().await.unwrap();

        assert_eq!(rowset.num_segments(), 3);
        let sizes = rowset.meta().segments.iter().map(|s| s.num_rows).collect::<Vec<_>>();
        assert_eq!(sizes, vec![3000, 3000, 4000]);
        assert_eq!(rowset.segments_overlap(), SegmentsOverlap::NonOverlapping);
        assert_eq!(read_all(&rowset).await, data.rows().collect::<Vec<_>>());
    }

    #[test_case(&[0..10, 5..20]; "chunk starts below previous chunk")]
    #[test_case(&[0..10, 10..20, 0..5]; "third chunk")]
    #[tokio::test]
    async fn test_vertical_rejects_unsorted_keys(parts: &[std::ops::Range<i32>]) {
        let dir = tempfile::tempdir().unwrap();
        let options = StorageOptions::default_for_test(dir.path().to_path_buf());
        let schema = schema(KeysType::Unique);
        let ctx = context(schema.clone(), dir.path()).with_writer_type(RowsetWriterType::Vertical);
        let mut writer = RowsetWriter::new(ctx, &options, PageCache::new(64)).unwrap();
        let (last, sorted) = parts.split_last().unwrap();
        for part in sorted {
            let keys = chunk(&schema, part.clone(), 1).project(&[0, 1]);
            writer.add_columns(&keys, &[0, 1], true).await.unwrap();
        }
        let keys = chunk(&schema, last.clone(), 1).project(&[0, 1]);
        let err = writer.add_columns(&keys, &[0, 1], true).await.unwrap_err();
        assert!(matches!(err.kind(), StorageError::InvalidState(_)));
        writer.abort().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_vertical_unsorted_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let options = StorageOptions::default_for_test(dir.path().to_path_buf());
        let schema = schema(KeysType::Duplicate);
        let ctx = context(schema.clone(), dir.path()).with_writer_type(RowsetWriterType::Vertical);
        let mut writer = RowsetWriter::new(ctx, &options, PageCache::new(64)).unwrap();
        let rows = [row(3, 1), row(1, 1)];
        let data = DataChunk::from_rows(&schema.data_types(), rows.iter().map(|r| r.as_slice()));
        let err = writer
            .add_columns(&data.project(&[0, 1]), &[0, 1], true)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), StorageError::InvalidState(_)));

        // Equal keys are allowed.
        let mut writer = RowsetWriter::new(
            context(schema.clone(), dir.path()).with_writer_type(RowsetWriterType::Vertical),
            &options,
            PageCache::new(64),
        )
        .unwrap();
        let rows = [row(1, 1), row(1, 2)];
        let data = DataChunk::from_rows(&schema.data_types(), rows.iter().map(|r| r.as_slice()));
        writer
            .add_columns(&data.project(&[0, 1]), &[0, 1], true)
            .await
            .unwrap();
        writer.flush_columns().await.unwrap();
    }

    #[tokio::test]
    async fn test_vertical_row_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let options = StorageOptions::default_for_test(dir.path().to_path_buf());
        let schema = schema(KeysType::Duplicate);
        let ctx = context(schema.clone(), dir.path()).with_writer_type(RowsetWriterType::Vertical);
        let mut writer = RowsetWriter::new(ctx, &options, PageCache::new(64)).unwrap();
        let data = chunk(&schema, 0..100, 1);
        writer
            .add_columns(&data.project(&[0, 1]), &[0, 1], true)
            .await
            .unwrap();
        writer.flush_columns().await.unwrap();
        writer
            .add_columns(&data.slice(0..60).project(&[2, 3]), &[2, 3], false)
            .await
            .unwrap();
        let err = writer.flush_columns().await.unwrap_err();
        assert!(matches!(
            err.kind(),
            StorageError::RowCountMismatch {
                expected: 100,
                actual: 60,
                ..
            }
        ));

        let err = writer.final_flush().await.unwrap_err();
        assert!(matches!(err.kind(), StorageError::InvalidState(_)));
        drop(writer);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_misordered_calls() {
        let dir = tempfile::tempdir().unwrap();
        let options = StorageOptions::default_for_test(dir.path().to_path_buf());
        let schema = schema(KeysType::Duplicate);
        let data = chunk(&schema, 0..10, 1);

        let ctx = context(schema.clone(), dir.path()).with_writer_type(RowsetWriterType::Vertical);
        let mut writer = RowsetWriter::new(ctx, &options, PageCache::new(64)).unwrap();
        let err = writer.add_chunk(&data).await.unwrap_err();
        assert!(matches!(err.kind(), StorageError::InvalidState(_)));
        let err = writer
            .add_columns(&data.project(&[2, 3]), &[2, 3], false)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), StorageError::InvalidState(_)));
        let err = writer
            .add_columns(&data.project(&[1, 2]), &[1, 2], true)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), StorageError::InvalidState(_)));
        writer
            .add_columns(&data.project(&[0, 1]), &[0, 1], true)
            .await
            .unwrap();
        writer.flush_columns().await.unwrap();
        let err = writer.final_flush().await.unwrap_err();
        assert!(matches!(err.kind(), StorageError::InvalidState(_)));
        writer.abort().await.unwrap();

        let mut writer =
            RowsetWriter::new(context(schema.clone(), dir.path()), &options, PageCache::new(64))
                .unwrap();
        let err = writer.final_flush().await.unwrap_err();
        assert!(matches!(err.kind(), StorageError::InvalidState(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_reject_null_in_not_null() {
        let dir = tempfile::tempdir().unwrap();
        let options = StorageOptions::default_for_test(dir.path().to_path_buf());
        let schema = schema(KeysType::Duplicate);
        let mut writer =
            RowsetWriter::new(context(schema.clone(), dir.path()), &options, PageCache::new(64))
                .unwrap();
        let rows = [vec![
            DataValue::Int32(1),
            DataValue::Int32(1),
            DataValue::Null,
            DataValue::Null,
        ]];
        let data = DataChunk::from_rows(&schema.data_types(), rows.iter().map(|r| r.as_slice()));
        let err = writer.add_chunk(&data).await.unwrap_err();
        assert!(matches!(err.kind(), StorageError::Schema(_)));
    }

    #[tokio::test]
    async fn test_abort_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = StorageOptions::default_for_test(dir.path().to_path_buf());
        options.max_rows_per_segment = 100;
        let schema = schema(KeysType::Duplicate);
        let mut writer =
            RowsetWriter::new(context(schema.clone(), dir.path()), &options, PageCache::new(64))
                .unwrap();
        writer.add_chunk(&chunk(&schema, 0..350, 1)).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
        assert_eq!(writer.num_rows(), 350);
        writer.abort().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
