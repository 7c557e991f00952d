// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::path::{Path, PathBuf};

use super::RowsetId;
use crate::array::DataChunk;
use crate::catalog::TabletSchema;
use crate::storage::segment::{
    segment_file_name, temp_segment_file_name, SegmentMeta, SegmentWriter, SegmentWriterOptions,
};
use crate::storage::{StorageError, StorageResult, TracedStorageError};
use crate::types::Row;

/// Writes column groups of a rowset into segment files.
///
/// The key group decides the segment boundaries. A chunk that would make the current
/// segment exceed `max_rows_per_segment` goes to a new segment. Value groups are routed
/// into the same segments by row ordinal.
pub(super) struct SegmentSink {
    dir: PathBuf,
    rowset_id: RowsetId,
    temp: bool,
    options: SegmentWriterOptions,
    max_rows_per_segment: u64,
    writers: Vec<SegmentWriter>,
    /// Rows of each segment whose key group is finished.
    segment_rows: Vec<u64>,
    key_written: bool,
    /// Whether the active group is the key group.
    group: Option<bool>,
    group_schema: Option<TabletSchema>,
    /// Last key appended to the key group.
    last_key: Option<Row>,
    /// Segment receiving rows of the active value group.
    current: usize,
    files: Vec<PathBuf>,
}

impl SegmentSink {
    pub fn new(
        dir: impl AsRef<Path>,
        rowset_id: RowsetId,
        temp: bool,
        options: SegmentWriterOptions,
        max_rows_per_segment: usize,
    ) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            rowset_id,
            temp,
            options,
            max_rows_per_segment: max_rows_per_segment.max(1) as u64,
            writers: vec![],
            segment_rows: vec![],
            key_written: false,
            group: None,
            group_schema: None,
            last_key: None,
            current: 0,
            files: vec![],
        }
    }

    /// Files created so far.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn has_active_group(&self) -> bool {
        self.group.is_some()
    }

    fn path_of(&self, segment_id: u32) -> PathBuf {
        let name = if self.temp {
            temp_segment_file_name(self.rowset_id.0, segment_id)
        } else {
            segment_file_name(self.rowset_id.0, segment_id)
        };
        self.dir.join(name)
    }

    pub fn start_group(&mut self, schema: &TabletSchema, is_key: bool) -> StorageResult<()> {
        if self.group.is_some() {
            return Err(TracedStorageError::invalid_state(
                "previous column group is not flushed",
            ));
        }
        if is_key && self.key_written {
            return Err(TracedStorageError::invalid_state("key columns have been written"));
        }
        if !is_key && !self.key_written {
            return Err(TracedStorageError::invalid_state(
                "key columns must be written before value columns",
            ));
        }
        if !is_key {
            for writer in &mut self.writers {
                writer.start_group(schema, false)?;
            }
        }
        self.group = Some(is_key);
        self.current = 0;
        self.group_schema = Some(schema.clone());
        Ok(())
    }

    pub async fn append(&mut self, chunk: &DataChunk) -> StorageResult<()> {
        match self.group {
            Some(true) => self.append_key(chunk).await,
            Some(false) => self.append_value(chunk).await,
            None => Err(TracedStorageError::invalid_state("no active column group")),
        }
    }

    async fn append_key(&mut self, chunk: &DataChunk) -> StorageResult<()> {
        self.check_key_order(chunk)?;
        let card = chunk.cardinality();
        let mut offset = 0;
        while offset < card {
            let take = ((card - offset) as u64).min(self.max_rows_per_segment);
            let roll = match self.writers.last() {
                None => true,
                Some(writer) => {
                    writer.group_rows() > 0
                        && writer.group_rows() + take > self.max_rows_per_segment
                }
            };
            if roll {
                self.finish_key_segment().await?;
                let segment_id = self.writers.len() as u32;
                let path = self.path_of(segment_id);
                let mut writer = SegmentWriter::create(&path, segment_id, self.options.clone()).await?;
                self.files.push(path);
                if let Some(schema) = &self.group_schema {
                    writer.start_group(schema, true)?;
                }
                self.writers.push(writer);
            }
            let end = offset + take as usize;
            if let Some(writer) = self.writers.last_mut() {
                writer.append(&chunk.slice(offset..end))?;
            }
            offset = end;
        }
        Ok(())
    }

    /// Keys must be non-decreasing within a chunk and across chunks.
    fn check_key_order(&mut self, chunk: &DataChunk) -> StorageResult<()> {
        let num_keys = self
            .group_schema
            .as_ref()
            .map_or(0, |s| s.num_key_columns());
        if num_keys == 0 {
            return Ok(());
        }
        for idx in 0..chunk.cardinality() {
            let key = chunk.row_prefix(idx, num_keys);
            if let Some(last) = &self.last_key {
                if key < *last {
                    return Err(TracedStorageError::invalid_state(format!(
                        "key {key:?} is smaller than previous key {last:?}"
                    )));
                }
            }
            self.last_key = Some(key);
        }
        Ok(())
    }

    /// Finish the key group of the last segment, if it is still open.
    async fn finish_key_segment(&mut self) -> StorageResult<()> {
        if self.segment_rows.len() < self.writers.len() {
            if let Some(writer) = self.writers.last_mut() {
                writer.finish_group().await?;
                self.segment_rows.push(writer.num_rows().unwrap_or(0));
            }
        }
        Ok(())
    }

    async fn append_value(&mut self, chunk: &DataChunk) -> StorageResult<()> {
        let card = chunk.cardinality();
        let mut offset = 0;
        while offset < card {
            let Some(writer) = self.writers.get_mut(self.current) else {
                let (segment, expected) = match self.segment_rows.last() {
                    Some(rows) => (self.segment_rows.len() - 1, *rows as usize),
                    None => (0, 0),
                };
                return Err(StorageError::RowCountMismatch {
                    segment,
                    expected,
                    actual: expected + card - offset,
                }
                .into());
            };
            let remaining = self.segment_rows[self.current] - writer.group_rows();
            if remaining == 0 {
                writer.finish_group().await?;
                self.current += 1;
                continue;
            }
            let end = offset + ((card - offset) as u64).min(remaining) as usize;
            writer.append(&chunk.slice(offset..end))?;
            offset = end;
        }
        Ok(())
    }

    pub async fn finish_group(&mut self) -> StorageResult<()> {
        match self.group.take() {
            Some(true) => {
                self.finish_key_segment().await?;
                self.key_written = true;
            }
            Some(false) => {
                for writer in &mut self.writers[self.current..] {
                    writer.finish_group().await?;
                }
            }
            None => return Err(TracedStorageError::invalid_state("no active column group")),
        }
        self.group_schema = None;
        Ok(())
    }

    /// Total rows decided by the key group.
    pub fn num_rows(&self) -> u64 {
        self.segment_rows.iter().sum()
    }

    /// Write every footer.
    pub async fn finish(self) -> StorageResult<Vec<SegmentMeta>> {
        if self.group.is_some() {
            return Err(TracedStorageError::invalid_state("column group is not flushed"));
        }
        let mut metas = Vec::with_capacity(self.writers.len());
        for writer in self.writers {
            metas.push(writer.finalize().await?);
        }
        Ok(metas)
    }
}
