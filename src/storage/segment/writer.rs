// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::path::{Path, PathBuf};

use bytes::BufMut;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use super::{SegmentFooter, SegmentMeta, ShortKeyIndex, SEGMENT_MAGIC};
use crate::array::DataChunk;
use crate::catalog::TabletSchema;
use crate::storage::column::{ColumnBuilderImpl, ColumnMeta};
use crate::storage::{
    ColumnBuilderOptions, StorageError, StorageOptions, StorageResult, TracedStorageError,
};
use crate::types::Row;

/// Options of a [`SegmentWriter`].
#[derive(Debug, Clone)]
pub struct SegmentWriterOptions {
    pub column: ColumnBuilderOptions,
    pub short_key_interval: usize,
    pub enable_fsync: bool,
}

impl SegmentWriterOptions {
    pub fn from_storage_options(options: &StorageOptions) -> Self {
        Self {
            column: ColumnBuilderOptions::from_storage_options(options),
            short_key_interval: options.short_key_interval.max(1),
            enable_fsync: options.enable_fsync,
        }
    }
}

/// The column group being written.
struct ActiveGroup {
    schema: TabletSchema,
    is_key: bool,
    builders: Vec<ColumnBuilderImpl>,
    num_rows: u64,
}

/// Writes one segment file.
///
/// Columns are written in groups. A horizontal write uses a single group holding every
/// column, a vertical write starts with the key group and appends value groups afterwards.
/// Every group must contain the same number of rows.
pub struct SegmentWriter {
    segment_id: u32,
    path: PathBuf,
    file: BufWriter<File>,
    offset: u64,
    options: SegmentWriterOptions,

    /// Row count established by the first finished group.
    num_rows: Option<u64>,
    columns: Vec<ColumnMeta>,
    short_key_index: ShortKeyIndex,
    min_key: Row,
    max_key: Row,
    group: Option<ActiveGroup>,
}

impl SegmentWriter {
    /// Create the segment file. Fails if the file exists.
    pub async fn create(
        path: impl AsRef<Path>,
        segment_id: u32,
        options: SegmentWriterOptions,
    ) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(Self {
            segment_id,
            path,
            file: BufWriter::new(file),
            offset: 0,
            short_key_index: ShortKeyIndex {
                interval: options.short_key_interval as u64,
                keys: vec![],
            },
            options,
            num_rows: None,
            columns: vec![],
            min_key: vec![],
            max_key: vec![],
            group: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn segment_id(&self) -> u32 {
        self.segment_id
    }

    /// Rows of the key group, once it is finished.
    pub fn num_rows(&self) -> Option<u64> {
        self.num_rows
    }

    /// Rows appended to the active group.
    pub fn group_rows(&self) -> u64 {
        self.group.as_ref().map_or(0, |g| g.num_rows)
    }

    /// Start a column group. `schema` describes the columns of the group, in order.
    pub fn start_group(&mut self, schema: &TabletSchema, is_key: bool) -> StorageResult<()> {
        if self.group.is_some() {
            return Err(TracedStorageError::invalid_state(format!(
                "segment {}: previous column group is not finished",
                self.segment_id
            )));
        }
        if is_key && self.num_rows.is_some() {
            return Err(TracedStorageError::invalid_state(format!(
                "segment {}: key group has been written",
                self.segment_id
            )));
        }
        if let Some(col) = schema
            .columns()
            .iter()
            .find(|c| self.columns.iter().any(|m| m.unique_id == c.unique_id()))
        {
            return Err(TracedStorageError::duplicated("column", col.unique_id()));
        }
        let builders = schema
            .columns()
            .iter()
            .map(|c| ColumnBuilderImpl::new(c, self.options.column.clone()))
            .collect();
        self.group = Some(ActiveGroup {
            schema: schema.clone(),
            is_key,
            builders,
            num_rows: 0,
        });
        Ok(())
    }

    /// Append a chunk laid out in the schema of the active group.
    pub fn append(&mut self, chunk: &DataChunk) -> StorageResult<()> {
        let Some(group) = &mut self.group else {
            return Err(TracedStorageError::invalid_state(format!(
                "segment {}: no active column group",
                self.segment_id
            )));
        };
        if !group.schema.is_compatible_with(&chunk.data_types()) {
            return Err(TracedStorageError::schema_mismatch(format!(
                "chunk of {:?} does not match column group {:?}",
                chunk.data_types(),
                group.schema.data_types()
            )));
        }
        if chunk.is_empty() {
            return Ok(());
        }

        if group.is_key {
            let num_keys = group.schema.num_key_columns();
            let num_short_keys = group.schema.num_short_key_columns();
            let interval = self.short_key_index.interval;
            for idx in 0..chunk.cardinality() {
                let ordinal = group.num_rows + idx as u64;
                if ordinal % interval == 0 {
                    self.short_key_index
                        .keys
                        .push(chunk.row_prefix(idx, num_short_keys));
                }
            }
            if group.num_rows == 0 {
                self.min_key = chunk.row_prefix(0, num_keys);
            }
            self.max_key = chunk.row_prefix(chunk.cardinality() - 1, num_keys);
        }

        for (builder, array) in group.builders.iter_mut().zip(chunk.arrays()) {
            builder.append(array)?;
        }
        group.num_rows += chunk.cardinality() as u64;
        Ok(())
    }

    /// Finish the active group and write its pages to the file.
    pub async fn finish_group(&mut self) -> StorageResult<()> {
        let Some(group) = self.group.take() else {
            return Err(TracedStorageError::invalid_state(format!(
                "segment {}: no active column group",
                self.segment_id
            )));
        };
        match self.num_rows {
            Some(expected) if expected != group.num_rows => {
                return Err(StorageError::RowCountMismatch {
                    segment: self.segment_id as usize,
                    expected: expected as usize,
                    actual: group.num_rows as usize,
                }
                .into());
            }
            _ => self.num_rows = Some(group.num_rows),
        }

        for (column, builder) in group.schema.columns().iter().zip(group.builders) {
            let (mut pages, zone_map, data) = builder.finish();
            for page in &mut pages {
                page.offset += self.offset;
            }
            self.file.write_all(&data).await?;
            self.offset += data.len() as u64;
            self.columns.push(ColumnMeta {
                unique_id: column.unique_id(),
                data_type: column.data_type(),
                is_nullable: column.is_nullable(),
                pages,
                zone_map,
            });
        }
        Ok(())
    }

    /// Write the footer and close the file.
    pub async fn finalize(mut self) -> StorageResult<SegmentMeta> {
        if self.group.is_some() {
            return Err(TracedStorageError::invalid_state(format!(
                "segment {}: column group is not finished",
                self.segment_id
            )));
        }
        let num_rows = self.num_rows.unwrap_or(0);
        let footer = SegmentFooter {
            num_rows,
            columns: self.columns,
            short_key_index: self.short_key_index,
            min_key: self.min_key,
            max_key: self.max_key,
        };
        let mut data = serde_json::to_vec(&footer)?;
        let checksum = crc32fast::hash(&data);
        let footer_len = data.len() as u32;
        data.put_u32_le(footer_len);
        data.put_u32_le(checksum);
        data.put_u32_le(SEGMENT_MAGIC);
        self.file.write_all(&data).await?;
        self.offset += data.len() as u64;
        self.file.flush().await?;
        let file = self.file.into_inner();
        if self.options.enable_fsync {
            file.sync_data().await?;
        }

        debug!(
            path = %self.path.display(),
            num_rows,
            size = self.offset,
            "segment sealed"
        );
        Ok(SegmentMeta {
            num_rows,
            min_key: footer.min_key,
            max_key: footer.max_key,
            data_size: self.offset,
        })
    }
}
