// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::io::{Read, Seek, SeekFrom};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tracing::debug;

use super::{SegmentFooter, SEGMENT_MAGIC, SEGMENT_TAIL_SIZE};
use crate::array::{ArrayBuilderImpl, ArrayImpl};
use crate::storage::column::ColumnMeta;
use crate::storage::page::{decode_page, open_page, PageCache, PageCacheKey};
use crate::storage::{IOBackend, RowsetId, StorageResult, TracedStorageError};

/// A readable segment file.
#[derive(Clone)]
pub enum SegmentFile {
    /// For `read_at`
    #[cfg(unix)]
    PositionedRead(Arc<std::fs::File>),
    /// For `file.lock().seek().read()`
    NormalRead(Arc<Mutex<std::fs::File>>),
}

impl SegmentFile {
    fn open(path: &Path, io_backend: IOBackend) -> StorageResult<Self> {
        let file = std::fs::OpenOptions::new().read(true).open(path)?;
        let file = match io_backend {
            #[cfg(unix)]
            IOBackend::PositionedRead => Self::PositionedRead(Arc::new(file)),
            _ => Self::NormalRead(Arc::new(Mutex::new(file))),
        };
        Ok(file)
    }

    fn len(&self) -> StorageResult<u64> {
        let len = match self {
            #[cfg(unix)]
            Self::PositionedRead(file) => file.metadata()?.len(),
            Self::NormalRead(file) => file.lock().metadata()?.len(),
        };
        Ok(len)
    }

    /// Blocking read of `length` bytes at `offset`.
    fn read_at(&self, offset: u64, length: u64) -> StorageResult<Bytes> {
        let mut data = vec![0; length as usize];
        match self {
            #[cfg(unix)]
            Self::PositionedRead(file) => file.read_exact_at(&mut data[..], offset)?,
            Self::NormalRead(file) => {
                let mut file = file.lock();
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut data[..])?;
            }
        }
        Ok(Bytes::from(data))
    }
}

/// An opened segment. Only the footer is held in memory; pages are read on demand
/// through the page cache.
///
/// [`Segment`] is immutable and can be shared among readers.
pub struct Segment {
    rowset_id: RowsetId,
    segment_id: u32,
    path: PathBuf,
    footer: SegmentFooter,
    file: SegmentFile,
    page_cache: PageCache,
}

impl Segment {
    /// Open a segment, validating its tail and footer.
    pub async fn open(
        path: impl AsRef<Path>,
        rowset_id: RowsetId,
        segment_id: u32,
        io_backend: IOBackend,
        page_cache: PageCache,
    ) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let path_clone = path.clone();
        let (file, footer) = tokio::task::spawn_blocking(move || {
            let file = SegmentFile::open(&path_clone, io_backend)?;
            let footer = read_footer(&file)?;
            Ok::<_, TracedStorageError>((file, footer))
        })
        .await??;
        debug!(
            path = %path.display(),
            num_rows = footer.num_rows,
            "segment opened"
        );
        Ok(Self {
            rowset_id,
            segment_id,
            path,
            footer,
            file,
            page_cache,
        })
    }

    pub fn rowset_id(&self) -> RowsetId {
        self.rowset_id
    }

    pub fn segment_id(&self) -> u32 {
        self.segment_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn footer(&self) -> &SegmentFooter {
        &self.footer
    }

    pub fn num_rows(&self) -> u64 {
        self.footer.num_rows
    }

    pub fn column_meta(&self, column_pos: usize) -> &ColumnMeta {
        &self.footer.columns[column_pos]
    }

    /// Load and decode one page of a column.
    pub async fn get_page(&self, column_pos: usize, page_id: usize) -> StorageResult<ArrayImpl> {
        let column = self.column_meta(column_pos);
        let index = column.pages.get(page_id).cloned().ok_or_else(|| {
            TracedStorageError::decode(format!(
                "page {page_id} out of range in column {}",
                column.unique_id
            ))
        })?;
        let key = PageCacheKey::default()
            .rowset(self.rowset_id.0)
            .segment(self.segment_id)
            .column(column.unique_id)
            .page(page_id as u32);

        // Only pages that pass their checksum enter the cache.
        let page = self
            .page_cache
            .try_get_with(key, async {
                let file = self.file.clone();
                let page =
                    tokio::task::spawn_blocking(move || file.read_at(index.offset, index.length))
                        .await??;
                open_page(&page, true)?;
                Ok::<_, TracedStorageError>(page)
            })
            .await?;

        let (meta, body) = open_page(&page, false)?;
        let array = decode_page(column.data_type, meta.page_type, &body)?;
        if array.len() as u64 != index.row_count {
            return Err(TracedStorageError::decode(format!(
                "page {page_id} of column {} has {} rows, expected {}",
                column.unique_id,
                array.len(),
                index.row_count
            )));
        }
        Ok(array)
    }

    /// Read the rows in `rows` of a column.
    pub async fn read_column(&self, column_pos: usize, rows: Range<u64>) -> StorageResult<ArrayImpl> {
        let column = self.column_meta(column_pos);
        let mut builder =
            ArrayBuilderImpl::with_capacity((rows.end - rows.start) as usize, column.data_type);
        if rows.is_empty() {
            return Ok(builder.finish());
        }
        let first_page = column.page_of_row(rows.start);
        let last_page = column.page_of_row(rows.end - 1);
        for page_id in first_page..=last_page {
            let page = &column.pages[page_id];
            let array = self.get_page(column_pos, page_id).await?;
            let page_end = page.first_ordinal + page.row_count;
            let start = rows.start.max(page.first_ordinal) - page.first_ordinal;
            let end = rows.end.min(page_end) - page.first_ordinal;
            builder.append(&array.slice(start as usize..end as usize));
        }
        Ok(builder.finish())
    }
}

/// Read and validate the footer of a segment file.
fn read_footer(file: &SegmentFile) -> StorageResult<SegmentFooter> {
    let file_len = file.len()?;
    if file_len < SEGMENT_TAIL_SIZE as u64 {
        return Err(TracedStorageError::decode("segment file is smaller than its tail"));
    }
    let mut tail = file.read_at(file_len - SEGMENT_TAIL_SIZE as u64, SEGMENT_TAIL_SIZE as u64)?;
    let footer_len = tail.get_u32_le() as u64;
    let checksum = tail.get_u32_le();
    let magic = tail.get_u32_le();
    if magic != SEGMENT_MAGIC {
        return Err(TracedStorageError::decode(format!(
            "invalid segment magic {magic:#x}"
        )));
    }
    if footer_len + SEGMENT_TAIL_SIZE as u64 > file_len {
        return Err(TracedStorageError::decode(format!(
            "footer length {footer_len} exceeds file size {file_len}"
        )));
    }
    let footer = file.read_at(file_len - SEGMENT_TAIL_SIZE as u64 - footer_len, footer_len)?;
    let found = crc32fast::hash(&footer);
    if found != checksum {
        return Err(TracedStorageError::checksum(found as u64, checksum as u64));
    }
    let footer: SegmentFooter = serde_json::from_slice(&footer)?;
    for column in &footer.columns {
        if column.num_rows() != footer.num_rows {
            return Err(TracedStorageError::decode(format!(
                "column {} has {} rows, footer has {}",
                column.unique_id,
                column.num_rows(),
                footer.num_rows
            )));
        }
    }
    Ok(footer)
}
