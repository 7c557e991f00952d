// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Page builders and decoders.
//!
//! A page is the minimum unit of I/O and caching in a segment file.

mod blob_page;
mod primitive_page;
mod rle_page;

use bitvec::prelude::{BitVec, Lsb0};
use bytes::{Buf, BufMut, Bytes};

pub use self::blob_page::*;
pub use self::primitive_page::*;
pub use self::rle_page::*;
use super::checksum::{build_checksum, verify_checksum};
use super::{ChecksumType, PrimitiveFixedWidthEncode, StorageResult, TracedStorageError};
use crate::array::{Array, ArrayImpl, PrimitiveArray};
use crate::types::DataType;

/// A page is simply a [`Bytes`] array.
pub type Page = Bytes;

/// Builds a page. All builders should implement the trait, while
/// ensuring that the format follows the page encoding scheme:
///
/// ```plain
/// |    data     | page_type | cksum_type | cksum  |
/// |  variable   |    4B     |     4B     |   8B   |
/// ```
pub trait PageBuilder<A: Array> {
    /// Append one data into the page, or null value if item is None
    fn append(&mut self, item: Option<&A::Item>);

    /// Get estimated size of page. Will be useful on runlength encoding.
    fn estimated_size(&self) -> usize;

    /// Check if we should finish the current page. If there is no item in the current
    /// builder, this function must return `false`.
    fn should_finish(&self, next_item: &Option<&A::Item>) -> bool;

    /// Finish a page and return encoded data, without the trailer.
    fn finish(self) -> Vec<u8>;
}

/// Encoding of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Fixed-width values of a non-nullable column.
    Plain,
    /// Validity bitmap followed by fixed-width values.
    PlainNullable,
    /// Runs of `(length, valid, value)`.
    RunLength,
    /// Validity bitmap, offsets and bytes of variable-length values.
    Blob,
}

impl PageType {
    fn to_u32(self) -> u32 {
        match self {
            Self::Plain => 1,
            Self::PlainNullable => 2,
            Self::RunLength => 3,
            Self::Blob => 4,
        }
    }

    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Plain),
            2 => Some(Self::PlainNullable),
            3 => Some(Self::RunLength),
            4 => Some(Self::Blob),
            _ => None,
        }
    }
}

/// A key in page cache contains `rowset_id`, `segment_id`, `column_id` and `page_id`.
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct PageCacheKey {
    pub rowset_id: u64,
    pub segment_id: u32,
    pub column_id: u32,
    pub page_id: u32,
}

impl PageCacheKey {
    pub fn page(mut self, page_id: u32) -> Self {
        self.page_id = page_id;
        self
    }

    pub fn column(mut self, column_id: u32) -> Self {
        self.column_id = column_id;
        self
    }

    pub fn segment(mut self, segment_id: u32) -> Self {
        self.segment_id = segment_id;
        self
    }

    pub fn rowset(mut self, rowset_id: u64) -> Self {
        self.rowset_id = rowset_id;
        self
    }
}

/// Page cache shared by every segment of an engine.
pub type PageCache = moka::future::Cache<PageCacheKey, Page>;

#[derive(Debug, Clone)]
pub struct PageMeta {
    pub page_type: PageType,
    pub checksum_type: ChecksumType,
    pub checksum: u64,
}

pub const PAGE_META_NON_CHECKSUM_SIZE: usize = 4;
pub const PAGE_META_CHECKSUM_SIZE: usize = 4 + 8;
pub const PAGE_META_SIZE: usize = PAGE_META_NON_CHECKSUM_SIZE + PAGE_META_CHECKSUM_SIZE;

impl PageMeta {
    pub fn decode(buf: &mut impl Buf) -> StorageResult<Self> {
        if buf.remaining() < PAGE_META_SIZE {
            return Err(TracedStorageError::decode("expected 16 bytes"));
        }
        let page_type = PageType::from_u32(buf.get_u32_le())
            .ok_or_else(|| TracedStorageError::decode("expected valid page type"))?;
        let checksum_type = ChecksumType::from_u32(buf.get_u32_le())
            .ok_or_else(|| TracedStorageError::decode("expected valid checksum type"))?;
        let checksum = buf.get_u64_le();
        Ok(PageMeta {
            page_type,
            checksum_type,
            checksum,
        })
    }
}

/// Append the trailer to the encoded page data.
pub fn seal_page(mut data: Vec<u8>, page_type: PageType, checksum_type: ChecksumType) -> Vec<u8> {
    data.put_u32_le(page_type.to_u32());
    let checksum = build_checksum(checksum_type, &data);
    data.put_u32_le(checksum_type.to_u32());
    data.put_u64_le(checksum);
    data
}

/// Split a sealed page into its trailer and body, verifying the checksum if asked to.
pub fn open_page(page: &Page, verify: bool) -> StorageResult<(PageMeta, Page)> {
    if page.len() < PAGE_META_SIZE {
        return Err(TracedStorageError::decode("page is smaller than header size"));
    }
    let mut trailer = &page[page.len() - PAGE_META_SIZE..];
    let meta = PageMeta::decode(&mut trailer)?;
    if verify {
        verify_checksum(
            meta.checksum_type,
            &page[..page.len() - PAGE_META_CHECKSUM_SIZE],
            meta.checksum,
        )?;
    }
    Ok((meta, page.slice(..page.len() - PAGE_META_SIZE)))
}

/// Decode the body of a page into an array of `data_type`.
pub fn decode_page(data_type: DataType, page_type: PageType, body: &[u8]) -> StorageResult<ArrayImpl> {
    let array = match (data_type, page_type) {
        (DataType::String, PageType::Blob) => ArrayImpl::Utf8(decode_blob_page(body)?),
        (DataType::String, _) => {
            return Err(TracedStorageError::decode(format!(
                "unexpected page type {page_type:?} for string column"
            )))
        }
        (_, PageType::Blob) => {
            return Err(TracedStorageError::decode(format!(
                "unexpected blob page for {data_type} column"
            )))
        }
        (DataType::Bool, _) => ArrayImpl::Bool(decode_primitive_page(page_type, body)?),
        (DataType::Int32, _) => ArrayImpl::Int32(decode_primitive_page(page_type, body)?),
        (DataType::Int64, _) => ArrayImpl::Int64(decode_primitive_page(page_type, body)?),
        (DataType::Float64, _) => ArrayImpl::Float64(decode_primitive_page(page_type, body)?),
    };
    Ok(array)
}

fn decode_primitive_page<T: PrimitiveFixedWidthEncode>(
    page_type: PageType,
    body: &[u8],
) -> StorageResult<PrimitiveArray<T>> {
    match page_type {
        PageType::Plain => decode_plain_page(body),
        PageType::PlainNullable => decode_plain_nullable_page(body),
        PageType::RunLength => decode_rle_page(body),
        PageType::Blob => unreachable!("blob pages are dispatched before"),
    }
}

/// Encode the bit length of a validity bitmap, then its raw bytes.
fn encode_bitmap(bitmap: &BitVec<u8, Lsb0>, buf: &mut Vec<u8>) {
    buf.put_u32_le(bitmap.len() as u32);
    buf.extend_from_slice(bitmap.as_raw_slice());
}

/// Decode a validity bitmap written by `encode_bitmap`.
fn decode_bitmap(buf: &mut &[u8]) -> StorageResult<BitVec<u8, Lsb0>> {
    ensure_remaining(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    let byte_len = (len + 7) / 8;
    ensure_remaining(buf, byte_len)?;
    let mut bitmap = BitVec::<u8, Lsb0>::from_slice(&buf[..byte_len]);
    bitmap.truncate(len);
    buf.advance(byte_len);
    Ok(bitmap)
}

fn ensure_remaining(buf: &[u8], len: usize) -> StorageResult<()> {
    if buf.remaining() < len {
        return Err(TracedStorageError::decode(format!(
            "page truncated: expected {len} bytes, found {}",
            buf.remaining()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_open() {
        let mut builder = PlainPrimitivePageBuilder::<i32>::new(128);
        builder.append(Some(&1));
        builder.append(Some(&2));
        let page = Bytes::from(seal_page(builder.finish(), PageType::Plain, ChecksumType::Crc32));
        let (meta, body) = open_page(&page, true).unwrap();
        assert_eq!(meta.page_type, PageType::Plain);
        let array = decode_page(DataType::Int32, meta.page_type, &body).unwrap();
        assert_eq!(array.len(), 2);

        let mut corrupted = page.to_vec();
        corrupted[0] ^= 0xff;
        assert!(open_page(&Bytes::from(corrupted), true).is_err());
    }

    #[test]
    fn test_type_mismatch() {
        assert!(decode_page(DataType::String, PageType::Plain, &[]).is_err());
        assert!(decode_page(DataType::Int32, PageType::Blob, &[]).is_err());
    }
}
