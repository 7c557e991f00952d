// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use bitvec::prelude::{BitVec, Lsb0};
use bytes::{Buf, BufMut};

use super::{decode_bitmap, encode_bitmap, ensure_remaining, PageBuilder};
use crate::array::{ArrayBuilder, Utf8Array, Utf8ArrayBuilder};
use crate::storage::{StorageResult, TracedStorageError};

/// Encodes variable-length strings into a page.
///
/// ```plain
/// | bitmap len (4B) | bitmap | offsets ((n + 1) * 4B) | data |
/// ```
pub struct BlobPageBuilder {
    bitmap: BitVec<u8, Lsb0>,
    offsets: Vec<u32>,
    data: Vec<u8>,
    target_size: usize,
}

impl BlobPageBuilder {
    pub fn new(target_size: usize) -> Self {
        Self {
            bitmap: BitVec::new(),
            offsets: vec![0],
            data: Vec::with_capacity(target_size),
            target_size,
        }
    }
}

impl PageBuilder<Utf8Array> for BlobPageBuilder {
    fn append(&mut self, item: Option<&str>) {
        self.bitmap.push(item.is_some());
        if let Some(item) = item {
            self.data.extend_from_slice(item.as_bytes());
        }
        self.offsets.push(self.data.len() as u32);
    }

    fn estimated_size(&self) -> usize {
        4 + (self.bitmap.len() + 7) / 8 + self.offsets.len() * 4 + self.data.len()
    }

    fn should_finish(&self, next_item: &Option<&str>) -> bool {
        let next_len = next_item.map_or(0, |s| s.len());
        !self.bitmap.is_empty() && self.estimated_size() + next_len + 4 + 1 > self.target_size
    }

    fn finish(self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.estimated_size());
        encode_bitmap(&self.bitmap, &mut data);
        for offset in &self.offsets {
            data.put_u32_le(*offset);
        }
        data.extend(self.data);
        data
    }
}

pub fn decode_blob_page(mut body: &[u8]) -> StorageResult<Utf8Array> {
    let bitmap = decode_bitmap(&mut body)?;
    let count = bitmap.len();
    ensure_remaining(body, (count + 1) * 4)?;
    let offsets = (0..=count).map(|_| body.get_u32_le() as usize).collect::<Vec<_>>();
    let data = body;
    if offsets.windows(2).any(|w| w[0] > w[1]) || offsets[count] != data.len() {
        return Err(TracedStorageError::decode("invalid offsets in blob page"));
    }
    let mut builder = Utf8ArrayBuilder::with_capacity(count);
    for (idx, valid) in bitmap.iter().by_vals().enumerate() {
        if valid {
            let s = std::str::from_utf8(&data[offsets[idx]..offsets[idx + 1]])
                .map_err(TracedStorageError::decode)?;
            builder.push(Some(s));
        } else {
            builder.push(None);
        }
    }
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Array;

    #[test]
    fn test_build_str() {
        let mut builder = BlobPageBuilder::new(128);
        builder.append(Some("233"));
        builder.append(Some("23333"));
        builder.append(None);
        builder.append(Some(""));
        assert_eq!(builder.estimated_size(), 4 + 1 + 5 * 4 + 8);
        assert!(!builder.should_finish(&Some("2333333")));
        let array = decode_blob_page(&builder.finish()).unwrap();
        assert_eq!(
            array.iter().collect::<Vec<_>>(),
            vec![Some("233"), Some("23333"), None, Some("")]
        );
    }

    #[test]
    fn test_invalid_offsets() {
        let mut builder = BlobPageBuilder::new(128);
        builder.append(Some("abc"));
        let mut data = builder.finish();
        data.pop();
        assert!(decode_blob_page(&data).is_err());
    }
}
