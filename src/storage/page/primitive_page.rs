// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use bitvec::prelude::{BitVec, Lsb0};
use bytes::Buf;

use super::{decode_bitmap, encode_bitmap, ensure_remaining, PageBuilder};
use crate::array::{ArrayBuilder, PrimitiveArray, PrimitiveArrayBuilder};
use crate::storage::{PrimitiveFixedWidthEncode, StorageResult, TracedStorageError};

/// Encodes fixed-width data into a page. The layout is simply an array of
/// little endian fixed-width data. Nulls are not representable.
pub struct PlainPrimitivePageBuilder<T: PrimitiveFixedWidthEncode> {
    data: Vec<u8>,
    target_size: usize,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: PrimitiveFixedWidthEncode> PlainPrimitivePageBuilder<T> {
    pub fn new(target_size: usize) -> Self {
        Self {
            data: Vec::with_capacity(target_size),
            target_size,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<T: PrimitiveFixedWidthEncode> PageBuilder<PrimitiveArray<T>> for PlainPrimitivePageBuilder<T> {
    fn append(&mut self, item: Option<&T>) {
        item.unwrap_or(T::DEFAULT_VALUE).encode(&mut self.data);
    }

    fn estimated_size(&self) -> usize {
        self.data.len()
    }

    fn should_finish(&self, _next_item: &Option<&T>) -> bool {
        !self.data.is_empty() && self.estimated_size() + T::WIDTH > self.target_size
    }

    fn finish(self) -> Vec<u8> {
        self.data
    }
}

/// Encodes nullable fixed-width data into a page.
///
/// ```plain
/// | bitmap len (4B) | bitmap | values |
/// ```
pub struct PlainNullablePageBuilder<T: PrimitiveFixedWidthEncode> {
    inner: PlainPrimitivePageBuilder<T>,
    bitmap: BitVec<u8, Lsb0>,
    target_size: usize,
}

impl<T: PrimitiveFixedWidthEncode> PlainNullablePageBuilder<T> {
    pub fn new(target_size: usize) -> Self {
        Self {
            inner: PlainPrimitivePageBuilder::new(target_size),
            bitmap: BitVec::with_capacity(target_size),
            target_size,
        }
    }
}

impl<T: PrimitiveFixedWidthEncode> PageBuilder<PrimitiveArray<T>> for PlainNullablePageBuilder<T> {
    fn append(&mut self, item: Option<&T>) {
        self.bitmap.push(item.is_some());
        self.inner.append(item);
    }

    fn estimated_size(&self) -> usize {
        4 + (self.bitmap.len() + 7) / 8 + self.inner.estimated_size()
    }

    fn should_finish(&self, _next_item: &Option<&T>) -> bool {
        // +1 here since bitmap may extend a byte
        !self.bitmap.is_empty() && self.estimated_size() + T::WIDTH + 1 > self.target_size
    }

    fn finish(self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.estimated_size());
        encode_bitmap(&self.bitmap, &mut data);
        data.extend(self.inner.finish());
        data
    }
}

pub fn decode_plain_page<T: PrimitiveFixedWidthEncode>(mut body: &[u8]) -> StorageResult<PrimitiveArray<T>> {
    if body.len() % T::WIDTH != 0 {
        return Err(TracedStorageError::decode(format!(
            "plain page of {} bytes is not aligned to {}",
            body.len(),
            T::WIDTH
        )));
    }
    let count = body.len() / T::WIDTH;
    let mut builder = PrimitiveArrayBuilder::<T>::with_capacity(count);
    for _ in 0..count {
        builder.push(Some(&T::decode(&mut body)));
    }
    Ok(builder.finish())
}

pub fn decode_plain_nullable_page<T: PrimitiveFixedWidthEncode>(
    mut body: &[u8],
) -> StorageResult<PrimitiveArray<T>> {
    let bitmap = decode_bitmap(&mut body)?;
    ensure_remaining(body, bitmap.len() * T::WIDTH)?;
    let mut builder = PrimitiveArrayBuilder::<T>::with_capacity(bitmap.len());
    for valid in bitmap.iter().by_vals() {
        let value = T::decode(&mut body);
        builder.push(valid.then_some(&value));
    }
    if body.has_remaining() {
        return Err(TracedStorageError::decode("trailing bytes in nullable page"));
    }
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Array;

    #[test]
    fn test_build_i32() {
        let mut builder = PlainPrimitivePageBuilder::<i32>::new(128);
        builder.append(Some(&1));
        builder.append(Some(&2));
        builder.append(Some(&3));
        assert_eq!(builder.estimated_size(), 12);
        assert!(!builder.should_finish(&Some(&4)));
        let array = decode_plain_page::<i32>(&builder.finish()).unwrap();
        assert_eq!(array.raw_values(), &[1, 2, 3]);
    }

    #[test]
    fn test_should_finish() {
        let mut builder = PlainPrimitivePageBuilder::<i64>::new(16);
        assert!(!builder.should_finish(&Some(&1)));
        builder.append(Some(&1));
        builder.append(Some(&2));
        assert!(builder.should_finish(&Some(&3)));
    }

    #[test]
    fn test_nullable_f64() {
        let mut builder = PlainNullablePageBuilder::<f64>::new(128);
        builder.append(Some(&1.5));
        builder.append(None);
        builder.append(Some(&-2.0));
        let array = decode_plain_nullable_page::<f64>(&builder.finish()).unwrap();
        assert_eq!(
            array.iter().map(|v| v.cloned()).collect::<Vec<_>>(),
            vec![Some(1.5), None, Some(-2.0)]
        );
    }

    #[test]
    fn test_truncated() {
        let mut builder = PlainNullablePageBuilder::<i32>::new(128);
        builder.append(Some(&1));
        let mut data = builder.finish();
        data.pop();
        assert!(decode_plain_nullable_page::<i32>(&data).is_err());
    }
}
