// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use bytes::{Buf, BufMut};

use super::{ensure_remaining, PageBuilder};
use crate::array::{ArrayBuilder, PrimitiveArray, PrimitiveArrayBuilder};
use crate::storage::{PrimitiveFixedWidthEncode, StorageResult, TracedStorageError};

/// Encodes fixed-width data as runs of equal values. Nulls form runs of their own.
///
/// ```plain
/// | run count (4B) | run length (4B) | valid (1B) | value | ... |
/// ```
pub struct RlePrimitivePageBuilder<T: PrimitiveFixedWidthEncode> {
    runs: Vec<(u32, Option<T>)>,
    target_size: usize,
}

impl<T: PrimitiveFixedWidthEncode> RlePrimitivePageBuilder<T> {
    const RUN_SIZE: usize = 4 + 1 + T::WIDTH;

    pub fn new(target_size: usize) -> Self {
        Self {
            runs: Vec::new(),
            target_size,
        }
    }

    fn extends_last_run(&self, item: &Option<&T>) -> bool {
        match self.runs.last() {
            Some((len, last)) => *len < u32::MAX && last.as_ref() == *item,
            None => false,
        }
    }
}

impl<T: PrimitiveFixedWidthEncode> PageBuilder<PrimitiveArray<T>> for RlePrimitivePageBuilder<T> {
    fn append(&mut self, item: Option<&T>) {
        if self.extends_last_run(&item) {
            if let Some((len, _)) = self.runs.last_mut() {
                *len += 1;
            }
        } else {
            self.runs.push((1, item.copied()));
        }
    }

    fn estimated_size(&self) -> usize {
        4 + self.runs.len() * Self::RUN_SIZE
    }

    fn should_finish(&self, next_item: &Option<&T>) -> bool {
        !self.runs.is_empty()
            && !self.extends_last_run(next_item)
            && self.estimated_size() + Self::RUN_SIZE > self.target_size
    }

    fn finish(self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.estimated_size());
        data.put_u32_le(self.runs.len() as u32);
        for (len, value) in self.runs {
            data.put_u32_le(len);
            data.put_u8(value.is_some() as u8);
            value.as_ref().unwrap_or(T::DEFAULT_VALUE).encode(&mut data);
        }
        data
    }
}

pub fn decode_rle_page<T: PrimitiveFixedWidthEncode>(mut body: &[u8]) -> StorageResult<PrimitiveArray<T>> {
    ensure_remaining(body, 4)?;
    let runs = body.get_u32_le() as usize;
    ensure_remaining(body, runs * RlePrimitivePageBuilder::<T>::RUN_SIZE)?;
    let mut builder = PrimitiveArrayBuilder::<T>::with_capacity(runs);
    for _ in 0..runs {
        let len = body.get_u32_le();
        let valid = body.get_u8() != 0;
        let value = T::decode(&mut body);
        for _ in 0..len {
            builder.push(valid.then_some(&value));
        }
    }
    if body.has_remaining() {
        return Err(TracedStorageError::decode("trailing bytes in rle page"));
    }
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Array;

    #[test]
    fn test_build_rle_i32() {
        let mut builder = RlePrimitivePageBuilder::<i32>::new(128);
        for _ in 0..100 {
            builder.append(Some(&1));
        }
        builder.append(None);
        builder.append(None);
        builder.append(Some(&2));
        assert_eq!(builder.estimated_size(), 4 + 3 * 9);
        assert!(!builder.should_finish(&Some(&2)));
        let array = decode_rle_page::<i32>(&builder.finish()).unwrap();
        assert_eq!(array.len(), 103);
        assert_eq!(array.get(99), Some(&1));
        assert_eq!(array.get(100), None);
        assert_eq!(array.get(102), Some(&2));
    }

    #[test]
    fn test_should_finish_only_on_new_run() {
        let mut builder = RlePrimitivePageBuilder::<i64>::new(30);
        builder.append(Some(&1));
        builder.append(Some(&2));
        // the page is full, but repeating the last value costs nothing
        assert!(!builder.should_finish(&Some(&2)));
        assert!(builder.should_finish(&Some(&3)));
    }
}
