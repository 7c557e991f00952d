// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::iter::FromIterator;

use bitvec::vec::BitVec;

use super::{Array, ArrayBuilder};

/// A collection of UTF-8 strings.
#[derive(Debug, Clone, PartialEq)]
pub struct Utf8Array {
    offset: Vec<usize>,
    valid: BitVec,
    data: Vec<u8>,
}

impl Array for Utf8Array {
    type Item = str;
    type Builder = Utf8ArrayBuilder;

    fn get(&self, idx: usize) -> Option<&str> {
        if self.valid[idx] {
            let data_slice = &self.data[self.offset[idx]..self.offset[idx + 1]];
            // SAFETY: only `&str` can be pushed into the builder.
            Some(unsafe { std::str::from_utf8_unchecked(data_slice) })
        } else {
            None
        }
    }

    fn len(&self) -> usize {
        self.valid.len()
    }

    fn null_count(&self) -> usize {
        self.valid.count_zeros()
    }
}

impl Utf8Array {
    /// Total size of string payloads in bytes.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }
}

impl<'a> FromIterator<Option<&'a str>> for Utf8Array {
    fn from_iter<I: IntoIterator<Item = Option<&'a str>>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut builder = Utf8ArrayBuilder::with_capacity(iter.size_hint().0);
        for e in iter {
            builder.push(e);
        }
        builder.finish()
    }
}

impl<'a> FromIterator<&'a str> for Utf8Array {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        iter.into_iter().map(Some).collect()
    }
}

/// A builder that uses `&str` to build an [`Utf8Array`].
pub struct Utf8ArrayBuilder {
    offset: Vec<usize>,
    valid: BitVec,
    data: Vec<u8>,
}

impl ArrayBuilder for Utf8ArrayBuilder {
    type Array = Utf8Array;

    fn with_capacity(capacity: usize) -> Self {
        let mut offset = Vec::with_capacity(capacity + 1);
        offset.push(0);
        Self {
            offset,
            data: Vec::with_capacity(capacity),
            valid: BitVec::with_capacity(capacity),
        }
    }

    fn push(&mut self, value: Option<&str>) {
        self.valid.push(value.is_some());
        if let Some(x) = value {
            self.data.extend_from_slice(x.as_bytes());
        }
        self.offset.push(self.data.len());
    }

    fn append(&mut self, other: &Utf8Array) {
        self.valid.extend_from_bitslice(&other.valid);
        self.data.extend_from_slice(&other.data);
        let start = *self.offset.last().unwrap_or(&0);
        for other_offset in &other.offset[1..] {
            self.offset.push(*other_offset + start);
        }
    }

    fn finish(self) -> Utf8Array {
        Utf8Array {
            offset: self.offset,
            valid: self.valid,
            data: self.data,
        }
    }
}
