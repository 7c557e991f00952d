// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::fmt::Debug;
use std::iter::FromIterator;

use bitvec::vec::BitVec;

use super::{Array, ArrayBuilder};

/// A primitive type that can be stored in a [`PrimitiveArray`].
pub trait NativeType: Copy + Default + PartialOrd + Debug + Send + Sync + 'static {}

impl NativeType for bool {}
impl NativeType for i32 {}
impl NativeType for i64 {}
impl NativeType for f64 {}

/// A collection of primitive types, such as `i32`, `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveArray<T: NativeType> {
    valid: BitVec,
    data: Vec<T>,
}

// Enable `collect()` an array from iterator of `Option<T>`.
impl<T: NativeType> FromIterator<Option<T>> for PrimitiveArray<T> {
    fn from_iter<I: IntoIterator<Item = Option<T>>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut builder = <Self as Array>::Builder::with_capacity(iter.size_hint().0);
        for e in iter {
            builder.push(e.as_ref());
        }
        builder.finish()
    }
}

// Enable `collect()` an array from iterator of `T`.
impl<T: NativeType> FromIterator<T> for PrimitiveArray<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        iter.into_iter().map(Some).collect()
    }
}

impl<T: NativeType> Array for PrimitiveArray<T> {
    type Item = T;
    type Builder = PrimitiveArrayBuilder<T>;

    fn get(&self, idx: usize) -> Option<&T> {
        self.valid[idx].then(|| &self.data[idx])
    }

    fn len(&self) -> usize {
        self.valid.len()
    }

    fn slice(&self, range: std::ops::Range<usize>) -> Self {
        Self {
            valid: self.valid[range.clone()].to_bitvec(),
            data: self.data[range].to_vec(),
        }
    }

    fn null_count(&self) -> usize {
        self.valid.count_zeros()
    }
}

impl<T: NativeType> PrimitiveArray<T> {
    /// Raw values. Null slots hold `T::default()`.
    pub fn raw_values(&self) -> &[T] {
        &self.data
    }

    /// The validity bitmap.
    pub fn valid_bitmap(&self) -> &BitVec {
        &self.valid
    }
}

/// A builder that constructs a [`PrimitiveArray`] from `Option<T>`.
pub struct PrimitiveArrayBuilder<T: NativeType> {
    valid: BitVec,
    data: Vec<T>,
}

impl<T: NativeType> ArrayBuilder for PrimitiveArrayBuilder<T> {
    type Array = PrimitiveArray<T>;

    fn with_capacity(capacity: usize) -> Self {
        Self {
            valid: BitVec::with_capacity(capacity),
            data: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, value: Option<&T>) {
        self.valid.push(value.is_some());
        self.data.push(value.cloned().unwrap_or_default());
    }

    fn append(&mut self, other: &PrimitiveArray<T>) {
        self.valid.extend_from_bitslice(&other.valid);
        self.data.extend_from_slice(&other.data);
    }

    fn finish(self) -> PrimitiveArray<T> {
        PrimitiveArray {
            valid: self.valid,
            data: self.data,
        }
    }
}
