// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! In-memory columnar representation used between the storage layer and its callers.

use std::ops::Range;

use ordered_float::OrderedFloat;

use crate::types::{DataType, DataValue};

mod data_chunk;
mod data_chunk_builder;
mod iterator;
mod primitive_array;
mod utf8_array;

pub use self::data_chunk::*;
pub use self::data_chunk_builder::*;
pub use self::iterator::ArrayIter;
pub use self::primitive_array::*;
pub use self::utf8_array::*;

/// A trait over all array builders.
///
/// `ArrayBuilder` is a trait over all builders. You could build an array with
/// `push` with the help of `ArrayBuilder` trait. The `push` function always
/// accepts reference to an element. e.g. for `PrimitiveArray`,
/// you must do `builder.push(Some(&1))`. For `Utf8Array`, you must do
/// `builder.push(Some("xxx"))`. Note that you don't need to construct a `String`.
pub trait ArrayBuilder: Send + Sync + 'static {
    /// Corresponding `Array` of this builder
    type Array: Array<Builder = Self>;

    /// Create a new builder with `capacity`.
    fn with_capacity(capacity: usize) -> Self;

    /// Append a value to builder.
    fn push(&mut self, value: Option<&<Self::Array as Array>::Item>);

    /// Append an array to builder.
    fn append(&mut self, other: &Self::Array);

    /// Finish build and return a new array.
    fn finish(self) -> Self::Array;
}

/// A trait over all array.
///
/// `Array` must be built with an `ArrayBuilder`. The array trait provides several
/// unified interface on an array, like `len`, `get` and `iter`.
pub trait Array: Sized + Send + Sync + 'static {
    /// Corresponding builder of this array.
    type Builder: ArrayBuilder<Array = Self>;

    /// Type of element in the array.
    type Item: ?Sized;

    /// Retrieve a reference to value.
    fn get(&self, idx: usize) -> Option<&Self::Item>;

    /// Number of items of array.
    fn len(&self) -> usize;

    /// Check if `Array` is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get iterator of current array.
    fn iter(&self) -> ArrayIter<'_, Self> {
        ArrayIter::new(self)
    }

    /// Filter the elements and return a new array.
    fn filter(&self, visibility: &[bool]) -> Self {
        let mut builder = Self::Builder::with_capacity(self.len());
        for (item, &visible) in self.iter().zip(visibility) {
            if visible {
                builder.push(item);
            }
        }
        builder.finish()
    }

    /// Return a slice of self for the provided range.
    fn slice(&self, range: Range<usize>) -> Self {
        let mut builder = Self::Builder::with_capacity(range.len());
        for idx in range {
            builder.push(self.get(idx));
        }
        builder.finish()
    }

    /// Gather the elements at `indices`.
    fn take(&self, indices: &[usize]) -> Self {
        let mut builder = Self::Builder::with_capacity(indices.len());
        for &idx in indices {
            builder.push(self.get(idx));
        }
        builder.finish()
    }

    /// Number of null elements.
    fn null_count(&self) -> usize {
        self.iter().filter(|v| v.is_none()).count()
    }
}

pub type BoolArray = PrimitiveArray<bool>;
pub type I32Array = PrimitiveArray<i32>;
pub type I64Array = PrimitiveArray<i64>;
pub type F64Array = PrimitiveArray<f64>;

pub type BoolArrayBuilder = PrimitiveArrayBuilder<bool>;
pub type I32ArrayBuilder = PrimitiveArrayBuilder<i32>;
pub type I64ArrayBuilder = PrimitiveArrayBuilder<i64>;
pub type F64ArrayBuilder = PrimitiveArrayBuilder<f64>;

/// Embeds all types of arrays in `array` module.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayImpl {
    Bool(BoolArray),
    Int32(I32Array),
    Int64(I64Array),
    Float64(F64Array),
    Utf8(Utf8Array),
}

/// Embeds all types of array builders in `array` module.
pub enum ArrayBuilderImpl {
    Bool(BoolArrayBuilder),
    Int32(I32ArrayBuilder),
    Int64(I64ArrayBuilder),
    Float64(F64ArrayBuilder),
    Utf8(Utf8ArrayBuilder),
}

/// Dispatch an expression over every variant of [`ArrayImpl`].
macro_rules! for_all_arrays {
    ($self:expr, $a:ident => $body:expr) => {
        match $self {
            ArrayImpl::Bool($a) => $body,
            ArrayImpl::Int32($a) => $body,
            ArrayImpl::Int64($a) => $body,
            ArrayImpl::Float64($a) => $body,
            ArrayImpl::Utf8($a) => $body,
        }
    };
}

/// Same as `for_all_arrays`, but re-wraps the result into the same variant.
macro_rules! map_all_arrays {
    ($self:expr, $a:ident => $body:expr) => {
        match $self {
            ArrayImpl::Bool($a) => ArrayImpl::Bool($body),
            ArrayImpl::Int32($a) => ArrayImpl::Int32($body),
            ArrayImpl::Int64($a) => ArrayImpl::Int64($body),
            ArrayImpl::Float64($a) => ArrayImpl::Float64($body),
            ArrayImpl::Utf8($a) => ArrayImpl::Utf8($body),
        }
    };
}

macro_rules! impl_into {
    ($x:ty, $y:ident) => {
        impl From<$x> for ArrayImpl {
            fn from(array: $x) -> Self {
                Self::$y(array)
            }
        }
    };
}

impl_into! { BoolArray, Bool }
impl_into! { I32Array, Int32 }
impl_into! { I64Array, Int64 }
impl_into! { F64Array, Float64 }
impl_into! { Utf8Array, Utf8 }

impl ArrayImpl {
    /// Number of items of array.
    pub fn len(&self) -> usize {
        for_all_arrays!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical type of the elements.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Bool(_) => DataType::Bool,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Float64(_) => DataType::Float64,
            Self::Utf8(_) => DataType::String,
        }
    }

    /// Get the value at the given index.
    pub fn get(&self, idx: usize) -> DataValue {
        match self {
            Self::Bool(a) => a.get(idx).map_or(DataValue::Null, |v| DataValue::Bool(*v)),
            Self::Int32(a) => a.get(idx).map_or(DataValue::Null, |v| DataValue::Int32(*v)),
            Self::Int64(a) => a.get(idx).map_or(DataValue::Null, |v| DataValue::Int64(*v)),
            Self::Float64(a) => a
                .get(idx)
                .map_or(DataValue::Null, |v| DataValue::Float64(OrderedFloat(*v))),
            Self::Utf8(a) => a
                .get(idx)
                .map_or(DataValue::Null, |v| DataValue::String(v.to_string())),
        }
    }

    pub fn is_null(&self, idx: usize) -> bool {
        for_all_arrays!(self, a => a.get(idx).is_none())
    }

    pub fn null_count(&self) -> usize {
        for_all_arrays!(self, a => a.null_count())
    }

    /// Filter the elements and return a new array.
    pub fn filter(&self, visibility: &[bool]) -> Self {
        map_all_arrays!(self, a => a.filter(visibility))
    }

    /// Return a slice of self for the provided range.
    pub fn slice(&self, range: Range<usize>) -> Self {
        map_all_arrays!(self, a => a.slice(range))
    }

    /// Gather the elements at `indices`.
    pub fn take(&self, indices: &[usize]) -> Self {
        map_all_arrays!(self, a => a.take(indices))
    }

    /// Build an array of `ty` from values. Panics if a value does not match `ty`.
    pub fn from_values<'a>(ty: DataType, values: impl IntoIterator<Item = &'a DataValue>) -> Self {
        let mut builder = ArrayBuilderImpl::with_capacity(0, ty);
        for v in values {
            builder.push(v);
        }
        builder.finish()
    }
}

impl ArrayBuilderImpl {
    /// Create a new array builder from data type.
    pub fn with_capacity(capacity: usize, ty: DataType) -> Self {
        match ty {
            DataType::Bool => Self::Bool(BoolArrayBuilder::with_capacity(capacity)),
            DataType::Int32 => Self::Int32(I32ArrayBuilder::with_capacity(capacity)),
            DataType::Int64 => Self::Int64(I64ArrayBuilder::with_capacity(capacity)),
            DataType::Float64 => Self::Float64(F64ArrayBuilder::with_capacity(capacity)),
            DataType::String => Self::Utf8(Utf8ArrayBuilder::with_capacity(capacity)),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Bool(_) => DataType::Bool,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Float64(_) => DataType::Float64,
            Self::Utf8(_) => DataType::String,
        }
    }

    /// Appends an element to the back of array.
    pub fn push(&mut self, v: &DataValue) {
        match (self, v) {
            (Self::Bool(a), DataValue::Bool(v)) => a.push(Some(v)),
            (Self::Int32(a), DataValue::Int32(v)) => a.push(Some(v)),
            (Self::Int64(a), DataValue::Int64(v)) => a.push(Some(v)),
            (Self::Int64(a), DataValue::Int32(v)) => a.push(Some(&(*v as i64))),
            (Self::Float64(a), DataValue::Float64(v)) => a.push(Some(&v.0)),
            (Self::Utf8(a), DataValue::String(v)) => a.push(Some(v)),
            (Self::Bool(a), DataValue::Null) => a.push(None),
            (Self::Int32(a), DataValue::Null) => a.push(None),
            (Self::Int64(a), DataValue::Null) => a.push(None),
            (Self::Float64(a), DataValue::Null) => a.push(None),
            (Self::Utf8(a), DataValue::Null) => a.push(None),
            (b, v) => panic!("failed to push value: type mismatch. builder: {}, value: {v:?}", b.data_type()),
        }
    }

    /// Appends the element at `idx` of `array`.
    pub fn push_from(&mut self, array: &ArrayImpl, idx: usize) {
        match (self, array) {
            (Self::Bool(b), ArrayImpl::Bool(a)) => b.push(a.get(idx)),
            (Self::Int32(b), ArrayImpl::Int32(a)) => b.push(a.get(idx)),
            (Self::Int64(b), ArrayImpl::Int64(a)) => b.push(a.get(idx)),
            (Self::Float64(b), ArrayImpl::Float64(a)) => b.push(a.get(idx)),
            (Self::Utf8(b), ArrayImpl::Utf8(a)) => b.push(a.get(idx)),
            (b, a) => b.push(&a.get(idx)),
        }
    }

    /// Appends an array.
    pub fn append(&mut self, array_impl: &ArrayImpl) {
        match (self, array_impl) {
            (Self::Bool(builder), ArrayImpl::Bool(arr)) => builder.append(arr),
            (Self::Int32(builder), ArrayImpl::Int32(arr)) => builder.append(arr),
            (Self::Int64(builder), ArrayImpl::Int64(arr)) => builder.append(arr),
            (Self::Float64(builder), ArrayImpl::Float64(arr)) => builder.append(arr),
            (Self::Utf8(builder), ArrayImpl::Utf8(arr)) => builder.append(arr),
            (b, a) => panic!(
                "failed to append array: type mismatch. builder: {}, array: {}",
                b.data_type(),
                a.data_type()
            ),
        }
    }

    /// Finish build and return a new array.
    pub fn finish(self) -> ArrayImpl {
        match self {
            Self::Bool(a) => ArrayImpl::Bool(a.finish()),
            Self::Int32(a) => ArrayImpl::Int32(a.finish()),
            Self::Int64(a) => ArrayImpl::Int64(a.finish()),
            Self::Float64(a) => ArrayImpl::Float64(a.finish()),
            Self::Utf8(a) => ArrayImpl::Utf8(a.finish()),
        }
    }
}
