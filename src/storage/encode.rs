// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use bytes::{Buf, BufMut};
use ordered_float::OrderedFloat;

use crate::array::{ArrayImpl, NativeType, PrimitiveArray};
use crate::types::DataValue;

/// Encode a primitive value into fixed-width buffer
pub trait PrimitiveFixedWidthEncode: NativeType {
    /// Width of each element
    const WIDTH: usize;
    const DEFAULT_VALUE: &'static Self;

    /// Encode current primitive data to the end of an `Vec<u8>`.
    fn encode(&self, buffer: &mut impl BufMut);

    /// Decode a data from a bytes array.
    fn decode(buffer: &mut impl Buf) -> Self;

    /// Convert into a scalar value, used by page statistics.
    fn to_value(self) -> DataValue;

    /// Downcast an array of the matching type.
    fn downcast(array: &ArrayImpl) -> Option<&PrimitiveArray<Self>>;
}

impl PrimitiveFixedWidthEncode for bool {
    const WIDTH: usize = std::mem::size_of::<u8>();
    const DEFAULT_VALUE: &'static bool = &false;

    fn encode(&self, buffer: &mut impl BufMut) {
        buffer.put_u8(*self as u8)
    }

    fn decode(buffer: &mut impl Buf) -> Self {
        buffer.get_u8() != 0
    }

    fn to_value(self) -> DataValue {
        DataValue::Bool(self)
    }

    fn downcast(array: &ArrayImpl) -> Option<&PrimitiveArray<Self>> {
        match array {
            ArrayImpl::Bool(a) => Some(a),
            _ => None,
        }
    }
}

impl PrimitiveFixedWidthEncode for i32 {
    const WIDTH: usize = std::mem::size_of::<i32>();
    const DEFAULT_VALUE: &'static i32 = &0;

    fn encode(&self, buffer: &mut impl BufMut) {
        buffer.put_i32_le(*self);
    }

    fn decode(buffer: &mut impl Buf) -> Self {
        buffer.get_i32_le()
    }

    fn to_value(self) -> DataValue {
        DataValue::Int32(self)
    }

    fn downcast(array: &ArrayImpl) -> Option<&PrimitiveArray<Self>> {
        match array {
            ArrayImpl::Int32(a) => Some(a),
            _ => None,
        }
    }
}

impl PrimitiveFixedWidthEncode for i64 {
    const WIDTH: usize = std::mem::size_of::<i64>();
    const DEFAULT_VALUE: &'static i64 = &0;

    fn encode(&self, buffer: &mut impl BufMut) {
        buffer.put_i64_le(*self);
    }

    fn decode(buffer: &mut impl Buf) -> Self {
        buffer.get_i64_le()
    }

    fn to_value(self) -> DataValue {
        DataValue::Int64(self)
    }

    fn downcast(array: &ArrayImpl) -> Option<&PrimitiveArray<Self>> {
        match array {
            ArrayImpl::Int64(a) => Some(a),
            _ => None,
        }
    }
}

impl PrimitiveFixedWidthEncode for f64 {
    const WIDTH: usize = std::mem::size_of::<f64>();
    const DEFAULT_VALUE: &'static f64 = &0.0;

    fn encode(&self, buffer: &mut impl BufMut) {
        buffer.put_f64_le(*self);
    }

    fn decode(buffer: &mut impl Buf) -> Self {
        buffer.get_f64_le()
    }

    fn to_value(self) -> DataValue {
        DataValue::Float64(OrderedFloat(self))
    }

    fn downcast(array: &ArrayImpl) -> Option<&PrimitiveArray<Self>> {
        match array {
            ArrayImpl::Float64(a) => Some(a),
            _ => None,
        }
    }
}
