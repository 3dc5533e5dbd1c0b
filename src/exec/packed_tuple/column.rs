// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Typed readers and builders bridging arrow arrays and packed slots.
//!
//! Readers encode one item into its packed little-endian form (or hand
//! out variable-length bytes); builders run the inverse direction when
//! unpacking and when scatter-reading externally stored payloads.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BinaryBuilder, BooleanArray, BooleanBuilder, Date32Array,
    Date32Builder, Float32Array, Float32Builder, Float64Array, Float64Builder, Int8Array,
    Int8Builder, Int16Array, Int16Builder, Int32Array, Int32Builder, Int64Array, Int64Builder,
    StringArray, StringBuilder, UInt8Array, UInt8Builder, UInt16Array, UInt16Builder, UInt32Array,
    UInt32Builder, UInt64Array, UInt64Builder,
};
use arrow::datatypes::DataType;

use crate::exec::packed_tuple::hash::hash_item_bytes;

macro_rules! downcast_column {
    ($array:expr, $arrow_ty:ty) => {
        $array
            .as_any()
            .downcast_ref::<$arrow_ty>()
            .cloned()
            .ok_or_else(|| {
                format!(
                    "column type mismatch: expected {}, got {}",
                    stringify!($arrow_ty),
                    $array.data_type()
                )
            })
    };
}

/// Read-side view over one column of a block.
pub(crate) enum ColumnReader {
    Boolean(BooleanArray),
    Int8(Int8Array),
    Int16(Int16Array),
    Int32(Int32Array),
    Int64(Int64Array),
    UInt8(UInt8Array),
    UInt16(UInt16Array),
    UInt32(UInt32Array),
    UInt64(UInt64Array),
    Float32(Float32Array),
    Float64(Float64Array),
    Date32(Date32Array),
    Utf8(StringArray),
    Binary(BinaryArray),
}

impl ColumnReader {
    pub(crate) fn try_new(array: &ArrayRef, data_type: &DataType) -> Result<Self, String> {
        if array.data_type() != data_type {
            return Err(format!(
                "column reader type mismatch: expected {data_type}, got {}",
                array.data_type()
            ));
        }
        Ok(match data_type {
            DataType::Boolean => Self::Boolean(downcast_column!(array, BooleanArray)?),
            DataType::Int8 => Self::Int8(downcast_column!(array, Int8Array)?),
            DataType::Int16 => Self::Int16(downcast_column!(array, Int16Array)?),
            DataType::Int32 => Self::Int32(downcast_column!(array, Int32Array)?),
            DataType::Int64 => Self::Int64(downcast_column!(array, Int64Array)?),
            DataType::UInt8 => Self::UInt8(downcast_column!(array, UInt8Array)?),
            DataType::UInt16 => Self::UInt16(downcast_column!(array, UInt16Array)?),
            DataType::UInt32 => Self::UInt32(downcast_column!(array, UInt32Array)?),
            DataType::UInt64 => Self::UInt64(downcast_column!(array, UInt64Array)?),
            DataType::Float32 => Self::Float32(downcast_column!(array, Float32Array)?),
            DataType::Float64 => Self::Float64(downcast_column!(array, Float64Array)?),
            DataType::Date32 => Self::Date32(downcast_column!(array, Date32Array)?),
            DataType::Utf8 => Self::Utf8(downcast_column!(array, StringArray)?),
            DataType::Binary => Self::Binary(downcast_column!(array, BinaryArray)?),
            other => return Err(format!("unsupported column item type: {other}")),
        })
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Boolean(a) => a.len(),
            Self::Int8(a) => a.len(),
            Self::Int16(a) => a.len(),
            Self::Int32(a) => a.len(),
            Self::Int64(a) => a.len(),
            Self::UInt8(a) => a.len(),
            Self::UInt16(a) => a.len(),
            Self::UInt32(a) => a.len(),
            Self::UInt64(a) => a.len(),
            Self::Float32(a) => a.len(),
            Self::Float64(a) => a.len(),
            Self::Date32(a) => a.len(),
            Self::Utf8(a) => a.len(),
            Self::Binary(a) => a.len(),
        }
    }

    pub(crate) fn is_null(&self, row: usize) -> bool {
        match self {
            Self::Boolean(a) => a.is_null(row),
            Self::Int8(a) => a.is_null(row),
            Self::Int16(a) => a.is_null(row),
            Self::Int32(a) => a.is_null(row),
            Self::Int64(a) => a.is_null(row),
            Self::UInt8(a) => a.is_null(row),
            Self::UInt16(a) => a.is_null(row),
            Self::UInt32(a) => a.is_null(row),
            Self::UInt64(a) => a.is_null(row),
            Self::Float32(a) => a.is_null(row),
            Self::Float64(a) => a.is_null(row),
            Self::Date32(a) => a.is_null(row),
            Self::Utf8(a) => a.is_null(row),
            Self::Binary(a) => a.is_null(row),
        }
    }

    /// Write the item's packed little-endian form into `dst`, which has
    /// exactly the slot width of the column.
    pub(crate) fn write_fixed(&self, row: usize, dst: &mut [u8]) -> Result<(), String> {
        match self {
            Self::Boolean(a) => dst.copy_from_slice(&[a.value(row) as u8]),
            Self::Int8(a) => dst.copy_from_slice(&a.value(row).to_le_bytes()),
            Self::Int16(a) => dst.copy_from_slice(&a.value(row).to_le_bytes()),
            Self::Int32(a) => dst.copy_from_slice(&a.value(row).to_le_bytes()),
            Self::Int64(a) => dst.copy_from_slice(&a.value(row).to_le_bytes()),
            Self::UInt8(a) => dst.copy_from_slice(&a.value(row).to_le_bytes()),
            Self::UInt16(a) => dst.copy_from_slice(&a.value(row).to_le_bytes()),
            Self::UInt32(a) => dst.copy_from_slice(&a.value(row).to_le_bytes()),
            Self::UInt64(a) => dst.copy_from_slice(&a.value(row).to_le_bytes()),
            Self::Float32(a) => dst.copy_from_slice(&a.value(row).to_le_bytes()),
            Self::Float64(a) => dst.copy_from_slice(&a.value(row).to_le_bytes()),
            Self::Date32(a) => dst.copy_from_slice(&a.value(row).to_le_bytes()),
            Self::Utf8(_) | Self::Binary(_) => {
                return Err("variable column written through fixed path".to_string());
            }
        }
        Ok(())
    }

    pub(crate) fn variable_bytes(&self, row: usize) -> Result<&[u8], String> {
        match self {
            Self::Utf8(a) => Ok(a.value(row).as_bytes()),
            Self::Binary(a) => Ok(a.value(row)),
            _ => Err("fixed column read through variable path".to_string()),
        }
    }

    /// Hash of the item's packed form; 0 for null.
    pub(crate) fn item_hash(&self, row: usize) -> Result<u64, String> {
        if self.is_null(row) {
            return Ok(0);
        }
        match self {
            Self::Utf8(_) | Self::Binary(_) => Ok(hash_item_bytes(self.variable_bytes(row)?)),
            _ => {
                let mut buf = [0u8; 8];
                let width = self.fixed_width()?;
                self.write_fixed(row, &mut buf[..width])?;
                Ok(hash_item_bytes(&buf[..width]))
            }
        }
    }

    fn fixed_width(&self) -> Result<usize, String> {
        match self {
            Self::Boolean(_) | Self::Int8(_) | Self::UInt8(_) => Ok(1),
            Self::Int16(_) | Self::UInt16(_) => Ok(2),
            Self::Int32(_) | Self::UInt32(_) | Self::Float32(_) | Self::Date32(_) => Ok(4),
            Self::Int64(_) | Self::UInt64(_) | Self::Float64(_) => Ok(8),
            Self::Utf8(_) | Self::Binary(_) => {
                Err("variable column has no fixed width".to_string())
            }
        }
    }

    /// Append the item at `row` to a builder of the same type.
    pub(crate) fn append_to(&self, row: usize, builder: &mut ColumnBuilder) -> Result<(), String> {
        if self.is_null(row) {
            builder.append_null();
            return Ok(());
        }
        match (self, builder) {
            (Self::Boolean(a), ColumnBuilder::Boolean(b)) => b.append_value(a.value(row)),
            (Self::Int8(a), ColumnBuilder::Int8(b)) => b.append_value(a.value(row)),
            (Self::Int16(a), ColumnBuilder::Int16(b)) => b.append_value(a.value(row)),
            (Self::Int32(a), ColumnBuilder::Int32(b)) => b.append_value(a.value(row)),
            (Self::Int64(a), ColumnBuilder::Int64(b)) => b.append_value(a.value(row)),
            (Self::UInt8(a), ColumnBuilder::UInt8(b)) => b.append_value(a.value(row)),
            (Self::UInt16(a), ColumnBuilder::UInt16(b)) => b.append_value(a.value(row)),
            (Self::UInt32(a), ColumnBuilder::UInt32(b)) => b.append_value(a.value(row)),
            (Self::UInt64(a), ColumnBuilder::UInt64(b)) => b.append_value(a.value(row)),
            (Self::Float32(a), ColumnBuilder::Float32(b)) => b.append_value(a.value(row)),
            (Self::Float64(a), ColumnBuilder::Float64(b)) => b.append_value(a.value(row)),
            (Self::Date32(a), ColumnBuilder::Date32(b)) => b.append_value(a.value(row)),
            (Self::Utf8(a), ColumnBuilder::Utf8(b)) => b.append_value(a.value(row)),
            (Self::Binary(a), ColumnBuilder::Binary(b)) => b.append_value(a.value(row)),
            _ => return Err("column builder type mismatch during append".to_string()),
        }
        Ok(())
    }
}

/// Build-side counterpart of `ColumnReader`.
pub(crate) enum ColumnBuilder {
    Boolean(BooleanBuilder),
    Int8(Int8Builder),
    Int16(Int16Builder),
    Int32(Int32Builder),
    Int64(Int64Builder),
    UInt8(UInt8Builder),
    UInt16(UInt16Builder),
    UInt32(UInt32Builder),
    UInt64(UInt64Builder),
    Float32(Float32Builder),
    Float64(Float64Builder),
    Date32(Date32Builder),
    Utf8(StringBuilder),
    Binary(BinaryBuilder),
}

macro_rules! decode_fixed {
    ($builder:expr, $bytes:expr, $prim:ty) => {{
        let bytes: [u8; std::mem::size_of::<$prim>()] = $bytes
            .try_into()
            .map_err(|_| "packed slot width mismatch".to_string())?;
        $builder.append_value(<$prim>::from_le_bytes(bytes));
    }};
}

impl ColumnBuilder {
    pub(crate) fn try_new(data_type: &DataType, capacity: usize) -> Result<Self, String> {
        Ok(match data_type {
            DataType::Boolean => Self::Boolean(BooleanBuilder::with_capacity(capacity)),
            DataType::Int8 => Self::Int8(Int8Builder::with_capacity(capacity)),
            DataType::Int16 => Self::Int16(Int16Builder::with_capacity(capacity)),
            DataType::Int32 => Self::Int32(Int32Builder::with_capacity(capacity)),
            DataType::Int64 => Self::Int64(Int64Builder::with_capacity(capacity)),
            DataType::UInt8 => Self::UInt8(UInt8Builder::with_capacity(capacity)),
            DataType::UInt16 => Self::UInt16(UInt16Builder::with_capacity(capacity)),
            DataType::UInt32 => Self::UInt32(UInt32Builder::with_capacity(capacity)),
            DataType::UInt64 => Self::UInt64(UInt64Builder::with_capacity(capacity)),
            DataType::Float32 => Self::Float32(Float32Builder::with_capacity(capacity)),
            DataType::Float64 => Self::Float64(Float64Builder::with_capacity(capacity)),
            DataType::Date32 => Self::Date32(Date32Builder::with_capacity(capacity)),
            DataType::Utf8 => Self::Utf8(StringBuilder::with_capacity(capacity, capacity * 8)),
            DataType::Binary => Self::Binary(BinaryBuilder::with_capacity(capacity, capacity * 8)),
            other => return Err(format!("unsupported column item type: {other}")),
        })
    }

    pub(crate) fn append_null(&mut self) {
        match self {
            Self::Boolean(b) => b.append_null(),
            Self::Int8(b) => b.append_null(),
            Self::Int16(b) => b.append_null(),
            Self::Int32(b) => b.append_null(),
            Self::Int64(b) => b.append_null(),
            Self::UInt8(b) => b.append_null(),
            Self::UInt16(b) => b.append_null(),
            Self::UInt32(b) => b.append_null(),
            Self::UInt64(b) => b.append_null(),
            Self::Float32(b) => b.append_null(),
            Self::Float64(b) => b.append_null(),
            Self::Date32(b) => b.append_null(),
            Self::Utf8(b) => b.append_null(),
            Self::Binary(b) => b.append_null(),
        }
    }

    /// Decode a fixed slot back into its native value.
    pub(crate) fn append_fixed_bytes(&mut self, bytes: &[u8]) -> Result<(), String> {
        match self {
            Self::Boolean(b) => {
                if bytes.len() != 1 {
                    return Err("packed slot width mismatch".to_string());
                }
                b.append_value(bytes[0] != 0);
            }
            Self::Int8(b) => decode_fixed!(b, bytes, i8),
            Self::Int16(b) => decode_fixed!(b, bytes, i16),
            Self::Int32(b) => decode_fixed!(b, bytes, i32),
            Self::Int64(b) => decode_fixed!(b, bytes, i64),
            Self::UInt8(b) => decode_fixed!(b, bytes, u8),
            Self::UInt16(b) => decode_fixed!(b, bytes, u16),
            Self::UInt32(b) => decode_fixed!(b, bytes, u32),
            Self::UInt64(b) => decode_fixed!(b, bytes, u64),
            Self::Float32(b) => decode_fixed!(b, bytes, f32),
            Self::Float64(b) => decode_fixed!(b, bytes, f64),
            Self::Date32(b) => decode_fixed!(b, bytes, i32),
            Self::Utf8(_) | Self::Binary(_) => {
                return Err("variable column decoded through fixed path".to_string());
            }
        }
        Ok(())
    }

    pub(crate) fn append_variable_bytes(&mut self, bytes: &[u8]) -> Result<(), String> {
        match self {
            Self::Utf8(b) => {
                let value = std::str::from_utf8(bytes)
                    .map_err(|e| format!("packed utf8 tail is not valid utf8: {e}"))?;
                b.append_value(value);
            }
            Self::Binary(b) => b.append_value(bytes),
            _ => return Err("fixed column decoded through variable path".to_string()),
        }
        Ok(())
    }

    pub(crate) fn finish(&mut self) -> ArrayRef {
        match self {
            Self::Boolean(b) => Arc::new(b.finish()),
            Self::Int8(b) => Arc::new(b.finish()),
            Self::Int16(b) => Arc::new(b.finish()),
            Self::Int32(b) => Arc::new(b.finish()),
            Self::Int64(b) => Arc::new(b.finish()),
            Self::UInt8(b) => Arc::new(b.finish()),
            Self::UInt16(b) => Arc::new(b.finish()),
            Self::UInt32(b) => Arc::new(b.finish()),
            Self::UInt64(b) => Arc::new(b.finish()),
            Self::Float32(b) => Arc::new(b.finish()),
            Self::Float64(b) => Arc::new(b.finish()),
            Self::Date32(b) => Arc::new(b.finish()),
            Self::Utf8(b) => Arc::new(b.finish()),
            Self::Binary(b) => Arc::new(b.finish()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_and_builder_round_trip_int32() {
        let array: ArrayRef = Arc::new(Int32Array::from(vec![Some(7), None, Some(-1)]));
        let reader = ColumnReader::try_new(&array, &DataType::Int32).expect("reader");
        let mut builder = ColumnBuilder::try_new(&DataType::Int32, 3).expect("builder");
        for row in 0..reader.len() {
            reader.append_to(row, &mut builder).expect("append");
        }
        let restored = builder.finish();
        assert_eq!(restored.as_ref(), array.as_ref());
    }

    #[test]
    fn item_hash_is_zero_only_for_null() {
        let array: ArrayRef = Arc::new(Int64Array::from(vec![Some(0), None]));
        let reader = ColumnReader::try_new(&array, &DataType::Int64).expect("reader");
        assert_ne!(reader.item_hash(0).expect("hash"), 0);
        assert_eq!(reader.item_hash(1).expect("hash"), 0);
    }

    #[test]
    fn reader_rejects_type_mismatch() {
        let array: ArrayRef = Arc::new(Int32Array::from(vec![1]));
        assert!(ColumnReader::try_new(&array, &DataType::Int64).is_err());
    }
}
