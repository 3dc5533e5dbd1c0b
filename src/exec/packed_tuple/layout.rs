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
//! Byte layout of packed tuples.
//!
//! Responsibilities:
//! - Derives per-column slot placement, null bitmap width, and the key /
//!   payload byte split from column item types and key positions.
//! - Provides key hashing and cross-layout key equality over packed
//!   tuple bytes; variable-length slots resolve through the owning
//!   overflow buffer.
//!
//! Key exported interfaces:
//! - Types: `TupleLayout`, `TupleColumn`, `ColumnRole`, `ColumnSizeType`.

use arrow::datatypes::DataType;

use crate::exec::block::fixed_item_width;
use crate::exec::packed_tuple::hash::{combine_hash, hash_item_bytes};

/// Inline header width of a variable-sized slot: `u32` length followed
/// by `u32` offset into the overflow buffer.
pub const VARIABLE_SLOT_SIZE: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnRole {
    Key,
    Payload,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnSizeType {
    Fixed,
    Variable,
}

/// Placement of one column inside the packed tuple.
#[derive(Clone, Debug)]
pub struct TupleColumn {
    /// Index of the column in the original (pre-reorder) block.
    pub orig_index: usize,
    pub data_type: DataType,
    pub role: ColumnRole,
    pub size_type: ColumnSizeType,
    /// Byte offset of the slot within a packed tuple.
    pub offset: usize,
    /// Slot width in bytes; the inline header width for variable slots.
    pub size: usize,
}

/// Packed tuple layout: keys first (in key-list order), then payload
/// columns in ascending original index, preceded by a null bitmap.
#[derive(Clone, Debug)]
pub struct TupleLayout {
    pub columns: Vec<TupleColumn>,
    pub key_count: usize,
    pub null_bytes: usize,
    /// Null bitmap plus key slots.
    pub key_size: usize,
    pub payload_size: usize,
    pub total_row_size: usize,
}

impl TupleLayout {
    /// Derive a layout. `key_columns` lists key positions in pairing
    /// order; the order is significant because the i-th key of one join
    /// side is compared against the i-th key of the other.
    pub fn describe(item_types: &[DataType], key_columns: &[u32]) -> Result<Self, String> {
        if item_types.is_empty() {
            return Err("tuple layout requires at least one column".to_string());
        }
        let mut is_key = vec![false; item_types.len()];
        for &key in key_columns {
            let idx = key as usize;
            if idx >= item_types.len() {
                return Err(format!(
                    "key column {key} out of range (columns={})",
                    item_types.len()
                ));
            }
            if is_key[idx] {
                return Err(format!("key column {key} listed twice"));
            }
            is_key[idx] = true;
        }

        let null_bytes = item_types.len().div_ceil(8);
        let mut columns = Vec::with_capacity(item_types.len());
        let mut offset = null_bytes;
        let mut key_slot_bytes = 0usize;
        let mut payload_size = 0usize;

        let key_order = key_columns.iter().map(|&k| k as usize);
        let payload_order = (0..item_types.len()).filter(|idx| !is_key[*idx]);
        for orig_index in key_order.chain(payload_order) {
            let data_type = item_types[orig_index].clone();
            let (size_type, size) = match fixed_item_width(&data_type) {
                Some(width) => (ColumnSizeType::Fixed, width),
                None => match data_type {
                    DataType::Utf8 | DataType::Binary => {
                        (ColumnSizeType::Variable, VARIABLE_SLOT_SIZE)
                    }
                    other => {
                        return Err(format!("unsupported packed tuple item type: {other}"));
                    }
                },
            };
            let role = if is_key[orig_index] {
                key_slot_bytes += size;
                ColumnRole::Key
            } else {
                payload_size += size;
                ColumnRole::Payload
            };
            columns.push(TupleColumn {
                orig_index,
                data_type,
                role,
                size_type,
                offset,
                size,
            });
            offset += size;
        }

        Ok(Self {
            columns,
            key_count: key_columns.len(),
            null_bytes,
            key_size: null_bytes + key_slot_bytes,
            payload_size,
            total_row_size: offset,
        })
    }

    pub fn is_null(&self, tuple: &[u8], layout_index: usize) -> bool {
        tuple[layout_index / 8] & (1 << (layout_index % 8)) != 0
    }

    pub(crate) fn set_null(tuple: &mut [u8], layout_index: usize) {
        tuple[layout_index / 8] |= 1 << (layout_index % 8);
    }

    /// True when any key component of the packed tuple is null. Rows
    /// with null key components never match and are skipped by the
    /// table on both the build and probe paths.
    pub fn key_has_null(&self, tuple: &[u8]) -> bool {
        (0..self.key_count).any(|idx| self.is_null(tuple, idx))
    }

    /// Composite key hash over the packed tuple; the zero sentinel when
    /// any key component is null. Agrees with the hash computed from
    /// columnar form during bucket packing.
    pub fn key_hash(&self, tuple: &[u8], overflow: &[u8]) -> u64 {
        let mut hash = 0u64;
        for (idx, column) in self.columns[..self.key_count].iter().enumerate() {
            if self.is_null(tuple, idx) {
                return 0;
            }
            let item = match column.size_type {
                ColumnSizeType::Fixed => {
                    hash_item_bytes(&tuple[column.offset..column.offset + column.size])
                }
                ColumnSizeType::Variable => match variable_slice(tuple, column, overflow) {
                    Some(bytes) => hash_item_bytes(bytes),
                    None => return 0,
                },
            };
            if item == 0 {
                return 0;
            }
            hash = combine_hash(hash, item);
        }
        hash
    }

    /// Compare the key of `tuple` against the key of `other_tuple` laid
    /// out by `other`. Key slots are paired positionally; nulls never
    /// compare equal.
    pub fn keys_equal(
        &self,
        tuple: &[u8],
        overflow: &[u8],
        other: &TupleLayout,
        other_tuple: &[u8],
        other_overflow: &[u8],
    ) -> bool {
        if self.key_count != other.key_count {
            return false;
        }
        for idx in 0..self.key_count {
            if self.is_null(tuple, idx) || other.is_null(other_tuple, idx) {
                return false;
            }
            let lhs = &self.columns[idx];
            let rhs = &other.columns[idx];
            if lhs.size_type != rhs.size_type || lhs.size != rhs.size {
                return false;
            }
            match lhs.size_type {
                ColumnSizeType::Fixed => {
                    if tuple[lhs.offset..lhs.offset + lhs.size]
                        != other_tuple[rhs.offset..rhs.offset + rhs.size]
                    {
                        return false;
                    }
                }
                ColumnSizeType::Variable => {
                    let (Some(a), Some(b)) = (
                        variable_slice(tuple, lhs, overflow),
                        variable_slice(other_tuple, rhs, other_overflow),
                    ) else {
                        return false;
                    };
                    if a != b {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// Resolve a variable slot header into its overflow slice.
pub(crate) fn variable_slice<'a>(
    tuple: &[u8],
    column: &TupleColumn,
    overflow: &'a [u8],
) -> Option<&'a [u8]> {
    let header = &tuple[column.offset..column.offset + VARIABLE_SLOT_SIZE];
    let len = u32::from_le_bytes(header[0..4].try_into().ok()?) as usize;
    let offset = u32::from_le_bytes(header[4..8].try_into().ok()?) as usize;
    overflow.get(offset..offset + len)
}

pub(crate) fn write_variable_header(slot: &mut [u8], len: u32, offset: u32) {
    slot[0..4].copy_from_slice(&len.to_le_bytes());
    slot[4..8].copy_from_slice(&offset.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_orders_keys_first() {
        let layout = TupleLayout::describe(
            &[DataType::Utf8, DataType::Int32, DataType::Int64],
            &[1],
        )
        .expect("layout");
        assert_eq!(layout.null_bytes, 1);
        assert_eq!(layout.key_count, 1);
        assert_eq!(layout.columns[0].orig_index, 1);
        assert_eq!(layout.columns[1].orig_index, 0);
        assert_eq!(layout.columns[2].orig_index, 2);
        // 1 null byte + 4 (key) + 8 (utf8 header) + 8 (i64)
        assert_eq!(layout.total_row_size, 21);
        assert_eq!(layout.key_size, 5);
        assert_eq!(layout.payload_size, 16);
    }

    #[test]
    fn describe_rejects_bad_keys() {
        assert!(TupleLayout::describe(&[DataType::Int32], &[1]).is_err());
        assert!(TupleLayout::describe(&[DataType::Int32, DataType::Int32], &[0, 0]).is_err());
        assert!(
            TupleLayout::describe(&[DataType::Duration(arrow::datatypes::TimeUnit::Second)], &[0])
                .is_err()
        );
    }

    #[test]
    fn key_order_follows_the_key_list() {
        let layout = TupleLayout::describe(
            &[DataType::Int32, DataType::Int64, DataType::Int16],
            &[2, 0],
        )
        .expect("layout");
        assert_eq!(layout.columns[0].orig_index, 2);
        assert_eq!(layout.columns[1].orig_index, 0);
        assert_eq!(layout.columns[2].orig_index, 1);
    }
}
