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
//! Side storage for heavy payload columns.
//!
//! Responsibilities:
//! - Splits a block into a key block (keys plus an appended indirection
//!   index column) and a stored payload block, so the hot join path
//!   carries only keys and a compact `u64` reference.
//! - Restores payload columns at emission time by scatter-reading the
//!   stored blocks through the index column.
//!
//! The indirection index packs `(block_id << 32) | row_id`; indices
//! issued by `split_block` stay valid until `clear`. Storage for the
//! build side is constructed non-clearable because build data is stable
//! for the operator's life.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt64Array};
use arrow::datatypes::DataType;
use hashbrown::HashSet;

use crate::exec::block::Block;
use crate::exec::packed_tuple::column::{ColumnBuilder, ColumnReader};

pub(crate) struct ExternalPayloadStorage {
    payload_types: Vec<DataType>,
    /// Original positions of key columns, ascending.
    key_positions: Vec<usize>,
    /// Original positions of payload columns, ascending.
    payload_positions: Vec<usize>,
    storage: Vec<Block>,
    non_clearable: bool,
}

impl ExternalPayloadStorage {
    pub(crate) fn new(
        item_types: &[DataType],
        key_columns: &HashSet<u32>,
        non_clearable: bool,
    ) -> Result<Self, String> {
        let mut payload_types = Vec::new();
        let mut key_positions = Vec::new();
        let mut payload_positions = Vec::new();
        for (idx, data_type) in item_types.iter().enumerate() {
            if key_columns.contains(&(idx as u32)) {
                key_positions.push(idx);
            } else {
                payload_positions.push(idx);
                payload_types.push(data_type.clone());
            }
        }
        if payload_types.is_empty() {
            return Err("external payload storage requires payload columns".to_string());
        }
        Ok(Self {
            payload_types,
            key_positions,
            payload_positions,
            storage: Vec::new(),
            non_clearable,
        })
    }

    pub(crate) fn size(&self) -> u32 {
        self.storage.len() as u32
    }

    /// Split `block` into its key part and its payload part; the payload
    /// part is stored, the key part comes back with the indirection
    /// index column appended as its last column.
    pub(crate) fn split_block(&mut self, block: &Block) -> Result<Block, String> {
        let expected = self.key_positions.len() + self.payload_positions.len();
        if block.columns.len() != expected {
            return Err(format!(
                "split block column count mismatch: got {}, expected {expected}",
                block.columns.len()
            ));
        }

        let mut key_columns: Vec<ArrayRef> = Vec::with_capacity(self.key_positions.len() + 1);
        for &pos in &self.key_positions {
            key_columns.push(Arc::clone(&block.columns[pos]));
        }
        let mut payload_columns: Vec<ArrayRef> = Vec::with_capacity(self.payload_positions.len());
        for &pos in &self.payload_positions {
            payload_columns.push(Arc::clone(&block.columns[pos]));
        }

        let block_id = self.storage.len() as u64;
        if block_id > u32::MAX as u64 {
            return Err("payload storage block id overflow".to_string());
        }
        let indexes: UInt64Array = (0..block.num_rows as u64)
            .map(|row| Some((block_id << 32) | row))
            .collect();
        key_columns.push(Arc::new(indexes));

        self.storage
            .push(Block::new(payload_columns, block.num_rows));
        Ok(Block::new(key_columns, block.num_rows))
    }

    /// Rebuild payload columns for `length` emitted rows by resolving
    /// each index back to its stored block and row.
    pub(crate) fn restore_payload(
        &self,
        indexes: &ArrayRef,
        length: usize,
    ) -> Result<Vec<ArrayRef>, String> {
        let indexes = indexes
            .as_any()
            .downcast_ref::<UInt64Array>()
            .ok_or_else(|| "indirection index column must be UInt64".to_string())?;
        if indexes.len() < length {
            return Err(format!(
                "indirection index column too short: {} < {length}",
                indexes.len()
            ));
        }

        let mut readers: Vec<Vec<ColumnReader>> = Vec::with_capacity(self.storage.len());
        for block in &self.storage {
            let mut block_readers = Vec::with_capacity(self.payload_types.len());
            for (col, data_type) in self.payload_types.iter().enumerate() {
                block_readers.push(ColumnReader::try_new(&block.columns[col], data_type)?);
            }
            readers.push(block_readers);
        }

        let mut result = Vec::with_capacity(self.payload_types.len());
        for (col, data_type) in self.payload_types.iter().enumerate() {
            let mut builder = ColumnBuilder::try_new(data_type, length)?;
            for j in 0..length {
                let raw = indexes.value(j);
                let block_id = (raw >> 32) as usize;
                let row_id = (raw & 0xFFFF_FFFF) as usize;
                let block_readers = readers.get(block_id).ok_or_else(|| {
                    format!("indirection block id {block_id} out of range")
                })?;
                block_readers[col].append_to(row_id, &mut builder)?;
            }
            result.push(builder.finish());
        }
        Ok(result)
    }

    /// Scatter restored key and payload columns back into the original
    /// column order of the side.
    pub(crate) fn merge_restored(
        &self,
        key_columns: Vec<ArrayRef>,
        payload_columns: Vec<ArrayRef>,
    ) -> Result<Vec<ArrayRef>, String> {
        if key_columns.len() != self.key_positions.len()
            || payload_columns.len() != self.payload_positions.len()
        {
            return Err("restored column count mismatch".to_string());
        }
        let total = key_columns.len() + payload_columns.len();
        let mut ordered: Vec<Option<ArrayRef>> = vec![None; total];
        for (&pos, column) in self.key_positions.iter().zip(key_columns) {
            ordered[pos] = Some(column);
        }
        for (&pos, column) in self.payload_positions.iter().zip(payload_columns) {
            ordered[pos] = Some(column);
        }
        ordered
            .into_iter()
            .map(|c| c.ok_or_else(|| "column missing after payload merge".to_string()))
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        if self.non_clearable {
            return;
        }
        self.storage.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};

    fn key_set(keys: &[u32]) -> HashSet<u32> {
        keys.iter().copied().collect()
    }

    #[test]
    fn split_and_restore_round_trip() {
        let block = Block::new(
            vec![
                Arc::new(StringArray::from(vec![Some("p0"), None, Some("p2")])) as ArrayRef,
                Arc::new(Int32Array::from(vec![1, 2, 3])) as ArrayRef,
            ],
            3,
        );
        let mut storage =
            ExternalPayloadStorage::new(&[DataType::Utf8, DataType::Int32], &key_set(&[1]), false)
                .expect("storage");
        let key_block = storage.split_block(&block).expect("split");
        assert_eq!(key_block.columns.len(), 2);

        // Read back rows 2, 1, 0 through the index column.
        let indexes: ArrayRef = Arc::new(UInt64Array::from(vec![2u64, 1, 0]));
        let restored = storage.restore_payload(&indexes, 3).expect("restore");
        assert_eq!(restored.len(), 1);
        let strings = restored[0]
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8 column");
        assert_eq!(strings.value(0), "p2");
        assert!(strings.is_null(1));
        assert_eq!(strings.value(2), "p0");
    }

    #[test]
    fn indices_encode_block_and_row() {
        let mut storage =
            ExternalPayloadStorage::new(&[DataType::Int32, DataType::Int32], &key_set(&[0]), true)
                .expect("storage");
        let block = Block::new(
            vec![
                Arc::new(Int32Array::from(vec![1, 2])) as ArrayRef,
                Arc::new(Int32Array::from(vec![10, 20])) as ArrayRef,
            ],
            2,
        );
        let first = storage.split_block(&block).expect("split");
        let second = storage.split_block(&block).expect("split");
        let read_indexes = |b: &Block| {
            b.columns
                .last()
                .expect("index column")
                .as_any()
                .downcast_ref::<UInt64Array>()
                .expect("uint64")
                .values()
                .to_vec()
        };
        assert_eq!(read_indexes(&first), vec![0, 1]);
        assert_eq!(read_indexes(&second), vec![1 << 32, (1 << 32) | 1]);

        // Non-clearable storage survives clear().
        storage.clear();
        assert_eq!(storage.size(), 2);
    }
}
