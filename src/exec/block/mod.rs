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
//! Columnar block type and the cooperative wide-stream contract.
//!
//! Responsibilities:
//! - Defines `Block` (arrow arrays of common length) and its wide wire
//!   form, where the last wide element is a `u64` scalar block length.
//! - Defines `BlockStream`, the pull contract with `Yield` suspension.

use arrow::array::ArrayRef;
use arrow::datatypes::DataType;

/// Byte budget one block is expected to occupy when fully decoded.
/// Mirrors the sizing used by the surrounding engine when it cuts
/// streams into blocks.
pub const BLOCK_SIZE_BUDGET: usize = 1 << 20;

/// Width estimate used for variable-sized items when sizing blocks.
const VARIABLE_ITEM_WIDTH_ESTIMATE: usize = 32;

/// A block of columnar data: arrow arrays of one common length.
#[derive(Clone, Debug)]
pub struct Block {
    pub columns: Vec<ArrayRef>,
    pub num_rows: usize,
}

/// One element of the wide wire form of a block.
#[derive(Clone, Debug)]
pub enum WideDatum {
    Array(ArrayRef),
    Scalar(u64),
}

impl Block {
    pub fn new(columns: Vec<ArrayRef>, num_rows: usize) -> Self {
        Self { columns, num_rows }
    }

    /// Build a block from its wide form, stripping the trailing block
    /// length scalar.
    pub fn try_from_wide(mut items: Vec<WideDatum>) -> Result<Self, String> {
        let Some(last) = items.pop() else {
            return Err("wide block requires at least the length scalar".to_string());
        };
        let WideDatum::Scalar(num_rows) = last else {
            return Err("last wide element must be the block length scalar".to_string());
        };
        let mut columns = Vec::with_capacity(items.len());
        for (idx, item) in items.into_iter().enumerate() {
            match item {
                WideDatum::Array(array) => columns.push(array),
                WideDatum::Scalar(_) => {
                    return Err(format!(
                        "unexpected scalar at wide position {idx}; only the last element carries the length"
                    ));
                }
            }
        }
        Ok(Self {
            columns,
            num_rows: num_rows as usize,
        })
    }

    /// The wide wire form: one datum per column, then the length scalar.
    pub fn to_wide(&self) -> Vec<WideDatum> {
        let mut items: Vec<WideDatum> = self
            .columns
            .iter()
            .cloned()
            .map(WideDatum::Array)
            .collect();
        items.push(WideDatum::Scalar(self.num_rows as u64));
        items
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }
}

/// Status of one cooperative fetch step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchStatus {
    /// Data was produced.
    Ok,
    /// No data right now; the caller should resume later.
    Yield,
    /// The stream ended, or the step has nothing further to report.
    Finish,
}

/// Result of pulling one block from a wide stream.
#[derive(Debug)]
pub enum BlockFetch {
    Block(Block),
    Yield,
    Finished,
}

/// Pull contract for wide block streams. Implementations surrender
/// control with `Yield` instead of blocking on input.
pub trait BlockStream {
    fn fetch(&mut self) -> Result<BlockFetch, String>;
}

/// Upper bound on rows per emitted block for the given column types.
pub fn max_block_length(item_types: &[DataType]) -> usize {
    let mut max_width = 1usize;
    for data_type in item_types {
        let width = match fixed_item_width(data_type) {
            Some(width) => width,
            None => VARIABLE_ITEM_WIDTH_ESTIMATE,
        };
        max_width = max_width.max(width);
    }
    (BLOCK_SIZE_BUDGET / max_width).max(1)
}

/// Decoded width in bytes of a fixed-size item, or `None` when the type
/// is variable-sized.
pub fn fixed_item_width(data_type: &DataType) -> Option<usize> {
    match data_type {
        DataType::Boolean | DataType::Int8 | DataType::UInt8 => Some(1),
        DataType::Int16 | DataType::UInt16 => Some(2),
        DataType::Int32 | DataType::UInt32 | DataType::Float32 | DataType::Date32 => Some(4),
        DataType::Int64 | DataType::UInt64 | DataType::Float64 => Some(8),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use std::sync::Arc;

    #[test]
    fn wide_round_trip_strips_length_scalar() {
        let block = Block::new(vec![Arc::new(Int32Array::from(vec![1, 2, 3])) as ArrayRef], 3);
        let wide = block.to_wide();
        assert_eq!(wide.len(), 2);
        let back = Block::try_from_wide(wide).expect("round trip");
        assert_eq!(back.num_rows, 3);
        assert_eq!(back.columns.len(), 1);
    }

    #[test]
    fn wide_form_requires_trailing_scalar() {
        let items = vec![WideDatum::Array(
            Arc::new(Int32Array::from(vec![1])) as ArrayRef
        )];
        assert!(Block::try_from_wide(items).is_err());
    }

    #[test]
    fn block_length_scales_with_widest_column() {
        let narrow = max_block_length(&[DataType::Int8]);
        let wide = max_block_length(&[DataType::Int8, DataType::Int64]);
        assert_eq!(narrow, BLOCK_SIZE_BUDGET);
        assert_eq!(wide, BLOCK_SIZE_BUDGET / 8);
    }
}
