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
//! Per-side bootstrap handoff and converter preparation.

use std::collections::VecDeque;
use std::sync::Arc;

use arrow::datatypes::DataType;
use hashbrown::HashSet;

use crate::exec::block::Block;
use crate::exec::join::payload_storage::ExternalPayloadStorage;
use crate::exec::packed_tuple::converter::TupleConverter;
use crate::exec::packed_tuple::layout::TupleLayout;

/// Everything one input side carries out of the bootstrap phase.
pub(crate) struct JoinSideArgs {
    pub(crate) item_types: Vec<DataType>,
    pub(crate) key_columns: Vec<u32>,
    pub(crate) data: VecDeque<Block>,
    pub(crate) fetched_tuples: usize,
    pub(crate) finished: bool,
}

/// A side's converter plus, when the policy chose indirection, the
/// external storage its payload columns are parked in.
pub(crate) struct SideConversion {
    pub(crate) converter: TupleConverter,
    pub(crate) payload: Option<ExternalPayloadStorage>,
}

impl SideConversion {
    /// Build the converter for one side. Under indirection the
    /// converter sees only the key columns plus a trailing `u64`
    /// indirection index as its single payload column; key positions
    /// are remapped into that narrowed column list, preserving the key
    /// pairing order.
    pub(crate) fn prepare(
        item_types: &[DataType],
        key_columns: &[u32],
        indirected: bool,
        non_clearable: bool,
    ) -> Result<Self, String> {
        if !indirected {
            let layout = Arc::new(TupleLayout::describe(item_types, key_columns)?);
            return Ok(Self {
                converter: TupleConverter::new(layout),
                payload: None,
            });
        }

        let key_set: HashSet<u32> = key_columns.iter().copied().collect();
        let payload = ExternalPayloadStorage::new(item_types, &key_set, non_clearable)?;

        let mut sorted_keys: Vec<u32> = key_columns.to_vec();
        sorted_keys.sort_unstable();
        let mut converter_types: Vec<DataType> = sorted_keys
            .iter()
            .map(|&k| item_types[k as usize].clone())
            .collect();
        converter_types.push(DataType::UInt64);

        let converter_keys: Vec<u32> = key_columns
            .iter()
            .map(|k| {
                sorted_keys
                    .binary_search(k)
                    .map(|rank| rank as u32)
                    .map_err(|_| format!("key column {k} missing from sorted key set"))
            })
            .collect::<Result<_, String>>()?;

        let layout = Arc::new(TupleLayout::describe(&converter_types, &converter_keys)?);
        Ok(Self {
            converter: TupleConverter::new(layout),
            payload: Some(payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indirected_side_narrows_to_keys_plus_index() {
        let side = SideConversion::prepare(
            &[DataType::Utf8, DataType::Int32, DataType::Utf8, DataType::Int64],
            &[3, 1],
            true,
            true,
        )
        .expect("side");
        let layout = side.converter.layout();
        // Columns: keys sorted ascending {1, 3} plus the u64 index.
        assert_eq!(layout.columns.len(), 3);
        assert_eq!(layout.key_count, 2);
        // Key pairing order is the key-list order: col 3 first, col 1
        // second, remapped into the narrowed list.
        assert_eq!(layout.columns[0].data_type, DataType::Int64);
        assert_eq!(layout.columns[1].data_type, DataType::Int32);
        assert!(side.payload.is_some());
    }

    #[test]
    fn plain_side_keeps_all_columns() {
        let side = SideConversion::prepare(
            &[DataType::Int32, DataType::Utf8],
            &[0],
            false,
            false,
        )
        .expect("side");
        assert_eq!(side.converter.layout().columns.len(), 2);
        assert!(side.payload.is_none());
    }
}
