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
//! Conversion between columnar blocks and packed tuple arrays.
//!
//! Responsibilities:
//! - Packs block columns into contiguous fixed-stride tuples with an
//!   overflow buffer for variable-length tails.
//! - Routes rows into radix buckets by the high bits of the composite
//!   key hash, so matching keys of both join sides share a bucket.
//! - Unpacks tuple arrays back into arrow columns in original order.
//!
//! Key exported interfaces:
//! - Types: `TupleConverter`, `PackResult`.
//!
//! Current limitations:
//! - Overflow offsets are 32-bit; a single overflow buffer past 4 GiB
//!   is surfaced as an explicit runtime error.

use std::sync::Arc;

use arrow::array::ArrayRef;

use crate::exec::packed_tuple::column::{ColumnBuilder, ColumnReader};
use crate::exec::packed_tuple::hash::compose_key_hash;
use crate::exec::packed_tuple::layout::{
    ColumnSizeType, TupleLayout, write_variable_header,
};

/// Packed tuples plus the overflow buffer their variable slots refer
/// into.
#[derive(Debug, Default)]
pub struct PackResult {
    pub packed_tuples: Vec<u8>,
    pub overflow: Vec<u8>,
    pub n_tuples: usize,
}

impl PackResult {
    /// Packed bytes of tuple `row`.
    pub fn tuple(&self, row: usize, total_row_size: usize) -> &[u8] {
        &self.packed_tuples[row * total_row_size..(row + 1) * total_row_size]
    }
}

/// Packs and unpacks blocks for one fixed tuple layout.
pub struct TupleConverter {
    layout: Arc<TupleLayout>,
}

impl TupleConverter {
    pub fn new(layout: Arc<TupleLayout>) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Arc<TupleLayout> {
        &self.layout
    }

    /// Append the rows of `columns` to `out`.
    pub fn pack(
        &self,
        columns: &[ArrayRef],
        num_rows: usize,
        out: &mut PackResult,
    ) -> Result<(), String> {
        let readers = self.make_readers(columns, num_rows)?;
        out.packed_tuples
            .reserve(num_rows * self.layout.total_row_size);
        for row in 0..num_rows {
            self.pack_row(&readers, row, out)?;
        }
        out.n_tuples += num_rows;
        Ok(())
    }

    /// As `pack`, routing each row into `buckets[hash >> (64 - log_buckets)]`.
    /// Rows with a null key component carry the zero sentinel and land in
    /// bucket 0; they can never match anyway.
    pub fn bucket_pack(
        &self,
        columns: &[ArrayRef],
        num_rows: usize,
        buckets: &mut [PackResult],
        log_buckets: u32,
    ) -> Result<(), String> {
        if buckets.len() != 1usize << log_buckets {
            return Err(format!(
                "bucket count mismatch: got {}, expected {}",
                buckets.len(),
                1usize << log_buckets
            ));
        }
        let readers = self.make_readers(columns, num_rows)?;
        for row in 0..num_rows {
            let hash = self.row_key_hash(&readers, row)?;
            let bucket = if log_buckets == 0 {
                0
            } else {
                (hash >> (64 - log_buckets)) as usize
            };
            self.pack_row(&readers, row, &mut buckets[bucket])?;
            buckets[bucket].n_tuples += 1;
        }
        Ok(())
    }

    /// Inverse of `pack`; columns come back in original input order.
    pub fn unpack(&self, pack: &PackResult, out: &mut Vec<ArrayRef>) -> Result<(), String> {
        let stride = self.layout.total_row_size;
        let mut builders = Vec::with_capacity(self.layout.columns.len());
        for column in &self.layout.columns {
            builders.push(ColumnBuilder::try_new(&column.data_type, pack.n_tuples)?);
        }
        for row in 0..pack.n_tuples {
            let tuple = pack
                .packed_tuples
                .get(row * stride..(row + 1) * stride)
                .ok_or_else(|| "packed tuple out of bounds during unpack".to_string())?;
            for (idx, column) in self.layout.columns.iter().enumerate() {
                let builder = &mut builders[idx];
                if self.layout.is_null(tuple, idx) {
                    builder.append_null();
                    continue;
                }
                match column.size_type {
                    ColumnSizeType::Fixed => {
                        builder.append_fixed_bytes(
                            &tuple[column.offset..column.offset + column.size],
                        )?;
                    }
                    ColumnSizeType::Variable => {
                        let bytes =
                            crate::exec::packed_tuple::layout::variable_slice(
                                tuple,
                                column,
                                &pack.overflow,
                            )
                            .ok_or_else(|| {
                                "overflow reference out of bounds during unpack".to_string()
                            })?;
                        builder.append_variable_bytes(bytes)?;
                    }
                }
            }
        }

        let mut ordered: Vec<Option<ArrayRef>> = vec![None; self.layout.columns.len()];
        for (idx, column) in self.layout.columns.iter().enumerate() {
            ordered[column.orig_index] = Some(builders[idx].finish());
        }
        for array in ordered {
            out.push(array.ok_or_else(|| "column missing after unpack".to_string())?);
        }
        Ok(())
    }

    fn make_readers(
        &self,
        columns: &[ArrayRef],
        num_rows: usize,
    ) -> Result<Vec<ColumnReader>, String> {
        if columns.len() != self.layout.columns.len() {
            return Err(format!(
                "column count mismatch: block has {}, layout has {}",
                columns.len(),
                self.layout.columns.len()
            ));
        }
        let mut readers = Vec::with_capacity(self.layout.columns.len());
        for column in &self.layout.columns {
            let reader = ColumnReader::try_new(&columns[column.orig_index], &column.data_type)?;
            if reader.len() < num_rows {
                return Err(format!(
                    "column {} shorter than block length: {} < {num_rows}",
                    column.orig_index,
                    reader.len()
                ));
            }
            readers.push(reader);
        }
        Ok(readers)
    }

    /// Composite key hash of one columnar row; agrees with
    /// `TupleLayout::key_hash` on the packed form of the same row.
    fn row_key_hash(&self, readers: &[ColumnReader], row: usize) -> Result<u64, String> {
        let mut items = [0u64; 8];
        let key_count = self.layout.key_count;
        if key_count <= items.len() {
            for (slot, reader) in items[..key_count].iter_mut().zip(readers.iter()) {
                *slot = reader.item_hash(row)?;
            }
            Ok(compose_key_hash(items[..key_count].iter().copied()))
        } else {
            let mut hashes = Vec::with_capacity(key_count);
            for reader in &readers[..key_count] {
                hashes.push(reader.item_hash(row)?);
            }
            Ok(compose_key_hash(hashes))
        }
    }

    fn pack_row(
        &self,
        readers: &[ColumnReader],
        row: usize,
        out: &mut PackResult,
    ) -> Result<(), String> {
        let stride = self.layout.total_row_size;
        let base = out.packed_tuples.len();
        out.packed_tuples.resize(base + stride, 0);
        for (idx, column) in self.layout.columns.iter().enumerate() {
            let reader = &readers[idx];
            if reader.is_null(row) {
                TupleLayout::set_null(&mut out.packed_tuples[base..base + stride], idx);
                continue;
            }
            match column.size_type {
                ColumnSizeType::Fixed => {
                    reader.write_fixed(
                        row,
                        &mut out.packed_tuples
                            [base + column.offset..base + column.offset + column.size],
                    )?;
                }
                ColumnSizeType::Variable => {
                    let bytes = reader.variable_bytes(row)?;
                    let offset = u32::try_from(out.overflow.len())
                        .map_err(|_| "overflow buffer exceeds 4 GiB".to_string())?;
                    let len = u32::try_from(bytes.len())
                        .map_err(|_| "variable item exceeds 4 GiB".to_string())?;
                    out.overflow.extend_from_slice(bytes);
                    write_variable_header(
                        &mut out.packed_tuples
                            [base + column.offset..base + column.offset + column.size],
                        len,
                        offset,
                    );
                }
            }
        }
        Ok(())
    }
}

/// Expected overflow footprint for `n_tuples` rows of `layout`. No more
/// than 10% of variable-sized values are assumed to be longer than 64
/// bytes.
pub fn expected_overflow_size(layout: &TupleLayout, n_tuples: usize) -> usize {
    let var_columns = layout
        .columns
        .iter()
        .filter(|c| c.size_type == ColumnSizeType::Variable)
        .count();
    if var_columns == 0 {
        return 0;
    }
    var_columns * n_tuples * 64 / 10
}
