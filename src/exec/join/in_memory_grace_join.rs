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
//! Radix-bucketed in-memory grace join.
//!
//! Responsibilities:
//! - Partitions both fully buffered sides into `2^log_buckets` radix
//!   buckets on the key hash, sized so one bucket's table plus its
//!   probe stream stay cache-resident.
//! - Joins bucket pairs in ascending index order, picking the smaller
//!   side of each pair as that bucket's build; the swap flag on the
//!   shared state keeps the emitted left/right order stable.
//! - Reentrant `do_probe` saves the bucket cursor and probe position
//!   between calls.
//!
//! Key exported interfaces:
//! - Types: `InMemoryGraceJoin`.
//!
//! Current limitations:
//! - Both sides must fit in memory; spilling bucket pairs to disk is a
//!   different operator mode and not implemented here.

use std::mem;
use std::sync::Arc;
use std::time::Instant;

use arrow::datatypes::DataType;

use crate::exec::block::{Block, FetchStatus, max_block_length};
use crate::exec::join::join_hash_table::JoinHashTable;
use crate::exec::join::join_probe_utils::run_batched_lookup;
use crate::exec::join::join_side::{JoinSideArgs, SideConversion};
use crate::exec::join::join_state::JoinState;
use crate::exec::join::payload_storage::ExternalPayloadStorage;
use crate::exec::join::policy::{GraceJoinPolicy, JoinAlgo};
use crate::exec::packed_tuple::converter::{PackResult, TupleConverter, expected_overflow_size};
use crate::exec::packed_tuple::layout::TupleLayout;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::resource_meter::global_resource_meter;

const KB: usize = 1024;
const L2_CACHE_SIZE: usize = 256 * KB;
/// One bucket pair should fit in 4x L2: the bucket's hash table plus
/// its probe stream stay cache-resident while it is processed.
const BUCKET_DESIRED_SIZE: usize = 4 * L2_CACHE_SIZE;

pub(crate) struct InMemoryGraceJoin {
    join_name: &'static str,
    state: JoinState,
    table: JoinHashTable,

    left_converter: TupleConverter,
    left_payload: Option<ExternalPayloadStorage>,
    right_converter: TupleConverter,
    right_payload: Option<ExternalPayloadStorage>,

    log_buckets: u32,
    left_buckets: Vec<PackResult>,
    right_buckets: Vec<PackResult>,

    curr_bucket: u32,
    curr_probe_row: usize,
    need_next_bucket: bool,
}

impl InMemoryGraceJoin {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn try_new(
        join_name: &'static str,
        result_item_types: &[DataType],
        mut left: JoinSideArgs,
        mut right: JoinSideArgs,
        left_io_map: Vec<u32>,
        right_io_map: Vec<u32>,
        policy: &dyn GraceJoinPolicy,
        cardinality: u64,
        tracker: &Arc<MemTracker>,
    ) -> Result<Self, String> {
        if !left.finished || !right.finished {
            return Err("in-memory grace join requires both sides fully buffered".to_string());
        }
        let left_rows: usize = left.data.iter().map(|b| b.num_rows).sum();
        let right_rows: usize = right.data.iter().map(|b| b.num_rows).sum();
        let multiplicity =
            (left_rows.max(right_rows) as u64 / cardinality.max(1)) as usize;

        let left_full_layout = TupleLayout::describe(&left.item_types, &left.key_columns)?;
        let right_full_layout = TupleLayout::describe(&right.item_types, &right.key_columns)?;
        let left_indirected = left_full_layout.payload_size > 0
            && policy.use_external_payload(
                JoinAlgo::InMemoryGraceJoin,
                left_full_layout.payload_size,
                multiplicity,
            );
        let right_indirected = right_full_layout.payload_size > 0
            && policy.use_external_payload(
                JoinAlgo::InMemoryGraceJoin,
                right_full_layout.payload_size,
                multiplicity,
            );

        // Both storages are stable across buckets, so neither clears.
        let mut left_side =
            SideConversion::prepare(&left.item_types, &left.key_columns, left_indirected, true)?;
        let mut right_side =
            SideConversion::prepare(&right.item_types, &right.key_columns, right_indirected, true)?;

        let left_bytes = left_rows * left_side.converter.layout().total_row_size;
        let right_bytes = right_rows * right_side.converter.layout().total_row_size;
        let min_bytes = left_bytes.min(right_bytes);
        let log_buckets = if min_bytes == 0 {
            0
        } else {
            usize::BITS - ((min_bytes - 1) / BUCKET_DESIRED_SIZE).leading_zeros()
        };
        let n_buckets = 1usize << log_buckets;

        let mut left_buckets: Vec<PackResult> =
            (0..n_buckets).map(|_| PackResult::default()).collect();
        let mut right_buckets: Vec<PackResult> =
            (0..n_buckets).map(|_| PackResult::default()).collect();
        let left_overflow_est =
            expected_overflow_size(left_side.converter.layout(), left_rows >> log_buckets);
        let right_overflow_est =
            expected_overflow_size(right_side.converter.layout(), right_rows >> log_buckets);
        for bucket in 0..n_buckets {
            left_buckets[bucket].overflow.reserve(left_overflow_est);
            right_buckets[bucket].overflow.reserve(right_overflow_est);
        }

        bucket_pack_side(
            mem::take(&mut left.data),
            &mut left_side,
            &mut left_buckets,
            log_buckets,
        )?;
        bucket_pack_side(
            mem::take(&mut right.data),
            &mut right_side,
            &mut right_buckets,
            log_buckets,
        )?;

        let mut state = JoinState::new(
            max_block_length(result_item_types),
            false,
            left_io_map,
            right_io_map,
            tracker,
        );
        state.build_packed_output.reserve(
            max_block_length(&left.item_types) * left_side.converter.layout().total_row_size,
        );
        state.probe_packed_output.reserve(
            max_block_length(&right.item_types) * right_side.converter.layout().total_row_size,
        );
        state.refresh_accounting();

        Ok(Self {
            join_name,
            state,
            table: JoinHashTable::new(),
            left_converter: left_side.converter,
            left_payload: left_side.payload,
            right_converter: right_side.converter,
            right_payload: right_side.payload,
            log_buckets,
            left_buckets,
            right_buckets,
            curr_bucket: 0,
            curr_probe_row: 0,
            need_next_bucket: true,
        })
    }

    pub(crate) fn do_probe(&mut self) -> Result<FetchStatus, String> {
        let begin = Instant::now();
        let result = self.do_probe_inner();
        global_resource_meter().update_stage_spent_time(
            self.join_name,
            "Probe",
            begin.elapsed().as_micros() as u64,
        );
        result
    }

    fn do_probe_inner(&mut self) -> Result<FetchStatus, String> {
        loop {
            if (self.curr_bucket >> self.log_buckets) != 0 {
                return Ok(FetchStatus::Finish);
            }

            // Output from a previous call is still waiting to be taken.
            if self.state.has_blocks() {
                return Ok(FetchStatus::Ok);
            }

            if self.need_next_bucket {
                self.need_next_bucket = false;
                self.build_bucket_index()?;
            }

            self.do_batch_lookup();

            if self.state.output_rows == 0 {
                continue;
            }

            let (build_converter, probe_converter) = if self.state.swapped() {
                (&self.right_converter, &self.left_converter)
            } else {
                (&self.left_converter, &self.right_converter)
            };
            let (build_payload, probe_payload) = if self.state.swapped() {
                (self.right_payload.as_ref(), self.left_payload.as_ref())
            } else {
                (self.left_payload.as_ref(), self.right_payload.as_ref())
            };
            self.state
                .make_blocks(build_converter, probe_converter, build_payload, probe_payload)?;
            // Reset input only once the bucket pair is fully consumed,
            // or the data still being probed would be wiped.
            if self.need_next_bucket {
                self.state
                    .reset_input(self.left_payload.as_mut(), self.right_payload.as_mut());
            }
            self.state.reset_output();
            return Ok(FetchStatus::Ok);
        }
    }

    pub(crate) fn fill_output(&mut self) -> Option<Block> {
        self.state.fill_output()
    }

    /// Point the table at the smaller half of the current bucket pair
    /// and index it; the larger half becomes this bucket's probe.
    fn build_bucket_index(&mut self) -> Result<(), String> {
        let begin = Instant::now();
        let result = self.build_bucket_index_inner();
        global_resource_meter().update_stage_spent_time(
            self.join_name,
            "Build",
            begin.elapsed().as_micros() as u64,
        );
        result
    }

    fn build_bucket_index_inner(&mut self) -> Result<(), String> {
        let bucket = self.curr_bucket as usize;
        let left_pack = self
            .left_buckets
            .get_mut(bucket)
            .map(mem::take)
            .ok_or_else(|| format!("left bucket {bucket} out of range"))?;
        let right_pack = self
            .right_buckets
            .get_mut(bucket)
            .map(mem::take)
            .ok_or_else(|| format!("right bucket {bucket} out of range"))?;

        if left_pack.n_tuples < right_pack.n_tuples {
            self.state.set_swapped(false);
            self.state.build_packed_input = left_pack;
            self.state.probe_packed_input = right_pack;
            self.table
                .set_layout(Arc::clone(self.left_converter.layout()));
        } else {
            self.state.set_swapped(true);
            self.state.build_packed_input = right_pack;
            self.state.probe_packed_input = left_pack;
            self.table
                .set_layout(Arc::clone(self.right_converter.layout()));
        }

        self.table.build(&self.state.build_packed_input)?;
        self.state.refresh_accounting();
        Ok(())
    }

    fn do_batch_lookup(&mut self) {
        let probe_layout = if self.state.swapped() {
            Arc::clone(self.left_converter.layout())
        } else {
            Arc::clone(self.right_converter.layout())
        };
        let n_tuples = self.state.probe_packed_input.n_tuples;
        let resumed = run_batched_lookup(
            &self.table,
            self.state.lookup_buffers(),
            &probe_layout,
            self.curr_probe_row,
            true,
        );
        self.curr_probe_row = resumed;
        if self.curr_probe_row >= n_tuples {
            self.need_next_bucket = true;
            self.curr_bucket += 1;
            self.curr_probe_row = 0;
        }
    }
}

fn bucket_pack_side(
    blocks: std::collections::VecDeque<Block>,
    side: &mut SideConversion,
    buckets: &mut [PackResult],
    log_buckets: u32,
) -> Result<(), String> {
    for block in blocks {
        if let Some(storage) = side.payload.as_mut() {
            let key_block = storage.split_block(&block)?;
            side.converter.bucket_pack(
                &key_block.columns,
                key_block.num_rows,
                buckets,
                log_buckets,
            )?;
        } else {
            side.converter
                .bucket_pack(&block.columns, block.num_rows, buckets, log_buckets)?;
        }
    }
    Ok(())
}
