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
//! One-sided in-memory hash join.
//!
//! Responsibilities:
//! - Builds the table once over the fully buffered (smaller or
//!   finished) side, then streams the probe side through it.
//! - Reentrant `do_probe`: fetches, packs, and batch-probes probe
//!   blocks until the output watermark trips or the stream drains,
//!   then emits one block.
//!
//! Key exported interfaces:
//! - Types: `HashJoin`.
//!
//! Current limitations:
//! - The build side must be fully buffered before `build_index`; there
//!   is no spilling fallback when it is not.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use arrow::datatypes::DataType;

use crate::exec::block::{Block, BlockFetch, BlockStream, FetchStatus, max_block_length};
use crate::exec::join::join_hash_table::JoinHashTable;
use crate::exec::join::join_probe_utils::run_batched_lookup;
use crate::exec::join::join_side::{JoinSideArgs, SideConversion};
use crate::exec::join::join_state::JoinState;
use crate::exec::join::payload_storage::ExternalPayloadStorage;
use crate::exec::join::policy::{GraceJoinPolicy, JoinAlgo};
use crate::exec::packed_tuple::converter::{TupleConverter, expected_overflow_size};
use crate::exec::packed_tuple::layout::TupleLayout;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::resource_meter::global_resource_meter;

/// Join selectivity assumed when pre-reserving the probe-side overflow:
/// around four probe blocks are expected to fill one output block.
const PROBE_BLOCKS_PER_OUTPUT: usize = 4;

pub(crate) struct HashJoin {
    join_name: &'static str,
    state: JoinState,
    table: JoinHashTable,

    build_converter: TupleConverter,
    build_payload: Option<ExternalPayloadStorage>,
    build_data: VecDeque<Block>,

    probe_stream: Box<dyn BlockStream>,
    probe_converter: TupleConverter,
    probe_payload: Option<ExternalPayloadStorage>,
    probe_data: VecDeque<Block>,

    is_finished: bool,
}

impl HashJoin {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn try_new(
        join_name: &'static str,
        result_item_types: &[DataType],
        left: JoinSideArgs,
        left_stream: Box<dyn BlockStream>,
        right: JoinSideArgs,
        right_stream: Box<dyn BlockStream>,
        left_io_map: Vec<u32>,
        right_io_map: Vec<u32>,
        policy: &dyn GraceJoinPolicy,
        cardinality: u64,
        tracker: &Arc<MemTracker>,
    ) -> Result<Self, String> {
        // A finished stream is assumed to be the smaller one; with both
        // finished, the row counts decide. The unfinished side keeps
        // streaming as probe.
        let was_swapped = (!left.finished && right.finished)
            || (left.finished && right.finished && left.fetched_tuples > right.fetched_tuples);
        let (build, probe, probe_stream) = if was_swapped {
            (right, left, left_stream)
        } else {
            (left, right, right_stream)
        };
        if !build.finished {
            return Err("hash join build side is not fully buffered".to_string());
        }

        let build_full_layout = TupleLayout::describe(&build.item_types, &build.key_columns)?;
        let probe_full_layout = TupleLayout::describe(&probe.item_types, &probe.key_columns)?;
        let multiplicity =
            (probe.fetched_tuples as u64 / cardinality.max(1)) as usize;

        let build_indirected = build_full_layout.payload_size > 0
            && policy.use_external_payload(
                JoinAlgo::HashJoin,
                build_full_layout.payload_size,
                multiplicity,
            );
        let probe_indirected = probe_full_layout.payload_size > 0
            && policy.use_external_payload(
                JoinAlgo::HashJoin,
                probe_full_layout.payload_size,
                multiplicity,
            );

        // Build-side storage is stable for the operator's life.
        let build_side =
            SideConversion::prepare(&build.item_types, &build.key_columns, build_indirected, true)?;
        let probe_side = SideConversion::prepare(
            &probe.item_types,
            &probe.key_columns,
            probe_indirected,
            false,
        )?;

        let mut table = JoinHashTable::new();
        table.set_layout(Arc::clone(build_side.converter.layout()));

        let mut state = JoinState::new(
            max_block_length(result_item_types),
            was_swapped,
            left_io_map,
            right_io_map,
            tracker,
        );

        let build_layout = build_side.converter.layout();
        let probe_layout = probe_side.converter.layout();
        let n_build_tuples: usize = build.data.iter().map(|b| b.num_rows).sum();
        state
            .build_packed_input
            .overflow
            .reserve(expected_overflow_size(build_layout, n_build_tuples));

        let probe_block_len = max_block_length(&probe.item_types);
        state.probe_packed_input.overflow.reserve(expected_overflow_size(
            probe_layout,
            probe_block_len * PROBE_BLOCKS_PER_OUTPUT,
        ));
        state
            .probe_packed_input
            .packed_tuples
            .reserve(probe_block_len * probe_layout.total_row_size);

        state
            .build_packed_output
            .reserve(max_block_length(&build.item_types) * build_layout.total_row_size);
        state
            .probe_packed_output
            .reserve(probe_block_len * probe_layout.total_row_size);
        state.refresh_accounting();

        Ok(Self {
            join_name,
            state,
            table,
            build_converter: build_side.converter,
            build_payload: build_side.payload,
            build_data: build.data,
            probe_stream,
            probe_converter: probe_side.converter,
            probe_payload: probe_side.payload,
            probe_data: probe.data,
            is_finished: false,
        })
    }

    /// Pack the buffered build side and index it. Called once, before
    /// the first `do_probe`.
    pub(crate) fn build_index(&mut self) -> Result<(), String> {
        let begin = Instant::now();
        let result = self.build_index_inner();
        global_resource_meter().update_stage_spent_time(
            self.join_name,
            "Build",
            begin.elapsed().as_micros() as u64,
        );
        result
    }

    fn build_index_inner(&mut self) -> Result<(), String> {
        while let Some(block) = self.build_data.pop_front() {
            if let Some(storage) = self.build_payload.as_mut() {
                let key_block = storage.split_block(&block)?;
                self.build_converter.pack(
                    &key_block.columns,
                    key_block.num_rows,
                    &mut self.state.build_packed_input,
                )?;
            } else {
                self.build_converter.pack(
                    &block.columns,
                    block.num_rows,
                    &mut self.state.build_packed_input,
                )?;
            }
        }
        self.table.build(&self.state.build_packed_input)?;
        self.state.refresh_accounting();
        Ok(())
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
        // Output from a previous call is still waiting to be taken.
        if self.state.has_blocks() {
            return Ok(FetchStatus::Ok);
        }

        loop {
            let mut status = FetchStatus::Finish;
            while self.state.is_not_full() && self.state.has_enough_memory() {
                if !self.is_finished {
                    status = match self.probe_stream.fetch()? {
                        BlockFetch::Block(block) => {
                            self.probe_data.push_back(block);
                            FetchStatus::Ok
                        }
                        BlockFetch::Yield => FetchStatus::Yield,
                        BlockFetch::Finished => FetchStatus::Finish,
                    };
                }

                // Buffered probe blocks are consumed no matter what the
                // upstream just reported.
                if status == FetchStatus::Yield && self.probe_data.is_empty() {
                    return Ok(FetchStatus::Yield);
                }
                if status == FetchStatus::Finish {
                    self.is_finished = true;
                    if self.probe_data.is_empty() {
                        break;
                    }
                }

                self.pack_next_probe_block()?;

                let probe_layout = Arc::clone(self.probe_converter.layout());
                run_batched_lookup(
                    &self.table,
                    self.state.lookup_buffers(),
                    &probe_layout,
                    0,
                    false,
                );

                // Packed probe tuples are spent; the overflow is not
                // cleared because packed output borrows from it, and
                // indirected probe payload stays for the same reason.
                self.state.probe_packed_input.packed_tuples.clear();
                self.state.probe_packed_input.n_tuples = 0;
            }

            if self.state.output_rows == 0 {
                if status != FetchStatus::Finish {
                    // The overflow guard tripped with nothing matched.
                    // No output row borrows the probe overflow, so it
                    // is safe to recycle the input and keep going.
                    self.state
                        .reset_input(self.build_payload.as_mut(), self.probe_payload.as_mut());
                    continue;
                }
                self.state
                    .reset_input(self.build_payload.as_mut(), self.probe_payload.as_mut());
                self.state.reset_output();
                return Ok(FetchStatus::Finish);
            }

            self.state.make_blocks(
                &self.build_converter,
                &self.probe_converter,
                self.build_payload.as_ref(),
                self.probe_payload.as_ref(),
            )?;
            self.state
                .reset_input(self.build_payload.as_mut(), self.probe_payload.as_mut());
            self.state.reset_output();
            return Ok(FetchStatus::Ok);
        }
    }

    pub(crate) fn fill_output(&mut self) -> Option<Block> {
        self.state.fill_output()
    }

    fn pack_next_probe_block(&mut self) -> Result<(), String> {
        let Some(block) = self.probe_data.pop_front() else {
            return Err("no buffered probe block to pack".to_string());
        };
        if let Some(storage) = self.probe_payload.as_mut() {
            let key_block = storage.split_block(&block)?;
            self.probe_converter.pack(
                &key_block.columns,
                key_block.num_rows,
                &mut self.state.probe_packed_input,
            )?;
        } else {
            self.probe_converter.pack(
                &block.columns,
                block.num_rows,
                &mut self.state.probe_packed_input,
            )?;
        }
        Ok(())
    }
}
