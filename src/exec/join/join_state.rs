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
//! Shared output state of the two join algorithms.
//!
//! Responsibilities:
//! - Owns the packed input and output buffers the batched lookup writes
//!   into, plus the fullness and overflow-capacity guards that keep one
//!   uninterruptible 64-batch from overflowing them.
//! - Assembles emitted blocks: unpack, payload restore, swap-aware
//!   left/right mapping, and IO-map projection.
//!
//! `was_swapped` is the single source of truth for which physical lane
//! (build or probe) feeds the user-visible left side. Converters and
//! payload storages stay bound to their side; only the lanes swap.

use std::mem;
use std::sync::Arc;

use arrow::array::ArrayRef;

use crate::exec::block::Block;
use crate::exec::join::payload_storage::ExternalPayloadStorage;
use crate::exec::packed_tuple::converter::{PackResult, TupleConverter};
use crate::runtime::mem_tracker::MemTracker;

pub(crate) struct JoinState {
    /// Converted build data; constant for all probe calls of one build.
    pub(crate) build_packed_input: PackResult,
    /// Converted probe data; recycled per consumed probe block.
    pub(crate) probe_packed_input: PackResult,
    /// Packed join output, build lane. Variable slots keep borrowing
    /// from the corresponding packed input overflow until unpack.
    pub(crate) build_packed_output: Vec<u8>,
    pub(crate) probe_packed_output: Vec<u8>,
    pub(crate) output_rows: u32,

    max_length: usize,
    was_swapped: bool,
    left_io_map: Vec<u32>,
    right_io_map: Vec<u32>,
    pending: Option<Block>,
    tracker: Arc<MemTracker>,
    accounted: i64,
}

impl JoinState {
    pub(crate) fn new(
        max_length: usize,
        was_swapped: bool,
        left_io_map: Vec<u32>,
        right_io_map: Vec<u32>,
        tracker: &Arc<MemTracker>,
    ) -> Self {
        Self {
            build_packed_input: PackResult::default(),
            probe_packed_input: PackResult::default(),
            build_packed_output: Vec::new(),
            probe_packed_output: Vec::new(),
            output_rows: 0,
            max_length,
            was_swapped,
            left_io_map,
            right_io_map,
            pending: None,
            tracker: MemTracker::new_child("JoinState", tracker),
            accounted: 0,
        }
    }

    pub(crate) fn swapped(&self) -> bool {
        self.was_swapped
    }

    pub(crate) fn set_swapped(&mut self, was_swapped: bool) {
        self.was_swapped = was_swapped;
    }

    /// The batched inner loop cannot be interrupted mid-batch, so the
    /// state reports "not full" only below an 80% watermark.
    pub(crate) fn is_not_full(&self) -> bool {
        (self.output_rows as usize) * 5 < self.max_length * 4
    }

    /// Overflow capacity guard: the next batched insert must not force
    /// the probe overflow to reallocate while output slots borrow from
    /// it.
    pub(crate) fn has_enough_memory(&self) -> bool {
        self.probe_packed_input.overflow.capacity() == 0
            || self.probe_packed_input.overflow.len() * 5
                < self.probe_packed_input.overflow.capacity() * 4
    }

    pub(crate) fn has_blocks(&self) -> bool {
        self.pending.is_some()
    }

    /// Unpack the packed output into an emitted block. The converters
    /// and payload storages are passed lane-wise: whatever currently
    /// feeds the build lane comes first.
    pub(crate) fn make_blocks(
        &mut self,
        build_converter: &TupleConverter,
        probe_converter: &TupleConverter,
        build_payload: Option<&ExternalPayloadStorage>,
        probe_payload: Option<&ExternalPayloadStorage>,
    ) -> Result<(), String> {
        let output_rows = self.output_rows as usize;

        let build_pack = PackResult {
            packed_tuples: mem::take(&mut self.build_packed_output),
            overflow: mem::take(&mut self.build_packed_input.overflow),
            n_tuples: output_rows,
        };
        let build_columns = unpack_lane(build_converter, build_payload, &build_pack, output_rows)?;

        let probe_pack = PackResult {
            packed_tuples: mem::take(&mut self.probe_packed_output),
            overflow: mem::take(&mut self.probe_packed_input.overflow),
            n_tuples: output_rows,
        };
        let probe_columns = unpack_lane(probe_converter, probe_payload, &probe_pack, output_rows)?;

        let (left_columns, right_columns) = if self.was_swapped {
            (probe_columns, build_columns)
        } else {
            (build_columns, probe_columns)
        };

        let mut columns = Vec::with_capacity(self.left_io_map.len() + self.right_io_map.len());
        for &idx in &self.left_io_map {
            let column = left_columns
                .get(idx as usize)
                .cloned()
                .ok_or_else(|| format!("left io map index {idx} out of range"))?;
            columns.push(column);
        }
        for &idx in &self.right_io_map {
            let column = right_columns
                .get(idx as usize)
                .cloned()
                .ok_or_else(|| format!("right io map index {idx} out of range"))?;
            columns.push(column);
        }
        self.pending = Some(Block::new(columns, output_rows));

        // Move the buffers back from their packed view for reuse.
        self.build_packed_output = build_pack.packed_tuples;
        self.build_packed_input.overflow = build_pack.overflow;
        self.probe_packed_output = probe_pack.packed_tuples;
        self.probe_packed_input.overflow = probe_pack.overflow;
        self.refresh_accounting();
        Ok(())
    }

    pub(crate) fn fill_output(&mut self) -> Option<Block> {
        self.pending.take()
    }

    /// Clear the per-probe-block buffers. Build input stays: it is
    /// constant for all probe calls.
    pub(crate) fn reset_input(
        &mut self,
        build_payload: Option<&mut ExternalPayloadStorage>,
        probe_payload: Option<&mut ExternalPayloadStorage>,
    ) {
        self.probe_packed_input.packed_tuples.clear();
        self.probe_packed_input.overflow.clear();
        self.probe_packed_input.n_tuples = 0;
        if let Some(storage) = build_payload {
            storage.clear();
        }
        if let Some(storage) = probe_payload {
            storage.clear();
        }
    }

    pub(crate) fn reset_output(&mut self) {
        self.output_rows = 0;
        self.build_packed_output.clear();
        self.probe_packed_output.clear();
    }

    /// Disjoint borrows of the buffers the batched lookup touches.
    pub(crate) fn lookup_buffers(&mut self) -> LookupBuffers<'_> {
        LookupBuffers {
            build_input: &self.build_packed_input,
            probe_input: &self.probe_packed_input,
            build_output: &mut self.build_packed_output,
            probe_output: &mut self.probe_packed_output,
            output_rows: &mut self.output_rows,
            max_length: self.max_length,
        }
    }

    pub(crate) fn refresh_accounting(&mut self) {
        let bytes = (self.build_packed_input.packed_tuples.capacity()
            + self.build_packed_input.overflow.capacity()
            + self.probe_packed_input.packed_tuples.capacity()
            + self.probe_packed_input.overflow.capacity()
            + self.build_packed_output.capacity()
            + self.probe_packed_output.capacity()) as i64;
        let delta = bytes - self.accounted;
        if delta > 0 {
            self.tracker.consume(delta);
        } else if delta < 0 {
            self.tracker.release(-delta);
        }
        self.accounted = bytes;
    }
}

impl Drop for JoinState {
    fn drop(&mut self) {
        self.tracker.release(self.accounted);
    }
}

/// Borrow bundle handed to the batched lookup: packed inputs read-only,
/// packed outputs and the row counter writable.
pub(crate) struct LookupBuffers<'a> {
    pub(crate) build_input: &'a PackResult,
    pub(crate) probe_input: &'a PackResult,
    pub(crate) build_output: &'a mut Vec<u8>,
    pub(crate) probe_output: &'a mut Vec<u8>,
    pub(crate) output_rows: &'a mut u32,
    pub(crate) max_length: usize,
}

fn unpack_lane(
    converter: &TupleConverter,
    payload: Option<&ExternalPayloadStorage>,
    pack: &PackResult,
    output_rows: usize,
) -> Result<Vec<ArrayRef>, String> {
    let mut columns = Vec::new();
    converter.unpack(pack, &mut columns)?;
    let Some(storage) = payload else {
        return Ok(columns);
    };
    let indexes = columns
        .pop()
        .ok_or_else(|| "indirection index column missing from packed output".to_string())?;
    let restored = storage.restore_payload(&indexes, output_rows)?;
    storage.merge_restored(columns, restored)
}
