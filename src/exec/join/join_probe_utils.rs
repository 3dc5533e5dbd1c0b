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
//! Batched probe lookup shared by both join algorithms.

use crate::exec::join::join_hash_table::{JoinHashTable, MatchIter};
use crate::exec::join::join_state::LookupBuffers;
use crate::exec::packed_tuple::layout::TupleLayout;

/// Window size of the two-pass lookup. Iterators for a full window are
/// resolved first, then drained, giving the memory system independent
/// streams to work ahead on. A window is never interrupted, which is
/// what the output fullness watermark accounts for.
pub(crate) const LOOKUP_BATCH_SIZE: usize = 64;

/// Probe rows `start_row..` against the table, appending matched
/// (build, probe) tuple pairs to the packed outputs. Returns the probe
/// row position to resume from; the position is at least `n_tuples`
/// when the input was drained.
///
/// With `gate_on_fullness`, the loop re-checks the output watermark
/// before every window; the one-sided hash join instead gates per probe
/// block and drains each block completely.
pub(crate) fn run_batched_lookup(
    table: &JoinHashTable,
    buffers: LookupBuffers<'_>,
    probe_layout: &TupleLayout,
    start_row: usize,
    gate_on_fullness: bool,
) -> usize {
    let LookupBuffers {
        build_input,
        probe_input,
        build_output,
        probe_output,
        output_rows,
        max_length,
    } = buffers;
    let probe_stride = probe_layout.total_row_size;
    let n_tuples = probe_input.n_tuples;
    let overflow = probe_input.overflow.as_slice();

    let mut iterators = [(MatchIter::empty(), 0usize); LOOKUP_BATCH_SIZE];
    let mut row = start_row;
    while row < n_tuples {
        if gate_on_fullness && (*output_rows as usize) * 5 >= max_length * 4 {
            break;
        }
        let remaining = LOOKUP_BATCH_SIZE.min(n_tuples - row);

        for (offset, slot) in iterators[..remaining].iter_mut().enumerate() {
            let probe_row = row + offset;
            let tuple = probe_input.tuple(probe_row, probe_stride);
            *slot = (
                table.find(tuple, overflow, probe_layout, build_input),
                probe_row,
            );
        }

        for &(it, probe_row) in &iterators[..remaining] {
            let mut it = it;
            while let Some(found) = table.next_match(&mut it, build_input) {
                build_output.extend_from_slice(found);
                probe_output.extend_from_slice(probe_input.tuple(probe_row, probe_stride));
                *output_rows += 1;
            }
        }

        row += LOOKUP_BATCH_SIZE;
    }
    row
}
