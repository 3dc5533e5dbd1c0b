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
//! Bootstrap buffering and statistics for algorithm selection.
//!
//! Responsibilities:
//! - Pulls blocks from both inputs, one per side per call, until either
//!   side ends or outgrows the policy's bootstrap budget.
//! - Collects stride samples of key hashes for the cardinality sketch
//!   and estimated packed sizes for the memory decision.
//! - Hands buffered blocks off to the selected algorithm and is then
//!   destroyed.

use std::collections::VecDeque;
use std::sync::Arc;

use arrow::datatypes::DataType;

use crate::exec::block::{Block, BlockFetch, BlockStream, FetchStatus};
use crate::exec::join::cardinality::CardinalityEstimator;
use crate::exec::join::policy::GraceJoinPolicy;
use crate::exec::packed_tuple::column::ColumnReader;
use crate::exec::packed_tuple::hash::compose_key_hash;
use crate::exec::packed_tuple::layout::TupleLayout;
use crate::runtime::mem_tracker::MemTracker;

/// Sampling stride: small enough to be cheap, large enough for the
/// estimator to converge on realistic block counts.
const SAMPLE_STRIDE: usize = 100;

/// Tuning constant folding the 5% sample share and the stride into the
/// estimator bucket count: 1/20 * 1/100 -> 1/2000.
const CARDINALITY_BUCKET_DIVISOR: usize = 2000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BootstrapStatus {
    Unknown,
    /// One side ended while the other outgrew the budget.
    OneStreamFinished,
    /// Both sides fully buffered.
    BothStreamsFinished,
    /// Both sides outgrew the budget; would require grace spilling.
    MemoryLimitExceeded,
}

struct SideBuffer {
    layout: Arc<TupleLayout>,
    data: VecDeque<Block>,
    fetched_tuples: usize,
    /// Size in packed tuple representation, not arrow bytes.
    estimated_size: usize,
    finished: bool,
    samples: Vec<u64>,
}

impl SideBuffer {
    fn new(item_types: &[DataType], key_columns: &[u32]) -> Result<Self, String> {
        Ok(Self {
            layout: Arc::new(TupleLayout::describe(item_types, key_columns)?),
            data: VecDeque::new(),
            fetched_tuples: 0,
            estimated_size: 0,
            finished: false,
            samples: Vec::new(),
        })
    }

    fn fetch_once(
        &mut self,
        stream: &mut dyn BlockStream,
        max_fetched_size: usize,
    ) -> Result<FetchStatus, String> {
        if self.finished || self.estimated_size >= max_fetched_size {
            return Ok(FetchStatus::Finish);
        }
        match stream.fetch()? {
            BlockFetch::Block(block) => {
                self.estimated_size += block.num_rows * self.layout.total_row_size;
                self.fetched_tuples += block.num_rows;
                self.sample_block(&block)?;
                self.data.push_back(block);
                Ok(FetchStatus::Ok)
            }
            BlockFetch::Yield => Ok(FetchStatus::Yield),
            BlockFetch::Finished => {
                self.finished = true;
                Ok(FetchStatus::Finish)
            }
        }
    }

    fn sample_block(&mut self, block: &Block) -> Result<(), String> {
        let key_count = self.layout.key_count;
        let mut readers = Vec::with_capacity(key_count);
        for column in &self.layout.columns[..key_count] {
            readers.push(ColumnReader::try_new(
                &block.columns[column.orig_index],
                &column.data_type,
            )?);
        }
        let mut hashes = vec![0u64; key_count];
        let mut row = 0;
        while row < block.num_rows {
            for (hash, reader) in hashes.iter_mut().zip(readers.iter()) {
                *hash = reader.item_hash(row)?;
            }
            self.samples.push(compose_key_hash(hashes.iter().copied()));
            row += SAMPLE_STRIDE;
        }
        Ok(())
    }
}

/// Temporary storage driving the quick-start phase of the adaptive
/// join: buffer, measure, decide, hand off.
pub(crate) struct TempJoinStorage {
    left: SideBuffer,
    right: SideBuffer,
    policy: Arc<dyn GraceJoinPolicy>,
    tracker: Arc<MemTracker>,
    accounted: i64,
}

impl TempJoinStorage {
    pub(crate) fn new(
        left_item_types: &[DataType],
        left_key_columns: &[u32],
        right_item_types: &[DataType],
        right_key_columns: &[u32],
        policy: Arc<dyn GraceJoinPolicy>,
        tracker: &Arc<MemTracker>,
    ) -> Result<Self, String> {
        Ok(Self {
            left: SideBuffer::new(left_item_types, left_key_columns)?,
            right: SideBuffer::new(right_item_types, right_key_columns)?,
            policy,
            tracker: MemTracker::new_child("TempJoinStorage", tracker),
            accounted: 0,
        })
    }

    /// Pull at most one block per side. `Yield` when either upstream
    /// yielded; `Finish` means "consult `status` now", not "no data".
    pub(crate) fn fetch_streams(
        &mut self,
        left_stream: &mut dyn BlockStream,
        right_stream: &mut dyn BlockStream,
    ) -> Result<FetchStatus, String> {
        let max_fetched_size = self.policy.maximum_initially_fetched_data();
        let left_status = self.left.fetch_once(left_stream, max_fetched_size)?;
        let right_status = self.right.fetch_once(right_stream, max_fetched_size)?;
        self.refresh_accounting();
        if left_status == FetchStatus::Yield || right_status == FetchStatus::Yield {
            return Ok(FetchStatus::Yield);
        }
        Ok(FetchStatus::Finish)
    }

    pub(crate) fn status(&self) -> BootstrapStatus {
        let max_fetched_size = self.policy.maximum_initially_fetched_data();
        if self.left.finished && self.right.finished {
            return BootstrapStatus::BothStreamsFinished;
        }
        if (self.left.finished && self.right.estimated_size >= max_fetched_size)
            || (self.left.estimated_size >= max_fetched_size && self.right.finished)
        {
            return BootstrapStatus::OneStreamFinished;
        }
        if self.left.estimated_size >= max_fetched_size
            && self.right.estimated_size >= max_fetched_size
        {
            return BootstrapStatus::MemoryLimitExceeded;
        }
        BootstrapStatus::Unknown
    }

    pub(crate) fn fetched_tuples(&self) -> (usize, usize) {
        (self.left.fetched_tuples, self.right.fetched_tuples)
    }

    pub(crate) fn payload_sizes(&self) -> (usize, usize) {
        (self.left.layout.payload_size, self.right.layout.payload_size)
    }

    pub(crate) fn is_finished(&self) -> (bool, bool) {
        (self.left.finished, self.right.finished)
    }

    /// Rough bootstrap estimate of the distinct join key count; callers
    /// treat `tuples / estimate` as the duplicate multiplicity.
    pub(crate) fn estimate_cardinality(&self) -> u64 {
        let (l_tuples, r_tuples) = self.fetched_tuples();
        let buckets = (l_tuples.max(r_tuples) / CARDINALITY_BUCKET_DIVISOR).max(1);
        let estimator = CardinalityEstimator::new(buckets);
        estimator.estimate(l_tuples, &self.left.samples, r_tuples, &self.right.samples)
    }

    /// Hand off the buffered blocks. `fetch_streams` must not be called
    /// afterwards.
    pub(crate) fn detach_data(&mut self) -> (VecDeque<Block>, VecDeque<Block>) {
        self.tracker.release(self.accounted);
        self.accounted = 0;
        (
            std::mem::take(&mut self.left.data),
            std::mem::take(&mut self.right.data),
        )
    }

    fn refresh_accounting(&mut self) {
        let bytes = (self.left.estimated_size + self.right.estimated_size) as i64;
        let delta = bytes - self.accounted;
        if delta > 0 {
            self.tracker.consume(delta);
        } else if delta < 0 {
            self.tracker.release(-delta);
        }
        self.accounted = bytes;
    }
}

impl Drop for TempJoinStorage {
    fn drop(&mut self) {
        self.tracker.release(self.accounted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::join::policy::{GraceJoinPolicy, JoinAlgo};
    use arrow::array::{ArrayRef, Int32Array};
    use std::sync::Arc;

    struct TinyBudgetPolicy(usize);

    impl GraceJoinPolicy for TinyBudgetPolicy {
        fn maximum_initially_fetched_data(&self) -> usize {
            self.0
        }
        fn pick_algorithm(&self, _l: usize, _r: usize) -> JoinAlgo {
            JoinAlgo::HashJoin
        }
        fn use_external_payload(&self, _a: JoinAlgo, _p: usize, _m: usize) -> bool {
            false
        }
    }

    struct VecStream {
        blocks: VecDeque<Block>,
    }

    impl BlockStream for VecStream {
        fn fetch(&mut self) -> Result<BlockFetch, String> {
            Ok(match self.blocks.pop_front() {
                Some(block) => BlockFetch::Block(block),
                None => BlockFetch::Finished,
            })
        }
    }

    fn int_block(values: Vec<i32>) -> Block {
        let len = values.len();
        Block::new(vec![Arc::new(Int32Array::from(values)) as ArrayRef], len)
    }

    fn storage(policy: Arc<dyn GraceJoinPolicy>) -> TempJoinStorage {
        let tracker = MemTracker::new_root("test");
        TempJoinStorage::new(
            &[DataType::Int32],
            &[0],
            &[DataType::Int32],
            &[0],
            policy,
            &tracker,
        )
        .expect("temp storage")
    }

    #[test]
    fn both_streams_finish_when_budget_is_large() {
        let mut temp = storage(Arc::new(TinyBudgetPolicy(1 << 20)));
        let mut left = VecStream {
            blocks: VecDeque::from([int_block(vec![1, 2]), int_block(vec![3])]),
        };
        let mut right = VecStream {
            blocks: VecDeque::from([int_block(vec![4])]),
        };
        loop {
            temp.fetch_streams(&mut left, &mut right).expect("fetch");
            if temp.status() != BootstrapStatus::Unknown {
                break;
            }
        }
        assert_eq!(temp.status(), BootstrapStatus::BothStreamsFinished);
        assert_eq!(temp.fetched_tuples(), (3, 1));
        let (left_data, right_data) = temp.detach_data();
        assert_eq!(left_data.len(), 2);
        assert_eq!(right_data.len(), 1);
    }

    #[test]
    fn one_heavy_side_stops_at_the_budget() {
        // A packed Int32 key row is 5 bytes: the left side ends under
        // the budget, the right side exceeds it on its first block.
        let mut temp = storage(Arc::new(TinyBudgetPolicy(16)));
        let mut left = VecStream {
            blocks: VecDeque::from([int_block(vec![1])]),
        };
        let mut right = VecStream {
            blocks: VecDeque::from([
                int_block(vec![1, 2, 3, 4]),
                int_block(vec![5, 6, 7, 8]),
            ]),
        };
        loop {
            temp.fetch_streams(&mut left, &mut right).expect("fetch");
            if temp.status() != BootstrapStatus::Unknown {
                break;
            }
        }
        assert_eq!(temp.status(), BootstrapStatus::OneStreamFinished);
        assert_eq!(temp.is_finished(), (true, false));
        // Only one right block was pulled before the budget tripped.
        let (_, right_data) = temp.detach_data();
        assert_eq!(right_data.len(), 1);
    }

    #[test]
    fn sampling_feeds_the_cardinality_estimate() {
        let mut temp = storage(Arc::new(TinyBudgetPolicy(1 << 20)));
        let mut left = VecStream {
            blocks: VecDeque::from([int_block((0..500).collect())]),
        };
        let mut right = VecStream {
            blocks: VecDeque::from([int_block((0..500).collect())]),
        };
        loop {
            temp.fetch_streams(&mut left, &mut right).expect("fetch");
            if temp.status() != BootstrapStatus::Unknown {
                break;
            }
        }
        let estimate = temp.estimate_cardinality();
        assert!(estimate >= 1);
        assert!(estimate <= 1000);
    }
}
