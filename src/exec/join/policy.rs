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
//! Tuning policy consulted by the adaptive join operator.

use std::sync::{Arc, OnceLock};

/// Sentinel tuple count for a side whose stream was not drained during
/// bootstrap.
pub const STREAM_NOT_FETCHED: usize = usize::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinAlgo {
    HashJoin,
    InMemoryGraceJoin,
}

/// External knobs for the adaptive join. Implementations must be cheap:
/// every method may be called on the hot path of algorithm selection.
pub trait GraceJoinPolicy: Send + Sync {
    /// Bootstrap byte budget per input side. Fetching stops on a side
    /// once its estimated packed size exceeds this.
    fn maximum_initially_fetched_data(&self) -> usize;

    /// Choose the join algorithm from the bootstrapped tuple counts.
    /// `STREAM_NOT_FETCHED` marks a side that did not finish; the pick
    /// must be `HashJoin` then, because partition spilling is not
    /// implemented.
    fn pick_algorithm(&self, l_tuples: usize, r_tuples: usize) -> JoinAlgo;

    /// Whether a side's payload columns should be parked in external
    /// storage and replaced by an indirection index on the hot path.
    fn use_external_payload(
        &self,
        algo: JoinAlgo,
        payload_bytes_per_tuple: usize,
        estimated_multiplicity: usize,
    ) -> bool;
}

/// Process-default policy.
#[derive(Debug, Default)]
pub struct DefaultGraceJoinPolicy;

impl DefaultGraceJoinPolicy {
    /// Bootstrap budget per side.
    const MAX_INITIALLY_FETCHED_DATA: usize = 64 << 20;
    /// Largest build side for which one monolithic hash table is still
    /// expected to probe well.
    const HASH_JOIN_MAX_BUILD_TUPLES: usize = 128 << 10;
    /// Payload width from which indirection starts to pay off.
    const EXTERNAL_PAYLOAD_MIN_BYTES: usize = 64;
    /// Duplicate multiplicity from which indirection starts to pay off.
    const EXTERNAL_PAYLOAD_MIN_MULTIPLICITY: usize = 4;
}

impl GraceJoinPolicy for DefaultGraceJoinPolicy {
    fn maximum_initially_fetched_data(&self) -> usize {
        Self::MAX_INITIALLY_FETCHED_DATA
    }

    fn pick_algorithm(&self, l_tuples: usize, r_tuples: usize) -> JoinAlgo {
        if l_tuples == STREAM_NOT_FETCHED || r_tuples == STREAM_NOT_FETCHED {
            return JoinAlgo::HashJoin;
        }
        if l_tuples.min(r_tuples) <= Self::HASH_JOIN_MAX_BUILD_TUPLES {
            JoinAlgo::HashJoin
        } else {
            JoinAlgo::InMemoryGraceJoin
        }
    }

    fn use_external_payload(
        &self,
        _algo: JoinAlgo,
        payload_bytes_per_tuple: usize,
        estimated_multiplicity: usize,
    ) -> bool {
        payload_bytes_per_tuple >= Self::EXTERNAL_PAYLOAD_MIN_BYTES
            && estimated_multiplicity >= Self::EXTERNAL_PAYLOAD_MIN_MULTIPLICITY
    }
}

/// The process-wide default policy, used when the operator is built
/// without an explicit one.
pub fn default_policy() -> Arc<dyn GraceJoinPolicy> {
    static DEFAULT: OnceLock<Arc<DefaultGraceJoinPolicy>> = OnceLock::new();
    let policy: Arc<DefaultGraceJoinPolicy> =
        Arc::clone(DEFAULT.get_or_init(|| Arc::new(DefaultGraceJoinPolicy)));
    policy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_side_forces_hash_join() {
        let policy = DefaultGraceJoinPolicy;
        assert_eq!(
            policy.pick_algorithm(STREAM_NOT_FETCHED, 1 << 30),
            JoinAlgo::HashJoin
        );
        assert_eq!(
            policy.pick_algorithm(1 << 30, STREAM_NOT_FETCHED),
            JoinAlgo::HashJoin
        );
    }

    #[test]
    fn large_balanced_sides_pick_grace() {
        let policy = DefaultGraceJoinPolicy;
        assert_eq!(policy.pick_algorithm(100, 1 << 24), JoinAlgo::HashJoin);
        assert_eq!(
            policy.pick_algorithm(1 << 20, 1 << 24),
            JoinAlgo::InMemoryGraceJoin
        );
    }

    #[test]
    fn external_payload_needs_wide_rows_and_duplicates() {
        let policy = DefaultGraceJoinPolicy;
        assert!(!policy.use_external_payload(JoinAlgo::HashJoin, 8, 100));
        assert!(!policy.use_external_payload(JoinAlgo::HashJoin, 1024, 1));
        assert!(policy.use_external_payload(JoinAlgo::HashJoin, 1024, 8));
    }
}
