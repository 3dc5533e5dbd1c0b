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
//! Bootstrap cardinality sketch over sampled key hashes.
//!
//! The estimate is deliberately rough: it feeds the payload-indirection
//! policy with an estimated duplicate multiplicity, nothing else.

use hashbrown::HashSet;

/// Estimates the number of distinct join keys from stride-sampled key
/// hashes of both sides. Samples carrying the zero null sentinel are
/// ignored.
pub struct CardinalityEstimator {
    buckets: usize,
}

impl CardinalityEstimator {
    pub fn new(buckets: usize) -> Self {
        Self {
            buckets: buckets.max(1),
        }
    }

    /// Ratio-scaled distinct count: the distinct fraction observed in
    /// the samples, scaled to the full tuple population. Bucketing
    /// bounds the per-set memory for large sample vectors.
    pub fn estimate(
        &self,
        l_tuples: usize,
        l_samples: &[u64],
        r_tuples: usize,
        r_samples: &[u64],
    ) -> u64 {
        let total_tuples = (l_tuples + r_tuples) as u64;
        let mut sampled = 0u64;
        let mut distinct = 0u64;

        let mut seen: Vec<HashSet<u64>> = (0..self.buckets).map(|_| HashSet::new()).collect();
        for &sample in l_samples.iter().chain(r_samples.iter()) {
            if sample == 0 {
                continue;
            }
            sampled += 1;
            if seen[(sample % self.buckets as u64) as usize].insert(sample) {
                distinct += 1;
            }
        }

        if sampled == 0 {
            return 1;
        }
        (distinct * total_tuples / sampled).clamp(1, total_tuples.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::CardinalityEstimator;

    #[test]
    fn all_distinct_samples_estimate_full_population() {
        let samples: Vec<u64> = (1..=100).collect();
        let estimator = CardinalityEstimator::new(4);
        let estimate = estimator.estimate(10_000, &samples, 10_000, &[]);
        assert_eq!(estimate, 20_000);
    }

    #[test]
    fn repeated_samples_shrink_the_estimate() {
        let samples: Vec<u64> = (0..100).map(|i| 1 + i % 10).collect();
        let estimator = CardinalityEstimator::new(4);
        let estimate = estimator.estimate(10_000, &samples, 0, &[]);
        assert_eq!(estimate, 1_000);
    }

    #[test]
    fn null_sentinels_are_ignored() {
        let estimator = CardinalityEstimator::new(1);
        assert_eq!(estimator.estimate(100, &[0, 0, 0], 100, &[]), 1);
    }
}
