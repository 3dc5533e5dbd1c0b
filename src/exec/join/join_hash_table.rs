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
//! Build-once / probe-many hash table over packed tuples.
//!
//! Responsibilities:
//! - Indexes the build side's packed tuples by composite key hash, with
//!   duplicate keys chained through row links.
//! - Serves batched probing: `find` resolves a probe tuple to an
//!   iterator, `next_match` drains the chain one build tuple at a time.
//!
//! Key exported interfaces:
//! - Types: `JoinHashTable`, `MatchIter`.
//!
//! Current limitations:
//! - The table never owns the build data; callers must pass the same
//!   `PackResult` the table was built over, which is immutable for the
//!   table's lifetime by the join state invariants.

use std::sync::Arc;

use hashbrown::raw::RawTable;

use crate::exec::packed_tuple::converter::PackResult;
use crate::exec::packed_tuple::layout::TupleLayout;

const ROW_NONE: u32 = u32::MAX;

#[derive(Clone, Copy, Debug)]
struct TableEntry {
    hash: u64,
    head: u32,
}

/// Cursor over the build rows matching one probe tuple.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MatchIter {
    next: u32,
}

impl MatchIter {
    pub(crate) fn empty() -> Self {
        Self { next: ROW_NONE }
    }
}

impl Default for MatchIter {
    fn default() -> Self {
        Self::empty()
    }
}

pub(crate) struct JoinHashTable {
    layout: Option<Arc<TupleLayout>>,
    stride: usize,
    table: RawTable<TableEntry>,
    row_next: Vec<u32>,
}

impl JoinHashTable {
    pub(crate) fn new() -> Self {
        Self {
            layout: None,
            stride: 0,
            table: RawTable::new(),
            row_next: Vec::new(),
        }
    }

    /// Point the table at the build side's layout. Must precede `build`;
    /// the grace join re-points it per bucket.
    pub(crate) fn set_layout(&mut self, layout: Arc<TupleLayout>) {
        self.stride = layout.total_row_size;
        self.layout = Some(layout);
    }

    /// Index `build`. Rows with a null key component are skipped: they
    /// can never match an inner-join probe.
    pub(crate) fn build(&mut self, build: &PackResult) -> Result<(), String> {
        let layout = Arc::clone(
            self.layout
                .as_ref()
                .ok_or_else(|| "join hash table layout not set before build".to_string())?,
        );
        let stride = layout.total_row_size;
        let n_tuples = build.n_tuples;
        if build.packed_tuples.len() < n_tuples * stride {
            return Err(format!(
                "build pack too short: {} bytes for {} tuples of {} bytes",
                build.packed_tuples.len(),
                n_tuples,
                stride
            ));
        }
        if n_tuples > ROW_NONE as usize {
            return Err("join build row count overflow".to_string());
        }

        self.table.clear();
        self.row_next.clear();
        self.row_next.resize(n_tuples, ROW_NONE);
        if self.table.capacity() < n_tuples {
            self.table = RawTable::with_capacity(n_tuples);
        }

        for row in 0..n_tuples {
            let tuple = build.tuple(row, stride);
            if layout.key_has_null(tuple) {
                continue;
            }
            let hash = layout.key_hash(tuple, &build.overflow);
            let found = self.table.find_or_find_insert_slot(
                hash,
                |entry| {
                    let head = build.tuple(entry.head as usize, stride);
                    layout.keys_equal(head, &build.overflow, &layout, tuple, &build.overflow)
                },
                |entry| entry.hash,
            );
            match found {
                Ok(bucket) => {
                    let entry = unsafe { bucket.as_mut() };
                    self.row_next[row] = entry.head;
                    entry.head = row as u32;
                }
                Err(slot) => unsafe {
                    self.table.insert_in_slot(
                        hash,
                        slot,
                        TableEntry {
                            hash,
                            head: row as u32,
                        },
                    );
                },
            }
        }
        Ok(())
    }

    /// Resolve one probe tuple to its match chain. `build` must be the
    /// pack the table was built over.
    pub(crate) fn find(
        &self,
        probe_tuple: &[u8],
        probe_overflow: &[u8],
        probe_layout: &TupleLayout,
        build: &PackResult,
    ) -> MatchIter {
        let Some(build_layout) = self.layout.as_ref() else {
            return MatchIter::empty();
        };
        if probe_layout.key_has_null(probe_tuple) {
            return MatchIter::empty();
        }
        let hash = probe_layout.key_hash(probe_tuple, probe_overflow);
        let entry = self.table.get(hash, |entry| {
            let build_tuple = build.tuple(entry.head as usize, self.stride);
            probe_layout.keys_equal(
                probe_tuple,
                probe_overflow,
                build_layout,
                build_tuple,
                &build.overflow,
            )
        });
        MatchIter {
            next: entry.map(|e| e.head).unwrap_or(ROW_NONE),
        }
    }

    /// Next matching build tuple, or `None` when the chain is drained.
    pub(crate) fn next_match<'a>(
        &self,
        it: &mut MatchIter,
        build: &'a PackResult,
    ) -> Option<&'a [u8]> {
        if it.next == ROW_NONE {
            return None;
        }
        let row = it.next as usize;
        it.next = self.row_next.get(row).copied().unwrap_or(ROW_NONE);
        Some(build.tuple(row, self.stride))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::packed_tuple::converter::TupleConverter;
    use arrow::array::{ArrayRef, Int32Array, StringArray};
    use arrow::datatypes::DataType;

    fn pack_block(keys: Vec<Option<i32>>, payloads: Vec<&str>) -> (Arc<TupleLayout>, PackResult) {
        let layout = Arc::new(
            TupleLayout::describe(&[DataType::Int32, DataType::Utf8], &[0]).expect("layout"),
        );
        let converter = TupleConverter::new(Arc::clone(&layout));
        let num_rows = keys.len();
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Int32Array::from(keys)),
            Arc::new(StringArray::from(payloads)),
        ];
        let mut pack = PackResult::default();
        converter.pack(&columns, num_rows, &mut pack).expect("pack");
        (layout, pack)
    }

    #[test]
    fn duplicate_keys_chain_and_drain() {
        let (layout, build) = pack_block(
            vec![Some(1), Some(2), Some(1)],
            vec!["a", "b", "c"],
        );
        let mut table = JoinHashTable::new();
        table.set_layout(Arc::clone(&layout));
        table.build(&build).expect("build");

        let (probe_layout, probe) = pack_block(vec![Some(1)], vec!["p"]);
        let mut it = table.find(probe.tuple(0, probe_layout.total_row_size), &probe.overflow, &probe_layout, &build);
        let mut matched = Vec::new();
        while let Some(tuple) = table.next_match(&mut it, &build) {
            matched.push(tuple.to_vec());
        }
        assert_eq!(matched.len(), 2);
        // Chain heads are the most recently inserted duplicate.
        assert_eq!(matched[0], build.tuple(2, layout.total_row_size));
        assert_eq!(matched[1], build.tuple(0, layout.total_row_size));
    }

    #[test]
    fn null_keys_never_match() {
        let (layout, build) = pack_block(vec![None, Some(5)], vec!["a", "b"]);
        let mut table = JoinHashTable::new();
        table.set_layout(Arc::clone(&layout));
        table.build(&build).expect("build");

        let (probe_layout, probe) = pack_block(vec![None, Some(5)], vec!["x", "y"]);
        let it = table.find(
            probe.tuple(0, probe_layout.total_row_size),
            &probe.overflow,
            &probe_layout,
            &build,
        );
        assert_eq!(it.next, ROW_NONE);

        let mut it = table.find(
            probe.tuple(1, probe_layout.total_row_size),
            &probe.overflow,
            &probe_layout,
            &build,
        );
        assert!(table.next_match(&mut it, &build).is_some());
        assert!(table.next_match(&mut it, &build).is_none());
    }

    #[test]
    fn missing_keys_yield_empty_iterators() {
        let (layout, build) = pack_block(vec![Some(1)], vec!["a"]);
        let mut table = JoinHashTable::new();
        table.set_layout(Arc::clone(&layout));
        table.build(&build).expect("build");

        let (probe_layout, probe) = pack_block(vec![Some(9)], vec!["x"]);
        let mut it = table.find(
            probe.tuple(0, probe_layout.total_row_size),
            &probe.overflow,
            &probe_layout,
            &build,
        );
        assert!(table.next_match(&mut it, &build).is_none());
    }
}
