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
//! Adaptive join operator and its construction contract.
//!
//! Responsibilities:
//! - Validates the nine construction arguments: streams, join kind,
//!   key and key-drop column sets, the reserved right-any flag, and
//!   the optional policy.
//! - Drives the start state machine: bootstrap both inputs, pick the
//!   algorithm through the policy, then forward every fetch to the
//!   committed join.
//!
//! Key exported interfaces:
//! - Types: `BlockGraceJoin`, `BlockGraceJoinArgs`, `JoinKind`.
//!
//! Current limitations:
//! - The disk-spilling grace mode is reserved: a bootstrap that ends
//!   with both sides over budget surfaces an explicit runtime error
//!   instead of falling back.

use std::mem;
use std::sync::Arc;
use std::time::Instant;

use arrow::datatypes::DataType;
use hashbrown::HashSet;
use tracing::debug;

use crate::exec::block::{BlockFetch, BlockStream, FetchStatus};
use crate::exec::join::hash_join::HashJoin;
use crate::exec::join::in_memory_grace_join::InMemoryGraceJoin;
use crate::exec::join::join_side::JoinSideArgs;
use crate::exec::join::policy::{GraceJoinPolicy, JoinAlgo, STREAM_NOT_FETCHED, default_policy};
use crate::exec::join::temp_join_storage::{BootstrapStatus, TempJoinStorage};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::resource_meter::global_resource_meter;

const JOIN_NAME: &str = "BlockGraceJoin";
const HASH_JOIN_NAME: &str = "BlockGraceJoin::HashJoin";
const GRACE_JOIN_NAME: &str = "BlockGraceJoin::InMemoryGraceJoin";

/// Join kinds understood by the operator family. This prototype
/// implements only the inner join.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum JoinKind {
    Inner = 1,
}

impl JoinKind {
    pub fn try_from_raw(raw: u32) -> Result<Self, String> {
        match raw {
            1 => Ok(Self::Inner),
            other => Err(format!(
                "only inner join is supported by the block grace join (kind={other})"
            )),
        }
    }
}

/// The nine construction arguments, in wire order.
pub struct BlockGraceJoinArgs {
    pub left_stream: Box<dyn BlockStream>,
    /// Column item types of the left wide stream, without the trailing
    /// block length scalar.
    pub left_item_types: Vec<DataType>,
    pub right_stream: Box<dyn BlockStream>,
    pub right_item_types: Vec<DataType>,
    pub join_kind: u32,
    pub left_key_columns: Vec<u32>,
    /// Key columns to drop from the output; must be a subset of
    /// `left_key_columns`.
    pub left_key_drops: Vec<u32>,
    pub right_key_columns: Vec<u32>,
    pub right_key_drops: Vec<u32>,
    /// Reserved.
    pub right_any: bool,
    /// Falls back to the process default when absent.
    pub policy: Option<Arc<dyn GraceJoinPolicy>>,
}

enum Mode {
    Start {
        temp: TempJoinStorage,
        left_stream: Box<dyn BlockStream>,
        right_stream: Box<dyn BlockStream>,
    },
    HashJoin(HashJoin),
    InMemoryGraceJoin(InMemoryGraceJoin),
    /// Transient placeholder while ownership moves between states.
    Detached,
}

/// Adaptive block-oriented inner equi-join operator. Emits the kept
/// left columns followed by the kept right columns, in source order
/// with key drops skipped, regardless of any internal build/probe swap.
pub struct BlockGraceJoin {
    join_name: &'static str,
    mode: Mode,

    result_item_types: Vec<DataType>,
    left_item_types: Vec<DataType>,
    left_key_columns: Vec<u32>,
    left_io_map: Vec<u32>,
    right_item_types: Vec<DataType>,
    right_key_columns: Vec<u32>,
    right_io_map: Vec<u32>,

    policy: Arc<dyn GraceJoinPolicy>,
    tracker: Arc<MemTracker>,
}

impl BlockGraceJoin {
    pub fn try_new(args: BlockGraceJoinArgs) -> Result<Self, String> {
        JoinKind::try_from_raw(args.join_kind)?;
        if args.left_item_types.is_empty() || args.right_item_types.is_empty() {
            return Err("both input streams must carry at least one column".to_string());
        }
        if args.left_key_columns.is_empty() {
            return Err("join requires at least one key column".to_string());
        }
        if args.left_key_columns.len() != args.right_key_columns.len() {
            return Err(format!(
                "key columns mismatch: left has {}, right has {}",
                args.left_key_columns.len(),
                args.right_key_columns.len()
            ));
        }
        validate_key_columns(&args.left_key_columns, args.left_item_types.len(), "left")?;
        validate_key_columns(&args.right_key_columns, args.right_item_types.len(), "right")?;
        validate_key_drops(&args.left_key_drops, &args.left_key_columns, "left")?;
        validate_key_drops(&args.right_key_drops, &args.right_key_columns, "right")?;
        for (l, r) in args
            .left_key_columns
            .iter()
            .zip(args.right_key_columns.iter())
        {
            let lt = &args.left_item_types[*l as usize];
            let rt = &args.right_item_types[*r as usize];
            if lt != rt {
                return Err(format!(
                    "key item type mismatch: left column {l} is {lt}, right column {r} is {rt}"
                ));
            }
        }

        let left_io_map = io_map(args.left_item_types.len(), &args.left_key_drops);
        let right_io_map = io_map(args.right_item_types.len(), &args.right_key_drops);
        let mut result_item_types =
            Vec::with_capacity(left_io_map.len() + right_io_map.len());
        for &idx in &left_io_map {
            result_item_types.push(args.left_item_types[idx as usize].clone());
        }
        for &idx in &right_io_map {
            result_item_types.push(args.right_item_types[idx as usize].clone());
        }

        let policy = args.policy.unwrap_or_else(default_policy);
        let tracker = MemTracker::new_root(JOIN_NAME);
        let temp = TempJoinStorage::new(
            &args.left_item_types,
            &args.left_key_columns,
            &args.right_item_types,
            &args.right_key_columns,
            Arc::clone(&policy),
            &tracker,
        )?;

        Ok(Self {
            join_name: JOIN_NAME,
            mode: Mode::Start {
                temp,
                left_stream: args.left_stream,
                right_stream: args.right_stream,
            },
            result_item_types,
            left_item_types: args.left_item_types,
            left_key_columns: args.left_key_columns,
            left_io_map,
            right_item_types: args.right_item_types,
            right_key_columns: args.right_key_columns,
            right_io_map,
            policy,
            tracker,
        })
    }

    /// Item types of the emitted wide stream, without the trailing
    /// length scalar.
    pub fn result_item_types(&self) -> &[DataType] {
        &self.result_item_types
    }

    fn fetch_inner(&mut self) -> Result<BlockFetch, String> {
        loop {
            match &mut self.mode {
                Mode::Start {
                    temp,
                    left_stream,
                    right_stream,
                } => {
                    loop {
                        let status =
                            temp.fetch_streams(left_stream.as_mut(), right_stream.as_mut())?;
                        if status == FetchStatus::Yield {
                            return Ok(BlockFetch::Yield);
                        }
                        if temp.status() != BootstrapStatus::Unknown {
                            break;
                        }
                    }
                }
                Mode::HashJoin(join) => {
                    return match join.do_probe()? {
                        FetchStatus::Ok => join
                            .fill_output()
                            .map(BlockFetch::Block)
                            .ok_or_else(|| "hash join reported output but none is pending".to_string()),
                        FetchStatus::Yield => Ok(BlockFetch::Yield),
                        FetchStatus::Finish => Ok(BlockFetch::Finished),
                    };
                }
                Mode::InMemoryGraceJoin(join) => {
                    return match join.do_probe()? {
                        FetchStatus::Ok => join
                            .fill_output()
                            .map(BlockFetch::Block)
                            .ok_or_else(|| "grace join reported output but none is pending".to_string()),
                        FetchStatus::Yield => Ok(BlockFetch::Yield),
                        FetchStatus::Finish => Ok(BlockFetch::Finished),
                    };
                }
                Mode::Detached => {
                    return Err("join operator mode detached during transition".to_string());
                }
            }
            // Only the start state falls through: commit to an
            // algorithm, then resume the loop in the new mode.
            self.select_algorithm()?;
        }
    }

    fn select_algorithm(&mut self) -> Result<(), String> {
        let Mode::Start {
            mut temp,
            left_stream,
            right_stream,
        } = mem::replace(&mut self.mode, Mode::Detached)
        else {
            return Err("algorithm selection outside the start state".to_string());
        };

        let status = temp.status();
        let (l_tuples, r_tuples) = temp.fetched_tuples();
        let (left_finished, right_finished) = temp.is_finished();
        let cardinality = temp.estimate_cardinality();

        let algo = match status {
            BootstrapStatus::BothStreamsFinished => self.policy.pick_algorithm(l_tuples, r_tuples),
            BootstrapStatus::OneStreamFinished => {
                let (l, r) = if left_finished {
                    (l_tuples, STREAM_NOT_FETCHED)
                } else {
                    (STREAM_NOT_FETCHED, r_tuples)
                };
                let algo = self.policy.pick_algorithm(l, r);
                if algo != JoinAlgo::HashJoin {
                    return Err(
                        "grace hash join with partition spilling is not implemented".to_string()
                    );
                }
                algo
            }
            BootstrapStatus::MemoryLimitExceeded => {
                return Err(format!(
                    "both sides exceeded the bootstrap memory budget of {} bytes; \
                     grace hash join with partition spilling is not implemented",
                    self.policy.maximum_initially_fetched_data()
                ));
            }
            BootstrapStatus::Unknown => {
                return Err("algorithm selection with unknown bootstrap status".to_string());
            }
        };

        debug!(
            "block grace join picked {:?}: left_tuples={} right_tuples={} \
             left_finished={} right_finished={} cardinality={}",
            algo, l_tuples, r_tuples, left_finished, right_finished, cardinality
        );

        let (left_data, right_data) = temp.detach_data();
        let left = JoinSideArgs {
            item_types: self.left_item_types.clone(),
            key_columns: self.left_key_columns.clone(),
            data: left_data,
            fetched_tuples: l_tuples,
            finished: left_finished,
        };
        let right = JoinSideArgs {
            item_types: self.right_item_types.clone(),
            key_columns: self.right_key_columns.clone(),
            data: right_data,
            fetched_tuples: r_tuples,
            finished: right_finished,
        };

        match algo {
            JoinAlgo::HashJoin => {
                let mut join = HashJoin::try_new(
                    HASH_JOIN_NAME,
                    &self.result_item_types,
                    left,
                    left_stream,
                    right,
                    right_stream,
                    self.left_io_map.clone(),
                    self.right_io_map.clone(),
                    self.policy.as_ref(),
                    cardinality,
                    &self.tracker,
                )?;
                join.build_index()?;
                global_resource_meter().merge_history_pages(self.join_name, HASH_JOIN_NAME);
                self.join_name = HASH_JOIN_NAME;
                self.mode = Mode::HashJoin(join);
            }
            JoinAlgo::InMemoryGraceJoin => {
                let join = InMemoryGraceJoin::try_new(
                    GRACE_JOIN_NAME,
                    &self.result_item_types,
                    left,
                    right,
                    self.left_io_map.clone(),
                    self.right_io_map.clone(),
                    self.policy.as_ref(),
                    cardinality,
                    &self.tracker,
                )?;
                global_resource_meter().merge_history_pages(self.join_name, GRACE_JOIN_NAME);
                self.join_name = GRACE_JOIN_NAME;
                self.mode = Mode::InMemoryGraceJoin(join);
            }
        }
        Ok(())
    }
}

impl BlockStream for BlockGraceJoin {
    fn fetch(&mut self) -> Result<BlockFetch, String> {
        let begin = Instant::now();
        let result = self.fetch_inner();
        let meter = global_resource_meter();
        meter.update_spent_time(self.join_name, begin.elapsed().as_micros() as u64);
        meter.update_consumed_memory(self.join_name, self.tracker.current());
        result
    }
}

fn validate_key_columns(
    key_columns: &[u32],
    column_count: usize,
    side: &str,
) -> Result<(), String> {
    let mut seen = HashSet::new();
    for &key in key_columns {
        if key as usize >= column_count {
            return Err(format!(
                "{side} key column {key} out of range (columns={column_count})"
            ));
        }
        if !seen.insert(key) {
            return Err(format!("{side} key column {key} listed twice"));
        }
    }
    Ok(())
}

fn validate_key_drops(drops: &[u32], key_columns: &[u32], side: &str) -> Result<(), String> {
    let keys: HashSet<u32> = key_columns.iter().copied().collect();
    for drop in drops {
        if !keys.contains(drop) {
            return Err(format!(
                "{side} key drop {drop}: only key columns may be dropped"
            ));
        }
    }
    Ok(())
}

fn io_map(column_count: usize, drops: &[u32]) -> Vec<u32> {
    let drop_set: HashSet<u32> = drops.iter().copied().collect();
    (0..column_count as u32)
        .filter(|idx| !drop_set.contains(idx))
        .collect()
}
