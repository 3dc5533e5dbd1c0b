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
//! End-to-end scenarios for the adaptive block join operator.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow::array::{Array, ArrayRef, Int32Array, StringArray};
use arrow::datatypes::DataType;

use block_grace_join::{
    Block, BlockFetch, BlockGraceJoin, BlockGraceJoinArgs, BlockStream, GraceJoinPolicy, JoinAlgo,
    JoinKind,
};

// ---------------------------------------------------------------
// Harness

struct VecBlockStream {
    blocks: VecDeque<Block>,
    yield_between: bool,
    pending_yield: bool,
}

impl VecBlockStream {
    fn new(blocks: Vec<Block>) -> Self {
        Self {
            blocks: blocks.into(),
            yield_between: false,
            pending_yield: false,
        }
    }

    fn yielding(blocks: Vec<Block>) -> Self {
        Self {
            blocks: blocks.into(),
            yield_between: true,
            pending_yield: true,
        }
    }
}

impl BlockStream for VecBlockStream {
    fn fetch(&mut self) -> Result<BlockFetch, String> {
        if self.yield_between && self.pending_yield {
            self.pending_yield = false;
            return Ok(BlockFetch::Yield);
        }
        self.pending_yield = true;
        Ok(match self.blocks.pop_front() {
            Some(block) => BlockFetch::Block(block),
            None => BlockFetch::Finished,
        })
    }
}

struct TestPolicy {
    max_fetched: usize,
    algo: JoinAlgo,
    external_payload: bool,
    payload_consulted: AtomicBool,
}

impl TestPolicy {
    fn new(algo: JoinAlgo) -> Self {
        Self {
            max_fetched: 1 << 30,
            algo,
            external_payload: false,
            payload_consulted: AtomicBool::new(false),
        }
    }
}

impl GraceJoinPolicy for TestPolicy {
    fn maximum_initially_fetched_data(&self) -> usize {
        self.max_fetched
    }

    fn pick_algorithm(&self, _l_tuples: usize, _r_tuples: usize) -> JoinAlgo {
        self.algo
    }

    fn use_external_payload(
        &self,
        _algo: JoinAlgo,
        _payload_bytes_per_tuple: usize,
        _estimated_multiplicity: usize,
    ) -> bool {
        self.payload_consulted.store(true, Ordering::Relaxed);
        self.external_payload
    }
}

fn int_utf8_block(keys: Vec<Option<i32>>, payloads: Vec<Option<&str>>) -> Block {
    let len = keys.len();
    assert_eq!(len, payloads.len());
    Block::new(
        vec![
            Arc::new(Int32Array::from(keys)) as ArrayRef,
            Arc::new(StringArray::from(payloads)) as ArrayRef,
        ],
        len,
    )
}

fn int_int_block(keys: Vec<i32>, payloads: Vec<i32>) -> Block {
    let len = keys.len();
    Block::new(
        vec![
            Arc::new(Int32Array::from(keys)) as ArrayRef,
            Arc::new(Int32Array::from(payloads)) as ArrayRef,
        ],
        len,
    )
}

fn join_args(
    left: Vec<Block>,
    right: Vec<Block>,
    left_types: Vec<DataType>,
    right_types: Vec<DataType>,
) -> BlockGraceJoinArgs {
    BlockGraceJoinArgs {
        left_stream: Box::new(VecBlockStream::new(left)),
        left_item_types: left_types,
        right_stream: Box::new(VecBlockStream::new(right)),
        right_item_types: right_types,
        join_kind: JoinKind::Inner as u32,
        left_key_columns: vec![0],
        left_key_drops: vec![],
        right_key_columns: vec![0],
        right_key_drops: vec![0],
        right_any: false,
        policy: None,
    }
}

fn drain(join: &mut BlockGraceJoin) -> Vec<Block> {
    let mut blocks = Vec::new();
    for _ in 0..1_000_000 {
        match join.fetch().expect("fetch") {
            BlockFetch::Block(block) => {
                // The emitted wide form carries the length scalar last.
                let wide = block.to_wide();
                let restored = Block::try_from_wide(wide).expect("wide round trip");
                assert_eq!(restored.num_rows, block.num_rows);
                blocks.push(block);
            }
            BlockFetch::Yield => continue,
            BlockFetch::Finished => return blocks,
        }
    }
    panic!("join did not finish");
}

fn int_at(block: &Block, col: usize) -> &Int32Array {
    block.columns[col]
        .as_any()
        .downcast_ref::<Int32Array>()
        .expect("int32 column")
}

fn str_at(block: &Block, col: usize) -> &StringArray {
    block.columns[col]
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("utf8 column")
}

/// Rows of (key, left payload, right payload) from blocks shaped by
/// the default arg set: left kept in full, right key dropped.
fn collect_kls(blocks: &[Block]) -> Vec<(i32, String, String)> {
    let mut rows = Vec::new();
    for block in blocks {
        assert_eq!(block.columns.len(), 3);
        let keys = int_at(block, 0);
        let left = str_at(block, 1);
        let right = str_at(block, 2);
        for row in 0..block.num_rows {
            rows.push((
                keys.value(row),
                left.value(row).to_string(),
                right.value(row).to_string(),
            ));
        }
    }
    rows
}

// ---------------------------------------------------------------
// Scenario suite

#[test]
fn tiny_exact_join() {
    block_grace_join::common::logging::init_with_level("info");
    let left = vec![int_utf8_block(
        vec![Some(1), Some(2), Some(3)],
        vec![Some("a"), Some("b"), Some("c")],
    )];
    let right = vec![int_utf8_block(
        vec![Some(2), Some(3), Some(4)],
        vec![Some("x"), Some("y"), Some("z")],
    )];
    let mut join = BlockGraceJoin::try_new(join_args(
        left,
        right,
        vec![DataType::Int32, DataType::Utf8],
        vec![DataType::Int32, DataType::Utf8],
    ))
    .expect("join");

    let rows = collect_kls(&drain(&mut join));
    assert_eq!(
        rows,
        vec![
            (2, "b".to_string(), "x".to_string()),
            (3, "c".to_string(), "y".to_string()),
        ]
    );
}

#[test]
fn duplicate_keys_emit_the_cross_product() {
    let left = vec![int_utf8_block(
        vec![Some(1), Some(1)],
        vec![Some("a"), Some("b")],
    )];
    let right = vec![int_utf8_block(
        vec![Some(1), Some(1)],
        vec![Some("x"), Some("y")],
    )];
    let mut join = BlockGraceJoin::try_new(join_args(
        left,
        right,
        vec![DataType::Int32, DataType::Utf8],
        vec![DataType::Int32, DataType::Utf8],
    ))
    .expect("join");

    let mut rows = collect_kls(&drain(&mut join));
    rows.sort();
    assert_eq!(
        rows,
        vec![
            (1, "a".to_string(), "x".to_string()),
            (1, "a".to_string(), "y".to_string()),
            (1, "b".to_string(), "x".to_string()),
            (1, "b".to_string(), "y".to_string()),
        ]
    );
}

#[test]
fn null_keys_never_match() {
    let left = vec![int_utf8_block(
        vec![None, Some(1)],
        vec![Some("a"), Some("b")],
    )];
    let right = vec![int_utf8_block(
        vec![None, Some(1)],
        vec![Some("x"), Some("y")],
    )];
    let mut join = BlockGraceJoin::try_new(join_args(
        left,
        right,
        vec![DataType::Int32, DataType::Utf8],
        vec![DataType::Int32, DataType::Utf8],
    ))
    .expect("join");

    let rows = collect_kls(&drain(&mut join));
    assert_eq!(rows, vec![(1, "b".to_string(), "y".to_string())]);
}

#[test]
fn all_null_keys_produce_no_output() {
    let left = vec![int_utf8_block(vec![None, None], vec![Some("a"), Some("b")])];
    let right = vec![int_utf8_block(vec![None], vec![Some("x")])];
    let mut join = BlockGraceJoin::try_new(join_args(
        left,
        right,
        vec![DataType::Int32, DataType::Utf8],
        vec![DataType::Int32, DataType::Utf8],
    ))
    .expect("join");
    assert!(drain(&mut join).is_empty());
}

#[test]
fn bucketed_path_matches_per_key_products() {
    const ROWS: i32 = 200_000;
    const DISTINCT: i32 = 100_000;
    const BLOCK: usize = 8_192;

    let make_side = || {
        let mut blocks = Vec::new();
        let mut keys = Vec::with_capacity(BLOCK);
        let mut payloads = Vec::with_capacity(BLOCK);
        for i in 0..ROWS {
            keys.push(i % DISTINCT);
            payloads.push(i);
            if keys.len() == BLOCK {
                blocks.push(int_int_block(
                    std::mem::take(&mut keys),
                    std::mem::take(&mut payloads),
                ));
            }
        }
        if !keys.is_empty() {
            blocks.push(int_int_block(keys, payloads));
        }
        blocks
    };

    let policy = Arc::new(TestPolicy::new(JoinAlgo::InMemoryGraceJoin));
    let mut args = join_args(
        make_side(),
        make_side(),
        vec![DataType::Int32, DataType::Int32],
        vec![DataType::Int32, DataType::Int32],
    );
    args.right_key_drops = vec![];
    args.policy = Some(policy);
    let mut join = BlockGraceJoin::try_new(args).expect("join");

    let blocks = drain(&mut join);
    let mut total_rows = 0usize;
    let mut key_counts = vec![0u32; DISTINCT as usize];
    for block in &blocks {
        assert_eq!(block.columns.len(), 4);
        let left_keys = int_at(block, 0);
        let right_keys = int_at(block, 2);
        for row in 0..block.num_rows {
            assert_eq!(left_keys.value(row), right_keys.value(row));
            key_counts[left_keys.value(row) as usize] += 1;
        }
        total_rows += block.num_rows;
    }
    // Every key appears twice per side: 2 x 2 matches per key.
    assert_eq!(total_rows, (DISTINCT as usize) * 4);
    assert!(key_counts.iter().all(|&count| count == 4));
}

#[test]
fn indirected_payload_preserves_semantics() {
    let fat_x = "x".repeat(4096);
    let fat_y = "y".repeat(4096);
    let fat_z = "z".repeat(4096);
    let left = vec![int_utf8_block(
        vec![Some(1), Some(2), Some(3)],
        vec![Some("a"), Some("b"), Some("c")],
    )];
    let right = vec![int_utf8_block(
        vec![Some(2), Some(3), Some(4)],
        vec![Some(fat_x.as_str()), Some(fat_y.as_str()), Some(fat_z.as_str())],
    )];

    let policy = Arc::new(TestPolicy {
        max_fetched: 1 << 30,
        algo: JoinAlgo::HashJoin,
        external_payload: true,
        payload_consulted: AtomicBool::new(false),
    });
    let mut args = join_args(
        left,
        right,
        vec![DataType::Int32, DataType::Utf8],
        vec![DataType::Int32, DataType::Utf8],
    );
    let shared: Arc<dyn GraceJoinPolicy> = policy.clone() as Arc<dyn GraceJoinPolicy>;
    args.policy = Some(shared);
    let mut join = BlockGraceJoin::try_new(args).expect("join");

    let rows = collect_kls(&drain(&mut join));
    assert!(policy.payload_consulted.load(Ordering::Relaxed));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], (2, "b".to_string(), fat_x));
    assert_eq!(rows[1], (3, "c".to_string(), fat_y));
}

#[test]
fn yields_between_blocks_do_not_change_the_output() {
    let make_left = || {
        vec![
            int_utf8_block(vec![Some(1), Some(2)], vec![Some("a"), Some("b")]),
            int_utf8_block(vec![Some(3)], vec![Some("c")]),
        ]
    };
    let make_right = || {
        vec![
            int_utf8_block(vec![Some(2)], vec![Some("x")]),
            int_utf8_block(vec![Some(3), Some(4)], vec![Some("y"), Some("z")]),
        ]
    };

    let mut baseline = BlockGraceJoin::try_new(join_args(
        make_left(),
        make_right(),
        vec![DataType::Int32, DataType::Utf8],
        vec![DataType::Int32, DataType::Utf8],
    ))
    .expect("join");
    let expected = collect_kls(&drain(&mut baseline));
    assert_eq!(expected.len(), 2);

    let mut args = join_args(
        vec![],
        vec![],
        vec![DataType::Int32, DataType::Utf8],
        vec![DataType::Int32, DataType::Utf8],
    );
    args.left_stream = Box::new(VecBlockStream::yielding(make_left()));
    args.right_stream = Box::new(VecBlockStream::yielding(make_right()));
    let mut yielding = BlockGraceJoin::try_new(args).expect("join");
    let observed = collect_kls(&drain(&mut yielding));
    assert_eq!(observed, expected);
}

// ---------------------------------------------------------------
// Boundary behaviors

#[test]
fn empty_left_stream_finishes_without_output() {
    let right = vec![int_utf8_block(vec![Some(1)], vec![Some("x")])];
    let mut join = BlockGraceJoin::try_new(join_args(
        vec![],
        right,
        vec![DataType::Int32, DataType::Utf8],
        vec![DataType::Int32, DataType::Utf8],
    ))
    .expect("join");
    assert!(drain(&mut join).is_empty());
}

#[test]
fn empty_right_stream_finishes_without_output() {
    let left = vec![int_utf8_block(vec![Some(1)], vec![Some("x")])];
    let mut join = BlockGraceJoin::try_new(join_args(
        left,
        vec![],
        vec![DataType::Int32, DataType::Utf8],
        vec![DataType::Int32, DataType::Utf8],
    ))
    .expect("join");
    assert!(drain(&mut join).is_empty());
}

#[test]
fn unfinished_side_probes_against_the_finished_build() {
    // A tiny bootstrap budget: the left side ends under it, the right
    // side outgrows it and keeps streaming as probe.
    let left = vec![int_utf8_block(
        vec![Some(1), Some(2)],
        vec![Some("a"), Some("b")],
    )];
    let right: Vec<Block> = (0..64)
        .map(|chunk| {
            let base = chunk * 4;
            int_utf8_block(
                (base..base + 4).map(Some).collect(),
                vec![Some("r"); 4],
            )
        })
        .collect();

    let policy = Arc::new(TestPolicy {
        max_fetched: 64,
        algo: JoinAlgo::HashJoin,
        external_payload: false,
        payload_consulted: AtomicBool::new(false),
    });
    let mut args = join_args(
        left,
        right,
        vec![DataType::Int32, DataType::Utf8],
        vec![DataType::Int32, DataType::Utf8],
    );
    args.policy = Some(policy);
    let mut join = BlockGraceJoin::try_new(args).expect("join");

    let rows = collect_kls(&drain(&mut join));
    // Right keys 0..256 cover the two left keys exactly once each.
    assert_eq!(
        rows,
        vec![
            (1, "a".to_string(), "r".to_string()),
            (2, "b".to_string(), "r".to_string()),
        ]
    );
}

#[test]
fn smaller_finished_side_becomes_the_build() {
    // Left is larger; with both sides buffered the smaller right side
    // builds and the left side probes, while the output still reads
    // left-then-right.
    let left = vec![int_utf8_block(
        vec![Some(1), Some(2), Some(3), Some(4)],
        vec![Some("a"), Some("b"), Some("c"), Some("d")],
    )];
    let right = vec![int_utf8_block(vec![Some(3)], vec![Some("x")])];
    let mut join = BlockGraceJoin::try_new(join_args(
        left,
        right,
        vec![DataType::Int32, DataType::Utf8],
        vec![DataType::Int32, DataType::Utf8],
    ))
    .expect("join");

    let rows = collect_kls(&drain(&mut join));
    assert_eq!(rows, vec![(3, "c".to_string(), "x".to_string())]);
}
