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
//! Adaptive block-oriented inner equi-join core.
//!
//! Two wide columnar block streams are joined on a prescribed set of
//! equi-key columns. The operator bootstraps by probing both inputs,
//! then commits to either a one-sided in-memory hash join or a
//! radix-bucketed in-memory grace join, driven by a pluggable policy.

pub mod common;
pub mod exec;
pub mod runtime;

pub use exec::block::{Block, BlockFetch, BlockStream, FetchStatus, WideDatum};
pub use exec::join::operator::{BlockGraceJoin, BlockGraceJoinArgs, JoinKind};
pub use exec::join::policy::{
    DefaultGraceJoinPolicy, GraceJoinPolicy, JoinAlgo, STREAM_NOT_FETCHED,
};
