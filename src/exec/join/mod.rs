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
//! Adaptive block join: bootstrap, algorithm selection, and the two
//! in-memory join strategies.

pub mod cardinality;
mod hash_join;
mod in_memory_grace_join;
mod join_hash_table;
pub(crate) mod join_probe_utils;
pub(crate) mod join_side;
mod join_state;
pub mod operator;
pub(crate) mod payload_storage;
pub mod policy;
pub(crate) mod temp_join_storage;

pub use operator::{BlockGraceJoin, BlockGraceJoinArgs, JoinKind};
