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
//! Process-wide sink for operator timings and memory watermarks.
//!
//! Responsibilities:
//! - Accumulates per-operator wall time, per-stage wall time, and peak
//!   memory across all operator instances in the process.
//! - Pages are keyed by operator name; renames merge the history page.
//!
//! The meter is an observer only; no execution decision reads it back.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, OnceLock};

#[derive(Clone, Debug, Default)]
pub struct MeterPage {
    pub spent_time_us: u64,
    pub stage_spent_us: BTreeMap<String, u64>,
    pub peak_memory_bytes: i64,
}

#[derive(Debug, Default)]
pub struct ResourceMeter {
    pages: Mutex<HashMap<String, MeterPage>>,
}

impl ResourceMeter {
    pub fn update_spent_time(&self, name: &str, micros: u64) {
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        let page = pages.entry(name.to_string()).or_default();
        page.spent_time_us = page.spent_time_us.saturating_add(micros);
    }

    pub fn update_stage_spent_time(&self, name: &str, stage: &str, micros: u64) {
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        let page = pages.entry(name.to_string()).or_default();
        let counter = page.stage_spent_us.entry(stage.to_string()).or_insert(0);
        *counter = counter.saturating_add(micros);
    }

    pub fn update_consumed_memory(&self, name: &str, bytes: i64) {
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        let page = pages.entry(name.to_string()).or_default();
        page.peak_memory_bytes = page.peak_memory_bytes.max(bytes);
    }

    /// Fold the accumulated history of `from` into `to`. Used when an
    /// operator commits to an algorithm and renames itself.
    pub fn merge_history_pages(&self, from: &str, to: &str) {
        if from == to {
            return;
        }
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        let Some(old) = pages.remove(from) else {
            return;
        };
        let page = pages.entry(to.to_string()).or_default();
        page.spent_time_us = page.spent_time_us.saturating_add(old.spent_time_us);
        page.peak_memory_bytes = page.peak_memory_bytes.max(old.peak_memory_bytes);
        for (stage, micros) in old.stage_spent_us {
            let counter = page.stage_spent_us.entry(stage).or_insert(0);
            *counter = counter.saturating_add(micros);
        }
    }

    pub fn page(&self, name: &str) -> Option<MeterPage> {
        let pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        pages.get(name).cloned()
    }
}

pub fn global_resource_meter() -> &'static ResourceMeter {
    static METER: OnceLock<ResourceMeter> = OnceLock::new();
    METER.get_or_init(ResourceMeter::default)
}

#[cfg(test)]
mod tests {
    use super::ResourceMeter;

    #[test]
    fn stage_times_accumulate_and_merge() {
        let meter = ResourceMeter::default();
        meter.update_stage_spent_time("Join", "Build", 10);
        meter.update_stage_spent_time("Join", "Build", 5);
        meter.update_consumed_memory("Join", 1024);
        meter.update_consumed_memory("Join", 512);
        meter.merge_history_pages("Join", "Join::HashJoin");

        assert!(meter.page("Join").is_none());
        let page = meter.page("Join::HashJoin").expect("merged page");
        assert_eq!(page.stage_spent_us.get("Build"), Some(&15));
        assert_eq!(page.peak_memory_bytes, 1024);
    }
}
