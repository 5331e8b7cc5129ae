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
//! Per-query memory accounting.
//!
//! The core hands out exactly three kinds of accounted memory: host group
//! buffers (main and small-overflow), COUNT DISTINCT presence bitmaps, and
//! the software device's arena. One `QueryMemTracker` travels with a query;
//! the row set memory owner charges the host categories as it registers
//! buffers and the device charges its arena as it grows. Only bytes
//! explicitly reported here are counted; this is not an allocator hook.
//!
//! Distinct spill sets are deliberately unaccounted: their growth is
//! row-driven and unbounded, and the planner's watchdog is the mechanism
//! that keeps them off the fast path in the first place.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemCategory {
    /// Main and small-overflow group tables, index prefixes included.
    GroupBuffers,
    /// Dense COUNT DISTINCT presence bitmaps.
    DistinctBitmaps,
    /// The software device's bump arena (kernel parameters, column copies,
    /// device-resident group buffers).
    DeviceArena,
}

const CATEGORIES: [MemCategory; 3] = [
    MemCategory::GroupBuffers,
    MemCategory::DistinctBitmaps,
    MemCategory::DeviceArena,
];

impl MemCategory {
    fn index(self) -> usize {
        match self {
            MemCategory::GroupBuffers => 0,
            MemCategory::DistinctBitmaps => 1,
            MemCategory::DeviceArena => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MemCategory::GroupBuffers => "group_buffers",
            MemCategory::DistinctBitmaps => "distinct_bitmaps",
            MemCategory::DeviceArena => "device_arena",
        }
    }
}

/// Byte accounting for one query, split by what the bytes back.
pub struct QueryMemTracker {
    label: String,
    current: [AtomicI64; 3],
    allocations: [AtomicI64; 3],
    peak_total: AtomicI64,
}

impl QueryMemTracker {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            current: [AtomicI64::new(0), AtomicI64::new(0), AtomicI64::new(0)],
            allocations: [AtomicI64::new(0), AtomicI64::new(0), AtomicI64::new(0)],
            peak_total: AtomicI64::new(0),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Record one allocation of `bytes` against a category.
    pub fn consume(&self, category: MemCategory, bytes: usize) {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        self.current[category.index()].fetch_add(bytes, Ordering::AcqRel);
        self.allocations[category.index()].fetch_add(1, Ordering::AcqRel);
        self.bump_peak();
    }

    /// Return `bytes` previously charged against a category.
    pub fn release(&self, category: MemCategory, bytes: usize) {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        self.current[category.index()].fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn current(&self, category: MemCategory) -> i64 {
        self.current[category.index()].load(Ordering::Relaxed)
    }

    pub fn allocations(&self, category: MemCategory) -> i64 {
        self.allocations[category.index()].load(Ordering::Relaxed)
    }

    /// Live bytes across every category.
    pub fn total(&self) -> i64 {
        CATEGORIES.iter().map(|c| self.current(*c)).sum()
    }

    pub fn peak_total(&self) -> i64 {
        self.peak_total.load(Ordering::Relaxed)
    }

    fn bump_peak(&self) {
        let total = self.total();
        let mut prev = self.peak_total.load(Ordering::Relaxed);
        while total > prev {
            match self.peak_total.compare_exchange(
                prev,
                total,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}

impl fmt::Display for QueryMemTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query={}", self.label)?;
        for category in CATEGORIES {
            write!(f, " {}={}B", category.label(), self.current(category))?;
        }
        write!(f, " peak={}B", self.peak_total())
    }
}

#[cfg(test)]
mod tests {
    use super::{MemCategory, QueryMemTracker};

    #[test]
    fn test_categories_account_independently() {
        let tracker = QueryMemTracker::new("q1");
        tracker.consume(MemCategory::GroupBuffers, 1024);
        tracker.consume(MemCategory::DistinctBitmaps, 128);
        assert_eq!(tracker.current(MemCategory::GroupBuffers), 1024);
        assert_eq!(tracker.current(MemCategory::DistinctBitmaps), 128);
        assert_eq!(tracker.current(MemCategory::DeviceArena), 0);
        assert_eq!(tracker.total(), 1152);
        tracker.release(MemCategory::GroupBuffers, 1024);
        assert_eq!(tracker.total(), 128);
    }

    #[test]
    fn test_peak_tracks_total_across_categories() {
        let tracker = QueryMemTracker::new("q2");
        tracker.consume(MemCategory::GroupBuffers, 100);
        tracker.consume(MemCategory::DeviceArena, 50);
        tracker.release(MemCategory::GroupBuffers, 100);
        tracker.consume(MemCategory::DeviceArena, 10);
        assert_eq!(tracker.peak_total(), 150);
        assert_eq!(tracker.allocations(MemCategory::DeviceArena), 2);
    }

    #[test]
    fn test_display_summary() {
        let tracker = QueryMemTracker::new("q3");
        tracker.consume(MemCategory::DistinctBitmaps, 8);
        let summary = tracker.to_string();
        assert!(summary.contains("query=q3"));
        assert!(summary.contains("distinct_bitmaps=8B"));
        assert!(summary.contains("peak=8B"));
    }
}
