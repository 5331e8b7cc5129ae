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
//! Query-lifetime ownership of result memory.
//!
//! Responsibilities:
//! - Owns group buffers, COUNT DISTINCT bitmaps and sets, and transient
//!   string dictionaries; execution contexts hold non-owning handles.
//! - Append-only and thread-safe: one owner is shared by every execution
//!   context of a query, released as a whole at query end.
//!
//! Group slots reference count-distinct substructures by positive 1-based
//! handle; which registry a handle resolves against is determined by the
//! target's count-distinct descriptor, never by the handle value itself.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::exec::groupby::count_distinct::CountDistinctDescriptors;
use crate::exec::unit::StringDictionaryRegistry;
use crate::runtime::mem_tracker::{MemCategory, QueryMemTracker};

pub type GroupBufferHandle = Arc<Mutex<Vec<u8>>>;
pub type BitmapHandle = Arc<Mutex<Vec<u8>>>;
pub type SetHandle = Arc<Mutex<BTreeSet<i64>>>;

pub struct RowSetMemoryOwner {
    tracker: Arc<QueryMemTracker>,
    group_by_buffers: Mutex<Vec<GroupBufferHandle>>,
    count_distinct_bitmaps: Mutex<Vec<BitmapHandle>>,
    count_distinct_sets: Mutex<Vec<SetHandle>>,
    count_distinct_descs: Mutex<CountDistinctDescriptors>,
    dictionaries: StringDictionaryRegistry,
}

impl RowSetMemoryOwner {
    pub fn new(tracker: &Arc<QueryMemTracker>) -> Arc<Self> {
        Arc::new(Self {
            tracker: Arc::clone(tracker),
            group_by_buffers: Mutex::new(Vec::new()),
            count_distinct_bitmaps: Mutex::new(Vec::new()),
            count_distinct_sets: Mutex::new(Vec::new()),
            count_distinct_descs: Mutex::new(CountDistinctDescriptors::new()),
            dictionaries: StringDictionaryRegistry::default(),
        })
    }

    pub fn tracker(&self) -> &Arc<QueryMemTracker> {
        &self.tracker
    }

    /// Take ownership of a fully built group buffer; returns the shared
    /// handle the context keeps as its non-owning view.
    pub fn add_group_by_buffer(&self, buffer: Vec<u8>) -> GroupBufferHandle {
        self.tracker
            .consume(MemCategory::GroupBuffers, buffer.len());
        let handle = Arc::new(Mutex::new(buffer));
        self.group_by_buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&handle));
        handle
    }

    /// Allocate a zeroed presence bitmap of `bitmap_bits` bits; returns the
    /// 1-based handle stored in the group slot.
    pub fn allocate_count_distinct_bitmap(&self, bitmap_bits: i64) -> i64 {
        let bytes = bitmap_bytes(bitmap_bits);
        self.tracker.consume(MemCategory::DistinctBitmaps, bytes);
        let mut guard = self
            .count_distinct_bitmaps
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.push(Arc::new(Mutex::new(vec![0u8; bytes])));
        guard.len() as i64
    }

    /// Allocate an empty ordered spill set; returns the 1-based handle.
    pub fn allocate_count_distinct_set(&self) -> i64 {
        let mut guard = self
            .count_distinct_sets
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.push(Arc::new(Mutex::new(BTreeSet::new())));
        guard.len() as i64
    }

    pub fn count_distinct_bitmap(&self, handle: i64) -> Option<BitmapHandle> {
        let guard = self
            .count_distinct_bitmaps
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        usize::try_from(handle - 1).ok().and_then(|idx| {
            guard.get(idx).map(Arc::clone)
        })
    }

    pub fn count_distinct_set(&self, handle: i64) -> Option<SetHandle> {
        let guard = self
            .count_distinct_sets
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        usize::try_from(handle - 1).ok().and_then(|idx| {
            guard.get(idx).map(Arc::clone)
        })
    }

    pub fn set_count_distinct_descriptors(&self, descs: CountDistinctDescriptors) {
        *self
            .count_distinct_descs
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = descs;
    }

    pub fn count_distinct_descriptors(&self) -> CountDistinctDescriptors {
        self.count_distinct_descs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn dictionaries(&self) -> &StringDictionaryRegistry {
        &self.dictionaries
    }

    /// OR the source bitmap into the destination bitmap.
    pub fn merge_count_distinct_bitmaps(&self, dst: i64, src: i64) {
        if dst == src {
            return;
        }
        let (Some(dst), Some(src)) = (
            self.count_distinct_bitmap(dst),
            self.count_distinct_bitmap(src),
        ) else {
            return;
        };
        let src = src.lock().unwrap_or_else(|e| e.into_inner());
        let mut dst = dst.lock().unwrap_or_else(|e| e.into_inner());
        for (d, s) in dst.iter_mut().zip(src.iter()) {
            *d |= *s;
        }
    }

    /// Union the source set into the destination set.
    pub fn merge_count_distinct_sets(&self, dst: i64, src: i64) {
        if dst == src {
            return;
        }
        let (Some(dst), Some(src)) = (
            self.count_distinct_set(dst),
            self.count_distinct_set(src),
        ) else {
            return;
        };
        let src = src.lock().unwrap_or_else(|e| e.into_inner());
        let mut dst = dst.lock().unwrap_or_else(|e| e.into_inner());
        for v in src.iter() {
            dst.insert(*v);
        }
    }

    pub fn bitmap_cardinality(&self, handle: i64) -> i64 {
        self.count_distinct_bitmap(handle)
            .map(|bm| {
                bm.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .iter()
                    .map(|b| b.count_ones() as i64)
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn set_cardinality(&self, handle: i64) -> i64 {
        self.count_distinct_set(handle)
            .map(|set| set.lock().unwrap_or_else(|e| e.into_inner()).len() as i64)
            .unwrap_or(0)
    }
}

impl Drop for RowSetMemoryOwner {
    fn drop(&mut self) {
        // Owned memory dies with the owner; hand the accounted bytes back
        // category by category.
        let group_bytes: usize = self
            .group_by_buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|b| b.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum();
        self.tracker.release(MemCategory::GroupBuffers, group_bytes);
        let bitmap_bytes: usize = self
            .count_distinct_bitmaps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|b| b.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum();
        self.tracker
            .release(MemCategory::DistinctBitmaps, bitmap_bytes);
    }
}

/// Byte size of a presence bitmap of `bits` bits.
pub fn bitmap_bytes(bits: i64) -> usize {
    ((bits.max(0) as usize) + 7) / 8
}
