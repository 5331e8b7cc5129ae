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
//! The query memory descriptor: the algebraic model of how a group hash
//! table is shaped for one query on one device.
//!
//! The offset formulas here are the single source of truth for buffer
//! layout; initialization, codegen and reduction all derive addresses from
//! them and nothing else.
//!
//! Row-major rows are `[keys (8B each unless keyless)] [target slots at
//! compact widths, 8-byte slots 8-aligned]`, padded to a multiple of 8.
//! Columnar buffers are an optional leading 8-byte key array followed by one
//! contiguous array per target column, with 8-byte padding between columns
//! when compact widths differ. Keyless warp-interleaved buffers replicate
//! each bin `warp_count` times, row `(bin, warp)` at `bin * warp_count +
//! warp`.

use crate::common::config::EngineConfig;
use crate::common::error::{GroupByError, GroupByResult};
use crate::exec::groupby::count_distinct::CountDistinctDescriptors;
use crate::exec::groupby::range::GroupingKind;
use crate::runtime::device::DeviceKind;

pub fn align_to_8(off: usize) -> usize {
    (off + 7) & !7usize
}

/// `actual` is the logical width of the slot, `compact` the in-buffer width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColWidth {
    pub actual: u8,
    pub compact: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemSharing {
    Private,
    Shared,
}

/// Device geometry captured at planning time; the descriptor never reaches
/// back into an executor for it.
#[derive(Clone, Copy, Debug)]
pub struct DeviceShape {
    pub block_size: usize,
    pub grid_size: usize,
    pub warp_size: usize,
    pub cpu_only: bool,
    pub shared_mem_budget_bytes: usize,
}

impl From<&EngineConfig> for DeviceShape {
    fn from(config: &EngineConfig) -> Self {
        Self {
            block_size: config.block_size,
            grid_size: config.grid_size,
            warp_size: config.warp_size,
            cpu_only: config.cpu_only,
            shared_mem_budget_bytes: config.shared_mem_budget_bytes,
        }
    }
}

pub(crate) fn many_entries(max_val: i64, min_val: i64, bucket: i64) -> bool {
    max_val - min_val > 10_000 * bucket.max(1)
}

#[derive(Clone, Debug)]
pub struct QueryMemoryDescriptor {
    pub allow_multifrag: bool,
    pub hash_kind: GroupingKind,
    pub keyless: bool,
    pub interleaved_bins_on_device: bool,
    pub idx_target_as_key: i32,
    pub init_val: i64,
    /// Logical byte widths of the grouping keys; keys occupy 8 bytes each
    /// in the buffer regardless.
    pub group_col_widths: Vec<u8>,
    pub agg_col_widths: Vec<ColWidth>,
    pub entry_count: usize,
    pub entry_count_small: usize,
    pub min_val: i64,
    pub max_val: i64,
    pub bucket: i64,
    pub has_nulls: bool,
    pub sharing: MemSharing,
    pub count_distinct_descs: CountDistinctDescriptors,
    pub sort_on_device: bool,
    pub is_sort_plan: bool,
    pub output_columnar: bool,
    pub render_output: bool,
    pub device: DeviceShape,
}

impl QueryMemoryDescriptor {
    /// Packed byte size of one row's target region.
    pub fn cols_size(&self) -> usize {
        assert!(!self.output_columnar);
        let mut total_bytes = 0usize;
        for col_width in &self.agg_col_widths {
            let chosen_bytes = col_width.compact as usize;
            if chosen_bytes == 8 {
                total_bytes = align_to_8(total_bytes);
            }
            total_bytes += chosen_bytes;
        }
        total_bytes
    }

    pub fn row_size(&self) -> usize {
        assert!(!self.output_columnar);
        let mut total_bytes = 0usize;
        if self.keyless {
            assert_eq!(self.group_col_widths.len(), 1);
        } else {
            total_bytes += self.group_col_widths.len() * 8;
        }
        total_bytes += self.cols_size();
        align_to_8(total_bytes)
    }

    pub fn row_size_quad(&self) -> usize {
        self.row_size() / 8
    }

    pub fn warp_count(&self) -> usize {
        if self.interleaved_bins_on_device {
            self.device.warp_size
        } else {
            1
        }
    }

    /// The shared compact width of the target slots; callers may only ask
    /// while the layout is isometric.
    pub fn compact_byte_width(&self) -> u8 {
        let Some(first) = self.agg_col_widths.first() else {
            return 8;
        };
        for col_width in &self.agg_col_widths {
            assert_eq!(col_width.compact, first.compact);
        }
        first.compact
    }

    pub fn is_compact_layout_isometric(&self) -> bool {
        let Some(first) = self.agg_col_widths.first() else {
            return true;
        };
        self.agg_col_widths
            .iter()
            .all(|w| w.compact == first.compact)
    }

    fn total_bytes_of_columnar_buffers(&self, col_widths: &[ColWidth]) -> usize {
        assert!(self.output_columnar);
        let is_isometric = self.is_compact_layout_isometric();
        let mut total_bytes = 0usize;
        for col_width in col_widths {
            total_bytes += col_width.compact as usize * self.entry_count;
            if !is_isometric {
                total_bytes = align_to_8(total_bytes);
            }
        }
        total_bytes
    }

    pub fn key_off_in_bytes(&self, bin: usize, key_idx: usize) -> usize {
        assert!(!self.keyless);
        if self.output_columnar {
            assert_eq!(key_idx, 0);
            return bin * 8;
        }
        assert!(key_idx < self.group_col_widths.len());
        let offset = bin * self.row_size();
        assert_eq!(offset % 8, 0);
        offset + key_idx * 8
    }

    pub fn next_key_off_in_bytes(&self, crt_idx: usize) -> usize {
        assert!(!self.keyless);
        assert!(crt_idx < self.group_col_widths.len());
        if self.output_columnar {
            assert_eq!(crt_idx, 0);
        }
        8
    }

    /// Offset of a target column inside the row's target region.
    pub fn col_only_off_in_bytes(&self, col_idx: usize) -> usize {
        assert!(col_idx < self.agg_col_widths.len());
        let mut offset = 0usize;
        for index in 0..col_idx {
            let chosen_bytes = self.agg_col_widths[index].compact as usize;
            if chosen_bytes == 8 {
                offset = align_to_8(offset);
            }
            offset += chosen_bytes;
        }
        if self.agg_col_widths[col_idx].compact == 8 {
            offset = align_to_8(offset);
        }
        offset
    }

    /// Absolute offset of `(bin, col_idx)` from the buffer start.
    pub fn col_off_in_bytes(&self, bin: usize, col_idx: usize) -> usize {
        assert!(col_idx < self.agg_col_widths.len());
        let warp_count = self.warp_count();
        if self.output_columnar {
            assert!(bin < self.entry_count);
            assert_eq!(self.group_col_widths.len(), 1);
            assert_eq!(warp_count, 1);
            let is_isometric = self.is_compact_layout_isometric();
            let mut offset = if self.keyless { 0 } else { 8 * self.entry_count };
            for index in 0..col_idx {
                offset += self.agg_col_widths[index].compact as usize * self.entry_count;
                if !is_isometric {
                    offset = align_to_8(offset);
                }
            }
            offset += bin * self.agg_col_widths[col_idx].compact as usize;
            return offset;
        }

        let mut offset = bin * warp_count * self.row_size();
        if self.keyless {
            assert_eq!(self.group_col_widths.len(), 1);
        } else {
            offset += self.group_col_widths.len() * 8;
        }
        offset + self.col_only_off_in_bytes(col_idx)
    }

    /// Closed form of `col_off_in_bytes` for isometric columnar layouts.
    pub fn consist_col_off_in_bytes(&self, bin: usize, col_idx: usize) -> usize {
        assert!(self.output_columnar && !self.agg_col_widths.is_empty());
        let key_bytes = if self.keyless { 0 } else { 8 * self.entry_count };
        key_bytes + (col_idx * self.entry_count + bin) * self.agg_col_widths[0].compact as usize
    }

    pub fn col_off_in_bytes_in_next_bin(&self, col_idx: usize) -> usize {
        assert!(col_idx < self.agg_col_widths.len());
        let warp_count = self.warp_count();
        if self.output_columnar {
            assert_eq!(self.group_col_widths.len(), 1);
            assert_eq!(warp_count, 1);
            return self.agg_col_widths[col_idx].compact as usize;
        }
        warp_count * self.row_size()
    }

    /// Distance from the slot at byte offset `col_off` (column `col_idx` of
    /// `bin`) to the next slot in walk order.
    pub fn next_col_off_in_bytes(&self, col_off: usize, bin: usize, col_idx: usize) -> usize {
        assert!(col_idx < self.agg_col_widths.len());
        assert!(!self.output_columnar || bin < self.entry_count);
        let warp_count = self.warp_count();
        let chosen_bytes = self.agg_col_widths[col_idx].compact as usize;
        if col_idx + 1 == self.agg_col_widths.len() {
            if self.output_columnar {
                return (self.entry_count - bin) * chosen_bytes;
            }
            return align_to_8(col_off + chosen_bytes) - col_off;
        }

        let next_chosen_bytes = self.agg_col_widths[col_idx + 1].compact as usize;
        if self.output_columnar {
            assert_eq!(self.group_col_widths.len(), 1);
            assert_eq!(warp_count, 1);
            let mut offset = self.entry_count * chosen_bytes;
            if !self.is_compact_layout_isometric() {
                offset = align_to_8(offset);
            }
            // Walking stays on this bin: back out of this column's tail and
            // into the next column's head.
            return offset + bin * (next_chosen_bytes - chosen_bytes);
        }

        if next_chosen_bytes == 8 {
            align_to_8(col_off + chosen_bytes) - col_off
        } else {
            chosen_bytes
        }
    }

    pub fn buffer_size_quad(&self, device_kind: DeviceKind) -> usize {
        if self.keyless {
            assert_eq!(self.group_col_widths.len(), 1);
            let total_bytes = align_to_8(self.cols_size());
            let warp_count = if self.interleaved_bins(device_kind) {
                self.device.warp_size
            } else {
                1
            };
            return warp_count * self.entry_count * total_bytes / 8;
        }
        let total_bytes = if self.output_columnar {
            assert_eq!(self.group_col_widths.len(), 1);
            8 * self.entry_count + self.total_bytes_of_columnar_buffers(&self.agg_col_widths)
        } else {
            self.row_size() * self.entry_count
        };
        total_bytes / 8
    }

    pub fn buffer_size_bytes(&self, device_kind: DeviceKind) -> usize {
        self.buffer_size_quad(device_kind) * 8
    }

    /// Small-buffer rows always use full 8-byte slots.
    pub fn small_buffer_size_quad(&self) -> usize {
        assert!(!self.keyless || self.entry_count_small == 0);
        (self.group_col_widths.len() + self.agg_col_widths.len()) * self.entry_count_small
    }

    pub fn small_buffer_size_bytes(&self) -> usize {
        self.small_buffer_size_quad() * 8
    }

    pub fn uses_get_group_value_fast(&self) -> bool {
        self.hash_kind == GroupingKind::OneColKnownRange && self.small_buffer_size_bytes() == 0
    }

    pub fn uses_cached_context(&self) -> bool {
        self.allow_multifrag
            && (self.uses_get_group_value_fast()
                || self.hash_kind == GroupingKind::MultiColPerfectHash)
    }

    pub fn threads_share_memory(&self) -> bool {
        self.sharing == MemSharing::Shared
    }

    pub fn blocks_share_memory(&self) -> bool {
        if self.device.cpu_only || self.render_output {
            return true;
        }
        self.uses_cached_context()
            && self.shared_mem_bytes(DeviceKind::Gpu) == 0
            && many_entries(self.max_val, self.min_val, self.bucket)
    }

    pub fn lazy_init_groups(&self, device_kind: DeviceKind) -> bool {
        device_kind == DeviceKind::Gpu && !self.render_output && self.small_buffer_size_quad() == 0
    }

    pub fn interleaved_bins(&self, device_kind: DeviceKind) -> bool {
        self.interleaved_bins_on_device && device_kind == DeviceKind::Gpu
    }

    /// Full buffer size iff the fast path fits the device's shared memory
    /// budget, else zero.
    pub fn shared_mem_bytes(&self, device_kind: DeviceKind) -> usize {
        if device_kind == DeviceKind::Cpu {
            return 0;
        }
        let shared_mem_bytes = self.buffer_size_bytes(DeviceKind::Gpu);
        if !self.uses_get_group_value_fast()
            || shared_mem_bytes > self.device.shared_mem_budget_bytes
        {
            return 0;
        }
        shared_mem_bytes
    }

    pub fn can_output_columnar(&self) -> bool {
        self.uses_get_group_value_fast()
            && self.threads_share_memory()
            && self.blocks_share_memory()
            && !self.interleaved_bins(DeviceKind::Gpu)
    }

    /// Structural invariants every constructor and mutator must preserve.
    pub fn validate(&self) -> GroupByResult<()> {
        let fail = |what: &str| Err(GroupByError::Unsupported(what.to_string()));
        if self.keyless && (self.group_col_widths.len() != 1 || self.entry_count_small != 0) {
            return fail("keyless layout requires one key column and no small buffer");
        }
        if self.interleaved_bins_on_device && !self.keyless {
            return fail("interleaved bins require a keyless layout");
        }
        if self.sort_on_device && (!self.output_columnar || self.keyless || self.render_output) {
            return fail("device sort requires a keyed columnar non-render layout");
        }
        if self.output_columnar
            && !(self.uses_get_group_value_fast()
                && self.threads_share_memory()
                && self.blocks_share_memory()
                && !self.interleaved_bins_on_device)
        {
            return fail("columnar output requires the shared fast path");
        }
        if self.small_buffer_size_bytes() > 0 && (self.output_columnar || self.keyless) {
            return fail("small buffer is incompatible with columnar or keyless layouts");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::groupby::range::GroupingKind;

    fn base_descriptor() -> QueryMemoryDescriptor {
        QueryMemoryDescriptor {
            allow_multifrag: true,
            hash_kind: GroupingKind::OneColKnownRange,
            keyless: false,
            interleaved_bins_on_device: false,
            idx_target_as_key: -1,
            init_val: 0,
            group_col_widths: vec![8],
            agg_col_widths: vec![
                ColWidth { actual: 8, compact: 8 },
                ColWidth { actual: 8, compact: 8 },
            ],
            entry_count: 7,
            entry_count_small: 0,
            min_val: 1,
            max_val: 7,
            bucket: 0,
            has_nulls: false,
            sharing: MemSharing::Shared,
            count_distinct_descs: CountDistinctDescriptors::new(),
            sort_on_device: false,
            is_sort_plan: false,
            output_columnar: false,
            render_output: false,
            device: DeviceShape {
                block_size: 4,
                grid_size: 2,
                warp_size: 4,
                cpu_only: false,
                shared_mem_budget_bytes: 0,
            },
        }
    }

    #[test]
    fn test_row_size_and_offsets_keyed() {
        let qmd = base_descriptor();
        // key (8) + two 8-byte columns.
        assert_eq!(qmd.row_size(), 24);
        assert_eq!(qmd.key_off_in_bytes(2, 0), 48);
        assert_eq!(qmd.col_off_in_bytes(0, 0), 8);
        assert_eq!(qmd.col_off_in_bytes(1, 1), 24 + 16);
        assert_eq!(qmd.buffer_size_quad(DeviceKind::Cpu), 3 * 7);
    }

    #[test]
    fn test_mixed_width_row_padding() {
        let mut qmd = base_descriptor();
        qmd.agg_col_widths = vec![
            ColWidth { actual: 8, compact: 4 },
            ColWidth { actual: 8, compact: 4 },
            ColWidth { actual: 8, compact: 8 },
        ];
        // cols: 4 + 4, then align to 8 for the 8-byte slot.
        assert_eq!(qmd.cols_size(), 16);
        assert_eq!(qmd.row_size(), 24);
        assert_eq!(qmd.col_only_off_in_bytes(0), 0);
        assert_eq!(qmd.col_only_off_in_bytes(1), 4);
        assert_eq!(qmd.col_only_off_in_bytes(2), 8);
    }

    /// Walking `next_col_off_in_bytes` from column 0 lands on the same
    /// addresses the closed-form column offsets give.
    #[test]
    fn test_layout_round_trip_row_major() {
        let mut qmd = base_descriptor();
        qmd.agg_col_widths = vec![
            ColWidth { actual: 8, compact: 4 },
            ColWidth { actual: 8, compact: 8 },
            ColWidth { actual: 8, compact: 4 },
        ];
        for bin in 0..qmd.entry_count {
            let mut walked = qmd.col_off_in_bytes(bin, 0);
            for col_idx in 0..qmd.agg_col_widths.len() {
                assert_eq!(
                    walked,
                    qmd.col_off_in_bytes(bin, col_idx),
                    "bin={bin} col={col_idx}"
                );
                walked += qmd.next_col_off_in_bytes(walked, bin, col_idx);
            }
            // The walk ends at the 8-aligned end of the row, i.e. the next
            // row's key slot.
            if bin + 1 < qmd.entry_count {
                assert_eq!(walked, qmd.col_off_in_bytes(bin + 1, 0) - 8);
            }
        }
    }

    #[test]
    fn test_layout_round_trip_columnar() {
        let mut qmd = base_descriptor();
        qmd.output_columnar = true;
        qmd.min_val = 0;
        qmd.max_val = 1_000_000;
        qmd.agg_col_widths = vec![
            ColWidth { actual: 8, compact: 8 },
            ColWidth { actual: 8, compact: 8 },
        ];
        for bin in 0..qmd.entry_count {
            let mut walked = qmd.col_off_in_bytes(bin, 0);
            for col_idx in 0..qmd.agg_col_widths.len() {
                assert_eq!(walked, qmd.col_off_in_bytes(bin, col_idx));
                assert_eq!(walked, qmd.consist_col_off_in_bytes(bin, col_idx));
                walked += qmd.next_col_off_in_bytes(walked, bin, col_idx);
            }
        }
    }

    #[test]
    fn test_keyless_interleaved_buffer_size() {
        let mut qmd = base_descriptor();
        qmd.keyless = true;
        qmd.interleaved_bins_on_device = true;
        qmd.agg_col_widths = vec![ColWidth { actual: 8, compact: 8 }];
        // 4 warps x 7 bins x 1 quad on the device, no replication on host.
        assert_eq!(qmd.buffer_size_quad(DeviceKind::Gpu), 4 * 7);
        assert_eq!(qmd.buffer_size_quad(DeviceKind::Cpu), 7);
    }

    #[test]
    fn test_invariants() {
        let mut qmd = base_descriptor();
        assert!(qmd.validate().is_ok());
        qmd.keyless = true;
        qmd.group_col_widths = vec![8, 8];
        assert!(qmd.validate().is_err());

        let mut qmd = base_descriptor();
        qmd.interleaved_bins_on_device = true;
        assert!(qmd.validate().is_err());

        let mut qmd = base_descriptor();
        qmd.entry_count_small = 16;
        qmd.output_columnar = true;
        assert!(qmd.validate().is_err());
    }

    #[test]
    fn test_shared_mem_budget_gates_fast_path() {
        let mut qmd = base_descriptor();
        assert_eq!(qmd.shared_mem_bytes(DeviceKind::Gpu), 0);
        qmd.device.shared_mem_budget_bytes = 1 << 20;
        assert_eq!(
            qmd.shared_mem_bytes(DeviceKind::Gpu),
            qmd.buffer_size_bytes(DeviceKind::Gpu)
        );
        assert_eq!(qmd.shared_mem_bytes(DeviceKind::Cpu), 0);
    }
}
