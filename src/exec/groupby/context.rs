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
//! Execution context: the live group buffers for one
//! `(device kind, device id, fragment batch)` slice.
//!
//! Responsibilities:
//! - Builds the initialized buffer template (row-major, columnar, or
//!   warp-replicated keyless) and stamps it into every owned buffer; COUNT
//!   DISTINCT slots receive freshly allocated substructure handles.
//! - Marshals the fixed-arity kernel parameter block, drives the launch on
//!   either device path, and reads back buffers and per-lane error codes.
//!
//! Buffers are owned by the `RowSetMemoryOwner`; the context keeps shared
//! handles only and everything outlives it until the owner is released.

use std::sync::Arc;

use tracing::debug;

use crate::common::config::EngineConfig;
use crate::common::error::{GroupByError, GroupByResult};
use crate::exec::chunk::FragmentColumns;
use crate::exec::groupby::descriptor::{ColWidth, QueryMemoryDescriptor, align_to_8};
use crate::exec::groupby::target_slot_widths;
use crate::exec::unit::{EMPTY_KEY_64, ExecutionUnit, target_info};
use crate::jit::KernelModule;
use crate::runtime::device::{
    DeviceAllocator, DeviceKind, DevicePtr, KernelLaunch, KernelMemory, KernelParams, LaunchDims,
    RenderAllocatorMap, pack_ptr, ptr_add,
};
use crate::runtime::mem_owner::{GroupBufferHandle, RowSetMemoryOwner};

/// Result of one kernel run: the winning error code, the number of rows that
/// matched the filter under a scan limit, and, for non-grouped kernels, one
/// per-lane output vector per aggregate slot.
#[derive(Debug, Default)]
pub struct LaunchOutput {
    pub error_code: i32,
    pub total_matched: i32,
    pub out_vec: Vec<Vec<i64>>,
}

pub struct ExecutionContext {
    qmd: QueryMemoryDescriptor,
    init_agg_vals: Vec<i64>,
    unit: ExecutionUnit,
    fragments: Vec<FragmentColumns>,
    row_set_mem_owner: Arc<RowSetMemoryOwner>,
    device_kind: DeviceKind,
    device_id: i32,
    config: EngineConfig,
    num_buffers: usize,
    group_by_buffers: Vec<Option<GroupBufferHandle>>,
    small_group_by_buffers: Vec<Option<GroupBufferHandle>>,
    output_columnar: bool,
    sort_on_device: bool,
    render_allocator_map: Option<Arc<RenderAllocatorMap>>,
}

fn write_slot_bytes(buf: &mut [u8], off: usize, width: u8, value: i64) {
    let width = width as usize;
    buf[off..off + width].copy_from_slice(&value.to_le_bytes()[..width]);
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        qmd: QueryMemoryDescriptor,
        init_agg_vals: Vec<i64>,
        unit: ExecutionUnit,
        fragments: Vec<FragmentColumns>,
        row_set_mem_owner: Arc<RowSetMemoryOwner>,
        device_kind: DeviceKind,
        device_id: i32,
        config: EngineConfig,
        render_allocator_map: Option<Arc<RenderAllocatorMap>>,
    ) -> GroupByResult<Self> {
        let output_columnar = qmd.output_columnar;
        let sort_on_device = qmd.sort_on_device;
        assert!(!sort_on_device || output_columnar);

        let num_buffers = match device_kind {
            DeviceKind::Cpu => 1,
            DeviceKind::Gpu => {
                config.block_size
                    * if qmd.blocks_share_memory() {
                        1
                    } else {
                        config.grid_size
                    }
            }
        };

        let mut ctx = Self {
            qmd,
            init_agg_vals,
            unit,
            fragments,
            row_set_mem_owner,
            device_kind,
            device_id,
            config,
            num_buffers,
            group_by_buffers: Vec::new(),
            small_group_by_buffers: Vec::new(),
            output_columnar,
            sort_on_device,
            render_allocator_map,
        };

        if ctx.render_allocator_map.is_some() || ctx.qmd.group_col_widths.is_empty() {
            // Render targets and non-grouped runs only need the eagerly
            // shared COUNT DISTINCT substructures.
            ctx.allocate_count_distinct_buffers(false);
            return Ok(ctx);
        }

        let template = if !ctx.qmd.lazy_init_groups(device_kind) {
            Some(ctx.build_group_buffer_template()?)
        } else {
            None
        };

        if ctx.qmd.interleaved_bins(device_kind) {
            assert!(ctx.qmd.keyless);
        }
        if ctx.qmd.keyless {
            assert_eq!(ctx.qmd.small_buffer_size_quad(), 0);
        }

        let small_template = if ctx.qmd.small_buffer_size_bytes() > 0 {
            assert!(!ctx.output_columnar && !ctx.qmd.keyless);
            let mut buf = vec![0u8; ctx.qmd.small_buffer_size_bytes()];
            ctx.init_groups(&mut buf, ctx.qmd.entry_count_small, false, 1);
            Some(buf)
        } else {
            None
        };

        let step = if device_kind == DeviceKind::Gpu && ctx.qmd.threads_share_memory() {
            ctx.config.block_size
        } else {
            1
        };

        let mut i = 0;
        while i < ctx.num_buffers {
            let index_buffer_qw = if device_kind == DeviceKind::Gpu
                && ctx.sort_on_device
                && ctx.qmd.keyless
            {
                ctx.qmd.entry_count
            } else {
                0
            };
            let mut buffer =
                vec![0u8; ctx.qmd.buffer_size_bytes(device_kind) + index_buffer_qw * 8];
            if let Some(template) = &template {
                buffer[index_buffer_qw * 8..].copy_from_slice(template);
            }
            let handle = ctx.row_set_mem_owner.add_group_by_buffer(buffer);
            ctx.group_by_buffers.push(Some(handle));
            for _ in 1..step {
                ctx.group_by_buffers.push(None);
            }
            if let Some(small_template) = &small_template {
                let handle = ctx
                    .row_set_mem_owner
                    .add_group_by_buffer(small_template.clone());
                ctx.small_group_by_buffers.push(Some(handle));
                for _ in 1..step {
                    ctx.small_group_by_buffers.push(None);
                }
            }
            i += step;
        }
        Ok(ctx)
    }

    pub fn qmd(&self) -> &QueryMemoryDescriptor {
        &self.qmd
    }

    pub fn unit(&self) -> &ExecutionUnit {
        &self.unit
    }

    pub fn row_set_mem_owner(&self) -> &Arc<RowSetMemoryOwner> {
        &self.row_set_mem_owner
    }

    pub fn device_kind(&self) -> DeviceKind {
        self.device_kind
    }

    pub fn group_by_buffers(&self) -> &[Option<GroupBufferHandle>] {
        &self.group_by_buffers
    }

    pub fn small_group_by_buffers(&self) -> &[Option<GroupBufferHandle>] {
        &self.small_group_by_buffers
    }

    pub fn init_agg_vals(&self) -> &[i64] {
        &self.init_agg_vals
    }

    /// Byte offset of bin data in each buffer (past the on-device sort index
    /// prefix, when present).
    pub fn data_offset_in_buffer(&self) -> usize {
        if self.device_kind == DeviceKind::Gpu && self.sort_on_device && self.qmd.keyless {
            self.qmd.entry_count * 8
        } else {
            0
        }
    }

    /// A keyed bin is dead iff its first key slot holds the empty marker.
    pub fn is_empty_bin(&self, buffer: &[u8], bin: usize, key_idx: usize) -> bool {
        let key_off = self.qmd.key_off_in_bytes(bin, key_idx);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buffer[key_off..key_off + 8]);
        i64::from_le_bytes(bytes) == EMPTY_KEY_64
    }

    fn build_group_buffer_template(&mut self) -> GroupByResult<Vec<u8>> {
        let mut template = vec![0u8; self.qmd.buffer_size_bytes(self.device_kind)];
        if self.output_columnar {
            self.init_columnar_groups(&mut template);
        } else {
            let warp_size = if self.qmd.interleaved_bins(self.device_kind) {
                self.config.warp_size
            } else {
                1
            };
            let entry_count = self.qmd.entry_count;
            let keyless = self.qmd.keyless;
            self.init_groups(&mut template, entry_count, keyless, warp_size);
        }
        Ok(template)
    }

    /// Deferred mode sizes the per-row COUNT DISTINCT substructures (>0 bits
    /// for a bitmap, -1 for a set) without allocating; eager mode allocates
    /// one shared substructure per distinct slot and patches the initial
    /// values in place.
    fn allocate_count_distinct_buffers(&mut self, deferred: bool) -> Vec<i64> {
        let agg_col_count = self.qmd.agg_col_widths.len();
        let mut agg_bitmap_size = vec![0i64; if deferred { agg_col_count } else { 0 }];

        let mut agg_col_idx = 0usize;
        for (target_idx, target_expr) in self.unit.target_exprs.iter().enumerate() {
            if agg_col_idx >= agg_col_count {
                break;
            }
            let agg_info = target_info(target_expr);
            if agg_info.is_distinct {
                assert_eq!(self.qmd.agg_col_widths[agg_col_idx].actual, 8);
                let descriptor = self
                    .qmd
                    .count_distinct_descs
                    .get(&target_idx)
                    .copied()
                    .expect("count distinct descriptor");
                if descriptor.is_bitmap() {
                    if deferred {
                        agg_bitmap_size[agg_col_idx] = descriptor.bitmap_bits();
                    } else {
                        self.init_agg_vals[agg_col_idx] = self
                            .row_set_mem_owner
                            .allocate_count_distinct_bitmap(descriptor.bitmap_bits());
                    }
                } else if deferred {
                    agg_bitmap_size[agg_col_idx] = -1;
                } else {
                    self.init_agg_vals[agg_col_idx] =
                        self.row_set_mem_owner.allocate_count_distinct_set();
                }
            }
            agg_col_idx += target_slot_widths(target_expr).len();
        }
        agg_bitmap_size
    }

    fn init_column_per_row(
        &self,
        buf: &mut [u8],
        row_col_base: usize,
        bin: usize,
        bitmap_sizes: &[i64],
    ) {
        let mut col_off = row_col_base;
        for col_idx in 0..self.qmd.agg_col_widths.len() {
            let bitmap_size = bitmap_sizes[col_idx];
            let init_val = if bitmap_size == 0 {
                self.init_agg_vals[col_idx]
            } else {
                assert_eq!(self.qmd.agg_col_widths[col_idx].compact, 8);
                if bitmap_size > 0 {
                    self.row_set_mem_owner
                        .allocate_count_distinct_bitmap(bitmap_size)
                } else {
                    self.row_set_mem_owner.allocate_count_distinct_set()
                }
            };
            write_slot_bytes(
                buf,
                col_off,
                self.qmd.agg_col_widths[col_idx].compact,
                init_val,
            );
            col_off += self.qmd.next_col_off_in_bytes(col_off, bin, col_idx);
        }
    }

    fn init_groups(&mut self, buf: &mut [u8], entry_count: usize, keyless: bool, warp_size: usize) {
        let key_qw_count = self.qmd.group_col_widths.len();
        let row_size = self.qmd.row_size();
        let col_base_off = self.qmd.col_off_in_bytes(0, 0);
        let agg_bitmap_size = self.allocate_count_distinct_buffers(true);

        if keyless {
            assert!(warp_size >= 1);
            assert_eq!(key_qw_count, 1);
            let mut row_off = 0usize;
            for _warp_idx in 0..warp_size {
                for bin in 0..entry_count {
                    self.init_column_per_row(buf, row_off + col_base_off, bin, &agg_bitmap_size);
                    row_off += row_size;
                }
            }
            return;
        }

        let mut row_off = 0usize;
        for bin in 0..entry_count {
            for key_idx in 0..key_qw_count {
                write_slot_bytes(buf, row_off + key_idx * 8, 8, EMPTY_KEY_64);
            }
            self.init_column_per_row(buf, row_off + col_base_off, bin, &agg_bitmap_size);
            row_off += row_size;
        }
    }

    fn init_columnar_groups(&mut self, buf: &mut [u8]) {
        let agg_bitmap_size = self.allocate_count_distinct_buffers(true);
        let need_padding = !self.qmd.is_compact_layout_isometric();
        let entry_count = self.qmd.entry_count;
        assert_eq!(self.qmd.group_col_widths.len(), 1);
        let mut off = 0usize;
        if !self.qmd.keyless {
            for _ in 0..entry_count {
                write_slot_bytes(buf, off, 8, EMPTY_KEY_64);
                off += 8;
            }
        }
        for (col_idx, col_width) in self.qmd.agg_col_widths.clone().iter().enumerate() {
            let bitmap_size = agg_bitmap_size[col_idx];
            for _ in 0..entry_count {
                let init_val = if bitmap_size == 0 {
                    self.init_agg_vals[col_idx]
                } else {
                    assert_eq!(col_width.compact, 8);
                    if bitmap_size > 0 {
                        self.row_set_mem_owner
                            .allocate_count_distinct_bitmap(bitmap_size)
                    } else {
                        self.row_set_mem_owner.allocate_count_distinct_set()
                    }
                };
                write_slot_bytes(buf, off, col_width.compact, init_val);
                off += col_width.compact as usize;
            }
            if need_padding {
                off = align_to_8(off);
            }
        }
    }

    /// Initial values compacted to the row's target region layout, one
    /// 8-byte slot per quad of `align_to_8(cols_size)`.
    fn compact_init_vals(
        cmpt_quads: usize,
        init_vals: &[i64],
        col_widths: &[ColWidth],
    ) -> Vec<u8> {
        let mut buf = vec![0u8; cmpt_quads * 8];
        let mut off = 0usize;
        for (idx, col_width) in col_widths.iter().enumerate() {
            let chosen_bytes = col_width.compact;
            if chosen_bytes == 8 {
                off = align_to_8(off);
            }
            write_slot_bytes(&mut buf, off, chosen_bytes, init_vals[idx]);
            off += chosen_bytes as usize;
        }
        buf
    }

    fn marshalled_init_vals(&self, is_group_by: bool) -> Vec<u8> {
        if is_group_by && !self.output_columnar {
            let cmpt_quads = align_to_8(self.qmd.cols_size()) / 8;
            Self::compact_init_vals(cmpt_quads, &self.init_agg_vals, &self.qmd.agg_col_widths)
        } else {
            let mut raw = Vec::with_capacity(self.init_agg_vals.len() * 8);
            for v in &self.init_agg_vals {
                raw.extend_from_slice(&v.to_le_bytes());
            }
            raw
        }
    }

    fn frag_row_offsets(&self) -> Vec<i64> {
        let mut offsets = Vec::with_capacity(self.fragments.len());
        let mut acc = 0i64;
        for fragment in &self.fragments {
            offsets.push(acc);
            acc += fragment.num_rows() as i64;
        }
        offsets
    }

    /// First non-zero per-lane code wins.
    fn scan_error_codes(error_codes: &[i32]) -> i32 {
        for &err in error_codes {
            if err != 0 {
                return err;
            }
        }
        0
    }

    /// Run the kernel on the host against the owner's buffers; no device
    /// traffic is involved.
    pub fn launch_host_code(
        &mut self,
        kernel: &KernelModule,
        literals: &[u8],
    ) -> GroupByResult<LaunchOutput> {
        assert_eq!(self.device_kind, DeviceKind::Cpu);
        let is_group_by = !self.qmd.group_col_widths.is_empty();
        let dims = LaunchDims { grid: 1, block: 1 };
        let lanes = dims.lane_count();
        let num_fragments = self.fragments.len();

        // Segment 0 is the parameter arena; group buffers follow.
        let mut arena: Vec<u8> = Vec::new();
        let arena_seg = 0usize;
        let mut push_bytes = |arena: &mut Vec<u8>, bytes: &[u8]| -> DevicePtr {
            let pad = (8 - arena.len() % 8) % 8;
            arena.resize(arena.len() + pad, 0);
            let off = arena.len();
            arena.extend_from_slice(bytes);
            pack_ptr(arena_seg, off)
        };

        // Column data, inner pointer arrays, outer array.
        let mut inner_ptrs = Vec::with_capacity(num_fragments);
        for fragment in &self.fragments {
            let mut col_ptrs: Vec<i64> = Vec::with_capacity(kernel.cols.len());
            for col in &kernel.cols {
                if col.is_list {
                    col_ptrs.push(0);
                    continue;
                }
                let chunk = fragment.columns.get(col.column).ok_or_else(|| {
                    GroupByError::Unsupported(format!("fragment missing column {}", col.column))
                })?;
                let width = col.width as usize;
                let mut raw = Vec::with_capacity(chunk.len() * width);
                for row in 0..chunk.len() {
                    raw.extend_from_slice(&chunk.value_bits(row).to_le_bytes()[..width]);
                }
                col_ptrs.push(push_bytes(&mut arena, &raw));
            }
            let as_bytes: Vec<u8> = col_ptrs.iter().flat_map(|p| p.to_le_bytes()).collect();
            inner_ptrs.push(push_bytes(&mut arena, &as_bytes));
        }
        let outer_bytes: Vec<u8> = inner_ptrs.iter().flat_map(|p| p.to_le_bytes()).collect();
        let col_buffers_ptr = push_bytes(&mut arena, &outer_bytes);

        let num_fragments_ptr = push_bytes(&mut arena, &(num_fragments as u32).to_le_bytes());
        let literals_ptr = if literals.is_empty() {
            0
        } else {
            push_bytes(&mut arena, literals)
        };
        let num_rows: Vec<u8> = self
            .fragments
            .iter()
            .flat_map(|f| (f.num_rows() as i64).to_le_bytes())
            .collect();
        let num_rows_ptr = push_bytes(&mut arena, &num_rows);
        let frag_off_bytes: Vec<u8> = self
            .frag_row_offsets()
            .iter()
            .flat_map(|o| o.to_le_bytes())
            .collect();
        let frag_row_offsets_ptr = push_bytes(&mut arena, &frag_off_bytes);
        let init_vals_ptr = {
            let marshalled = self.marshalled_init_vals(is_group_by);
            push_bytes(&mut arena, &marshalled)
        };
        let max_matched_ptr =
            push_bytes(&mut arena, &(self.unit.scan_limit as i32).to_le_bytes());
        let total_matched_ptr = push_bytes(&mut arena, &0i32.to_le_bytes());
        let error_code_ptr = push_bytes(&mut arena, &vec![0u8; lanes * 4]);
        let num_tables_ptr = push_bytes(&mut arena, &1u32.to_le_bytes());
        let join_hash_table_ptr =
            push_bytes(&mut arena, &self.unit.join_hash_table.to_le_bytes());
        let scratch_ptr = push_bytes(&mut arena, &[0u8; 8]);

        // Group buffer (or out-vec) pointer arrays.
        let mut out_vec_ptrs: Vec<DevicePtr> = Vec::new();
        let (groupby_buf_ptr, small_buf_ptr) = if is_group_by {
            let mut buf_ptrs: Vec<i64> = Vec::new();
            let mut seg = 1usize;
            for handle in &self.group_by_buffers {
                match handle {
                    Some(_) => {
                        buf_ptrs.push(pack_ptr(seg, 0));
                        seg += 1;
                    }
                    None => buf_ptrs.push(0),
                }
            }
            let groupby_bytes: Vec<u8> =
                buf_ptrs.iter().flat_map(|p| p.to_le_bytes()).collect();
            let groupby_buf_ptr = push_bytes(&mut arena, &groupby_bytes);
            let small_buf_ptr = if self.small_group_by_buffers.is_empty() {
                0
            } else {
                let mut small_ptrs: Vec<i64> = Vec::new();
                for handle in &self.small_group_by_buffers {
                    match handle {
                        Some(_) => {
                            small_ptrs.push(pack_ptr(seg, 0));
                            seg += 1;
                        }
                        None => small_ptrs.push(0),
                    }
                }
                let small_bytes: Vec<u8> =
                    small_ptrs.iter().flat_map(|p| p.to_le_bytes()).collect();
                push_bytes(&mut arena, &small_bytes)
            };
            (groupby_buf_ptr, small_buf_ptr)
        } else {
            for _ in 0..kernel.layout.agg_out_count {
                let ptr = push_bytes(&mut arena, &vec![0u8; lanes * num_fragments * 8]);
                out_vec_ptrs.push(ptr);
            }
            let out_bytes: Vec<u8> = out_vec_ptrs.iter().flat_map(|p| p.to_le_bytes()).collect();
            (push_bytes(&mut arena, &out_bytes), 0)
        };

        let params = KernelParams {
            col_buffers: col_buffers_ptr,
            num_fragments: num_fragments_ptr,
            literals: literals_ptr,
            num_rows: num_rows_ptr,
            frag_row_offsets: frag_row_offsets_ptr,
            init_agg_vals: init_vals_ptr,
            groupby_buf: groupby_buf_ptr,
            small_buf: small_buf_ptr,
            max_matched: max_matched_ptr,
            total_matched: total_matched_ptr,
            error_code: error_code_ptr,
            num_tables: num_tables_ptr,
            join_hash_table: join_hash_table_ptr,
        };

        // Lock the owner-held buffers for the duration of the run and expose
        // them as memory segments behind the pointer array built above.
        let mut guards = Vec::new();
        for handle in self.group_by_buffers.iter().flatten() {
            guards.push(handle.lock().unwrap_or_else(|e| e.into_inner()));
        }
        for handle in self.small_group_by_buffers.iter().flatten() {
            guards.push(handle.lock().unwrap_or_else(|e| e.into_inner()));
        }
        let output = {
            let mut segs: Vec<&mut [u8]> = vec![arena.as_mut_slice()];
            for guard in guards.iter_mut() {
                segs.push(guard.as_mut_slice());
            }
            let mut mem = KernelMemory::new(segs);
            let launch = KernelLaunch {
                module: kernel,
                dims,
                shared_mem_bytes: self.qmd.shared_mem_bytes(DeviceKind::Cpu),
                params: &params,
                owner: &self.row_set_mem_owner,
                fragments: &self.fragments,
                scratch: scratch_ptr,
            };
            crate::jit::interp::run_kernel(&mut mem, &launch)?;

            let error_code = {
                let mut codes = Vec::with_capacity(lanes);
                for lane in 0..lanes {
                    codes.push(mem.read_i32(ptr_add(error_code_ptr, lane * 4)));
                }
                Self::scan_error_codes(&codes)
            };
            let total_matched = mem.read_i32(total_matched_ptr);
            let mut out_vec = Vec::new();
            for ptr in &out_vec_ptrs {
                let mut lane_vals = Vec::with_capacity(lanes * num_fragments);
                for cell in 0..lanes * num_fragments {
                    lane_vals.push(mem.read_i64(ptr_add(*ptr, cell * 8)));
                }
                out_vec.push(lane_vals);
            }
            LaunchOutput {
                error_code,
                total_matched,
                out_vec,
            }
        };
        debug!(
            "host kernel complete: error_code={} out_vecs={}",
            output.error_code,
            output.out_vec.len()
        );
        Ok(output)
    }

    /// Allocate device memory for the parameter block and buffers, launch,
    /// and copy group buffers and error codes back.
    pub fn launch_device_code(
        &mut self,
        kernel: &KernelModule,
        allocator: &dyn DeviceAllocator,
        literals: &[u8],
    ) -> GroupByResult<LaunchOutput> {
        assert_eq!(self.device_kind, DeviceKind::Gpu);
        let is_group_by = self.qmd.buffer_size_bytes(DeviceKind::Gpu) > 0
            && !self.qmd.group_col_widths.is_empty();
        let dims = LaunchDims {
            grid: self.config.grid_size,
            block: self.config.block_size,
        };
        let lanes = dims.lane_count();
        let device_id = self.device_id;
        let num_fragments = self.fragments.len();
        let render_allocator = self
            .render_allocator_map
            .as_ref()
            .and_then(|map| map.get_render_allocator(device_id));

        let alloc_and_copy = |bytes: &[u8]| -> GroupByResult<DevicePtr> {
            let ptr = allocator.alloc_device_mem(bytes.len().max(1), device_id, false)?;
            allocator.copy_to_device(ptr, bytes, device_id)?;
            Ok(ptr)
        };

        // Column data, inner pointer arrays, outer array.
        let mut inner_ptrs = Vec::with_capacity(num_fragments);
        for fragment in &self.fragments {
            let mut col_ptrs: Vec<i64> = Vec::with_capacity(kernel.cols.len());
            for col in &kernel.cols {
                if col.is_list {
                    col_ptrs.push(0);
                    continue;
                }
                let chunk = fragment.columns.get(col.column).ok_or_else(|| {
                    GroupByError::Unsupported(format!("fragment missing column {}", col.column))
                })?;
                let width = col.width as usize;
                let mut raw = Vec::with_capacity(chunk.len() * width);
                for row in 0..chunk.len() {
                    raw.extend_from_slice(&chunk.value_bits(row).to_le_bytes()[..width]);
                }
                col_ptrs.push(alloc_and_copy(&raw)?);
            }
            let as_bytes: Vec<u8> = col_ptrs.iter().flat_map(|p| p.to_le_bytes()).collect();
            inner_ptrs.push(alloc_and_copy(&as_bytes)?);
        }
        let outer_bytes: Vec<u8> = inner_ptrs.iter().flat_map(|p| p.to_le_bytes()).collect();
        let col_buffers_ptr = alloc_and_copy(&outer_bytes)?;

        let num_rows: Vec<u8> = self
            .fragments
            .iter()
            .flat_map(|f| (f.num_rows() as i64).to_le_bytes())
            .collect();
        let frag_off_bytes: Vec<u8> = self
            .frag_row_offsets()
            .iter()
            .flat_map(|o| o.to_le_bytes())
            .collect();
        let marshalled_init_vals = self.marshalled_init_vals(is_group_by);

        let mut params = KernelParams {
            col_buffers: col_buffers_ptr,
            num_fragments: alloc_and_copy(&(num_fragments as u32).to_le_bytes())?,
            literals: if literals.is_empty() {
                0
            } else {
                alloc_and_copy(literals)?
            },
            num_rows: alloc_and_copy(&num_rows)?,
            frag_row_offsets: alloc_and_copy(&frag_off_bytes)?,
            init_agg_vals: alloc_and_copy(&marshalled_init_vals)?,
            groupby_buf: 0,
            small_buf: 0,
            max_matched: alloc_and_copy(&(self.unit.scan_limit as i32).to_le_bytes())?,
            total_matched: alloc_and_copy(&0i32.to_le_bytes())?,
            error_code: alloc_and_copy(&vec![0u8; lanes * 4])?,
            num_tables: alloc_and_copy(&1u32.to_le_bytes())?,
            join_hash_table: alloc_and_copy(&self.unit.join_hash_table.to_le_bytes())?,
        };
        let scratch_ptr = alloc_and_copy(&[0u8; 8])?;

        let mut dev_group_buffers: Vec<DevicePtr> = Vec::new();
        let mut dev_small_buffers: Vec<DevicePtr> = Vec::new();
        let mut out_vec_dev: Vec<DevicePtr> = Vec::new();

        if is_group_by {
            assert!(!self.group_by_buffers.is_empty() || render_allocator.is_some());
            let index_prefix_bytes = self.data_offset_in_buffer();
            // The lazy device path folds on-device initialization into the
            // H2D copy of a freshly built template.
            let lazy_template = if self.qmd.lazy_init_groups(DeviceKind::Gpu)
                && render_allocator.is_none()
            {
                Some(self.build_group_buffer_template()?)
            } else {
                None
            };
            let mut buf_ptrs: Vec<i64> = Vec::new();
            if let Some(render) = render_allocator {
                assert_eq!(render.allocated_size % 8, 0);
                for handle in &self.group_by_buffers {
                    buf_ptrs.push(if handle.is_some() { render.base } else { 0 });
                }
                if buf_ptrs.is_empty() {
                    buf_ptrs.push(render.base);
                }
            } else {
                for handle in &self.group_by_buffers {
                    match handle {
                        Some(handle) => {
                            let host = handle.lock().unwrap_or_else(|e| e.into_inner());
                            let dev = if let Some(template) = &lazy_template {
                                let ptr = allocator.alloc_device_mem(
                                    template.len() + index_prefix_bytes,
                                    device_id,
                                    false,
                                )?;
                                allocator.copy_to_device(
                                    ptr_add(ptr, index_prefix_bytes),
                                    template,
                                    device_id,
                                )?;
                                ptr
                            } else {
                                alloc_and_copy(host.as_slice())?
                            };
                            dev_group_buffers.push(dev);
                            // The kernel sees bin space only; the index
                            // prefix stays in front of it for the sort.
                            buf_ptrs.push(ptr_add(dev, index_prefix_bytes));
                        }
                        None => buf_ptrs.push(0),
                    }
                }
            }
            let groupby_bytes: Vec<u8> = buf_ptrs.iter().flat_map(|p| p.to_le_bytes()).collect();
            params.groupby_buf = alloc_and_copy(&groupby_bytes)?;

            if !self.small_group_by_buffers.is_empty() {
                let mut small_ptrs: Vec<i64> = Vec::new();
                for handle in &self.small_group_by_buffers {
                    match handle {
                        Some(handle) => {
                            let host = handle.lock().unwrap_or_else(|e| e.into_inner());
                            let dev = alloc_and_copy(host.as_slice())?;
                            dev_small_buffers.push(dev);
                            small_ptrs.push(dev);
                        }
                        None => small_ptrs.push(0),
                    }
                }
                let small_bytes: Vec<u8> =
                    small_ptrs.iter().flat_map(|p| p.to_le_bytes()).collect();
                params.small_buf = alloc_and_copy(&small_bytes)?;
            }
        } else {
            for _ in 0..kernel.layout.agg_out_count {
                let ptr = allocator.alloc_device_mem(
                    (lanes * num_fragments * 8).max(8),
                    device_id,
                    false,
                )?;
                out_vec_dev.push(ptr);
            }
            let out_bytes: Vec<u8> = out_vec_dev.iter().flat_map(|p| p.to_le_bytes()).collect();
            params.groupby_buf = alloc_and_copy(&out_bytes)?;
        }

        let launch = KernelLaunch {
            module: kernel,
            dims,
            shared_mem_bytes: self.qmd.shared_mem_bytes(DeviceKind::Gpu),
            params: &params,
            owner: &self.row_set_mem_owner,
            fragments: &self.fragments,
            scratch: scratch_ptr,
        };
        allocator.launch_kernel(launch, device_id)?;

        if is_group_by && render_allocator.is_none() {
            let mut dev_iter = dev_group_buffers.iter();
            for handle in self.group_by_buffers.iter().flatten() {
                let dev = dev_iter.next().expect("device buffer");
                let mut host = handle.lock().unwrap_or_else(|e| e.into_inner());
                allocator.copy_from_device(host.as_mut_slice(), *dev, device_id)?;
            }
            let mut dev_iter = dev_small_buffers.iter();
            for handle in self.small_group_by_buffers.iter().flatten() {
                let dev = dev_iter.next().expect("device small buffer");
                let mut host = handle.lock().unwrap_or_else(|e| e.into_inner());
                allocator.copy_from_device(host.as_mut_slice(), *dev, device_id)?;
            }
        }

        let mut error_bytes = vec![0u8; lanes * 4];
        allocator.copy_from_device(&mut error_bytes, params.error_code, device_id)?;
        let error_codes: Vec<i32> = error_bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let error_code = Self::scan_error_codes(&error_codes);
        let mut total_matched_bytes = [0u8; 4];
        allocator.copy_from_device(&mut total_matched_bytes, params.total_matched, device_id)?;
        let total_matched = i32::from_le_bytes(total_matched_bytes);

        let mut out_vec = Vec::new();
        for dev in &out_vec_dev {
            let mut bytes = vec![0u8; lanes * num_fragments * 8];
            allocator.copy_from_device(&mut bytes, *dev, device_id)?;
            out_vec.push(
                bytes
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes(c.try_into().expect("quad")))
                    .collect(),
            );
        }
        debug!(
            "device kernel complete: device_id={} error_code={} total_matched={}",
            device_id, error_code, total_matched
        );
        Ok(LaunchOutput {
            error_code,
            total_matched,
            out_vec,
        })
    }
}
