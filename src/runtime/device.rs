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
//! Device memory model and the allocator collaborator.
//!
//! Responsibilities:
//! - `KernelMemory`: the typed, bounds-checked view generated kernels use for
//!   all pointer traffic. Pointers are segment-tagged 64-bit handles; the
//!   zero handle is null.
//! - `DeviceAllocator`: the collaborator contract the execution context
//!   drives (allocate inside kernel-parameter preparation only, copy in/out,
//!   launch). `SoftwareDevice` is the reference implementation: one bump
//!   arena per device id, with the interpreter as its "kernel".

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use tracing::debug;

use crate::common::error::{GroupByError, GroupByResult};
use crate::exec::chunk::FragmentColumns;
use crate::jit::KernelModule;
use crate::jit::interp;
use crate::runtime::mem_owner::RowSetMemoryOwner;
use crate::runtime::mem_tracker::{MemCategory, QueryMemTracker};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// 1D launch shape; the core only ever launches `(grid, 1, 1) x (block, 1, 1)`.
#[derive(Clone, Copy, Debug)]
pub struct LaunchDims {
    pub grid: usize,
    pub block: usize,
}

impl LaunchDims {
    pub fn lane_count(&self) -> usize {
        self.grid * self.block
    }
}

/// Segment-tagged pointer. Zero is null; otherwise the high bits carry the
/// 1-based segment id and the low 40 bits the byte offset.
pub type DevicePtr = i64;

const PTR_OFF_BITS: u32 = 40;
const PTR_OFF_MASK: i64 = (1 << PTR_OFF_BITS) - 1;

pub fn pack_ptr(seg: usize, off: usize) -> DevicePtr {
    debug_assert!((off as i64) <= PTR_OFF_MASK);
    (((seg as i64) + 1) << PTR_OFF_BITS) | off as i64
}

pub fn unpack_ptr(ptr: DevicePtr) -> (usize, usize) {
    debug_assert!(ptr != 0);
    (((ptr >> PTR_OFF_BITS) - 1) as usize, (ptr & PTR_OFF_MASK) as usize)
}

pub fn ptr_add(ptr: DevicePtr, bytes: usize) -> DevicePtr {
    debug_assert!(ptr != 0);
    ptr + bytes as i64
}

/// Mutable view over the memory a kernel may touch. All offset arithmetic is
/// bounds-checked; the layout formulas own correctness, this owns safety.
pub struct KernelMemory<'a> {
    segs: Vec<&'a mut [u8]>,
}

impl<'a> KernelMemory<'a> {
    pub fn new(segs: Vec<&'a mut [u8]>) -> Self {
        Self { segs }
    }

    pub fn seg_ptr(&self, seg: usize) -> DevicePtr {
        pack_ptr(seg, 0)
    }

    fn range(&self, ptr: DevicePtr, len: usize) -> (usize, usize) {
        let (seg, off) = unpack_ptr(ptr);
        assert!(
            off + len <= self.segs[seg].len(),
            "kernel memory access out of bounds: seg={} off={} len={} size={}",
            seg,
            off,
            len,
            self.segs[seg].len()
        );
        (seg, off)
    }

    pub fn bytes(&self, ptr: DevicePtr, len: usize) -> &[u8] {
        let (seg, off) = self.range(ptr, len);
        &self.segs[seg][off..off + len]
    }

    pub fn bytes_mut(&mut self, ptr: DevicePtr, len: usize) -> &mut [u8] {
        let (seg, off) = self.range(ptr, len);
        &mut self.segs[seg][off..off + len]
    }

    pub fn read_i64(&self, ptr: DevicePtr) -> i64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(ptr, 8));
        i64::from_le_bytes(buf)
    }

    pub fn write_i64(&mut self, ptr: DevicePtr, value: i64) {
        self.bytes_mut(ptr, 8).copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_i32(&self, ptr: DevicePtr) -> i32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.bytes(ptr, 4));
        i32::from_le_bytes(buf)
    }

    pub fn write_i32(&mut self, ptr: DevicePtr, value: i32) {
        self.bytes_mut(ptr, 4).copy_from_slice(&value.to_le_bytes());
    }

    /// Read a `width`-byte slot as a 64-bit pattern. Integer slots are
    /// sign-extended; FP slots keep their raw bit pattern.
    pub fn read_slot(&self, ptr: DevicePtr, width: u8, is_fp: bool) -> i64 {
        let width = width as usize;
        let mut buf = [0u8; 8];
        buf[..width].copy_from_slice(self.bytes(ptr, width));
        let raw = i64::from_le_bytes(buf);
        if is_fp || width == 8 {
            return raw;
        }
        let shift = 64 - (width as u32) * 8;
        (raw << shift) >> shift
    }

    pub fn write_slot(&mut self, ptr: DevicePtr, width: u8, value: i64) {
        let width = width as usize;
        self.bytes_mut(ptr, width)
            .copy_from_slice(&value.to_le_bytes()[..width]);
    }

    pub fn copy_within_from(&mut self, dst: DevicePtr, src: &[u8]) {
        self.bytes_mut(dst, src.len()).copy_from_slice(src);
    }
}

/// Everything a launch needs besides the parameter block itself.
pub struct KernelLaunch<'a> {
    pub module: &'a KernelModule,
    pub dims: LaunchDims,
    pub shared_mem_bytes: usize,
    pub params: &'a KernelParams,
    pub owner: &'a RowSetMemoryOwner,
    pub fragments: &'a [FragmentColumns],
    /// Backing slot for the row function's `crt_matched` argument.
    pub scratch: DevicePtr,
}

/// The fixed-arity kernel parameter block: one device-resident slot each.
#[derive(Clone, Copy, Debug, Default)]
pub struct KernelParams {
    pub col_buffers: DevicePtr,
    pub num_fragments: DevicePtr,
    pub literals: DevicePtr,
    pub num_rows: DevicePtr,
    pub frag_row_offsets: DevicePtr,
    pub init_agg_vals: DevicePtr,
    pub groupby_buf: DevicePtr,
    pub small_buf: DevicePtr,
    pub max_matched: DevicePtr,
    pub total_matched: DevicePtr,
    pub error_code: DevicePtr,
    pub num_tables: DevicePtr,
    pub join_hash_table: DevicePtr,
}

pub const KERN_PARAM_COUNT: usize = 13;

impl KernelParams {
    pub fn as_array(&self) -> [DevicePtr; KERN_PARAM_COUNT] {
        [
            self.col_buffers,
            self.num_fragments,
            self.literals,
            self.num_rows,
            self.frag_row_offsets,
            self.init_agg_vals,
            self.groupby_buf,
            self.small_buf,
            self.max_matched,
            self.total_matched,
            self.error_code,
            self.num_tables,
            self.join_hash_table,
        ]
    }
}

/// Caller-supplied device buffer for render output. The allocation is made
/// by the render subsystem; the core only checks the 8-byte alignment
/// postcondition and never initializes through it.
#[derive(Clone, Copy, Debug)]
pub struct RenderAllocator {
    pub base: DevicePtr,
    pub allocated_size: usize,
}

#[derive(Default)]
pub struct RenderAllocatorMap {
    allocators: Mutex<HashMap<i32, RenderAllocator>>,
}

impl RenderAllocatorMap {
    pub fn insert(&self, device_id: i32, allocator: RenderAllocator) {
        self.allocators
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id, allocator);
    }

    pub fn get_render_allocator(&self, device_id: i32) -> Option<RenderAllocator> {
        self.allocators
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&device_id)
            .copied()
    }
}

/// Device allocator collaborator. Allocations are tracked per device id and
/// only released wholesale at end of query; the core never frees explicitly.
pub trait DeviceAllocator: Send + Sync {
    fn alloc_device_mem(
        &self,
        bytes: usize,
        device_id: i32,
        render: bool,
    ) -> GroupByResult<DevicePtr>;

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8], device_id: i32) -> GroupByResult<()>;

    fn copy_from_device(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        device_id: i32,
    ) -> GroupByResult<()>;

    fn launch_kernel(&self, launch: KernelLaunch<'_>, device_id: i32) -> GroupByResult<()>;

    /// Drop every allocation made for the device; called at end of query.
    fn release_device(&self, device_id: i32);
}

/// Reference device: a bump arena per device id, kernels executed by the IR
/// interpreter. Lanes run sequentially, so `_shared` atomics degenerate to
/// plain updates without changing the contract.
pub struct SoftwareDevice {
    arenas: Mutex<HashMap<i32, Vec<u8>>>,
    tracker: Arc<QueryMemTracker>,
}

impl SoftwareDevice {
    pub fn new(tracker: &Arc<QueryMemTracker>) -> Self {
        Self {
            arenas: Mutex::new(HashMap::new()),
            tracker: Arc::clone(tracker),
        }
    }
}

impl DeviceAllocator for SoftwareDevice {
    fn alloc_device_mem(
        &self,
        bytes: usize,
        device_id: i32,
        render: bool,
    ) -> GroupByResult<DevicePtr> {
        let mut arenas = self.arenas.lock().unwrap_or_else(|e| e.into_inner());
        let arena = arenas.entry(device_id).or_default();
        // Keep every allocation 8-aligned; render allocations promise this
        // to their consumer.
        let pad = (8 - arena.len() % 8) % 8;
        let off = arena.len() + pad;
        if (off + bytes) as i64 > PTR_OFF_MASK {
            return Err(GroupByError::DeviceAllocationFailed { bytes, device_id });
        }
        arena.resize(off + bytes, 0);
        self.tracker.consume(MemCategory::DeviceArena, pad + bytes);
        debug!(
            "device alloc: device_id={} bytes={} off={} render={}",
            device_id, bytes, off, render
        );
        Ok(pack_ptr(0, off))
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8], device_id: i32) -> GroupByResult<()> {
        let mut arenas = self.arenas.lock().unwrap_or_else(|e| e.into_inner());
        let arena = arenas.entry(device_id).or_default();
        let (_, off) = unpack_ptr(dst);
        arena[off..off + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn copy_from_device(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        device_id: i32,
    ) -> GroupByResult<()> {
        let arenas = self.arenas.lock().unwrap_or_else(|e| e.into_inner());
        let arena = arenas.get(&device_id).ok_or(GroupByError::KernelError(-1))?;
        let (_, off) = unpack_ptr(src);
        dst.copy_from_slice(&arena[off..off + dst.len()]);
        Ok(())
    }

    fn launch_kernel(&self, launch: KernelLaunch<'_>, device_id: i32) -> GroupByResult<()> {
        // The arena is taken out for the duration of the launch so the
        // kernel memory view holds the only mutable reference.
        let mut arena = {
            let mut arenas = self.arenas.lock().unwrap_or_else(|e| e.into_inner());
            arenas.remove(&device_id).unwrap_or_default()
        };
        debug!(
            "launch: device_id={} grid={} block={} shared_mem_bytes={}",
            device_id, launch.dims.grid, launch.dims.block, launch.shared_mem_bytes
        );
        let mut mem = KernelMemory::new(vec![arena.as_mut_slice()]);
        let result = interp::run_kernel(&mut mem, &launch);
        let mut arenas = self.arenas.lock().unwrap_or_else(|e| e.into_inner());
        arenas.insert(device_id, arena);
        result
    }

    fn release_device(&self, device_id: i32) {
        let mut arenas = self.arenas.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(arena) = arenas.remove(&device_id) {
            self.tracker.release(MemCategory::DeviceArena, arena.len());
            debug!("device released: device_id={} {}", device_id, self.tracker);
        }
    }
}
