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
//! Runtime intrinsics linked by generated kernels.
//!
//! Responsibilities:
//! - Group-slot acquisition: the direct-addressed fast path (plain, keyless,
//!   warp-semiprivate, columnar), the one-key slow path with small-buffer
//!   overflow, bounded open addressing over composite keys, and the
//!   multi-column perfect-hash probe.
//! - Per-slot aggregate updates with null-skipping and FP variants, and
//!   COUNT DISTINCT routing into owner-held bitmaps and spill sets.
//!
//! All lookups return a pointer to the slot's column region (past any keys);
//! the open-addressing probes return null when the table is full.

use crate::exec::groupby::hash::key_hash;
use crate::exec::unit::EMPTY_KEY_64;
use crate::runtime::device::{DevicePtr, KernelMemory, ptr_add};
use crate::runtime::mem_owner::RowSetMemoryOwner;

fn quads(n: i64) -> usize {
    n as usize * 8
}

fn bin_for(key: i64, min_key: i64, bucket: i64) -> i64 {
    let mut diff = key - min_key;
    if bucket != 0 {
        diff /= bucket;
    }
    diff
}

/// Direct-addressed lookup; writes the key on first touch. Never fails.
pub fn get_group_value_fast(
    mem: &mut KernelMemory<'_>,
    groups_buffer: DevicePtr,
    key: i64,
    min_key: i64,
    bucket: i64,
    row_size_quad: i64,
) -> DevicePtr {
    let bin = bin_for(key, min_key, bucket);
    let row = ptr_add(groups_buffer, bin as usize * quads(row_size_quad));
    if mem.read_i64(row) == EMPTY_KEY_64 {
        mem.write_i64(row, key);
    }
    ptr_add(row, 8)
}

/// Keyless variant: the row is all columns, presence is the marker slot.
pub fn get_group_value_fast_keyless(
    groups_buffer: DevicePtr,
    key: i64,
    min_key: i64,
    bucket: i64,
    row_size_quad: i64,
) -> DevicePtr {
    let bin = bin_for(key, min_key, bucket);
    ptr_add(groups_buffer, bin as usize * quads(row_size_quad))
}

/// Warp-interleaved keyless variant: lane `warp_idx` owns row
/// `bin * warp_size + warp_idx`.
pub fn get_group_value_fast_keyless_semiprivate(
    groups_buffer: DevicePtr,
    key: i64,
    min_key: i64,
    bucket: i64,
    row_size_quad: i64,
    warp_idx: i64,
    warp_size: i64,
) -> DevicePtr {
    let bin = bin_for(key, min_key, bucket);
    let row = bin * warp_size + warp_idx;
    ptr_add(groups_buffer, row as usize * quads(row_size_quad))
}

/// Columnar keyless lookup returns the bin index, not a pointer.
pub fn get_columnar_group_bin_offset(key: i64, min_key: i64, bucket: i64) -> i64 {
    bin_for(key, min_key, bucket)
}

/// Probe one slot: claim it if empty (keys written, columns initialized from
/// `init_vals` when provided), accept it if the keys match, else report a
/// collision with `None`.
fn get_matching_group_value(
    mem: &mut KernelMemory<'_>,
    groups_buffer: DevicePtr,
    h: usize,
    keys: &[i64],
    row_size_quad: i64,
    init_vals: DevicePtr,
) -> Option<DevicePtr> {
    let row = ptr_add(groups_buffer, h * quads(row_size_quad));
    if mem.read_i64(row) == EMPTY_KEY_64 {
        for (i, key) in keys.iter().enumerate() {
            mem.write_i64(ptr_add(row, i * 8), *key);
        }
        if init_vals != 0 {
            let col_quads = row_size_quad as usize - keys.len();
            for q in 0..col_quads {
                let val = mem.read_i64(ptr_add(init_vals, q * 8));
                mem.write_i64(ptr_add(row, (keys.len() + q) * 8), val);
            }
        }
        return Some(ptr_add(row, keys.len() * 8));
    }
    for (i, key) in keys.iter().enumerate() {
        if mem.read_i64(ptr_add(row, i * 8)) != *key {
            return None;
        }
    }
    Some(ptr_add(row, keys.len() * 8))
}

/// Bounded open addressing over a composite key; null when the table is full.
pub fn get_group_value(
    mem: &mut KernelMemory<'_>,
    groups_buffer: DevicePtr,
    entry_count: usize,
    keys: &[i64],
    row_size_quad: i64,
    init_vals: DevicePtr,
) -> DevicePtr {
    if entry_count == 0 {
        return 0;
    }
    let start = (key_hash(keys) % entry_count as u64) as usize;
    let mut h = start;
    loop {
        if let Some(ptr) = get_matching_group_value(mem, groups_buffer, h, keys, row_size_quad, init_vals)
        {
            return ptr;
        }
        h = (h + 1) % entry_count;
        if h == start {
            return 0;
        }
    }
}

/// One-key lookup: direct slot when the key falls inside the main table's
/// range, small-buffer open addressing otherwise.
#[allow(clippy::too_many_arguments)]
pub fn get_group_value_one_key(
    mem: &mut KernelMemory<'_>,
    groups_buffer: DevicePtr,
    entry_count: usize,
    small_groups_buffer: DevicePtr,
    entry_count_small: usize,
    key: i64,
    min_key: i64,
    row_size_quad: i64,
    init_vals: DevicePtr,
) -> DevicePtr {
    let off = key - min_key;
    if off >= 0 && (off as usize) < entry_count {
        return get_matching_group_value(
            mem,
            groups_buffer,
            off as usize,
            &[key],
            row_size_quad,
            init_vals,
        )
        .unwrap_or(0);
    }
    get_group_value(
        mem,
        small_groups_buffer,
        entry_count_small,
        &[key],
        row_size_quad,
        init_vals,
    )
}

/// Perfect-hash probe: the hash is collision-free over legal keys, so the
/// slot is claimed or already carries the same key.
pub fn get_matching_group_value_perfect_hash(
    mem: &mut KernelMemory<'_>,
    groups_buffer: DevicePtr,
    h: i64,
    keys: &[i64],
    row_size_quad: i64,
) -> DevicePtr {
    let row = ptr_add(groups_buffer, h as usize * quads(row_size_quad));
    if mem.read_i64(row) == EMPTY_KEY_64 {
        for (i, key) in keys.iter().enumerate() {
            mem.write_i64(ptr_add(row, i * 8), *key);
        }
    }
    ptr_add(row, keys.len() * 8)
}

fn read_int(mem: &KernelMemory<'_>, ptr: DevicePtr, width: u8) -> i64 {
    mem.read_slot(ptr, width, false)
}

fn read_fp(mem: &KernelMemory<'_>, ptr: DevicePtr, width: u8) -> f64 {
    let bits = mem.read_slot(ptr, width, true);
    if width == 4 {
        f32::from_bits(bits as u32) as f64
    } else {
        f64::from_bits(bits as u64)
    }
}

fn write_fp(mem: &mut KernelMemory<'_>, ptr: DevicePtr, width: u8, value: f64) {
    let bits = if width == 4 {
        (value as f32).to_bits() as i64
    } else {
        value.to_bits() as i64
    };
    mem.write_slot(ptr, width, bits);
}

fn fp_of_bits(bits: i64, width: u8) -> f64 {
    if width == 4 {
        f32::from_bits(bits as u32) as f64
    } else {
        f64::from_bits(bits as u64)
    }
}

pub fn agg_id(mem: &mut KernelMemory<'_>, ptr: DevicePtr, width: u8, val: i64) {
    mem.write_slot(ptr, width, val);
}

pub fn agg_count(mem: &mut KernelMemory<'_>, ptr: DevicePtr, width: u8) {
    let old = read_int(mem, ptr, width);
    mem.write_slot(ptr, width, old.wrapping_add(1));
}

pub fn agg_count_skip_val(
    mem: &mut KernelMemory<'_>,
    ptr: DevicePtr,
    width: u8,
    val: i64,
    skip_val: i64,
) {
    if val != skip_val {
        agg_count(mem, ptr, width);
    }
}

pub fn agg_sum(mem: &mut KernelMemory<'_>, ptr: DevicePtr, width: u8, val: i64) {
    let old = read_int(mem, ptr, width);
    mem.write_slot(ptr, width, old.wrapping_add(val));
}

/// Null-skipping sum: the accumulator starts at the sentinel and the first
/// real value replaces it.
pub fn agg_sum_skip_val(
    mem: &mut KernelMemory<'_>,
    ptr: DevicePtr,
    width: u8,
    val: i64,
    skip_val: i64,
) {
    if val == skip_val {
        return;
    }
    let old = read_int(mem, ptr, width);
    if old == skip_val {
        mem.write_slot(ptr, width, val);
    } else {
        mem.write_slot(ptr, width, old.wrapping_add(val));
    }
}

pub fn agg_min(mem: &mut KernelMemory<'_>, ptr: DevicePtr, width: u8, val: i64) {
    let old = read_int(mem, ptr, width);
    mem.write_slot(ptr, width, old.min(val));
}

pub fn agg_min_skip_val(
    mem: &mut KernelMemory<'_>,
    ptr: DevicePtr,
    width: u8,
    val: i64,
    skip_val: i64,
) {
    if val == skip_val {
        return;
    }
    let old = read_int(mem, ptr, width);
    if old == skip_val {
        mem.write_slot(ptr, width, val);
    } else {
        mem.write_slot(ptr, width, old.min(val));
    }
}

pub fn agg_max(mem: &mut KernelMemory<'_>, ptr: DevicePtr, width: u8, val: i64) {
    let old = read_int(mem, ptr, width);
    mem.write_slot(ptr, width, old.max(val));
}

pub fn agg_max_skip_val(
    mem: &mut KernelMemory<'_>,
    ptr: DevicePtr,
    width: u8,
    val: i64,
    skip_val: i64,
) {
    if val == skip_val {
        return;
    }
    let old = read_int(mem, ptr, width);
    if old == skip_val {
        mem.write_slot(ptr, width, val);
    } else {
        mem.write_slot(ptr, width, old.max(val));
    }
}

pub fn agg_sum_fp(mem: &mut KernelMemory<'_>, ptr: DevicePtr, width: u8, val_bits: i64) {
    let old = read_fp(mem, ptr, width);
    write_fp(mem, ptr, width, old + fp_of_bits(val_bits, width));
}

pub fn agg_sum_fp_skip_val(
    mem: &mut KernelMemory<'_>,
    ptr: DevicePtr,
    width: u8,
    val_bits: i64,
    skip_bits: i64,
) {
    if val_bits == skip_bits {
        return;
    }
    let old_bits = mem.read_slot(ptr, width, true);
    if old_bits == skip_bits {
        mem.write_slot(ptr, width, val_bits);
    } else {
        agg_sum_fp(mem, ptr, width, val_bits);
    }
}

pub fn agg_min_fp(mem: &mut KernelMemory<'_>, ptr: DevicePtr, width: u8, val_bits: i64) {
    let old = read_fp(mem, ptr, width);
    write_fp(mem, ptr, width, old.min(fp_of_bits(val_bits, width)));
}

pub fn agg_min_fp_skip_val(
    mem: &mut KernelMemory<'_>,
    ptr: DevicePtr,
    width: u8,
    val_bits: i64,
    skip_bits: i64,
) {
    if val_bits == skip_bits {
        return;
    }
    let old_bits = mem.read_slot(ptr, width, true);
    if old_bits == skip_bits {
        mem.write_slot(ptr, width, val_bits);
    } else {
        agg_min_fp(mem, ptr, width, val_bits);
    }
}

pub fn agg_max_fp(mem: &mut KernelMemory<'_>, ptr: DevicePtr, width: u8, val_bits: i64) {
    let old = read_fp(mem, ptr, width);
    write_fp(mem, ptr, width, old.max(fp_of_bits(val_bits, width)));
}

pub fn agg_max_fp_skip_val(
    mem: &mut KernelMemory<'_>,
    ptr: DevicePtr,
    width: u8,
    val_bits: i64,
    skip_bits: i64,
) {
    if val_bits == skip_bits {
        return;
    }
    let old_bits = mem.read_slot(ptr, width, true);
    if old_bits == skip_bits {
        mem.write_slot(ptr, width, val_bits);
    } else {
        agg_max_fp(mem, ptr, width, val_bits);
    }
}

/// Spill-set COUNT DISTINCT: the slot holds the owner handle of the set.
pub fn agg_count_distinct(
    mem: &KernelMemory<'_>,
    owner: &RowSetMemoryOwner,
    ptr: DevicePtr,
    val: i64,
) {
    let handle = mem.read_i64(ptr);
    if let Some(set) = owner.count_distinct_set(handle) {
        set.lock().unwrap_or_else(|e| e.into_inner()).insert(val);
    }
}

pub fn agg_count_distinct_skip_val(
    mem: &KernelMemory<'_>,
    owner: &RowSetMemoryOwner,
    ptr: DevicePtr,
    val: i64,
    skip_val: i64,
) {
    if val != skip_val {
        agg_count_distinct(mem, owner, ptr, val);
    }
}

/// Dense-bitmap COUNT DISTINCT: the slot holds the owner handle of the
/// bitmap; bit `val - min_val` marks presence.
pub fn agg_count_distinct_bitmap(
    mem: &KernelMemory<'_>,
    owner: &RowSetMemoryOwner,
    ptr: DevicePtr,
    val: i64,
    min_val: i64,
) {
    let handle = mem.read_i64(ptr);
    if let Some(bitmap) = owner.count_distinct_bitmap(handle) {
        let bit = (val - min_val) as usize;
        let mut guard = bitmap.lock().unwrap_or_else(|e| e.into_inner());
        guard[bit / 8] |= 1 << (bit % 8);
    }
}

pub fn agg_count_distinct_bitmap_skip_val(
    mem: &KernelMemory<'_>,
    owner: &RowSetMemoryOwner,
    ptr: DevicePtr,
    val: i64,
    min_val: i64,
    skip_val: i64,
) {
    if val != skip_val {
        agg_count_distinct_bitmap(mem, owner, ptr, val, min_val);
    }
}

/// Array COUNT DISTINCT: every non-null element of the row's array joins the
/// spill set.
pub fn agg_count_distinct_array(
    mem: &KernelMemory<'_>,
    owner: &RowSetMemoryOwner,
    ptr: DevicePtr,
    elems: &[i64],
    skip_val: i64,
) {
    let handle = mem.read_i64(ptr);
    if let Some(set) = owner.count_distinct_set(handle) {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        for elem in elems {
            if *elem != skip_val {
                guard.insert(*elem);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::device::KernelMemory;
    use crate::runtime::mem_owner::RowSetMemoryOwner;
    use crate::runtime::mem_tracker::QueryMemTracker;

    fn mem_with(buf: &mut Vec<u8>) -> KernelMemory<'_> {
        KernelMemory::new(vec![buf.as_mut_slice()])
    }

    #[test]
    fn test_get_group_value_fast_claims_key() {
        // Two rows of 2 quads each (key + one column).
        let mut buf = Vec::new();
        for _ in 0..2 {
            buf.extend_from_slice(&EMPTY_KEY_64.to_le_bytes());
            buf.extend_from_slice(&0i64.to_le_bytes());
        }
        let mut mem = mem_with(&mut buf);
        let base = mem.seg_ptr(0);
        let col = get_group_value_fast(&mut mem, base, 11, 10, 0, 2);
        assert_eq!(mem.read_i64(ptr_add(base, 16)), 11);
        assert_eq!(col, ptr_add(base, 24));
        // Second probe of the same key reuses the slot.
        assert_eq!(get_group_value_fast(&mut mem, base, 11, 10, 0, 2), col);
    }

    #[test]
    fn test_open_addressing_wraps_and_fills() {
        let entries = 2usize;
        let mut buf = Vec::new();
        for _ in 0..entries {
            buf.extend_from_slice(&EMPTY_KEY_64.to_le_bytes());
            buf.extend_from_slice(&0i64.to_le_bytes());
        }
        let mut mem = mem_with(&mut buf);
        let base = mem.seg_ptr(0);
        let a = get_group_value(&mut mem, base, entries, &[7], 2, 0);
        let b = get_group_value(&mut mem, base, entries, &[8], 2, 0);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
        // Table is full now; a third key cannot be placed.
        assert_eq!(get_group_value(&mut mem, base, entries, &[9], 2, 0), 0);
        // Existing keys still resolve to their slots.
        assert_eq!(get_group_value(&mut mem, base, entries, &[7], 2, 0), a);
    }

    #[test]
    fn test_agg_sum_skip_val_replaces_sentinel() {
        let mut buf = i64::MIN.to_le_bytes().to_vec();
        let mut mem = mem_with(&mut buf);
        let ptr = mem.seg_ptr(0);
        agg_sum_skip_val(&mut mem, ptr, 8, i64::MIN, i64::MIN);
        assert_eq!(mem.read_i64(ptr), i64::MIN);
        agg_sum_skip_val(&mut mem, ptr, 8, 5, i64::MIN);
        assert_eq!(mem.read_i64(ptr), 5);
        agg_sum_skip_val(&mut mem, ptr, 8, 3, i64::MIN);
        assert_eq!(mem.read_i64(ptr), 8);
    }

    #[test]
    fn test_agg_min_max_int32_slots() {
        let mut buf = vec![0u8; 8];
        let mut mem = mem_with(&mut buf);
        let ptr = mem.seg_ptr(0);
        mem.write_slot(ptr, 4, i32::MAX as i64);
        agg_min(&mut mem, ptr, 4, 9);
        agg_min(&mut mem, ptr, 4, -3);
        assert_eq!(mem.read_slot(ptr, 4, false), -3);
        mem.write_slot(ptr_add(ptr, 4), 4, i32::MIN as i64);
        agg_max(&mut mem, ptr_add(ptr, 4), 4, 17);
        assert_eq!(mem.read_slot(ptr_add(ptr, 4), 4, false), 17);
    }

    #[test]
    fn test_agg_sum_fp() {
        let mut buf = 0f64.to_bits().to_le_bytes().to_vec();
        let mut mem = mem_with(&mut buf);
        let ptr = mem.seg_ptr(0);
        agg_sum_fp(&mut mem, ptr, 8, 1.5f64.to_bits() as i64);
        agg_sum_fp(&mut mem, ptr, 8, 2.5f64.to_bits() as i64);
        assert_eq!(f64::from_bits(mem.read_i64(ptr) as u64), 4.0);
    }

    #[test]
    fn test_count_distinct_bitmap_idempotent() {
        let tracker = QueryMemTracker::new("test");
        let owner = RowSetMemoryOwner::new(&tracker);
        let handle = owner.allocate_count_distinct_bitmap(1000);
        let mut buf = handle.to_le_bytes().to_vec();
        let mem = mem_with(&mut buf);
        let ptr = mem.seg_ptr(0);
        agg_count_distinct_bitmap(&mem, &owner, ptr, 5, 0);
        agg_count_distinct_bitmap(&mem, &owner, ptr, 5, 0);
        agg_count_distinct_bitmap(&mem, &owner, ptr, 999, 0);
        assert_eq!(owner.bitmap_cardinality(handle), 2);
    }
}
