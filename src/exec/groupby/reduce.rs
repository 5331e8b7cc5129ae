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
//! Reduction: one logical row set out of many physical buffers.
//!
//! Fast-path buffers (direct-addressed and perfect-hash tables) are
//! positionally aligned and reduce elementwise; baseline tables rehash
//! their occupied rows by key. Per-slot merging uses each aggregate's own
//! operator: add for SUM/COUNT and both AVG halves, min/max with null
//! sentinels respected, bitwise OR for distinct bitmaps, union for distinct
//! sets. AVG divides at materialisation time and yields NULL on a zero
//! count.

use hashbrown::HashMap;

use crate::common::error::{GroupByError, GroupByResult};
use crate::exec::groupby::context::{ExecutionContext, LaunchOutput};
use crate::exec::groupby::descriptor::QueryMemoryDescriptor;
use crate::exec::groupby::row_set::{ResultRow, ResultRowSet, TargetValue};
use crate::exec::unit::{
    AggKind, EMPTY_KEY_64, Expr, TargetInfo, TypeInfo, null_sentinel_for_width, target_info,
};
use crate::exec::groupby::target_slot_widths;
use crate::runtime::mem_owner::RowSetMemoryOwner;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotRole {
    Whole,
    AvgSum,
    AvgCount,
    /// Second slot of a two-slot projection (pointer/length pair).
    Extra,
}

#[derive(Clone, Debug)]
struct SlotDesc {
    target_idx: usize,
    role: SlotRole,
    info: TargetInfo,
}

fn slot_descs(target_exprs: &[Expr]) -> Vec<SlotDesc> {
    let mut descs = Vec::new();
    for (target_idx, target_expr) in target_exprs.iter().enumerate() {
        let info = target_info(target_expr);
        if info.agg_kind == Some(AggKind::Avg) {
            descs.push(SlotDesc {
                target_idx,
                role: SlotRole::AvgSum,
                info: info.clone(),
            });
            descs.push(SlotDesc {
                target_idx,
                role: SlotRole::AvgCount,
                info,
            });
            continue;
        }
        let slots = target_slot_widths(target_expr).len();
        descs.push(SlotDesc {
            target_idx,
            role: SlotRole::Whole,
            info: info.clone(),
        });
        for _ in 1..slots {
            descs.push(SlotDesc {
                target_idx,
                role: SlotRole::Extra,
                info: info.clone(),
            });
        }
    }
    descs
}

fn read_slot(buf: &[u8], off: usize, width: u8, is_fp: bool) -> i64 {
    let width = width as usize;
    let mut bytes = [0u8; 8];
    bytes[..width].copy_from_slice(&buf[off..off + width]);
    let raw = i64::from_le_bytes(bytes);
    if is_fp || width == 8 {
        return raw;
    }
    let shift = 64 - (width as u32) * 8;
    (raw << shift) >> shift
}

fn write_slot(buf: &mut [u8], off: usize, width: u8, value: i64) {
    let width = width as usize;
    buf[off..off + width].copy_from_slice(&value.to_le_bytes()[..width]);
}

fn slot_as_f64(value: i64, width: u8) -> f64 {
    if width == 4 {
        f32::from_bits(value as u32) as f64
    } else {
        f64::from_bits(value as u64)
    }
}

fn f64_as_slot(value: f64, width: u8) -> i64 {
    if width == 4 {
        (value as f32).to_bits() as i64
    } else {
        value.to_bits() as i64
    }
}

fn arg_type_of(info: &TargetInfo) -> TypeInfo {
    info.arg_ty.clone().unwrap_or_else(|| info.ty.clone())
}

fn slot_is_fp(desc: &SlotDesc) -> bool {
    match desc.role {
        SlotRole::AvgCount | SlotRole::Extra => false,
        SlotRole::AvgSum => arg_type_of(&desc.info).ty.is_fp(),
        SlotRole::Whole => {
            if desc.info.agg_kind == Some(AggKind::Count) {
                false
            } else {
                desc.info.ty.ty.is_fp()
            }
        }
    }
}

struct Reducer<'a> {
    qmd: &'a QueryMemoryDescriptor,
    owner: &'a RowSetMemoryOwner,
    descs: Vec<SlotDesc>,
    init_vals: Vec<i64>,
}

impl<'a> Reducer<'a> {
    fn new(
        qmd: &'a QueryMemoryDescriptor,
        owner: &'a RowSetMemoryOwner,
        target_exprs: &[Expr],
        init_vals: &[i64],
    ) -> Self {
        let descs = slot_descs(target_exprs);
        debug_assert_eq!(descs.len(), qmd.agg_col_widths.len());
        Self {
            qmd,
            owner,
            descs,
            init_vals: init_vals.to_vec(),
        }
    }

    fn width(&self, slot: usize) -> u8 {
        self.qmd.agg_col_widths[slot].compact
    }

    /// Merge one source slot into one destination slot with the target's
    /// operator; returns the merged destination value.
    fn merge_slot(&self, slot: usize, dst: i64, src: i64) -> i64 {
        let desc = &self.descs[slot];
        let width = self.width(slot);
        let is_fp = slot_is_fp(desc);

        if desc.info.is_distinct {
            let cd = self
                .qmd
                .count_distinct_descs
                .get(&desc.target_idx)
                .copied();
            if let Some(cd) = cd {
                if cd.is_bitmap() {
                    self.owner.merge_count_distinct_bitmaps(dst, src);
                } else {
                    self.owner.merge_count_distinct_sets(dst, src);
                }
            }
            return dst;
        }

        match desc.role {
            SlotRole::Extra => {
                if dst == self.init_vals[slot] {
                    src
                } else {
                    dst
                }
            }
            SlotRole::AvgCount => dst.wrapping_add(src),
            SlotRole::AvgSum => {
                if is_fp {
                    f64_as_slot(slot_as_f64(dst, width) + slot_as_f64(src, width), width)
                } else {
                    dst.wrapping_add(src)
                }
            }
            SlotRole::Whole => match desc.info.agg_kind {
                Some(AggKind::Count) => dst.wrapping_add(src),
                Some(kind @ (AggKind::Sum | AggKind::Min | AggKind::Max)) => {
                    let sentinel = null_sentinel_for_width(&desc.info.ty.ty, width);
                    if desc.info.skip_null_val {
                        if src == sentinel {
                            return dst;
                        }
                        if dst == sentinel {
                            return src;
                        }
                    }
                    if is_fp {
                        let (d, s) = (slot_as_f64(dst, width), slot_as_f64(src, width));
                        let merged = match kind {
                            AggKind::Sum => d + s,
                            AggKind::Min => d.min(s),
                            _ => d.max(s),
                        };
                        f64_as_slot(merged, width)
                    } else {
                        match kind {
                            AggKind::Sum => dst.wrapping_add(src),
                            AggKind::Min => dst.min(src),
                            _ => dst.max(src),
                        }
                    }
                }
                // Projections of the same group carry the same value; an
                // untouched slot yields to the populated one.
                _ => {
                    if dst == self.init_vals[slot] {
                        src
                    } else {
                        dst
                    }
                }
            },
        }
    }

    fn merge_slot_vals(&self, dst: &mut [i64], src: &[i64]) {
        for slot in 0..dst.len() {
            dst[slot] = self.merge_slot(slot, dst[slot], src[slot]);
        }
    }

    fn read_slot_vals_at(&self, buf: &[u8], base: usize, keyed: bool) -> Vec<i64> {
        let key_bytes = if keyed {
            self.qmd.group_col_widths.len() * 8
        } else {
            0
        };
        (0..self.descs.len())
            .map(|slot| {
                let off = base + key_bytes + self.qmd.col_only_off_in_bytes(slot);
                read_slot(buf, off, self.width(slot), slot_is_fp(&self.descs[slot]))
            })
            .collect()
    }

    fn write_slot_vals_at(&self, buf: &mut [u8], base: usize, keyed: bool, vals: &[i64]) {
        let key_bytes = if keyed {
            self.qmd.group_col_widths.len() * 8
        } else {
            0
        };
        for (slot, val) in vals.iter().enumerate() {
            let off = base + key_bytes + self.qmd.col_only_off_in_bytes(slot);
            write_slot(buf, off, self.width(slot), *val);
        }
    }

    /// Materialise one value per target from a row's slot values.
    fn decode_values(&self, slot_vals: &[i64]) -> Vec<TargetValue> {
        let mut values = Vec::new();
        let mut slot = 0usize;
        while slot < self.descs.len() {
            let desc = &self.descs[slot];
            let width = self.width(slot);
            match desc.role {
                SlotRole::AvgSum => {
                    let count = slot_vals[slot + 1];
                    if count == 0 {
                        values.push(TargetValue::Null);
                    } else {
                        let sum = if slot_is_fp(desc) {
                            slot_as_f64(slot_vals[slot], width)
                        } else {
                            slot_vals[slot] as f64
                        };
                        values.push(TargetValue::Real(sum / count as f64));
                    }
                    slot += 2;
                }
                SlotRole::Whole if desc.info.is_distinct => {
                    let cd = self
                        .qmd
                        .count_distinct_descs
                        .get(&desc.target_idx)
                        .copied();
                    let cardinality = match cd {
                        Some(cd) if cd.is_bitmap() => {
                            self.owner.bitmap_cardinality(slot_vals[slot])
                        }
                        _ => self.owner.set_cardinality(slot_vals[slot]),
                    };
                    values.push(TargetValue::Int(cardinality));
                    slot += 1;
                }
                SlotRole::Whole => {
                    let val = slot_vals[slot];
                    let nullable = match desc.info.agg_kind {
                        Some(AggKind::Count) => false,
                        Some(_) => desc.info.skip_null_val,
                        None => desc.info.ty.nullable,
                    };
                    let sentinel = null_sentinel_for_width(&desc.info.ty.ty, width);
                    let decoded = if nullable && val == sentinel {
                        TargetValue::Null
                    } else if slot_is_fp(desc) {
                        TargetValue::Real(slot_as_f64(val, width))
                    } else {
                        TargetValue::Int(val)
                    };
                    values.push(decoded);
                    // Skip any extra slot of an expanded projection.
                    slot += 1;
                    while slot < self.descs.len() && self.descs[slot].role == SlotRole::Extra {
                        slot += 1;
                    }
                }
                SlotRole::AvgCount | SlotRole::Extra => {
                    slot += 1;
                }
            }
        }
        values
    }
}

/// Elementwise positional merge of `src` into `dst`. Buffers must share the
/// descriptor's shape; fast-path tables keep bins positionally aligned.
pub fn reduce_group_buffers(
    qmd: &QueryMemoryDescriptor,
    owner: &RowSetMemoryOwner,
    target_exprs: &[Expr],
    init_vals: &[i64],
    dst: &mut [u8],
    src: &[u8],
) {
    let reducer = Reducer::new(qmd, owner, target_exprs, init_vals);
    let row_size = if qmd.output_columnar { 0 } else { qmd.row_size() };

    if qmd.output_columnar {
        for bin in 0..qmd.entry_count {
            if !qmd.keyless {
                let key_off = qmd.key_off_in_bytes(bin, 0);
                let src_key = read_slot(src, key_off, 8, false);
                if src_key == EMPTY_KEY_64 {
                    continue;
                }
                let dst_key = read_slot(dst, key_off, 8, false);
                if dst_key == EMPTY_KEY_64 {
                    write_slot(dst, key_off, 8, src_key);
                    for slot in 0..reducer.descs.len() {
                        let off = qmd.col_off_in_bytes(bin, slot);
                        let val = read_slot(src, off, reducer.width(slot), true);
                        write_slot(dst, off, reducer.width(slot), val);
                    }
                    continue;
                }
            }
            for slot in 0..reducer.descs.len() {
                let off = qmd.col_off_in_bytes(bin, slot);
                let is_fp = slot_is_fp(&reducer.descs[slot]);
                let d = read_slot(dst, off, reducer.width(slot), is_fp);
                let s = read_slot(src, off, reducer.width(slot), is_fp);
                let merged = reducer.merge_slot(slot, d, s);
                write_slot(dst, off, reducer.width(slot), merged);
            }
        }
        return;
    }

    if qmd.keyless {
        let rows = qmd.entry_count * qmd.warp_count();
        for row in 0..rows {
            let base = row * row_size;
            let mut dst_vals = reducer.read_slot_vals_at(dst, base, false);
            let src_vals = reducer.read_slot_vals_at(src, base, false);
            reducer.merge_slot_vals(&mut dst_vals, &src_vals);
            reducer.write_slot_vals_at(dst, base, false, &dst_vals);
        }
        return;
    }

    for bin in 0..qmd.entry_count {
        let base = bin * row_size;
        let src_key = read_slot(src, base, 8, false);
        if src_key == EMPTY_KEY_64 {
            continue;
        }
        let dst_key = read_slot(dst, base, 8, false);
        if dst_key == EMPTY_KEY_64 {
            dst[base..base + row_size].copy_from_slice(&src[base..base + row_size]);
            continue;
        }
        let mut dst_vals = reducer.read_slot_vals_at(dst, base, true);
        let src_vals = reducer.read_slot_vals_at(src, base, true);
        reducer.merge_slot_vals(&mut dst_vals, &src_vals);
        reducer.write_slot_vals_at(dst, base, true, &dst_vals);
    }
}

fn decode_single_key(qmd: &QueryMemoryDescriptor, key: i64) -> Option<i64> {
    if qmd.has_nulls && key == qmd.max_val + 1 {
        None
    } else {
        Some(key)
    }
}

/// Reduce every buffer of a context (plus the non-grouped out vectors) into
/// the final row set.
pub fn get_row_set(
    ctx: &ExecutionContext,
    output: &LaunchOutput,
) -> GroupByResult<ResultRowSet> {
    if output.error_code != 0 {
        return Err(GroupByError::KernelError(output.error_code));
    }
    let qmd = ctx.qmd();
    let unit = ctx.unit();
    let owner = ctx.row_set_mem_owner();
    let mut row_set = ResultRowSet::new(&unit.target_exprs);

    if qmd.group_col_widths.is_empty() {
        // Non-grouped: fold the per-lane output vectors into one row.
        let reducer = Reducer::new(qmd, owner, &unit.target_exprs, ctx.init_agg_vals());
        let mut acc: Vec<i64> = ctx.init_agg_vals().to_vec();
        for (slot, lanes) in output.out_vec.iter().enumerate() {
            for lane_val in lanes {
                acc[slot] = reducer.merge_slot(slot, acc[slot], *lane_val);
            }
        }
        row_set.rows.push(ResultRow {
            keys: Vec::new(),
            values: reducer.decode_values(&acc),
        });
        return Ok(row_set);
    }

    let reducer = Reducer::new(qmd, owner, &unit.target_exprs, ctx.init_agg_vals());
    let data_off = ctx.data_offset_in_buffer();

    // Clone the physical buffers out of their handles for reduction.
    let mut buffers: Vec<Vec<u8>> = Vec::new();
    for handle in ctx.group_by_buffers().iter().flatten() {
        let guard = handle.lock().unwrap_or_else(|e| e.into_inner());
        buffers.push(guard[data_off..].to_vec());
    }
    let mut small_buffers: Vec<Vec<u8>> = Vec::new();
    for handle in ctx.small_group_by_buffers().iter().flatten() {
        let guard = handle.lock().unwrap_or_else(|e| e.into_inner());
        small_buffers.push(guard.clone());
    }
    if buffers.is_empty() {
        return Ok(row_set);
    }

    let positional = qmd.uses_get_group_value_fast();
    if positional {
        let (first, rest) = buffers.split_at_mut(1);
        for src in rest.iter() {
            reduce_group_buffers(
                qmd,
                owner,
                &unit.target_exprs,
                ctx.init_agg_vals(),
                &mut first[0],
                src,
            );
        }
        let buf = &buffers[0];
        if qmd.keyless {
            let row_size = qmd.row_size();
            let warp_count = qmd.warp_count();
            let marker_slot = qmd.idx_target_as_key as usize;
            for bin in 0..qmd.entry_count {
                let mut vals =
                    reducer.read_slot_vals_at(buf, bin * warp_count * row_size, false);
                for warp in 1..warp_count {
                    let warp_vals = reducer
                        .read_slot_vals_at(buf, (bin * warp_count + warp) * row_size, false);
                    reducer.merge_slot_vals(&mut vals, &warp_vals);
                }
                if vals[marker_slot] == qmd.init_val {
                    continue;
                }
                let key = qmd.min_val + bin as i64;
                let is_null_bin = qmd.has_nulls && bin + 1 == qmd.entry_count;
                row_set.rows.push(ResultRow {
                    keys: vec![if is_null_bin { None } else { Some(key) }],
                    values: reducer.decode_values(&vals),
                });
            }
        } else {
            for bin in 0..qmd.entry_count {
                let key_off = qmd.key_off_in_bytes(bin, 0);
                let key = read_slot(buf, key_off, 8, false);
                if key == EMPTY_KEY_64 {
                    continue;
                }
                let vals: Vec<i64> = (0..reducer.descs.len())
                    .map(|slot| {
                        read_slot(
                            buf,
                            qmd.col_off_in_bytes(bin, slot),
                            reducer.width(slot),
                            slot_is_fp(&reducer.descs[slot]),
                        )
                    })
                    .collect();
                row_set.rows.push(ResultRow {
                    keys: vec![decode_single_key(qmd, key)],
                    values: reducer.decode_values(&vals),
                });
            }
        }
        return Ok(row_set);
    }

    // Baseline path: rehash occupied rows by key across every buffer.
    let key_count = qmd.group_col_widths.len();
    let row_size = qmd.row_size();
    let mut table: HashMap<Vec<i64>, usize> = HashMap::new();
    let mut merged_rows: Vec<(Vec<i64>, Vec<i64>)> = Vec::new();
    let mut absorb = |buf: &[u8], entry_count: usize| {
        for bin in 0..entry_count {
            let base = bin * row_size;
            let first_key = read_slot(buf, base, 8, false);
            if first_key == EMPTY_KEY_64 {
                continue;
            }
            let keys: Vec<i64> = (0..key_count)
                .map(|k| read_slot(buf, base + k * 8, 8, false))
                .collect();
            let vals = reducer.read_slot_vals_at(buf, base, true);
            match table.get(&keys) {
                Some(&idx) => {
                    let dst = &mut merged_rows[idx].1;
                    reducer.merge_slot_vals(dst, &vals);
                }
                None => {
                    table.insert(keys.clone(), merged_rows.len());
                    merged_rows.push((keys, vals));
                }
            }
        }
    };
    for buf in &buffers {
        absorb(buf, qmd.entry_count);
    }
    for buf in &small_buffers {
        absorb(buf, qmd.entry_count_small);
    }
    for (keys, vals) in merged_rows {
        let decoded_keys = if key_count == 1 {
            vec![decode_single_key(qmd, keys[0])]
        } else {
            keys.iter().map(|k| Some(*k)).collect()
        };
        row_set.rows.push(ResultRow {
            keys: decoded_keys,
            values: reducer.decode_values(&vals),
        });
    }
    Ok(row_set)
}
