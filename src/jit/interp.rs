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
//! Reference kernel backend.
//!
//! Executes a generated row function over every fragment row, reproducing
//! the device kernel skeleton: grid-stride work distribution, filter
//! evaluation, scan-limit accounting against `total_matched`, per-lane error
//! codes, and intrinsic dispatch into `runtime::kernel`.
//!
//! Lanes run sequentially; `_shared` intrinsics therefore behave exactly
//! like their private forms without weakening the calling convention.

use crate::common::error::{GroupByError, GroupByResult};
use crate::exec::unit::{CmpOp, Datum, Expr};
use crate::jit::ir::{BinOpKind, CmpKind, FuncId, Instr, IrValue, Module};
use crate::jit::KernelModule;
use crate::runtime::device::{DevicePtr, KernelLaunch, KernelMemory, ptr_add};
use crate::runtime::kernel;
use crate::runtime::mem_owner::RowSetMemoryOwner;

struct RowCtx<'a> {
    owner: &'a RowSetMemoryOwner,
    km: &'a KernelModule,
    launch: &'a KernelLaunch<'a>,
    frag: usize,
    row: usize,
    thread_idx: usize,
}

/// Scalar as the skeleton sees it when evaluating filter quals.
#[derive(Clone, Copy, Debug)]
enum QualValue {
    Int(i64),
    Real(f64),
}

fn col_value_from_bits(bits: i64, is_fp: bool, width: u8, sentinel: i64) -> Option<QualValue> {
    if bits == sentinel {
        return None;
    }
    if is_fp {
        let v = if width == 4 {
            f32::from_bits(bits as u32) as f64
        } else {
            f64::from_bits(bits as u64)
        };
        Some(QualValue::Real(v))
    } else {
        Some(QualValue::Int(bits))
    }
}

fn eval_qual_expr(
    expr: &Expr,
    ctx: &RowCtx<'_>,
    col_bits: &[i64],
) -> GroupByResult<Option<QualValue>> {
    match expr {
        Expr::ColumnRef { column, ty } => {
            let pos = ctx
                .km
                .cols
                .iter()
                .position(|c| c.column == *column)
                .ok_or_else(|| {
                    GroupByError::Unsupported(format!("filter column {column} not in kernel"))
                })?;
            let col = &ctx.km.cols[pos];
            let bits = col_bits[pos];
            if !ty.nullable {
                // A non-nullable column may legitimately carry the sentinel
                // pattern as data.
                return Ok(if col.is_fp {
                    let v = if col.width == 4 {
                        f32::from_bits(bits as u32) as f64
                    } else {
                        f64::from_bits(bits as u64)
                    };
                    Some(QualValue::Real(v))
                } else {
                    Some(QualValue::Int(bits))
                });
            }
            Ok(col_value_from_bits(bits, col.is_fp, col.width, col.null_sentinel))
        }
        Expr::Literal { value, .. } => Ok(match value {
            Datum::Int(v) => Some(QualValue::Int(*v)),
            Datum::Real(v) => Some(QualValue::Real(*v)),
            Datum::Str(_) => None,
            Datum::Null => None,
        }),
        Expr::Cast { arg, .. } => eval_qual_expr(arg, ctx, col_bits),
        Expr::IsNotNull { arg } => {
            let inner = eval_qual_expr(arg, ctx, col_bits)?;
            Ok(Some(QualValue::Int(inner.is_some() as i64)))
        }
        Expr::Comparison { op, lhs, rhs } => {
            let (Some(l), Some(r)) = (
                eval_qual_expr(lhs, ctx, col_bits)?,
                eval_qual_expr(rhs, ctx, col_bits)?,
            ) else {
                // SQL three-valued logic collapses to "row does not pass".
                return Ok(None);
            };
            let ord = match (l, r) {
                (QualValue::Int(a), QualValue::Int(b)) => a.partial_cmp(&b),
                (QualValue::Real(a), QualValue::Real(b)) => a.partial_cmp(&b),
                (QualValue::Int(a), QualValue::Real(b)) => (a as f64).partial_cmp(&b),
                (QualValue::Real(a), QualValue::Int(b)) => a.partial_cmp(&(b as f64)),
            };
            let Some(ord) = ord else { return Ok(None) };
            let pass = match op {
                CmpOp::Eq => ord.is_eq(),
                CmpOp::Ne => !ord.is_eq(),
                CmpOp::Lt => ord.is_lt(),
                CmpOp::Le => ord.is_le(),
                CmpOp::Gt => ord.is_gt(),
                CmpOp::Ge => ord.is_ge(),
            };
            Ok(Some(QualValue::Int(pass as i64)))
        }
        other => Err(GroupByError::Unsupported(format!(
            "unsupported filter qual: {other:?}"
        ))),
    }
}

fn row_passes_filter(ctx: &RowCtx<'_>, col_bits: &[i64]) -> GroupByResult<bool> {
    for qual in &ctx.km.quals {
        match eval_qual_expr(qual, ctx, col_bits)? {
            Some(QualValue::Int(v)) if v != 0 => {}
            Some(QualValue::Real(v)) if v != 0.0 => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

fn buffer_index_for_lane(km: &KernelModule, lane: usize, block_size: usize) -> usize {
    if km.threads_share {
        if km.blocks_share {
            0
        } else {
            (lane / block_size) * block_size
        }
    } else {
        lane
    }
}

/// Drive the generated row function over all fragments. `launch.scratch`
/// backs the row function's `crt_matched` slot.
pub fn run_kernel(mem: &mut KernelMemory<'_>, launch: &KernelLaunch<'_>) -> GroupByResult<()> {
    let km = launch.module;
    let params = launch.params;
    let lanes = launch.dims.lane_count();
    let block_size = launch.dims.block;
    let num_fragments = mem.read_i32(params.num_fragments) as usize;
    let scan_limit = km.scan_limit;

    if !km.layout.is_group_by {
        // Every (slot, fragment, lane) output cell starts at the slot's
        // initial value; the reducer folds them afterwards.
        for slot in 0..km.layout.agg_out_count {
            let out_buf = mem.read_i64(ptr_add(params.groupby_buf, slot * 8));
            let init = mem.read_i64(ptr_add(params.init_agg_vals, slot * 8));
            for cell in 0..num_fragments * lanes {
                mem.write_i64(ptr_add(out_buf, cell * 8), init);
            }
        }
    }

    for lane in 0..lanes {
        let thread_idx = lane % block_size;
        'frags: for frag in 0..num_fragments {
            let num_rows = mem.read_i64(ptr_add(params.num_rows, frag * 8)) as usize;
            let frag_off = mem.read_i64(ptr_add(params.frag_row_offsets, frag * 8));
            let inner = mem.read_i64(ptr_add(params.col_buffers, frag * 8));
            let col_ptrs: Vec<DevicePtr> = (0..km.cols.len())
                .map(|i| {
                    if inner == 0 {
                        0
                    } else {
                        mem.read_i64(ptr_add(inner, i * 8))
                    }
                })
                .collect();

            let mut row = lane;
            while row < num_rows {
                if scan_limit > 0 {
                    let max_matched = mem.read_i32(params.max_matched);
                    if mem.read_i32(params.total_matched) >= max_matched {
                        break 'frags;
                    }
                }

                let ctx = RowCtx {
                    owner: launch.owner,
                    km,
                    launch,
                    frag,
                    row,
                    thread_idx,
                };

                let col_bits: Vec<i64> = km
                    .cols
                    .iter()
                    .zip(col_ptrs.iter())
                    .map(|(col, ptr)| {
                        if col.is_list || *ptr == 0 {
                            0
                        } else {
                            mem.read_slot(
                                ptr_add(*ptr, row * col.width as usize),
                                col.width,
                                col.is_fp,
                            )
                        }
                    })
                    .collect();

                let filter_ok = row_passes_filter(&ctx, &col_bits)?;

                let mut args = Vec::new();
                if km.layout.is_group_by {
                    let buf_idx = buffer_index_for_lane(km, lane, block_size);
                    args.push(mem.read_i64(ptr_add(params.groupby_buf, buf_idx * 8)));
                    args.push(if params.small_buf == 0 {
                        0
                    } else {
                        mem.read_i64(ptr_add(params.small_buf, buf_idx * 8))
                    });
                    args.push(launch.scratch);
                    args.push(params.init_agg_vals);
                } else {
                    for slot in 0..km.layout.agg_out_count {
                        let out_buf = mem.read_i64(ptr_add(params.groupby_buf, slot * 8));
                        args.push(ptr_add(out_buf, (frag * lanes + lane) * 8));
                    }
                }
                args.push(frag_off + row as i64); // pos
                args.push(filter_ok as i64);
                args.extend_from_slice(&col_bits);

                if scan_limit > 0 {
                    mem.write_i32(launch.scratch, 0);
                }

                let mut allocas = Vec::new();
                let ret = run_function(
                    mem,
                    &km.module,
                    km.module.row_func,
                    &args,
                    &ctx,
                    &mut allocas,
                )? as i32;

                if ret != 0 {
                    let err_slot = ptr_add(params.error_code, lane * 4);
                    if mem.read_i32(err_slot) == 0 {
                        mem.write_i32(err_slot, ret);
                    }
                } else if scan_limit > 0 && mem.read_i32(launch.scratch) != 0 {
                    let total = mem.read_i32(params.total_matched);
                    mem.write_i32(params.total_matched, total + 1);
                }

                row += lanes;
            }
        }
    }
    Ok(())
}

fn resolve(value: IrValue, args: &[i64], results: &[i64]) -> i64 {
    match value {
        IrValue::ConstI64(v) => v,
        IrValue::ConstI32(v) => v as i64,
        IrValue::ConstF64(v) => v.to_bits() as i64,
        IrValue::ConstF32(v) => v.to_bits() as i64,
        IrValue::NullPtr => 0,
        IrValue::Arg(i) => args[i],
        IrValue::Instr(i) => results[i],
    }
}

fn run_function(
    mem: &mut KernelMemory<'_>,
    module: &Module,
    func: FuncId,
    args: &[i64],
    ctx: &RowCtx<'_>,
    allocas: &mut Vec<Vec<i64>>,
) -> GroupByResult<i64> {
    let f = &module.functions[func];
    let mut results = vec![0i64; f.instrs.len()];
    let mut block = f.entry_block();

    loop {
        let mut next_block = None;
        for &id in &f.blocks[block].instrs {
            let instr = &f.instrs[id];
            match instr {
                Instr::Call { callee, args: call_args } => {
                    let vals: Vec<i64> =
                        call_args.iter().map(|a| resolve(*a, args, &results)).collect();
                    results[id] = exec_intrinsic(mem, ctx, callee, &vals, allocas)?;
                }
                Instr::ExternalCall { callee, args: call_args, .. } => {
                    let vals: Vec<i64> =
                        call_args.iter().map(|a| resolve(*a, args, &results)).collect();
                    results[id] = exec_external(mem, ctx, callee, &vals)?;
                }
                Instr::HelperCall { func, args: call_args } => {
                    let vals: Vec<i64> =
                        call_args.iter().map(|a| resolve(*a, args, &results)).collect();
                    results[id] = run_function(mem, module, *func, &vals, ctx, allocas)?;
                }
                Instr::BinOp { op, lhs, rhs } => {
                    let l = resolve(*lhs, args, &results);
                    let r = resolve(*rhs, args, &results);
                    results[id] = match op {
                        BinOpKind::Add => l.wrapping_add(r),
                        BinOpKind::Sub => l.wrapping_sub(r),
                        BinOpKind::Mul => l.wrapping_mul(r),
                    };
                }
                Instr::Cmp { op, lhs, rhs } => {
                    let l = resolve(*lhs, args, &results);
                    let r = resolve(*rhs, args, &results);
                    results[id] = match op {
                        CmpKind::IntEq => (l == r) as i64,
                        CmpKind::IntNe => (l != r) as i64,
                        CmpKind::FpEq => {
                            (f64::from_bits(l as u64) == f64::from_bits(r as u64)) as i64
                        }
                    };
                }
                Instr::Select { cond, on_true, on_false } => {
                    results[id] = if resolve(*cond, args, &results) != 0 {
                        resolve(*on_true, args, &results)
                    } else {
                        resolve(*on_false, args, &results)
                    };
                }
                Instr::CastWidth { value, bits } => {
                    let v = resolve(*value, args, &results);
                    let shift = 64 - u32::from(*bits);
                    results[id] = if *bits == 64 { v } else { (v << shift) >> shift };
                }
                Instr::IntToFp { value } => {
                    let v = resolve(*value, args, &results);
                    results[id] = (v as f64).to_bits() as i64;
                }
                Instr::FpCast {
                    value,
                    from_bits,
                    to_bits,
                } => {
                    let v = resolve(*value, args, &results);
                    let as_f64 = if *from_bits == 32 {
                        f32::from_bits(v as u32) as f64
                    } else {
                        f64::from_bits(v as u64)
                    };
                    results[id] = if *to_bits == 32 {
                        (as_f64 as f32).to_bits() as i64
                    } else {
                        as_f64.to_bits() as i64
                    };
                }
                Instr::SlotPtr { base, index, width } => {
                    let b = resolve(*base, args, &results);
                    let i = resolve(*index, args, &results);
                    results[id] = ptr_add(b, i as usize * *width as usize);
                }
                Instr::AllocaKeys { count } => {
                    allocas.push(vec![0i64; *count]);
                    results[id] = (allocas.len() - 1) as i64;
                }
                Instr::KeyStore { buf, index, value } => {
                    let slot = resolve(*buf, args, &results) as usize;
                    let v = resolve(*value, args, &results);
                    allocas[slot][*index] = v;
                }
                Instr::KeyLoad { buf, index } => {
                    let slot = resolve(*buf, args, &results) as usize;
                    results[id] = allocas[slot][*index];
                }
                Instr::Store { ptr, value, width } => {
                    let p = resolve(*ptr, args, &results);
                    let v = resolve(*value, args, &results);
                    if *width == 4 {
                        mem.write_i32(p, v as i32);
                    } else {
                        mem.write_slot(p, *width, v);
                    }
                }
                Instr::AtomicAdd { ptr, value, width } => {
                    let p = resolve(*ptr, args, &results);
                    let v = resolve(*value, args, &results);
                    let old = mem.read_slot(p, *width, false);
                    mem.write_slot(p, *width, old.wrapping_add(v));
                    results[id] = old;
                }
                Instr::CondBr { cond, on_true, on_false } => {
                    next_block = Some(if resolve(*cond, args, &results) != 0 {
                        *on_true
                    } else {
                        *on_false
                    });
                    break;
                }
                Instr::Br { target } => {
                    next_block = Some(*target);
                    break;
                }
                Instr::Neg { value } => {
                    results[id] = -resolve(*value, args, &results);
                }
                Instr::Trunc { value, bits } => {
                    let v = resolve(*value, args, &results);
                    let shift = 64 - u32::from(*bits);
                    results[id] = if *bits == 64 { v } else { (v << shift) >> shift };
                }
                Instr::Ret { value } => {
                    return Ok(value.map(|v| resolve(v, args, &results)).unwrap_or(0));
                }
            }
        }
        match next_block {
            Some(b) => block = b,
            // Fell off a block with no terminator: implicit return 0, the
            // "row processed" result.
            None => return Ok(0),
        }
    }
}

struct AggCall {
    base: &'static str,
    width: u8,
    is_fp: bool,
    skip: bool,
}

fn parse_agg_name(name: &str) -> Option<AggCall> {
    let name = name.strip_suffix("_shared").unwrap_or(name);
    let (name, skip) = match name.strip_suffix("_skip_val") {
        Some(rest) => (rest, true),
        None => (name, false),
    };
    let (base, width, is_fp) = match name {
        "agg_id" => ("agg_id", 8, false),
        "agg_id_int32" => ("agg_id", 4, false),
        "agg_id_float" => ("agg_id", 4, true),
        "agg_id_double" => ("agg_id", 8, true),
        "agg_count" => ("agg_count", 8, false),
        "agg_count_int32" => ("agg_count", 4, false),
        "agg_sum" => ("agg_sum", 8, false),
        "agg_sum_int32" => ("agg_sum", 4, false),
        "agg_sum_float" => ("agg_sum", 4, true),
        "agg_sum_double" => ("agg_sum", 8, true),
        "agg_min" => ("agg_min", 8, false),
        "agg_min_int32" => ("agg_min", 4, false),
        "agg_min_float" => ("agg_min", 4, true),
        "agg_min_double" => ("agg_min", 8, true),
        "agg_max" => ("agg_max", 8, false),
        "agg_max_int32" => ("agg_max", 4, false),
        "agg_max_float" => ("agg_max", 4, true),
        "agg_max_double" => ("agg_max", 8, true),
        _ => return None,
    };
    Some(AggCall {
        base,
        width,
        is_fp,
        skip,
    })
}

fn exec_intrinsic(
    mem: &mut KernelMemory<'_>,
    ctx: &RowCtx<'_>,
    callee: &str,
    args: &[i64],
    allocas: &mut Vec<Vec<i64>>,
) -> GroupByResult<i64> {
    match callee {
        "get_group_value_fast" => Ok(kernel::get_group_value_fast(
            mem, args[0], args[1], args[2], args[3], args[4],
        )),
        "get_group_value_fast_keyless" => Ok(kernel::get_group_value_fast_keyless(
            args[0], args[1], args[2], args[3], args[4],
        )),
        "get_group_value_fast_keyless_semiprivate" => {
            Ok(kernel::get_group_value_fast_keyless_semiprivate(
                args[0], args[1], args[2], args[3], args[4], args[5], args[6],
            ))
        }
        "get_columnar_group_bin_offset" => Ok(kernel::get_columnar_group_bin_offset(
            args[1], args[2], args[3],
        )),
        "get_group_value_one_key" => Ok(kernel::get_group_value_one_key(
            mem,
            args[0],
            args[1] as usize,
            args[2],
            args[3] as usize,
            args[4],
            args[5],
            args[6],
            args[7],
        )),
        "get_group_value" => {
            let keys = allocas[args[2] as usize].clone();
            debug_assert_eq!(keys.len(), args[3] as usize);
            Ok(kernel::get_group_value(
                mem,
                args[0],
                args[1] as usize,
                &keys,
                args[4],
                args[5],
            ))
        }
        "get_matching_group_value_perfect_hash" => {
            let keys = allocas[args[2] as usize].clone();
            debug_assert_eq!(keys.len(), args[3] as usize);
            Ok(kernel::get_matching_group_value_perfect_hash(
                mem, args[0], args[1], &keys, args[4],
            ))
        }
        "thread_warp_idx" => Ok((ctx.thread_idx as i64) % args[0]),
        "agg_count_distinct" => {
            kernel::agg_count_distinct(mem, ctx.owner, args[0], args[1]);
            Ok(0)
        }
        "agg_count_distinct_skip_val" => {
            kernel::agg_count_distinct_skip_val(mem, ctx.owner, args[0], args[1], args[2]);
            Ok(0)
        }
        "agg_count_distinct_bitmap" => {
            kernel::agg_count_distinct_bitmap(mem, ctx.owner, args[0], args[1], args[2]);
            Ok(0)
        }
        "agg_count_distinct_bitmap_skip_val" => {
            kernel::agg_count_distinct_bitmap_skip_val(
                mem, ctx.owner, args[0], args[1], args[2], args[3],
            );
            Ok(0)
        }
        name => {
            let Some(call) = parse_agg_name(name) else {
                return Err(GroupByError::Unsupported(format!(
                    "unknown runtime intrinsic: {name}"
                )));
            };
            let ptr = args[0];
            match (call.base, call.is_fp, call.skip) {
                ("agg_id", _, _) => kernel::agg_id(mem, ptr, call.width, args[1]),
                ("agg_count", _, false) => kernel::agg_count(mem, ptr, call.width),
                ("agg_count", _, true) => {
                    kernel::agg_count_skip_val(mem, ptr, call.width, args[1], args[2])
                }
                ("agg_sum", false, false) => kernel::agg_sum(mem, ptr, call.width, args[1]),
                ("agg_sum", false, true) => {
                    kernel::agg_sum_skip_val(mem, ptr, call.width, args[1], args[2])
                }
                ("agg_sum", true, false) => kernel::agg_sum_fp(mem, ptr, call.width, args[1]),
                ("agg_sum", true, true) => {
                    kernel::agg_sum_fp_skip_val(mem, ptr, call.width, args[1], args[2])
                }
                ("agg_min", false, false) => kernel::agg_min(mem, ptr, call.width, args[1]),
                ("agg_min", false, true) => {
                    kernel::agg_min_skip_val(mem, ptr, call.width, args[1], args[2])
                }
                ("agg_min", true, false) => kernel::agg_min_fp(mem, ptr, call.width, args[1]),
                ("agg_min", true, true) => {
                    kernel::agg_min_fp_skip_val(mem, ptr, call.width, args[1], args[2])
                }
                ("agg_max", false, false) => kernel::agg_max(mem, ptr, call.width, args[1]),
                ("agg_max", false, true) => {
                    kernel::agg_max_skip_val(mem, ptr, call.width, args[1], args[2])
                }
                ("agg_max", true, false) => kernel::agg_max_fp(mem, ptr, call.width, args[1]),
                ("agg_max", true, true) => {
                    kernel::agg_max_fp_skip_val(mem, ptr, call.width, args[1], args[2])
                }
                _ => {
                    return Err(GroupByError::Unsupported(format!(
                        "unknown runtime intrinsic: {name}"
                    )));
                }
            }
            Ok(0)
        }
    }
}

fn exec_external(
    mem: &mut KernelMemory<'_>,
    ctx: &RowCtx<'_>,
    callee: &str,
    args: &[i64],
) -> GroupByResult<i64> {
    if callee.starts_with("agg_count_distinct_array_") {
        // (slot_ptr, column, pos, elem_null_sentinel)
        let column = args[1] as usize;
        let elems = ctx.launch.fragments[ctx.frag]
            .columns
            .get(column)
            .and_then(|c| c.list_at(ctx.row))
            .unwrap_or(&[])
            .to_vec();
        kernel::agg_count_distinct_array(mem, ctx.owner, args[0], &elems, args[3]);
        return Ok(0);
    }
    Err(GroupByError::Unsupported(format!(
        "unknown external function: {callee}"
    )))
}
