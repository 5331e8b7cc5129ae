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
//! Aggregate kernel emission.
//!
//! Emits, into the JIT collaborator's IR, the per-row protocol the kernel
//! must honour: the filter diamond, scan-limit accounting, group-slot
//! acquisition matching the descriptor's hash kind, the null-pointer
//! diamond for fallible lookups, and one update intrinsic per target slot
//! with the null-skipping / width / shared-memory variant suffixes.
//!
//! Lazy-fetched target columns widen their slot to 8 bytes mid-emission;
//! when that changes the row size, every previously emitted group-lookup
//! call is patched in place (`get_columnar_group_bin_offset` excepted).

use crate::common::config::EngineConfig;
use crate::common::error::{GroupByError, GroupByResult};
use crate::exec::groupby::descriptor::QueryMemoryDescriptor;
use crate::exec::groupby::range::{GroupingKind, column_range};
use crate::exec::groupby::get_agg_count;
use crate::exec::unit::{
    AggKind, Datum, ExecutionUnit, Expr, SqlType, TableStats, TargetInfo, TypeInfo, agg_arg,
    constrained_not_null, null_sentinel_for_width, target_info,
};
use crate::jit::ir::{BlockId, FuncId, IrBuilder, IrType, IrValue};
use crate::jit::{
    GROUPS_BUFFER_ARG, INIT_AGG_VALS_ARG, KernelColumn, KernelModule, RowFunctionLayout,
    SMALL_GROUPS_BUFFER_ARG, CRT_MATCHED_ARG,
};
use crate::runtime::device::DeviceKind;
use crate::runtime::mem_owner::RowSetMemoryOwner;

#[derive(Debug)]
pub struct CodegenResult {
    pub kernel: KernelModule,
    /// Descriptor after codegen-time refinements (lazy-fetch widening).
    pub qmd: QueryMemoryDescriptor,
    pub can_return_error: bool,
}

/// Conditional region emitter: branch on a condition, generate into the true
/// arm, converge on the false arm. `finish` must be called exactly once.
struct DiamondCodegen {
    cond_false: BlockId,
    orig_cond_false: BlockId,
    chain_to_next: bool,
}

impl DiamondCodegen {
    fn new(b: &mut IrBuilder, cond: IrValue, chain_to_next: bool, label_prefix: &str) -> Self {
        let cond_true = b.create_bb(&format!("{label_prefix}_true"));
        let cond_false = b.create_bb(&format!("{label_prefix}_false"));
        b.create_cond_br(cond, cond_true, cond_false);
        b.set_insert_point(cond_true);
        Self {
            cond_false,
            orig_cond_false: cond_false,
            chain_to_next,
        }
    }

    fn set_chain_to_next(&mut self) {
        self.chain_to_next = true;
    }

    fn finish(self, b: &mut IrBuilder) {
        if self.chain_to_next {
            b.create_br(self.cond_false);
        }
        b.set_insert_point(self.orig_cond_false);
    }

    /// Nested form: the true arm converges into the parent's false arm and
    /// emission resumes in this diamond's own false arm.
    fn finish_into_parent(self, b: &mut IrBuilder, parent: &DiamondCodegen) {
        b.create_br(parent.cond_false);
        b.set_insert_point(self.orig_cond_false);
    }
}

fn agg_fn_base_names(info: &TargetInfo) -> Vec<&'static str> {
    if !info.is_agg {
        let expanded = info.ty.ty.is_array()
            || (info.ty.ty.is_string() && !info.ty.ty.is_dict_encoded_string());
        return if expanded {
            vec!["agg_id", "agg_id"]
        } else {
            vec!["agg_id"]
        };
    }
    match info.agg_kind {
        Some(AggKind::Avg) => vec!["agg_sum", "agg_count"],
        Some(AggKind::Count) => {
            if info.is_distinct {
                vec!["agg_count_distinct"]
            } else {
                vec!["agg_count"]
            }
        }
        Some(AggKind::Max) => vec!["agg_max"],
        Some(AggKind::Min) => vec!["agg_min"],
        Some(AggKind::Sum) => vec!["agg_sum"],
        None => unreachable!("aggregate without kind"),
    }
}

fn numeric_type_name(ty: &SqlType) -> &'static str {
    match ty {
        SqlType::Boolean | SqlType::TinyInt => "int8",
        SqlType::SmallInt => "int16",
        SqlType::Int => "int32",
        SqlType::BigInt => "int64",
        SqlType::Float => "float",
        SqlType::Double => "double",
        _ => "int64",
    }
}

fn collect_column_refs(expr: &Expr, out: &mut Vec<(usize, TypeInfo)>) {
    match expr {
        Expr::ColumnRef { column, ty } => {
            if !out.iter().any(|(c, _)| c == column) {
                out.push((*column, ty.clone()));
            }
        }
        Expr::Cast { arg, .. } | Expr::Unnest { arg } | Expr::IsNotNull { arg } => {
            collect_column_refs(arg, out)
        }
        Expr::Comparison { lhs, rhs, .. } => {
            collect_column_refs(lhs, out);
            collect_column_refs(rhs, out);
        }
        Expr::Case { results, .. } => {
            for result in results {
                collect_column_refs(result, out);
            }
        }
        Expr::Agg(agg) => {
            if let Some(arg) = &agg.arg {
                collect_column_refs(arg, out);
            }
        }
        Expr::Literal { .. } => {}
    }
}

struct AggregateCodegen<'a> {
    unit: &'a ExecutionUnit,
    stats: &'a TableStats,
    config: &'a EngineConfig,
    owner: &'a RowSetMemoryOwner,
    device_kind: DeviceKind,
    lazy_fetch_columns: &'a [usize],
    qmd: QueryMemoryDescriptor,
    layout: RowFunctionLayout,
}

/// Emit the per-row kernel for one execution unit against its descriptor.
pub fn build_kernel(
    unit: &ExecutionUnit,
    stats: &TableStats,
    config: &EngineConfig,
    owner: &RowSetMemoryOwner,
    qmd: QueryMemoryDescriptor,
    device_kind: DeviceKind,
    lazy_fetch_columns: &[usize],
) -> GroupByResult<CodegenResult> {
    let mut col_refs = Vec::new();
    for expr in unit
        .groupby_exprs
        .iter()
        .chain(unit.target_exprs.iter())
        .chain(unit.quals.iter())
    {
        collect_column_refs(expr, &mut col_refs);
    }
    let cols: Vec<KernelColumn> = col_refs
        .iter()
        .map(|(column, ty)| KernelColumn {
            column: *column,
            width: ty.ty.byte_width(),
            is_fp: ty.ty.is_fp(),
            is_list: ty.ty.is_array(),
            null_sentinel: ty.null_sentinel(),
        })
        .collect();
    let columns: Vec<usize> = col_refs.iter().map(|(c, _)| *c).collect();

    let is_group_by = unit.is_group_by();
    let layout = if is_group_by {
        RowFunctionLayout::for_group_by(&columns)
    } else {
        RowFunctionLayout::for_projection(get_agg_count(&unit.target_exprs), &columns)
    };
    let mut builder = IrBuilder::with_row_function(layout.arg_names());

    let mut cg = AggregateCodegen {
        unit,
        stats,
        config,
        owner,
        device_kind,
        lazy_fetch_columns,
        qmd,
        layout,
    };
    let can_return_error = cg.codegen(&mut builder)?;

    let threads_share =
        device_kind == DeviceKind::Gpu && cg.qmd.threads_share_memory();
    let kernel = KernelModule {
        module: builder.finish(),
        layout: cg.layout,
        cols,
        quals: unit.quals.clone(),
        threads_share,
        blocks_share: cg.qmd.blocks_share_memory(),
        scan_limit: unit.scan_limit,
    };
    Ok(CodegenResult {
        kernel,
        qmd: cg.qmd,
        can_return_error,
    })
}

impl<'a> AggregateCodegen<'a> {
    fn codegen(&mut self, b: &mut IrBuilder) -> GroupByResult<bool> {
        let is_group_by = self.unit.is_group_by();
        let mut can_return_error = false;

        let filter_cond = IrValue::Arg(self.layout.filter_arg);
        let mut filter_cfg = DiamondCodegen::new(
            b,
            filter_cond,
            !is_group_by || self.qmd.uses_get_group_value_fast(),
            "filter",
        );

        if is_group_by {
            if self.unit.scan_limit > 0 {
                b.create_store(IrValue::Arg(CRT_MATCHED_ARG), IrValue::ConstI32(1), 4);
            }

            let initial_row_size_quad = if self.qmd.output_columnar {
                0
            } else {
                self.qmd.row_size_quad()
            };

            let (agg_out_ptr, columnar_idx, lookup_call) =
                self.codegen_group_by(b, &mut filter_cfg)?;

            let fast_path = self.qmd.uses_get_group_value_fast()
                || self.qmd.hash_kind == GroupingKind::MultiColPerfectHash;
            if fast_path {
                if self.qmd.hash_kind == GroupingKind::MultiColPerfectHash {
                    filter_cfg.set_chain_to_next();
                }
                // The fast lookups never yield a null slot, so no check.
                self.codegen_agg_calls(b, Some((agg_out_ptr, columnar_idx)))?;
            } else {
                assert!(!self.qmd.output_columnar || self.qmd.keyless);
                let not_null = b.create_icmp_ne(agg_out_ptr, IrValue::NullPtr);
                let nullcheck_cfg =
                    DiamondCodegen::new(b, not_null, false, "groupby_nullcheck");
                self.codegen_agg_calls(b, Some((agg_out_ptr, None)))?;
                nullcheck_cfg.finish_into_parent(b, &filter_cfg);
                // Out of slots: report the row position as a negated error.
                can_return_error = true;
                let pos = b.create_trunc(IrValue::Arg(self.layout.pos_arg), 32);
                let neg = b.create_neg(pos);
                b.create_ret(Some(neg));
            }

            if !self.qmd.output_columnar
                && self.qmd.row_size_quad() != initial_row_size_quad
            {
                b.patch_group_lookup_row_size(lookup_call, self.qmd.row_size_quad() as i32);
            }
        } else {
            self.codegen_agg_calls(b, None)?;
        }

        filter_cfg.finish(b);
        b.create_ret(Some(IrValue::ConstI32(0)));
        Ok(can_return_error)
    }

    fn codegen_group_by(
        &mut self,
        b: &mut IrBuilder,
        _diamond: &mut DiamondCodegen,
    ) -> GroupByResult<(IrValue, Option<IrValue>, IrValue)> {
        let groups_buffer = IrValue::Arg(GROUPS_BUFFER_ARG);
        let row_size_quad = if self.qmd.output_columnar {
            0
        } else {
            self.qmd.row_size_quad() as i32
        };

        match self.qmd.hash_kind {
            GroupingKind::OneColKnownRange
            | GroupingKind::OneColGuessedRange
            | GroupingKind::Scan => {
                assert_eq!(self.unit.groupby_exprs.len(), 1);
                let group_expr = &self.unit.groupby_exprs[0];
                let null_mapped = self.qmd.max_val
                    + if self.qmd.bucket != 0 { self.qmd.bucket } else { 1 };
                let group_expr_lv =
                    self.group_by_column_codegen(b, group_expr, self.qmd.has_nulls, null_mapped)?;

                if self.qmd.uses_get_group_value_fast() {
                    let mut get_group_fn_name =
                        if self.qmd.output_columnar && !self.qmd.keyless {
                            "get_columnar_group_bin_offset".to_string()
                        } else {
                            "get_group_value_fast".to_string()
                        };
                    if self.qmd.keyless {
                        get_group_fn_name += "_keyless";
                    }
                    if self.qmd.interleaved_bins(self.device_kind) {
                        assert!(!self.qmd.output_columnar);
                        assert!(self.qmd.keyless);
                        get_group_fn_name += "_semiprivate";
                    }
                    let mut get_group_fn_args = vec![
                        groups_buffer,
                        group_expr_lv,
                        IrValue::ConstI64(self.qmd.min_val),
                        IrValue::ConstI64(self.qmd.bucket),
                    ];
                    if !self.qmd.keyless {
                        if !self.qmd.output_columnar {
                            get_group_fn_args.push(IrValue::ConstI32(row_size_quad));
                        }
                    } else {
                        assert!(!self.qmd.output_columnar);
                        get_group_fn_args.push(IrValue::ConstI32(row_size_quad));
                        if self.qmd.interleaved_bins(self.device_kind) {
                            let warp_idx = b.emit_call(
                                "thread_warp_idx",
                                vec![IrValue::ConstI64(self.qmd.device.warp_size as i64)],
                            );
                            get_group_fn_args.push(warp_idx);
                            get_group_fn_args
                                .push(IrValue::ConstI64(self.qmd.device.warp_size as i64));
                        }
                    }
                    let call = b.emit_call(&get_group_fn_name, get_group_fn_args);
                    if get_group_fn_name == "get_columnar_group_bin_offset" {
                        return Ok((groups_buffer, Some(call), call));
                    }
                    Ok((call, None, call))
                } else {
                    let call = b.emit_call(
                        "get_group_value_one_key",
                        vec![
                            groups_buffer,
                            IrValue::ConstI32(self.qmd.entry_count as i32),
                            IrValue::Arg(SMALL_GROUPS_BUFFER_ARG),
                            IrValue::ConstI32(self.qmd.entry_count_small as i32),
                            group_expr_lv,
                            IrValue::ConstI64(self.qmd.min_val),
                            IrValue::ConstI32(row_size_quad),
                            IrValue::Arg(INIT_AGG_VALS_ARG),
                        ],
                    );
                    Ok((call, None, call))
                }
            }
            GroupingKind::MultiCol | GroupingKind::MultiColPerfectHash => {
                let key_count = self.unit.groupby_exprs.len();
                let group_key = b.create_alloca_keys(key_count);
                for (subkey_idx, group_expr) in self.unit.groupby_exprs.iter().enumerate() {
                    let col_range_info = column_range(group_expr, self.stats, self.config)?;
                    let group_expr_lv = self.group_by_column_codegen(
                        b,
                        group_expr,
                        col_range_info.has_nulls,
                        col_range_info.max + 1,
                    )?;
                    b.create_key_store(group_key, subkey_idx, group_expr_lv);
                }
                if self.qmd.hash_kind == GroupingKind::MultiColPerfectHash {
                    let perfect_hash_func = self.codegen_perfect_hash_function(b)?;
                    let hash_lv = b.emit_helper_call(perfect_hash_func, vec![group_key]);
                    let call = b.emit_call(
                        "get_matching_group_value_perfect_hash",
                        vec![
                            groups_buffer,
                            hash_lv,
                            group_key,
                            IrValue::ConstI32(key_count as i32),
                            IrValue::ConstI32(row_size_quad),
                        ],
                    );
                    Ok((call, None, call))
                } else {
                    let call = b.emit_call(
                        "get_group_value",
                        vec![
                            groups_buffer,
                            IrValue::ConstI32(self.qmd.entry_count as i32),
                            group_key,
                            IrValue::ConstI32(key_count as i32),
                            IrValue::ConstI32(row_size_quad),
                            IrValue::Arg(INIT_AGG_VALS_ARG),
                        ],
                    );
                    Ok((call, None, call))
                }
            }
        }
    }

    /// Synthesize `h(k) = sum_i (k_i - min_i) * prod_{j<i} card_j` as an
    /// always-inline helper.
    fn codegen_perfect_hash_function(&mut self, b: &mut IrBuilder) -> GroupByResult<FuncId> {
        assert!(self.unit.groupby_exprs.len() > 1);
        let mut cardinalities = Vec::new();
        for groupby_expr in &self.unit.groupby_exprs {
            let col_range_info = column_range(groupby_expr, self.stats, self.config)?;
            assert_eq!(col_range_info.kind, GroupingKind::OneColKnownRange);
            cardinalities.push(col_range_info.max - col_range_info.min + 1);
        }

        let saved_func = b.current_function();
        let saved_block = b.insert_point();
        let key_hash_func =
            b.create_function("perfect_key_hash", vec!["key_buff".to_string()], true);

        let mut hash_lv = IrValue::ConstI64(0);
        for (dim_idx, groupby_expr) in self.unit.groupby_exprs.iter().enumerate() {
            let col_range_info = column_range(groupby_expr, self.stats, self.config)?;
            let key_comp_lv = b.create_key_load(IrValue::Arg(0), dim_idx);
            let mut crt_term_lv =
                b.create_sub(key_comp_lv, IrValue::ConstI64(col_range_info.min));
            for prev_dim_idx in 0..dim_idx {
                crt_term_lv =
                    b.create_mul(crt_term_lv, IrValue::ConstI64(cardinalities[prev_dim_idx]));
            }
            hash_lv = b.create_add(hash_lv, crt_term_lv);
        }
        let truncated = b.create_trunc(hash_lv, 32);
        b.create_ret(Some(truncated));

        b.set_insert_function(saved_func, saved_block);
        Ok(key_hash_func)
    }

    fn group_by_column_codegen(
        &mut self,
        b: &mut IrBuilder,
        group_expr: &Expr,
        has_nulls: bool,
        null_mapped_val: i64,
    ) -> GroupByResult<IrValue> {
        let group_expr_lv = self.col_value(b, group_expr)?;
        let group_ti = group_expr.type_info();
        if has_nulls && group_ti.nullable {
            // NULL group values hash past the real domain.
            let sentinel = group_ti.null_sentinel();
            let is_null = b.create_icmp_eq(group_expr_lv, IrValue::ConstI64(sentinel));
            return Ok(b.create_select(
                is_null,
                IrValue::ConstI64(null_mapped_val),
                group_expr_lv,
            ));
        }
        Ok(group_expr_lv)
    }

    /// Row-function value of an expression: a column argument or a constant.
    /// Anything needing general expression codegen belongs to the JIT
    /// collaborator, not this core.
    fn col_value(&self, b: &mut IrBuilder, expr: &Expr) -> GroupByResult<IrValue> {
        let _ = b;
        match expr {
            Expr::ColumnRef { column, .. } => self
                .layout
                .col_arg(*column)
                .map(IrValue::Arg)
                .ok_or_else(|| {
                    GroupByError::Unsupported(format!("column {column} not bound to the kernel"))
                }),
            Expr::Cast { arg, ty } => {
                if let Expr::Literal {
                    value: Datum::Str(s),
                    ..
                } = arg.as_ref()
                {
                    if let SqlType::Text(crate::exec::unit::StringEncoding::Dict(dict_id)) = ty.ty
                    {
                        let id = self
                            .owner
                            .dictionaries()
                            .get_or_create(dict_id)
                            .get_or_add_transient(s);
                        return Ok(IrValue::ConstI64(id as i64));
                    }
                }
                self.col_value(b, arg)
            }
            Expr::Literal { value, .. } => match value {
                Datum::Int(v) => Ok(IrValue::ConstI64(*v)),
                Datum::Real(v) => Ok(IrValue::ConstF64(*v)),
                _ => Err(GroupByError::Unsupported(
                    "unsupported literal in kernel".to_string(),
                )),
            },
            Expr::Agg(agg) => match &agg.arg {
                Some(arg) => self.col_value(b, arg),
                None => Ok(IrValue::ConstI64(0)),
            },
            other => Err(GroupByError::Unsupported(format!(
                "expression requires JIT codegen: {other:?}"
            ))),
        }
    }

    fn agg_col_ptr(
        &self,
        b: &mut IrBuilder,
        group_out: (IrValue, Option<IrValue>),
        agg_out_off: usize,
        chosen_bytes: u8,
    ) -> IrValue {
        match group_out.1 {
            Some(bin_idx) => {
                let col_off = self.qmd.col_off_in_bytes(0, agg_out_off);
                assert_eq!(col_off % chosen_bytes as usize, 0);
                let offset = b.create_add(
                    bin_idx,
                    IrValue::ConstI64((col_off / chosen_bytes as usize) as i64),
                );
                b.create_slot_ptr(group_out.0, offset, chosen_bytes)
            }
            None => {
                let col_off = self.qmd.col_only_off_in_bytes(agg_out_off);
                assert_eq!(col_off % chosen_bytes as usize, 0);
                b.create_slot_ptr(
                    group_out.0,
                    IrValue::ConstI64((col_off / chosen_bytes as usize) as i64),
                    chosen_bytes,
                )
            }
        }
    }

    fn is_lazy_fetched(&self, expr: &Expr) -> bool {
        expr.source_column()
            .map(|col| self.lazy_fetch_columns.contains(&col))
            .unwrap_or(false)
    }

    /// Count slots compare the raw argument pattern, so the sentinel is the
    /// argument type's own null pattern at its logical width.
    fn count_skip_sentinel(&self, ty: &TypeInfo) -> i64 {
        null_sentinel_for_width(&ty.ty, ty.ty.byte_width())
    }

    fn cast_to_fp(
        &self,
        b: &mut IrBuilder,
        arg_ty: &TypeInfo,
        chosen_bytes: u8,
        target_lv: IrValue,
    ) -> IrValue {
        if arg_ty.ty.is_fp() {
            let from = arg_ty.ty.byte_width() * 8;
            let to = chosen_bytes * 8;
            if from == to {
                return target_lv;
            }
            return b.create_fp_cast(target_lv, from, to);
        }
        let as_double = b.create_int_to_fp(target_lv);
        if chosen_bytes == 4 {
            return b.create_fp_cast(as_double, 64, 32);
        }
        as_double
    }

    /// Replace the argument type's null pattern with the accumulator type's
    /// null pattern, converting the value to the accumulator domain.
    fn convert_null_if_any(
        &self,
        b: &mut IrBuilder,
        arg_ty: &TypeInfo,
        agg_ty: &TypeInfo,
        chosen_bytes: u8,
        target_lv: IrValue,
    ) -> GroupByResult<IrValue> {
        let arg_null = null_sentinel_for_width(&arg_ty.ty, arg_ty.ty.byte_width());
        let agg_fp = agg_ty.ty.is_fp();
        let agg_null = null_sentinel_for_width(&agg_ty.ty, chosen_bytes);

        if arg_ty.ty.is_fp() && !agg_fp {
            return Err(GroupByError::Unsupported(
                "floating point argument with integer accumulator".to_string(),
            ));
        }

        let need_conversion = if agg_fp {
            !arg_ty.ty.is_fp() || arg_ty.ty.byte_width() != chosen_bytes
        } else {
            arg_null != agg_null
        };
        if !need_conversion {
            return Ok(target_lv);
        }

        let converted = if agg_fp {
            self.cast_to_fp(b, arg_ty, chosen_bytes, target_lv)
        } else {
            b.create_cast_width(target_lv, chosen_bytes * 8)
        };
        let is_null = b.create_icmp_eq(target_lv, IrValue::ConstI64(arg_null));
        Ok(b.create_select(is_null, IrValue::ConstI64(agg_null), converted))
    }

    fn codegen_agg_calls(
        &mut self,
        b: &mut IrBuilder,
        group_out: Option<(IrValue, Option<IrValue>)>,
    ) -> GroupByResult<()> {
        let is_group_by = group_out.is_some();
        let mut agg_out_off = 0usize;

        for (target_idx, target_expr) in self.unit.target_exprs.iter().enumerate() {
            if matches!(target_expr, Expr::Unnest { .. }) {
                return Err(GroupByError::UnsupportedUnnestInProjection);
            }
            let mut agg_info = target_info(target_expr);
            let arg_expr = agg_arg(target_expr);
            if let Some(arg) = arg_expr {
                if constrained_not_null(arg, &self.unit.quals) {
                    agg_info.skip_null_val = false;
                }
            }
            let agg_fn_names = agg_fn_base_names(&agg_info);
            let lazy_fetched = self.is_lazy_fetched(target_expr);
            if lazy_fetched || !is_group_by {
                // Raw (or laned) values do not fit a narrowed slot.
                self.qmd.agg_col_widths[agg_out_off].compact = 8;
            }
            let base_lv = self.col_value(b, target_expr)?;
            let target_lvs = vec![base_lv; agg_fn_names.len()];

            let is_simple_count = agg_info.is_agg
                && agg_info.agg_kind == Some(AggKind::Count)
                && !agg_info.is_distinct;
            if self.device_kind == DeviceKind::Gpu
                && self.qmd.threads_share_memory()
                && is_simple_count
                && (arg_expr.is_none() || !agg_info.skip_null_val)
            {
                assert_eq!(agg_fn_names.len(), 1);
                let chosen_bytes = self.qmd.agg_col_widths[agg_out_off].compact;
                let acc_ptr = match &group_out {
                    Some(out) => self.agg_col_ptr(b, *out, agg_out_off, chosen_bytes),
                    None => IrValue::Arg(self.layout.agg_out_arg(agg_out_off)),
                };
                // Count fits 32 bits here; atomics stay on the low word.
                b.create_atomic_add(acc_ptr, IrValue::ConstI32(1), 4);
                agg_out_off += 1;
                continue;
            }

            let mut target_lv_idx = 0usize;
            for agg_base_name in &agg_fn_names {
                if agg_info.is_distinct
                    && arg_expr.map(|a| a.type_info().ty.is_array()).unwrap_or(false)
                {
                    let arg = arg_expr.expect("distinct array argument");
                    assert_eq!(self.qmd.agg_col_widths[agg_out_off].actual, 8);
                    assert!(!self.qmd.output_columnar);
                    let elem_ty = arg
                        .type_info()
                        .ty
                        .elem_type()
                        .cloned()
                        .unwrap_or(SqlType::BigInt);
                    let slot_ptr = match &group_out {
                        Some(out) => self.agg_col_ptr(b, *out, agg_out_off, 8),
                        None => IrValue::Arg(self.layout.agg_out_arg(agg_out_off)),
                    };
                    let column = arg.source_column().ok_or_else(|| {
                        GroupByError::Unsupported(
                            "array COUNT DISTINCT requires a column argument".to_string(),
                        )
                    })?;
                    let elem_sentinel =
                        null_sentinel_for_width(&elem_ty, elem_ty.byte_width());
                    b.emit_external_call(
                        &format!("agg_count_distinct_array_{}", numeric_type_name(&elem_ty)),
                        IrType::Void,
                        vec![
                            slot_ptr,
                            IrValue::ConstI64(column as i64),
                            IrValue::Arg(self.layout.pos_arg),
                            IrValue::ConstI64(elem_sentinel),
                        ],
                    );
                    agg_out_off += 1;
                    target_lv_idx += 1;
                    continue;
                }

                let chosen_bytes = self.qmd.agg_col_widths[agg_out_off].compact;
                let chosen_is_fp = agg_info.ty.ty.is_fp();
                let is_count_slot = *agg_base_name == "agg_count";
                let agg_col_ptr = match &group_out {
                    Some(out) => self.agg_col_ptr(b, *out, agg_out_off, chosen_bytes),
                    None => IrValue::Arg(self.layout.agg_out_arg(agg_out_off)),
                };

                let mut target_lv = target_lvs[target_lv_idx];
                let need_skip_null = agg_info.skip_null_val
                    && !(agg_info.agg_kind == Some(AggKind::Avg)
                        && *agg_base_name == "agg_count");
                if need_skip_null && !is_count_slot {
                    let arg_ty = arg_expr
                        .map(|a| a.type_info())
                        .unwrap_or_else(|| agg_info.ty.clone());
                    target_lv =
                        self.convert_null_if_any(b, &arg_ty, &agg_info.ty, chosen_bytes, target_lv)?;
                } else if !lazy_fetched && chosen_is_fp && !is_count_slot {
                    let arg_ty = arg_expr
                        .map(|a| a.type_info())
                        .unwrap_or_else(|| agg_info.ty.clone());
                    target_lv = self.cast_to_fp(b, &arg_ty, chosen_bytes, target_lv);
                } else if !chosen_is_fp && !is_count_slot && !agg_info.is_distinct {
                    target_lv = b.create_cast_width(target_lv, chosen_bytes * 8);
                }

                let value_lv = if is_simple_count && arg_expr.is_none() {
                    if chosen_bytes == 4 {
                        IrValue::ConstI32(0)
                    } else {
                        IrValue::ConstI64(0)
                    }
                } else {
                    target_lv
                };

                let mut agg_fname = (*agg_base_name).to_string();
                if !lazy_fetched && chosen_is_fp && !is_count_slot {
                    agg_fname += if chosen_bytes == 4 { "_float" } else { "_double" };
                } else if chosen_bytes == 4 {
                    agg_fname += "_int32";
                }

                if agg_info.is_distinct {
                    assert_eq!(chosen_bytes, 8);
                    assert!(!agg_info.ty.ty.is_fp());
                    assert_eq!(*agg_base_name, "agg_count_distinct");
                    self.codegen_count_distinct(
                        b,
                        target_idx,
                        &agg_info,
                        arg_expr,
                        agg_col_ptr,
                        value_lv,
                    )?;
                } else {
                    let mut agg_args = vec![agg_col_ptr, value_lv];
                    // The count half of AVG and nullable COUNT both skip the
                    // argument's null pattern so null rows never count.
                    let count_needs_skip = is_count_slot
                        && agg_info.skip_null_val
                        && arg_expr.is_some();
                    if need_skip_null || count_needs_skip {
                        agg_fname += "_skip_val";
                        let null_lv = if is_count_slot {
                            let arg_ty = arg_expr.expect("count skip arg").type_info();
                            self.count_skip_sentinel(&arg_ty)
                        } else {
                            null_sentinel_for_width(&agg_info.ty.ty, chosen_bytes)
                        };
                        agg_args.push(IrValue::ConstI64(null_lv));
                    }
                    let shared = self.device_kind == DeviceKind::Gpu
                        && self.qmd.threads_share_memory();
                    let final_name = if shared {
                        agg_fname + "_shared"
                    } else {
                        agg_fname
                    };
                    b.emit_call(&final_name, agg_args);
                }
                agg_out_off += 1;
                target_lv_idx += 1;
            }
        }
        Ok(())
    }

    fn codegen_count_distinct(
        &mut self,
        b: &mut IrBuilder,
        target_idx: usize,
        agg_info: &TargetInfo,
        arg_expr: Option<&Expr>,
        slot_ptr: IrValue,
        value_lv: IrValue,
    ) -> GroupByResult<()> {
        if self.device_kind != DeviceKind::Cpu {
            return Err(GroupByError::Unsupported(
                "COUNT DISTINCT requires host execution".to_string(),
            ));
        }
        let descriptor = self
            .qmd
            .count_distinct_descs
            .get(&target_idx)
            .copied()
            .ok_or_else(|| {
                GroupByError::Unsupported("missing count distinct descriptor".to_string())
            })?;
        let mut agg_fname = "agg_count_distinct".to_string();
        let mut agg_args = vec![slot_ptr, value_lv];
        if descriptor.is_bitmap() {
            agg_fname += "_bitmap";
            agg_args.push(IrValue::ConstI64(descriptor.min_val));
        }
        if agg_info.skip_null_val {
            agg_fname += "_skip_val";
            let arg_ty = arg_expr
                .map(|a| a.type_info())
                .unwrap_or_else(|| agg_info.ty.clone());
            agg_args.push(IrValue::ConstI64(
                null_sentinel_for_width(&arg_ty.ty, arg_ty.ty.byte_width()),
            ));
        }
        b.emit_call(&agg_fname, agg_args);
        Ok(())
    }
}
