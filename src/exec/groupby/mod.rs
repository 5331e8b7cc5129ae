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
//! GROUP BY / aggregation execution core.
//!
//! Responsibilities:
//! - `GroupByPlanner` turns one execution unit plus fragment statistics into
//!   a `QueryMemoryDescriptor`: range analysis, COUNT DISTINCT planning,
//!   keyless analysis, compact-width selection, and the hash-kind dispatch
//!   that sizes the group buffers.
//! - Submodules own layout (`descriptor`), kernel emission (`codegen`),
//!   buffer lifecycle and launch (`context`), and reduction (`reduce`).

pub mod codegen;
pub mod context;
pub mod count_distinct;
pub mod descriptor;
pub mod hash;
pub mod keyless;
pub mod range;
pub mod reduce;
pub mod row_set;

use std::sync::Arc;

use tracing::warn;

use crate::common::config::EngineConfig;
use crate::common::error::{GroupByError, GroupByResult};
use crate::exec::unit::{
    AggKind, Datum, ExecutionUnit, Expr, SqlType, StringEncoding, TableStats, agg_arg,
    expression_range, target_info, ExprRange,
};
use crate::runtime::device::DeviceKind;
use crate::runtime::mem_owner::RowSetMemoryOwner;
use descriptor::{ColWidth, DeviceShape, MemSharing, QueryMemoryDescriptor, many_entries};
use range::{ColumnRange, GroupingKind};

/// Bins at or below this count qualify for warp-interleaved keyless layout.
const INTERLEAVED_MAX_THRESHOLD: usize = 20;

/// Watchdog lets small-limit scans through even on slow grouping paths.
const WATCHDOG_SCAN_LIMIT: usize = 10_000;

/// Per-slot byte widths of one target, with the standard expansions: AVG
/// takes two slots, unencoded strings and arrays take a pointer/length pair.
pub(crate) fn target_slot_widths(target_expr: &Expr) -> Vec<u8> {
    let info = target_info(target_expr);
    if info.is_agg {
        return match info.agg_kind {
            Some(AggKind::Avg) => vec![8, 8],
            _ => vec![8],
        };
    }
    match &info.ty.ty {
        SqlType::Text(StringEncoding::None) | SqlType::Array(_) => vec![8, 8],
        ty => vec![ty.byte_width()],
    }
}

pub(crate) fn get_col_byte_widths(target_exprs: &[Expr]) -> Vec<u8> {
    target_exprs.iter().flat_map(|e| target_slot_widths(e)).collect()
}

/// Number of aggregate output slots (the non-grouped kernel's out vector
/// arity).
pub(crate) fn get_agg_count(target_exprs: &[Expr]) -> usize {
    get_col_byte_widths(target_exprs).len()
}

/// Narrow the in-buffer slot width to 4 bytes when provably safe: one
/// grouping column, no UNNEST, only COUNT aggregates or narrow projection
/// types, and a source small enough that counts fit in 32 bits.
fn pick_target_compact_width(unit: &ExecutionUnit, stats: &TableStats) -> u8 {
    for groupby_expr in &unit.groupby_exprs {
        if groupby_expr.is_unnest() {
            return 8;
        }
    }
    if unit.groupby_exprs.len() != 1 {
        return 8;
    }
    for target_expr in unit.target_exprs.iter() {
        let info = target_info(target_expr);
        if info.is_agg {
            if agg_arg(target_expr).is_some() {
                return 8;
            }
            debug_assert_eq!(info.agg_kind, Some(AggKind::Count));
            debug_assert!(!info.is_distinct);
            continue;
        }
        match &info.ty.ty {
            SqlType::Int | SqlType::Text(StringEncoding::Dict(_)) => {}
            _ => return 8,
        }
    }
    if stats.total_tuples() <= i32::MAX as usize {
        4
    } else {
        8
    }
}

fn compact_byte_width(width: u8, smallest: u8) -> u8 {
    width.min(smallest)
}

pub struct GroupByPlanner<'a> {
    unit: &'a ExecutionUnit,
    stats: &'a TableStats,
    config: &'a EngineConfig,
    row_set_mem_owner: Arc<RowSetMemoryOwner>,
    device_kind: DeviceKind,
    render_output: bool,
    output_columnar_hint: bool,
    allow_multifrag: bool,
    max_groups_buffer_entry_count: usize,
    small_groups_buffer_entry_count: usize,
}

impl<'a> GroupByPlanner<'a> {
    pub fn new(
        unit: &'a ExecutionUnit,
        stats: &'a TableStats,
        config: &'a EngineConfig,
        row_set_mem_owner: Arc<RowSetMemoryOwner>,
        device_kind: DeviceKind,
        render_output: bool,
        output_columnar_hint: bool,
    ) -> Self {
        Self {
            unit,
            stats,
            config,
            row_set_mem_owner,
            device_kind,
            render_output,
            output_columnar_hint,
            allow_multifrag: config.allow_multifrag,
            max_groups_buffer_entry_count: config.max_groups_buffer_entry_count,
            small_groups_buffer_entry_count: config.small_groups_buffer_entry_count,
        }
    }

    pub fn build(&self) -> GroupByResult<QueryMemoryDescriptor> {
        for groupby_expr in &self.unit.groupby_exprs {
            let groupby_ti = groupby_expr.type_info();
            if groupby_ti.ty.is_string() && !groupby_ti.ty.is_dict_encoded_string() {
                return Err(GroupByError::StringsMustBeDictionaryEncoded("GROUP BY"));
            }
        }
        let sort_on_device_hint = self.device_kind == DeviceKind::Gpu
            && self.allow_multifrag
            && !self.unit.order_entries.is_empty()
            && self.device_can_handle_order_entries();

        let mut qmd = self.init_query_memory_descriptor(sort_on_device_hint)?;
        if self.device_kind != DeviceKind::Gpu {
            qmd.interleaved_bins_on_device = false;
        }
        qmd.sort_on_device =
            sort_on_device_hint && qmd.can_output_columnar() && !qmd.keyless;
        qmd.is_sort_plan = !self.unit.order_entries.is_empty() && !qmd.sort_on_device;
        qmd.output_columnar =
            (self.output_columnar_hint && qmd.can_output_columnar()) || qmd.sort_on_device;
        qmd.validate()?;
        Ok(qmd)
    }

    fn init_query_memory_descriptor(
        &self,
        sort_on_device_hint: bool,
    ) -> GroupByResult<QueryMemoryDescriptor> {
        self.add_transient_string_literals();

        let count_distinct_descs =
            count_distinct::init_count_distinct_descriptors(self.unit, self.stats, self.config)?;
        if !count_distinct_descs.is_empty() {
            self.row_set_mem_owner
                .set_count_distinct_descriptors(count_distinct_descs.clone());
        }

        let smallest_byte_width_to_compact = pick_target_compact_width(self.unit, self.stats);
        let agg_col_widths: Vec<ColWidth> = get_col_byte_widths(&self.unit.target_exprs)
            .into_iter()
            .map(|wid| ColWidth {
                actual: wid,
                compact: compact_byte_width(wid, smallest_byte_width_to_compact),
            })
            .collect();
        let group_col_widths = get_col_byte_widths(&self.unit.groupby_exprs);
        let device = DeviceShape::from(self.config);

        let descriptor = |hash_kind: GroupingKind,
                          keyless: bool,
                          interleaved: bool,
                          idx_target_as_key: i32,
                          init_val: i64,
                          entry_count: usize,
                          entry_count_small: usize,
                          range: &ColumnRange,
                          sharing: MemSharing,
                          render: bool| QueryMemoryDescriptor {
            allow_multifrag: self.allow_multifrag,
            hash_kind,
            keyless,
            interleaved_bins_on_device: interleaved,
            idx_target_as_key,
            init_val,
            group_col_widths: group_col_widths.clone(),
            agg_col_widths: agg_col_widths.clone(),
            entry_count,
            entry_count_small,
            min_val: range.min,
            max_val: range.max,
            bucket: range.bucket,
            has_nulls: range.has_nulls,
            sharing,
            count_distinct_descs: count_distinct_descs.clone(),
            sort_on_device: false,
            is_sort_plan: false,
            output_columnar: false,
            render_output: render,
            device,
        };

        let is_group_by = !group_col_widths.is_empty();
        if !is_group_by {
            assert!(!self.render_output);
            let scan_range = ColumnRange {
                kind: GroupingKind::Scan,
                min: 0,
                max: 0,
                bucket: 0,
                has_nulls: false,
            };
            return Ok(descriptor(
                GroupingKind::Scan,
                false,
                false,
                -1,
                0,
                0,
                0,
                &scan_range,
                MemSharing::Private,
                false,
            ));
        }

        let col_range_info = range::groupby_range(self.unit, self.stats, self.config)?;

        if self.config.enable_watchdog
            && col_range_info.kind != GroupingKind::OneColKnownRange
            && col_range_info.kind != GroupingKind::MultiColPerfectHash
            && col_range_info.kind != GroupingKind::OneColGuessedRange
            && !self.render_output
            && (self.unit.scan_limit == 0 || self.unit.scan_limit > WATCHDOG_SCAN_LIMIT)
        {
            warn!(
                "watchdog: rejecting group by with hash kind {:?}",
                col_range_info.kind
            );
            return Err(GroupByError::WouldUseTooMuchMemory);
        }

        match col_range_info.kind {
            GroupingKind::OneColKnownRange
            | GroupingKind::OneColGuessedRange
            | GroupingKind::Scan => {
                let groupby_is_single_string = self.unit.groupby_exprs.len() == 1
                    && self.unit.groupby_exprs[0].type_info().ty.is_string();
                let domain_exceeds_buffer = !groupby_is_single_string
                    && col_range_info.max
                        >= col_range_info.min + self.max_groups_buffer_entry_count as i64
                    && col_range_info.bucket == 0;
                if col_range_info.kind != GroupingKind::OneColKnownRange || domain_exceeds_buffer
                {
                    // Baseline table with a small overflow buffer; render
                    // queries get a quadrupled multi-column table instead.
                    let hash_kind = if self.render_output {
                        GroupingKind::MultiCol
                    } else {
                        col_range_info.kind
                    };
                    let small_group_slots = if self.render_output {
                        0
                    } else if self.unit.scan_limit != 0 {
                        self.unit.scan_limit
                    } else {
                        self.small_groups_buffer_entry_count
                    };
                    return Ok(descriptor(
                        hash_kind,
                        false,
                        false,
                        -1,
                        0,
                        self.max_groups_buffer_entry_count
                            * (if self.render_output { 4 } else { 1 }),
                        small_group_slots,
                        &ColumnRange {
                            bucket: 0,
                            ..col_range_info
                        },
                        MemSharing::Shared,
                        self.render_output,
                    ));
                }
                assert!(!self.render_output);
                let keyless_info = keyless::get_keyless_info(
                    &self.unit.target_exprs,
                    self.stats,
                    smallest_byte_width_to_compact,
                );
                let keyless = (!sort_on_device_hint
                    || !many_entries(col_range_info.max, col_range_info.min, col_range_info.bucket))
                    && col_range_info.bucket == 0
                    && keyless_info.keyless;
                let mut bin_count = (col_range_info.max - col_range_info.min) as usize;
                if col_range_info.bucket != 0 {
                    bin_count /= col_range_info.bucket as usize;
                }
                bin_count += 1 + col_range_info.has_nulls as usize;
                let interleaved_bins = keyless && bin_count <= INTERLEAVED_MAX_THRESHOLD;
                return Ok(descriptor(
                    col_range_info.kind,
                    keyless,
                    interleaved_bins,
                    keyless_info.target_index,
                    keyless_info.init_val,
                    bin_count,
                    0,
                    &col_range_info,
                    MemSharing::Shared,
                    false,
                ));
            }
            GroupingKind::MultiCol => {
                assert!(!self.render_output);
                Ok(descriptor(
                    GroupingKind::MultiCol,
                    false,
                    false,
                    -1,
                    0,
                    self.max_groups_buffer_entry_count,
                    0,
                    &ColumnRange {
                        min: 0,
                        max: 0,
                        ..col_range_info
                    },
                    MemSharing::Shared,
                    false,
                ))
            }
            GroupingKind::MultiColPerfectHash => {
                assert!(!self.render_output);
                Ok(descriptor(
                    GroupingKind::MultiColPerfectHash,
                    false,
                    false,
                    -1,
                    0,
                    col_range_info.max as usize,
                    0,
                    &col_range_info,
                    MemSharing::Shared,
                    false,
                ))
            }
            GroupingKind::Scan => unreachable!("scan handled above"),
        }
    }

    /// Register every string literal that appears as a grouping constant
    /// (behind a cast or in a CASE domain) so it has a stable encoded id
    /// before kernel launch.
    fn add_transient_string_literals(&self) {
        for group_expr in &self.unit.groupby_exprs {
            let group_ti = group_expr.type_info();
            let SqlType::Text(StringEncoding::Dict(dict_id)) = group_ti.ty else {
                continue;
            };
            match group_expr {
                Expr::Cast { arg, .. } => {
                    if let Expr::Literal {
                        value: Datum::Str(s),
                        ..
                    } = arg.as_ref()
                    {
                        self.row_set_mem_owner
                            .dictionaries()
                            .get_or_create(dict_id)
                            .get_or_add_transient(s);
                    }
                }
                Expr::Case { results, .. } => {
                    for result in results {
                        let literal = match result {
                            Expr::Literal {
                                value: Datum::Str(s),
                                ..
                            } => Some(s),
                            Expr::Cast { arg, .. } => match arg.as_ref() {
                                Expr::Literal {
                                    value: Datum::Str(s),
                                    ..
                                } => Some(s),
                                _ => None,
                            },
                            _ => None,
                        };
                        if let Some(s) = literal {
                            self.row_set_mem_owner
                                .dictionaries()
                                .get_or_create(dict_id)
                                .get_or_add_transient(s);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Whether the accelerator sort path can take the order entries: a single
    /// entry over an integer aggregate that is not DISTINCT, AVG, MIN or MAX,
    /// with null ordering the index-buffer sort can honour.
    fn device_can_handle_order_entries(&self) -> bool {
        if self.unit.order_entries.len() > 1 {
            return false;
        }
        for order_entry in &self.unit.order_entries {
            assert!(order_entry.tle_no >= 1);
            assert!(order_entry.tle_no <= self.unit.target_exprs.len());
            let target_expr = &self.unit.target_exprs[order_entry.tle_no - 1];
            let Expr::Agg(agg_expr) = target_expr else {
                return false;
            };
            if agg_expr.distinct
                || matches!(agg_expr.kind, AggKind::Avg | AggKind::Min | AggKind::Max)
            {
                return false;
            }
            if let Some(arg) = &agg_expr.arg {
                let arg_range = expression_range(arg, self.stats);
                let known_without_nulls =
                    matches!(arg_range, ExprRange::Integer { has_nulls: false, .. });
                if !known_without_nulls && order_entry.is_desc == order_entry.nulls_first {
                    return false;
                }
            }
            let target_ti = target_info(target_expr).ty;
            assert!(!target_ti.ty.is_array());
            if !target_ti.ty.is_integer() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::unit::{AggExpr, ColumnRangeStat, FragmentInfo, TypeInfo};
    use crate::runtime::mem_tracker::QueryMemTracker;

    fn owner() -> Arc<RowSetMemoryOwner> {
        RowSetMemoryOwner::new(&QueryMemTracker::new("test"))
    }

    fn int_col(column: usize) -> Expr {
        Expr::ColumnRef {
            column,
            ty: TypeInfo::not_null(SqlType::Int),
        }
    }

    fn count_star() -> Expr {
        Expr::Agg(AggExpr {
            kind: AggKind::Count,
            arg: None,
            distinct: false,
            ty: TypeInfo::not_null(SqlType::BigInt),
        })
    }

    fn stats_one_int(min: i64, max: i64) -> TableStats {
        TableStats {
            fragments: vec![FragmentInfo { num_tuples: 100 }],
            columns: vec![ColumnRangeStat::Int {
                min,
                max,
                bucket: 0,
                has_nulls: false,
            }],
        }
    }

    fn simple_unit(groupby: Vec<Expr>, targets: Vec<Expr>) -> ExecutionUnit {
        ExecutionUnit {
            groupby_exprs: groupby,
            target_exprs: targets,
            quals: Vec::new(),
            order_entries: Vec::new(),
            scan_limit: 0,
            join_hash_table: 0,
        }
    }

    #[test]
    fn test_small_known_range_is_keyless_interleaved() {
        let unit = simple_unit(vec![int_col(0)], vec![int_col(0), count_star()]);
        let stats = stats_one_int(1, 7);
        let config = EngineConfig::default();
        let planner = GroupByPlanner::new(
            &unit,
            &stats,
            &config,
            owner(),
            DeviceKind::Gpu,
            false,
            false,
        );
        let qmd = planner.build().unwrap();
        assert_eq!(qmd.hash_kind, GroupingKind::OneColKnownRange);
        assert!(qmd.keyless);
        assert!(qmd.interleaved_bins_on_device);
        assert_eq!(qmd.entry_count, 7);
        assert_eq!(qmd.idx_target_as_key, 1);
        // One grouping column of INT, count-only aggregates, small input:
        // projection slot compacts to 4 bytes.
        assert_eq!(qmd.agg_col_widths[0].compact, 4);
    }

    #[test]
    fn test_wide_domain_uses_baseline_with_small_buffer() {
        let unit = simple_unit(vec![int_col(0)], vec![count_star()]);
        let stats = stats_one_int(0, 100_000_000);
        let config = EngineConfig::default();
        let planner = GroupByPlanner::new(
            &unit,
            &stats,
            &config,
            owner(),
            DeviceKind::Cpu,
            false,
            false,
        );
        let qmd = planner.build().unwrap();
        assert!(!qmd.keyless);
        assert_eq!(qmd.entry_count, config.max_groups_buffer_entry_count);
        assert_eq!(
            qmd.entry_count_small,
            config.small_groups_buffer_entry_count
        );
        assert!(!qmd.uses_get_group_value_fast());
    }

    #[test]
    fn test_scan_limit_sizes_small_buffer() {
        let mut unit = simple_unit(vec![int_col(0)], vec![count_star()]);
        unit.scan_limit = 10;
        let stats = stats_one_int(0, 100_000_000);
        let config = EngineConfig::default();
        let planner = GroupByPlanner::new(
            &unit,
            &stats,
            &config,
            owner(),
            DeviceKind::Cpu,
            false,
            false,
        );
        let qmd = planner.build().unwrap();
        assert_eq!(qmd.entry_count_small, 10);
    }

    #[test]
    fn test_watchdog_rejects_multi_col_without_limit() {
        let unit = simple_unit(vec![int_col(0), int_col(1)], vec![count_star()]);
        let stats = TableStats {
            fragments: vec![FragmentInfo { num_tuples: 100 }],
            columns: vec![ColumnRangeStat::Unknown, ColumnRangeStat::Unknown],
        };
        let config = EngineConfig {
            enable_watchdog: true,
            ..EngineConfig::default()
        };
        let planner = GroupByPlanner::new(
            &unit,
            &stats,
            &config,
            owner(),
            DeviceKind::Cpu,
            false,
            false,
        );
        assert_eq!(planner.build().unwrap_err(), GroupByError::WouldUseTooMuchMemory);
    }

    #[test]
    fn test_multi_col_perfect_hash_entry_count() {
        let unit = simple_unit(vec![int_col(0), int_col(1)], vec![count_star()]);
        let stats = TableStats {
            fragments: vec![FragmentInfo { num_tuples: 100 }],
            columns: vec![
                ColumnRangeStat::Int {
                    min: 0,
                    max: 2,
                    bucket: 0,
                    has_nulls: false,
                },
                ColumnRangeStat::Int {
                    min: 10,
                    max: 13,
                    bucket: 0,
                    has_nulls: false,
                },
            ],
        };
        let config = EngineConfig::default();
        let planner = GroupByPlanner::new(
            &unit,
            &stats,
            &config,
            owner(),
            DeviceKind::Cpu,
            false,
            false,
        );
        let qmd = planner.build().unwrap();
        assert_eq!(qmd.hash_kind, GroupingKind::MultiColPerfectHash);
        assert_eq!(qmd.entry_count, 12);
        assert!(!qmd.keyless);
    }

    #[test]
    fn test_group_by_raw_string_rejected() {
        let unit = simple_unit(
            vec![Expr::ColumnRef {
                column: 0,
                ty: TypeInfo::nullable(SqlType::Text(StringEncoding::None)),
            }],
            vec![count_star()],
        );
        let stats = TableStats::default();
        let config = EngineConfig::default();
        let planner = GroupByPlanner::new(
            &unit,
            &stats,
            &config,
            owner(),
            DeviceKind::Cpu,
            false,
            false,
        );
        assert_eq!(
            planner.build().unwrap_err(),
            GroupByError::StringsMustBeDictionaryEncoded("GROUP BY")
        );
    }

    #[test]
    fn test_transient_literal_registration() {
        let dict_ty = TypeInfo::not_null(SqlType::Text(StringEncoding::Dict(7)));
        let unit = simple_unit(
            vec![Expr::Cast {
                arg: Box::new(Expr::Literal {
                    value: Datum::Str("foo".to_string()),
                    ty: TypeInfo::not_null(SqlType::Text(StringEncoding::None)),
                }),
                ty: dict_ty,
            }],
            vec![count_star()],
        );
        let stats = TableStats::default();
        let config = EngineConfig::default();
        let row_set_mem_owner = owner();
        let planner = GroupByPlanner::new(
            &unit,
            &stats,
            &config,
            Arc::clone(&row_set_mem_owner),
            DeviceKind::Cpu,
            false,
            false,
        );
        let _ = planner.build().unwrap();
        let dict = row_set_mem_owner.dictionaries().get_or_create(7);
        assert_eq!(dict.transient_count(), 1);
    }

    #[test]
    fn test_no_grouping_scan_descriptor() {
        let unit = simple_unit(Vec::new(), vec![count_star()]);
        let stats = stats_one_int(0, 10);
        let config = EngineConfig::default();
        let planner = GroupByPlanner::new(
            &unit,
            &stats,
            &config,
            owner(),
            DeviceKind::Cpu,
            false,
            false,
        );
        let qmd = planner.build().unwrap();
        assert_eq!(qmd.hash_kind, GroupingKind::Scan);
        assert_eq!(qmd.entry_count, 0);
        assert_eq!(qmd.sharing, MemSharing::Private);
    }
}
