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
//! COUNT DISTINCT planning.
//!
//! Per distinct target the planner picks a dense presence bitmap when the
//! argument has a known integer range of at most `MAX_BITMAP_BITS` bits, and
//! an ordered spill set otherwise. With the watchdog enabled the spill-set
//! fallback is rejected outright.

use std::collections::BTreeMap;

use crate::common::config::EngineConfig;
use crate::common::error::{GroupByError, GroupByResult};
use crate::exec::groupby::range::{GroupingKind, column_range};
use crate::exec::unit::{AggKind, ExecutionUnit, TableStats, agg_arg, target_info};

pub const MAX_BITMAP_BITS: i64 = 8_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CountDistinctImpl {
    Bitmap { bitmap_bits: i64 },
    StdSet,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CountDistinctDescriptor {
    pub impl_kind: CountDistinctImpl,
    pub min_val: i64,
}

impl CountDistinctDescriptor {
    pub fn is_bitmap(&self) -> bool {
        matches!(self.impl_kind, CountDistinctImpl::Bitmap { .. })
    }

    pub fn bitmap_bits(&self) -> i64 {
        match self.impl_kind {
            CountDistinctImpl::Bitmap { bitmap_bits } => bitmap_bits,
            CountDistinctImpl::StdSet => 0,
        }
    }
}

/// Keyed by target index into the execution unit's target list.
pub type CountDistinctDescriptors = BTreeMap<usize, CountDistinctDescriptor>;

pub fn init_count_distinct_descriptors(
    unit: &ExecutionUnit,
    stats: &TableStats,
    config: &EngineConfig,
) -> GroupByResult<CountDistinctDescriptors> {
    let mut descriptors = CountDistinctDescriptors::new();
    for (target_idx, target_expr) in unit.target_exprs.iter().enumerate() {
        let info = target_info(target_expr);
        if !info.is_distinct {
            continue;
        }
        if info.agg_kind != Some(AggKind::Count) {
            return Err(GroupByError::Unsupported(
                "DISTINCT is only supported for COUNT".to_string(),
            ));
        }
        let arg = agg_arg(target_expr).ok_or_else(|| {
            GroupByError::Unsupported("COUNT(DISTINCT) requires an argument".to_string())
        })?;
        let arg_ty = arg.type_info();
        if arg_ty.ty.is_string() && !arg_ty.ty.is_dict_encoded_string() {
            return Err(GroupByError::StringsMustBeDictionaryEncoded(
                "COUNT(DISTINCT)",
            ));
        }
        let arg_range = column_range(arg, stats, config)?;
        let mut impl_kind = CountDistinctImpl::StdSet;
        if arg_range.kind == GroupingKind::OneColKnownRange && !arg_ty.ty.is_array() {
            let bitmap_bits = arg_range.max - arg_range.min + 1;
            if bitmap_bits > 0 && bitmap_bits <= MAX_BITMAP_BITS {
                impl_kind = CountDistinctImpl::Bitmap { bitmap_bits };
            }
        }
        if config.enable_watchdog && impl_kind == CountDistinctImpl::StdSet {
            return Err(GroupByError::CannotUseFastPath);
        }
        descriptors.insert(
            target_idx,
            CountDistinctDescriptor {
                impl_kind,
                min_val: arg_range.min,
            },
        );
    }
    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::unit::{
        AggExpr, ColumnRangeStat, Expr, FragmentInfo, SqlType, StringEncoding, TypeInfo,
    };

    fn count_distinct_of(column: usize, ty: TypeInfo) -> Expr {
        Expr::Agg(AggExpr {
            kind: AggKind::Count,
            arg: Some(Box::new(Expr::ColumnRef { column, ty })),
            distinct: true,
            ty: TypeInfo::not_null(SqlType::BigInt),
        })
    }

    fn unit_with_targets(target_exprs: Vec<Expr>) -> ExecutionUnit {
        ExecutionUnit {
            groupby_exprs: Vec::new(),
            target_exprs,
            quals: Vec::new(),
            order_entries: Vec::new(),
            scan_limit: 0,
            join_hash_table: 0,
        }
    }

    #[test]
    fn test_dense_range_picks_bitmap() {
        let stats = TableStats {
            fragments: vec![FragmentInfo { num_tuples: 100 }],
            columns: vec![ColumnRangeStat::Int {
                min: 0,
                max: 999,
                bucket: 0,
                has_nulls: false,
            }],
        };
        let unit =
            unit_with_targets(vec![count_distinct_of(0, TypeInfo::not_null(SqlType::Int))]);
        let descs =
            init_count_distinct_descriptors(&unit, &stats, &EngineConfig::default()).unwrap();
        let desc = descs.get(&0).unwrap();
        assert_eq!(
            desc.impl_kind,
            CountDistinctImpl::Bitmap { bitmap_bits: 1000 }
        );
        assert_eq!(desc.min_val, 0);
    }

    #[test]
    fn test_wide_range_falls_back_to_set() {
        let stats = TableStats {
            fragments: vec![FragmentInfo { num_tuples: 100 }],
            columns: vec![ColumnRangeStat::Int {
                min: 0,
                max: 1_000_000_000_000,
                bucket: 0,
                has_nulls: false,
            }],
        };
        let unit = unit_with_targets(vec![count_distinct_of(
            0,
            TypeInfo::not_null(SqlType::BigInt),
        )]);
        let descs =
            init_count_distinct_descriptors(&unit, &stats, &EngineConfig::default()).unwrap();
        assert_eq!(descs.get(&0).unwrap().impl_kind, CountDistinctImpl::StdSet);

        let config = EngineConfig {
            enable_watchdog: true,
            ..EngineConfig::default()
        };
        assert_eq!(
            init_count_distinct_descriptors(&unit, &stats, &config),
            Err(GroupByError::CannotUseFastPath)
        );
    }

    #[test]
    fn test_non_dict_string_rejected() {
        let stats = TableStats::default();
        let unit = unit_with_targets(vec![count_distinct_of(
            0,
            TypeInfo::nullable(SqlType::Text(StringEncoding::None)),
        )]);
        assert_eq!(
            init_count_distinct_descriptors(&unit, &stats, &EngineConfig::default()),
            Err(GroupByError::StringsMustBeDictionaryEncoded("COUNT(DISTINCT)"))
        );
    }

    #[test]
    fn test_array_argument_never_uses_bitmap() {
        let stats = TableStats {
            fragments: vec![FragmentInfo { num_tuples: 10 }],
            columns: vec![ColumnRangeStat::Int {
                min: 0,
                max: 10,
                bucket: 0,
                has_nulls: false,
            }],
        };
        let unit = unit_with_targets(vec![count_distinct_of(
            0,
            TypeInfo::nullable(SqlType::Array(Box::new(SqlType::Int))),
        )]);
        let descs =
            init_count_distinct_descriptors(&unit, &stats, &EngineConfig::default()).unwrap();
        assert_eq!(descs.get(&0).unwrap().impl_kind, CountDistinctImpl::StdSet);
    }
}
