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
//! Grouping range analysis.
//!
//! Classifies the grouping domain of an execution unit: a known contiguous
//! integer range gets the direct-addressed fast path, floating point and
//! unknown ranges degrade to a guessed range, and multi-column keys either
//! qualify for a perfect hash (product cardinality in checked arithmetic)
//! or fall back to the baseline hash table.

use crate::common::config::EngineConfig;
use crate::common::error::{GroupByError, GroupByResult};
use crate::exec::unit::{ExecutionUnit, Expr, ExprRange, TableStats, expression_range};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupingKind {
    Scan,
    OneColKnownRange,
    OneColGuessedRange,
    MultiCol,
    MultiColPerfectHash,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColumnRange {
    pub kind: GroupingKind,
    pub min: i64,
    pub max: i64,
    pub bucket: i64,
    pub has_nulls: bool,
}

impl ColumnRange {
    fn multi_col() -> Self {
        Self {
            kind: GroupingKind::MultiCol,
            min: 0,
            max: 0,
            bucket: 0,
            has_nulls: false,
        }
    }
}

const GUESSED_RANGE_MAX: i64 = 255;

/// Groups beyond this product cardinality are not worth a perfect hash.
const MAX_PERFECT_HASH_PRODUCT: i64 = 10_000_000;

/// Range classification for a single grouping expression.
pub fn column_range(
    expr: &Expr,
    stats: &TableStats,
    config: &EngineConfig,
) -> GroupByResult<ColumnRange> {
    match expression_range(expr, stats) {
        ExprRange::Integer {
            min,
            max,
            bucket,
            has_nulls,
        } => Ok(ColumnRange {
            kind: GroupingKind::OneColKnownRange,
            min,
            max,
            bucket,
            has_nulls,
        }),
        ExprRange::FloatingPoint { .. } => {
            if config.enable_watchdog {
                return Err(GroupByError::WouldBeSlow);
            }
            Ok(guessed_range())
        }
        ExprRange::Invalid => Ok(guessed_range()),
    }
}

fn guessed_range() -> ColumnRange {
    ColumnRange {
        kind: GroupingKind::OneColGuessedRange,
        min: 0,
        max: GUESSED_RANGE_MAX,
        bucket: 0,
        has_nulls: false,
    }
}

/// Range classification for the whole grouping key. Multi-column keys take
/// the product-cardinality path; any sub-range that is not a known range, a
/// checked-arithmetic overflow, or a product past the threshold degrades to
/// the baseline multi-column hash.
pub fn groupby_range(
    unit: &ExecutionUnit,
    stats: &TableStats,
    config: &EngineConfig,
) -> GroupByResult<ColumnRange> {
    if unit.groupby_exprs.len() != 1 {
        let mut cardinality: i64 = 1;
        let mut has_nulls = false;
        for groupby_expr in &unit.groupby_exprs {
            let col_range = match column_range(groupby_expr, stats, config) {
                Ok(range) => range,
                // Overflow and slow-path classification both degrade here;
                // the baseline hash can group anything.
                Err(_) => return Ok(ColumnRange::multi_col()),
            };
            if col_range.kind != GroupingKind::OneColKnownRange {
                return Ok(ColumnRange::multi_col());
            }
            let crt_cardinality = col_range
                .max
                .checked_sub(col_range.min)
                .and_then(|span| span.checked_add(1))
                .and_then(|span| span.checked_add(col_range.has_nulls as i64));
            let crt_cardinality = match crt_cardinality {
                Some(c) if c > 0 => c,
                _ => return Ok(ColumnRange::multi_col()),
            };
            cardinality = match cardinality.checked_mul(crt_cardinality) {
                Some(c) => c,
                None => return Ok(ColumnRange::multi_col()),
            };
            if col_range.has_nulls {
                has_nulls = true;
            }
        }
        if cardinality > MAX_PERFECT_HASH_PRODUCT {
            return Ok(ColumnRange::multi_col());
        }
        return Ok(ColumnRange {
            kind: GroupingKind::MultiColPerfectHash,
            min: 0,
            max: cardinality,
            bucket: 0,
            has_nulls,
        });
    }
    column_range(&unit.groupby_exprs[0], stats, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::unit::{ColumnRangeStat, FragmentInfo, SqlType, TypeInfo};

    fn int_col(column: usize) -> Expr {
        Expr::ColumnRef {
            column,
            ty: TypeInfo::not_null(SqlType::BigInt),
        }
    }

    fn stats_with(columns: Vec<ColumnRangeStat>) -> TableStats {
        TableStats {
            fragments: vec![FragmentInfo { num_tuples: 100 }],
            columns,
        }
    }

    fn unit_with_groupby(groupby_exprs: Vec<Expr>) -> ExecutionUnit {
        ExecutionUnit {
            groupby_exprs,
            target_exprs: Vec::new(),
            quals: Vec::new(),
            order_entries: Vec::new(),
            scan_limit: 0,
            join_hash_table: 0,
        }
    }

    #[test]
    fn test_known_int_range() {
        let stats = stats_with(vec![ColumnRangeStat::Int {
            min: 1,
            max: 7,
            bucket: 0,
            has_nulls: false,
        }]);
        let range = column_range(&int_col(0), &stats, &EngineConfig::default()).unwrap();
        assert_eq!(range.kind, GroupingKind::OneColKnownRange);
        assert_eq!((range.min, range.max), (1, 7));
    }

    #[test]
    fn test_fp_grouping_watchdog() {
        let stats = stats_with(vec![ColumnRangeStat::Fp {
            min: 0.0,
            max: 1.0,
            has_nulls: false,
        }]);
        let fp_col = Expr::ColumnRef {
            column: 0,
            ty: TypeInfo::not_null(SqlType::Double),
        };
        let mut config = EngineConfig::default();
        let range = column_range(&fp_col, &stats, &config).unwrap();
        assert_eq!(range.kind, GroupingKind::OneColGuessedRange);
        assert_eq!(range.max, 255);

        config.enable_watchdog = true;
        assert_eq!(
            column_range(&fp_col, &stats, &config),
            Err(GroupByError::WouldBeSlow)
        );
    }

    #[test]
    fn test_multi_col_perfect_hash_product() {
        let stats = stats_with(vec![
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
                has_nulls: true,
            },
        ]);
        let unit = unit_with_groupby(vec![int_col(0), int_col(1)]);
        let range = groupby_range(&unit, &stats, &EngineConfig::default()).unwrap();
        assert_eq!(range.kind, GroupingKind::MultiColPerfectHash);
        // 3 * (4 + null) = 15
        assert_eq!(range.max, 15);
        assert!(range.has_nulls);
    }

    #[test]
    fn test_multi_col_falls_back_on_unknown_subrange() {
        let stats = stats_with(vec![
            ColumnRangeStat::Int {
                min: 0,
                max: 2,
                bucket: 0,
                has_nulls: false,
            },
            ColumnRangeStat::Unknown,
        ]);
        let unit = unit_with_groupby(vec![int_col(0), int_col(1)]);
        let range = groupby_range(&unit, &stats, &EngineConfig::default()).unwrap();
        assert_eq!(range.kind, GroupingKind::MultiCol);
    }

    #[test]
    fn test_multi_col_falls_back_on_overflow_or_big_product() {
        let stats = stats_with(vec![
            ColumnRangeStat::Int {
                min: 0,
                max: 5_000_000,
                bucket: 0,
                has_nulls: false,
            },
            ColumnRangeStat::Int {
                min: 0,
                max: 5_000_000,
                bucket: 0,
                has_nulls: false,
            },
        ]);
        let unit = unit_with_groupby(vec![int_col(0), int_col(1)]);
        let range = groupby_range(&unit, &stats, &EngineConfig::default()).unwrap();
        assert_eq!(range.kind, GroupingKind::MultiCol);

        let stats = stats_with(vec![
            ColumnRangeStat::Int {
                min: i64::MIN + 1,
                max: i64::MAX - 1,
                bucket: 0,
                has_nulls: false,
            },
            ColumnRangeStat::Int {
                min: 0,
                max: 1,
                bucket: 0,
                has_nulls: false,
            },
        ]);
        let unit = unit_with_groupby(vec![int_col(0), int_col(1)]);
        let range = groupby_range(&unit, &stats, &EngineConfig::default()).unwrap();
        assert_eq!(range.kind, GroupingKind::MultiCol);
    }
}
