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
//! Keyless hash analysis and aggregate initial values.
//!
//! A single-column direct-addressed table can drop its key column when the
//! leading aggregate's slot doubles as the presence marker: an untouched
//! slot still holds the initial value, and the data provably never produces
//! that value. The scan below finds the first aggregate with that property.

use crate::exec::unit::{
    AggKind, Expr, ExprRange, TableStats, TypeInfo, constrained_not_null, expression_range,
    null_sentinel_for_width, target_info,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeylessInfo {
    pub keyless: bool,
    /// Index of the marker target; for AVG the marker is the count half.
    pub target_index: i32,
    pub init_val: i64,
}

fn fp_bits_for_width(value: f64, width: u8) -> i64 {
    if width == 4 {
        (value as f32).to_bits() as i64
    } else {
        value.to_bits() as i64
    }
}

fn type_max_for_width(ty: &TypeInfo, width: u8) -> i64 {
    if ty.ty.is_fp() {
        return fp_bits_for_width(f64::MAX, width);
    }
    match width {
        1 => i8::MAX as i64,
        2 => i16::MAX as i64,
        4 => i32::MAX as i64,
        _ => i64::MAX,
    }
}

fn type_min_for_width(ty: &TypeInfo, width: u8) -> i64 {
    if ty.ty.is_fp() {
        return fp_bits_for_width(f64::MIN, width);
    }
    match width {
        1 => i8::MIN as i64,
        2 => i16::MIN as i64,
        4 => i32::MIN as i64,
        _ => i64::MIN,
    }
}

/// Initial accumulator value for one aggregate slot. Nullable arguments use
/// the null sentinel (the `_skip_val` intrinsics replace it on the first
/// real value); AVG halves always start at zero so the final division can
/// decide nullness from the count.
pub fn agg_initial_val(kind: AggKind, ty: &TypeInfo, compact_width: u8) -> i64 {
    match kind {
        AggKind::Count | AggKind::Avg => 0,
        AggKind::Sum => {
            if ty.nullable {
                null_sentinel_for_width(&ty.ty, compact_width)
            } else {
                0
            }
        }
        AggKind::Min => {
            if ty.nullable {
                null_sentinel_for_width(&ty.ty, compact_width)
            } else {
                type_max_for_width(ty, compact_width)
            }
        }
        AggKind::Max => {
            if ty.nullable {
                null_sentinel_for_width(&ty.ty, compact_width)
            } else {
                type_min_for_width(ty, compact_width)
            }
        }
    }
}

/// Initial values for every aggregate slot, in slot order (AVG expands to
/// its sum and count halves, unencoded strings and arrays to two slots).
pub fn init_agg_val_vec(
    target_exprs: &[Expr],
    quals: &[Expr],
    compact_widths: &[u8],
) -> Vec<i64> {
    let mut init_vals = Vec::new();
    for target_expr in target_exprs {
        let mut info = target_info(target_expr);
        if let Some(arg) = crate::exec::unit::agg_arg(target_expr) {
            if constrained_not_null(arg, quals) {
                info.skip_null_val = false;
            }
        }
        let slot = init_vals.len();
        let width = |idx: usize| compact_widths.get(idx).copied().unwrap_or(8);
        match info.agg_kind {
            Some(AggKind::Avg) => {
                init_vals.push(0);
                init_vals.push(0);
            }
            Some(kind) => {
                let ty = TypeInfo {
                    ty: info.ty.ty.clone(),
                    nullable: info.skip_null_val,
                };
                init_vals.push(agg_initial_val(kind, &ty, width(slot)));
            }
            None => {
                init_vals.push(0);
                let expanded = info.ty.ty.is_array()
                    || (info.ty.ty.is_string() && !info.ty.ty.is_dict_encoded_string());
                if expanded {
                    init_vals.push(0);
                }
            }
        }
    }
    init_vals
}

/// Scan the target list for the first aggregate whose slot can act as the
/// presence marker. Pure projections never qualify.
pub fn get_keyless_info(
    target_exprs: &[Expr],
    stats: &TableStats,
    compact_width: u8,
) -> KeylessInfo {
    let mut keyless = true;
    let mut found = false;
    let mut index: i32 = 0;
    let mut init_val: i64 = 0;

    for target_expr in target_exprs {
        let info = target_info(target_expr);
        if !found && info.is_agg {
            let arg = crate::exec::unit::agg_arg(target_expr);
            let arg_range = arg.map(|a| expression_range(a, stats));
            match info.agg_kind {
                // A distinct slot holds a substructure handle, never its
                // initial value, so it cannot mark presence.
                _ if info.is_distinct => {
                    keyless = false;
                }
                Some(AggKind::Avg) => {
                    index += 1;
                    init_val = 0;
                    found = true;
                }
                Some(AggKind::Count) => {
                    let nullable = arg.map(|a| a.type_info().nullable).unwrap_or(false);
                    if nullable {
                        match arg_range {
                            Some(ExprRange::Integer { has_nulls, .. })
                            | Some(ExprRange::FloatingPoint { has_nulls, .. })
                                if !has_nulls => {}
                            _ => {
                                index += 1;
                                continue;
                            }
                        }
                    }
                    init_val = 0;
                    found = true;
                }
                Some(AggKind::Sum) => {
                    let arg_ty = arg.map(|a| a.type_info());
                    match arg_ty {
                        Some(ty) if ty.nullable => {
                            let proven_not_null = matches!(
                                arg_range,
                                Some(ExprRange::Integer { has_nulls: false, .. })
                                    | Some(ExprRange::FloatingPoint { has_nulls: false, .. })
                            );
                            if proven_not_null {
                                init_val = agg_initial_val(AggKind::Sum, &ty, compact_width);
                                found = true;
                            }
                        }
                        Some(_) => {
                            init_val = 0;
                            match arg_range {
                                Some(ExprRange::Integer { min, max, .. })
                                    if max < 0 || min > 0 =>
                                {
                                    found = true;
                                }
                                Some(ExprRange::FloatingPoint { min, max, .. })
                                    if max < 0.0 || min > 0.0 =>
                                {
                                    found = true;
                                }
                                _ => {}
                            }
                        }
                        None => {}
                    }
                }
                Some(AggKind::Min) => {
                    let init_max = agg_initial_val(AggKind::Min, &info.ty, compact_width);
                    match arg_range {
                        Some(ExprRange::FloatingPoint { max, .. }) => {
                            init_val = init_max;
                            let init_as_fp = if compact_width == 4 && info.ty.ty.is_fp() {
                                f32::from_bits(init_max as u32) as f64
                            } else {
                                f64::from_bits(init_max as u64)
                            };
                            if max < init_as_fp {
                                found = true;
                            }
                        }
                        Some(ExprRange::Integer { max, .. }) => {
                            init_val = init_max;
                            if max < init_max {
                                found = true;
                            }
                        }
                        _ => {}
                    }
                }
                Some(AggKind::Max) => {
                    let init_min = agg_initial_val(AggKind::Max, &info.ty, compact_width);
                    match arg_range {
                        Some(ExprRange::FloatingPoint { min, .. }) => {
                            init_val = init_min;
                            let init_as_fp = if compact_width == 4 && info.ty.ty.is_fp() {
                                f32::from_bits(init_min as u32) as f64
                            } else {
                                f64::from_bits(init_min as u64)
                            };
                            if min > init_as_fp {
                                found = true;
                            }
                        }
                        Some(ExprRange::Integer { min, .. }) => {
                            init_val = init_min;
                            if min > init_min {
                                found = true;
                            }
                        }
                        _ => {}
                    }
                }
                None => {
                    keyless = false;
                }
            }
        }
        if !keyless {
            break;
        }
        if !found {
            index += 1;
        }
    }

    // Pure projections never reach `found`, which disables keyless.
    KeylessInfo {
        keyless: keyless && found,
        target_index: index,
        init_val,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::unit::{AggExpr, ColumnRangeStat, FragmentInfo, SqlType};

    fn stats_int(min: i64, max: i64, has_nulls: bool) -> TableStats {
        TableStats {
            fragments: vec![FragmentInfo { num_tuples: 10 }],
            columns: vec![ColumnRangeStat::Int {
                min,
                max,
                bucket: 0,
                has_nulls,
            }],
        }
    }

    fn col(ty: TypeInfo) -> Expr {
        Expr::ColumnRef { column: 0, ty }
    }

    fn agg(kind: AggKind, arg: Option<Expr>) -> Expr {
        Expr::Agg(AggExpr {
            kind,
            arg: arg.map(Box::new),
            distinct: false,
            ty: TypeInfo::not_null(SqlType::BigInt),
        })
    }

    #[test]
    fn test_count_star_is_keyless() {
        let info = get_keyless_info(&[agg(AggKind::Count, None)], &stats_int(0, 9, false), 8);
        assert!(info.keyless);
        assert_eq!(info.target_index, 0);
        assert_eq!(info.init_val, 0);
    }

    #[test]
    fn test_count_nullable_with_nulls_not_marker() {
        let nullable_col = col(TypeInfo::nullable(SqlType::Int));
        let info = get_keyless_info(
            &[agg(AggKind::Count, Some(nullable_col))],
            &stats_int(0, 9, true),
            8,
        );
        assert!(!info.keyless);
    }

    #[test]
    fn test_avg_marker_is_count_half() {
        let targets = vec![agg(
            AggKind::Avg,
            Some(col(TypeInfo::nullable(SqlType::Double))),
        )];
        let info = get_keyless_info(&targets, &stats_int(0, 9, true), 8);
        assert!(info.keyless);
        assert_eq!(info.target_index, 1);
        assert_eq!(info.init_val, 0);
    }

    #[test]
    fn test_min_keyless_when_max_below_initial() {
        let targets = vec![agg(AggKind::Min, Some(col(TypeInfo::not_null(SqlType::BigInt))))];
        let info = get_keyless_info(&targets, &stats_int(1, 7, false), 8);
        assert!(info.keyless);
        assert_eq!(info.init_val, i64::MAX);
    }

    #[test]
    fn test_sum_strictly_positive_range() {
        let targets = vec![agg(AggKind::Sum, Some(col(TypeInfo::not_null(SqlType::BigInt))))];
        assert!(get_keyless_info(&targets, &stats_int(1, 7, false), 8).keyless);
        assert!(!get_keyless_info(&targets, &stats_int(-1, 7, false), 8).keyless);
    }

    #[test]
    fn test_projection_disables_keyless() {
        let targets = vec![col(TypeInfo::not_null(SqlType::BigInt))];
        assert!(!get_keyless_info(&targets, &stats_int(0, 9, false), 8).keyless);
    }

    #[test]
    fn test_marker_index_skips_leading_projection() {
        let targets = vec![
            col(TypeInfo::not_null(SqlType::BigInt)),
            agg(AggKind::Count, None),
        ];
        let info = get_keyless_info(&targets, &stats_int(0, 9, false), 8);
        assert!(info.keyless);
        assert_eq!(info.target_index, 1);
    }

    #[test]
    fn test_init_agg_val_vec_expansion() {
        let targets = vec![
            agg(AggKind::Avg, Some(col(TypeInfo::nullable(SqlType::Double)))),
            agg(AggKind::Min, Some(col(TypeInfo::not_null(SqlType::BigInt)))),
            agg(AggKind::Count, None),
        ];
        let vals = init_agg_val_vec(&targets, &[], &[8, 8, 8, 8]);
        assert_eq!(vals, vec![0, 0, i64::MAX, 0]);
    }

    #[test]
    fn test_nullable_sum_inits_to_sentinel() {
        let targets = vec![agg(AggKind::Sum, Some(col(TypeInfo::nullable(SqlType::BigInt))))];
        let vals = init_agg_val_vec(&targets, &[], &[8]);
        assert_eq!(vals, vec![i64::MIN]);
    }
}
