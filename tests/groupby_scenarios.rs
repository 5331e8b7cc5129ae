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
//! End-to-end group-by scenarios: planner, codegen, buffer lifecycle,
//! kernel execution and reduction over real input fragments.

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array};

use basalt::common::config::EngineConfig;
use basalt::common::error::GroupByError;
use basalt::exec::chunk::{ColumnChunk, FragmentColumns};
use basalt::exec::groupby::codegen::build_kernel;
use basalt::exec::groupby::context::{ExecutionContext, LaunchOutput};
use basalt::exec::groupby::keyless::init_agg_val_vec;
use basalt::exec::groupby::reduce::get_row_set;
use basalt::exec::groupby::row_set::{ResultRowSet, TargetValue};
use basalt::exec::groupby::GroupByPlanner;
use basalt::exec::unit::{
    AggExpr, AggKind, CmpOp, ColumnRangeStat, Datum, ExecutionUnit, Expr, FragmentInfo, SqlType,
    TableStats, TypeInfo,
};
use basalt::runtime::device::{DeviceKind, SoftwareDevice};
use basalt::runtime::mem_owner::RowSetMemoryOwner;
use basalt::runtime::mem_tracker::QueryMemTracker;

fn int_col(column: usize, nullable: bool) -> Expr {
    Expr::ColumnRef {
        column,
        ty: TypeInfo::new(SqlType::BigInt, nullable),
    }
}

fn double_col(column: usize, nullable: bool) -> Expr {
    Expr::ColumnRef {
        column,
        ty: TypeInfo::new(SqlType::Double, nullable),
    }
}

fn agg(kind: AggKind, arg: Option<Expr>, distinct: bool, ty: TypeInfo) -> Expr {
    Expr::Agg(AggExpr {
        kind,
        arg: arg.map(Box::new),
        distinct,
        ty,
    })
}

fn bigint() -> TypeInfo {
    TypeInfo::not_null(SqlType::BigInt)
}

fn unit(groupby: Vec<Expr>, targets: Vec<Expr>) -> ExecutionUnit {
    ExecutionUnit {
        groupby_exprs: groupby,
        target_exprs: targets,
        quals: Vec::new(),
        order_entries: Vec::new(),
        scan_limit: 0,
        join_hash_table: 0,
    }
}

fn int_fragment(columns: Vec<(Vec<Option<i64>>, bool)>) -> FragmentColumns {
    let columns = columns
        .into_iter()
        .map(|(values, nullable)| {
            let array: ArrayRef = Arc::new(Int64Array::from(values));
            Arc::new(
                ColumnChunk::from_arrow(&array, TypeInfo::new(SqlType::BigInt, nullable)).unwrap(),
            )
        })
        .collect();
    FragmentColumns { columns }
}

#[derive(Debug)]
struct QueryRun {
    row_set: ResultRowSet,
    output: LaunchOutput,
}

/// Drive one execution unit end to end on the requested device kind. The
/// accelerator path goes through the software device; the host path runs
/// directly on the owner's buffers.
fn run_query(
    unit: &ExecutionUnit,
    stats: &TableStats,
    fragments: Vec<FragmentColumns>,
    config: &EngineConfig,
    device_kind: DeviceKind,
) -> Result<QueryRun, GroupByError> {
    basalt::common::logging::init_with_level("warn");
    let tracker = QueryMemTracker::new("query");
    let owner = RowSetMemoryOwner::new(&tracker);
    let planner = GroupByPlanner::new(
        unit,
        stats,
        config,
        Arc::clone(&owner),
        device_kind,
        false,
        false,
    );
    let qmd = planner.build()?;
    let codegen = build_kernel(unit, stats, config, &owner, qmd, device_kind, &[])?;
    let widths: Vec<u8> = codegen.qmd.agg_col_widths.iter().map(|w| w.compact).collect();
    let init_vals = init_agg_val_vec(&unit.target_exprs, &unit.quals, &widths);
    let mut ctx = ExecutionContext::new(
        codegen.qmd,
        init_vals,
        unit.clone(),
        fragments,
        Arc::clone(&owner),
        device_kind,
        0,
        config.clone(),
        None,
    )?;
    let output = match device_kind {
        DeviceKind::Cpu => ctx.launch_host_code(&codegen.kernel, &[])?,
        DeviceKind::Gpu => {
            let device = SoftwareDevice::new(&tracker);
            ctx.launch_device_code(&codegen.kernel, &device, &[])?
        }
    };
    let row_set = get_row_set(&ctx, &output)?;
    Ok(QueryRun { row_set, output })
}

fn rows_as_pairs(row_set: &ResultRowSet) -> Vec<(Option<i64>, Vec<TargetValue>)> {
    let mut rows: Vec<(Option<i64>, Vec<TargetValue>)> = row_set
        .rows
        .iter()
        .map(|r| (r.keys.first().copied().flatten(), r.values.clone()))
        .collect();
    rows.sort_by_key(|(k, _)| *k);
    rows
}

/// S1: single-column perfect hash MIN / COUNT.
#[test]
fn test_s1_min_count_group_by_known_range() {
    let x = vec![1i64, 2, 3, 5, 5, 5, 7];
    let u = unit(
        vec![int_col(0, false)],
        vec![
            agg(AggKind::Min, Some(int_col(0, false)), false, bigint()),
            agg(AggKind::Count, Some(int_col(0, false)), false, bigint()),
        ],
    );
    let stats = TableStats {
        fragments: vec![FragmentInfo { num_tuples: x.len() }],
        columns: vec![ColumnRangeStat::Int {
            min: 1,
            max: 7,
            bucket: 0,
            has_nulls: false,
        }],
    };
    let fragment = int_fragment(vec![(x.iter().map(|v| Some(*v)).collect(), false)]);
    let run = run_query(&u, &stats, vec![fragment], &EngineConfig::default(), DeviceKind::Cpu)
        .unwrap();
    let rows = rows_as_pairs(&run.row_set);
    assert_eq!(
        rows,
        vec![
            (Some(1), vec![TargetValue::Int(1), TargetValue::Int(1)]),
            (Some(2), vec![TargetValue::Int(2), TargetValue::Int(1)]),
            (Some(3), vec![TargetValue::Int(3), TargetValue::Int(1)]),
            (Some(5), vec![TargetValue::Int(5), TargetValue::Int(3)]),
            (Some(7), vec![TargetValue::Int(7), TargetValue::Int(1)]),
        ]
    );
}

/// S1 again, through the accelerator path: interleaved keyless bins, one
/// buffer per block, multi-buffer reduction.
#[test]
fn test_s1_on_software_device() {
    let x = vec![1i64, 2, 3, 5, 5, 5, 7];
    let u = unit(
        vec![int_col(0, false)],
        vec![
            agg(AggKind::Min, Some(int_col(0, false)), false, bigint()),
            agg(AggKind::Count, Some(int_col(0, false)), false, bigint()),
        ],
    );
    let stats = TableStats {
        fragments: vec![FragmentInfo { num_tuples: x.len() }],
        columns: vec![ColumnRangeStat::Int {
            min: 1,
            max: 7,
            bucket: 0,
            has_nulls: false,
        }],
    };
    let fragment = int_fragment(vec![(x.iter().map(|v| Some(*v)).collect(), false)]);
    let config = EngineConfig {
        block_size: 2,
        grid_size: 2,
        warp_size: 2,
        ..EngineConfig::default()
    };
    let run = run_query(&u, &stats, vec![fragment], &config, DeviceKind::Gpu).unwrap();
    let rows = rows_as_pairs(&run.row_set);
    assert_eq!(
        rows,
        vec![
            (Some(1), vec![TargetValue::Int(1), TargetValue::Int(1)]),
            (Some(2), vec![TargetValue::Int(2), TargetValue::Int(1)]),
            (Some(3), vec![TargetValue::Int(3), TargetValue::Int(1)]),
            (Some(5), vec![TargetValue::Int(5), TargetValue::Int(3)]),
            (Some(7), vec![TargetValue::Int(7), TargetValue::Int(1)]),
        ]
    );
}

/// S2: AVG over a nullable double column decomposes into skip-null halves.
#[test]
fn test_s2_avg_with_nulls() {
    let g = vec![Some(42i64); 5];
    let v = vec![Some(1.0f64), None, Some(3.0), None, Some(5.0)];
    let u = unit(
        vec![int_col(0, false)],
        vec![agg(
            AggKind::Avg,
            Some(double_col(1, true)),
            false,
            TypeInfo::nullable(SqlType::Double),
        )],
    );
    let stats = TableStats {
        fragments: vec![FragmentInfo { num_tuples: 5 }],
        columns: vec![
            ColumnRangeStat::Int {
                min: 42,
                max: 42,
                bucket: 0,
                has_nulls: false,
            },
            ColumnRangeStat::Fp {
                min: 1.0,
                max: 5.0,
                has_nulls: true,
            },
        ],
    };
    let g_array: ArrayRef = Arc::new(Int64Array::from(g));
    let v_array: ArrayRef = Arc::new(Float64Array::from(v));
    let fragment = FragmentColumns {
        columns: vec![
            Arc::new(ColumnChunk::from_arrow(&g_array, bigint()).unwrap()),
            Arc::new(
                ColumnChunk::from_arrow(&v_array, TypeInfo::nullable(SqlType::Double)).unwrap(),
            ),
        ],
    };
    let run = run_query(&u, &stats, vec![fragment], &EngineConfig::default(), DeviceKind::Cpu)
        .unwrap();
    let rows = rows_as_pairs(&run.row_set);
    assert_eq!(rows, vec![(Some(42), vec![TargetValue::Real(3.0)])]);
}

fn count_distinct_unit(max: i64) -> (ExecutionUnit, TableStats) {
    let u = unit(
        Vec::new(),
        vec![agg(
            AggKind::Count,
            Some(int_col(0, false)),
            true,
            bigint(),
        )],
    );
    let stats = TableStats {
        fragments: vec![FragmentInfo { num_tuples: 100 }],
        columns: vec![ColumnRangeStat::Int {
            min: 0,
            max,
            bucket: 0,
            has_nulls: false,
        }],
    };
    (u, stats)
}

/// S3: dense COUNT DISTINCT over a 1000-bit bitmap.
#[test]
fn test_s3_count_distinct_bitmap() {
    let values: Vec<Option<i64>> = (0..100).map(|i| Some((i * 37) % 1000)).collect();
    let distinct = {
        let mut v: Vec<i64> = values.iter().map(|v| v.unwrap()).collect();
        v.sort();
        v.dedup();
        v.len() as i64
    };
    let (u, stats) = count_distinct_unit(999);
    let fragment = int_fragment(vec![(values, false)]);
    let run = run_query(&u, &stats, vec![fragment], &EngineConfig::default(), DeviceKind::Cpu)
        .unwrap();
    assert_eq!(run.row_set.rows.len(), 1);
    assert_eq!(run.row_set.rows[0].values, vec![TargetValue::Int(distinct)]);
}

/// S4: a sparse domain spills to the ordered set; the watchdog rejects it.
#[test]
fn test_s4_count_distinct_sparse() {
    let values: Vec<Option<i64>> = (0..100).map(|i| Some(i * 9_999_999_999 / 100)).collect();
    let distinct = {
        let mut v: Vec<i64> = values.iter().map(|v| v.unwrap()).collect();
        v.sort();
        v.dedup();
        v.len() as i64
    };
    let (u, stats) = count_distinct_unit(1_000_000_000_000);
    let fragment = int_fragment(vec![(values, false)]);
    let run = run_query(
        &u,
        &stats,
        vec![fragment.clone()],
        &EngineConfig::default(),
        DeviceKind::Cpu,
    )
    .unwrap();
    assert_eq!(run.row_set.rows[0].values, vec![TargetValue::Int(distinct)]);

    let watchdog = EngineConfig {
        enable_watchdog: true,
        ..EngineConfig::default()
    };
    let err = run_query(&u, &stats, vec![fragment], &watchdog, DeviceKind::Cpu).unwrap_err();
    assert_eq!(err, GroupByError::CannotUseFastPath);
}

/// P7: bitmap and set implementations agree on cardinality.
#[test]
fn test_p7_bitmap_matches_set() {
    let values: Vec<Option<i64>> = (0..200).map(|i| Some((i * 13) % 500)).collect();
    let (dense_unit, dense_stats) = count_distinct_unit(499);
    let dense = run_query(
        &dense_unit,
        &dense_stats,
        vec![int_fragment(vec![(values.clone(), false)])],
        &EngineConfig::default(),
        DeviceKind::Cpu,
    )
    .unwrap();
    // Same values, but a range too wide for a bitmap.
    let (sparse_unit, sparse_stats) = count_distinct_unit(100_000_000_000);
    let sparse = run_query(
        &sparse_unit,
        &sparse_stats,
        vec![int_fragment(vec![(values, false)])],
        &EngineConfig::default(),
        DeviceKind::Cpu,
    )
    .unwrap();
    assert_eq!(dense.row_set.rows[0].values, sparse.row_set.rows[0].values);
}

/// S5: two-column perfect hash with cardinalities 3 x 4.
#[test]
fn test_s5_multi_col_perfect_hash() {
    let min0 = 10i64;
    let min1 = 100i64;
    // (min0 + 2, min1 + 3) must land in bin 2 + 3*3 = 11.
    let k0: Vec<Option<i64>> = vec![Some(min0), Some(min0 + 2), Some(min0 + 2), Some(min0 + 1)];
    let k1: Vec<Option<i64>> = vec![
        Some(min1),
        Some(min1 + 3),
        Some(min1 + 3),
        Some(min1 + 1),
    ];
    let u = unit(
        vec![int_col(0, false), int_col(1, false)],
        vec![agg(AggKind::Count, None, false, bigint())],
    );
    let stats = TableStats {
        fragments: vec![FragmentInfo { num_tuples: 4 }],
        columns: vec![
            ColumnRangeStat::Int {
                min: min0,
                max: min0 + 2,
                bucket: 0,
                has_nulls: false,
            },
            ColumnRangeStat::Int {
                min: min1,
                max: min1 + 3,
                bucket: 0,
                has_nulls: false,
            },
        ],
    };
    let fragment = int_fragment(vec![(k0, false), (k1, false)]);
    let run = run_query(&u, &stats, vec![fragment], &EngineConfig::default(), DeviceKind::Cpu)
        .unwrap();
    let mut rows: Vec<(Vec<Option<i64>>, Vec<TargetValue>)> = run
        .row_set
        .rows
        .iter()
        .map(|r| (r.keys.clone(), r.values.clone()))
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        rows,
        vec![
            (
                vec![Some(min0), Some(min1)],
                vec![TargetValue::Int(1)]
            ),
            (
                vec![Some(min0 + 1), Some(min1 + 1)],
                vec![TargetValue::Int(1)]
            ),
            (
                vec![Some(min0 + 2), Some(min1 + 3)],
                vec![TargetValue::Int(2)]
            ),
        ]
    );
}

/// S6: scan-limit truncation is not an error; `total_matched` stops at the
/// limit.
#[test]
fn test_s6_scan_limit_truncation() {
    let values: Vec<Option<i64>> = (0..1000).map(Some).collect();
    let mut u = unit(
        vec![int_col(0, false)],
        vec![agg(AggKind::Count, None, false, bigint())],
    );
    u.scan_limit = 10;
    u.quals = vec![Expr::Comparison {
        op: CmpOp::Ge,
        lhs: Box::new(int_col(0, false)),
        rhs: Box::new(Expr::Literal {
            value: Datum::Int(0),
            ty: bigint(),
        }),
    }];
    let stats = TableStats {
        fragments: vec![FragmentInfo { num_tuples: 1000 }],
        columns: vec![ColumnRangeStat::Int {
            min: 0,
            max: 100_000_000,
            bucket: 0,
            has_nulls: false,
        }],
    };
    let fragment = int_fragment(vec![(values, false)]);
    let run = run_query(&u, &stats, vec![fragment], &EngineConfig::default(), DeviceKind::Cpu)
        .unwrap();
    assert_eq!(run.output.error_code, 0);
    assert_eq!(run.output.total_matched, 10);
    assert_eq!(run.row_set.rows.len(), 10);
}

/// P6: per-partition AVG reduced across fragments equals single-shot AVG.
#[test]
fn test_p6_avg_associativity_across_fragments() {
    let g: Vec<Option<i64>> = (0..8).map(|i| Some(i % 2)).collect();
    let v: Vec<Option<f64>> = (0..8).map(|i| Some(i as f64 * 0.5 + 1.0)).collect();
    let u = unit(
        vec![int_col(0, false)],
        vec![agg(
            AggKind::Avg,
            Some(double_col(1, false)),
            false,
            TypeInfo::nullable(SqlType::Double),
        )],
    );
    let stats = TableStats {
        fragments: vec![FragmentInfo { num_tuples: 8 }],
        columns: vec![
            ColumnRangeStat::Int {
                min: 0,
                max: 1,
                bucket: 0,
                has_nulls: false,
            },
            ColumnRangeStat::Fp {
                min: 1.0,
                max: 4.5,
                has_nulls: false,
            },
        ],
    };
    let make_fragment = |range: std::ops::Range<usize>| {
        let g_array: ArrayRef = Arc::new(Int64Array::from(g[range.clone()].to_vec()));
        let v_array: ArrayRef = Arc::new(Float64Array::from(v[range].to_vec()));
        FragmentColumns {
            columns: vec![
                Arc::new(ColumnChunk::from_arrow(&g_array, bigint()).unwrap()),
                Arc::new(
                    ColumnChunk::from_arrow(&v_array, TypeInfo::not_null(SqlType::Double))
                        .unwrap(),
                ),
            ],
        }
    };
    let single = run_query(
        &u,
        &stats,
        vec![make_fragment(0..8)],
        &EngineConfig::default(),
        DeviceKind::Cpu,
    )
    .unwrap();
    let split = run_query(
        &u,
        &stats,
        vec![make_fragment(0..3), make_fragment(3..8)],
        &EngineConfig::default(),
        DeviceKind::Cpu,
    )
    .unwrap();
    assert_eq!(rows_as_pairs(&single.row_set), rows_as_pairs(&split.row_set));
}

/// P8: feeding only null rows leaves every accumulator at its initial
/// value; SUM/MIN/MAX and AVG all come back NULL.
#[test]
fn test_p8_null_propagation() {
    let g: Vec<Option<i64>> = vec![Some(1); 4];
    let v: Vec<Option<i64>> = vec![None; 4];
    let u = unit(
        vec![int_col(0, false)],
        vec![
            agg(AggKind::Sum, Some(int_col(1, true)), false, TypeInfo::nullable(SqlType::BigInt)),
            agg(AggKind::Min, Some(int_col(1, true)), false, TypeInfo::nullable(SqlType::BigInt)),
            agg(AggKind::Max, Some(int_col(1, true)), false, TypeInfo::nullable(SqlType::BigInt)),
            agg(AggKind::Avg, Some(int_col(1, true)), false, TypeInfo::nullable(SqlType::Double)),
        ],
    );
    // A wide grouping domain forces the keyed baseline table; a keyless
    // layout would drop an all-null group with its untouched marker.
    let stats = TableStats {
        fragments: vec![FragmentInfo { num_tuples: 4 }],
        columns: vec![
            ColumnRangeStat::Int {
                min: 0,
                max: 100_000_000,
                bucket: 0,
                has_nulls: false,
            },
            ColumnRangeStat::Int {
                min: 0,
                max: 5,
                bucket: 0,
                has_nulls: true,
            },
        ],
    };
    let fragment = int_fragment(vec![(g, false), (v, true)]);
    let run = run_query(&u, &stats, vec![fragment], &EngineConfig::default(), DeviceKind::Cpu)
        .unwrap();
    let rows = rows_as_pairs(&run.row_set);
    assert_eq!(
        rows,
        vec![(
            Some(1),
            vec![
                TargetValue::Null,
                TargetValue::Null,
                TargetValue::Null,
                TargetValue::Null,
            ]
        )]
    );
}

/// NULL group keys hash past the real domain and come back as the NULL row.
#[test]
fn test_null_group_key_bin() {
    let g: Vec<Option<i64>> = vec![Some(1), None, Some(1), None, None];
    let u = unit(
        vec![int_col(0, true)],
        vec![agg(AggKind::Count, None, false, bigint())],
    );
    let stats = TableStats {
        fragments: vec![FragmentInfo { num_tuples: 5 }],
        columns: vec![ColumnRangeStat::Int {
            min: 1,
            max: 1,
            bucket: 0,
            has_nulls: true,
        }],
    };
    let fragment = int_fragment(vec![(g, true)]);
    let run = run_query(&u, &stats, vec![fragment], &EngineConfig::default(), DeviceKind::Cpu)
        .unwrap();
    let rows = rows_as_pairs(&run.row_set);
    assert_eq!(
        rows,
        vec![
            (None, vec![TargetValue::Int(3)]),
            (Some(1), vec![TargetValue::Int(2)]),
        ]
    );
}

/// Non-grouped aggregates over multiple fragments reduce per-lane vectors.
#[test]
fn test_non_grouped_aggregates() {
    let u = unit(
        Vec::new(),
        vec![
            agg(AggKind::Sum, Some(int_col(0, false)), false, bigint()),
            agg(AggKind::Max, Some(int_col(0, false)), false, bigint()),
            agg(AggKind::Count, None, false, bigint()),
        ],
    );
    let stats = TableStats {
        fragments: vec![
            FragmentInfo { num_tuples: 3 },
            FragmentInfo { num_tuples: 2 },
        ],
        columns: vec![ColumnRangeStat::Int {
            min: 1,
            max: 50,
            bucket: 0,
            has_nulls: false,
        }],
    };
    let frag_a = int_fragment(vec![(vec![Some(1), Some(2), Some(3)], false)]);
    let frag_b = int_fragment(vec![(vec![Some(10), Some(50)], false)]);
    let run = run_query(
        &u,
        &stats,
        vec![frag_a, frag_b],
        &EngineConfig::default(),
        DeviceKind::Cpu,
    )
    .unwrap();
    assert_eq!(run.row_set.rows.len(), 1);
    assert_eq!(
        run.row_set.rows[0].values,
        vec![
            TargetValue::Int(66),
            TargetValue::Int(50),
            TargetValue::Int(5)
        ]
    );
}

/// Grouped COUNT DISTINCT: per-bin bitmaps stay independent.
#[test]
fn test_grouped_count_distinct_bitmap() {
    let g: Vec<Option<i64>> = vec![Some(0), Some(0), Some(1), Some(1), Some(1)];
    let x: Vec<Option<i64>> = vec![Some(3), Some(3), Some(4), Some(5), Some(4)];
    let u = unit(
        vec![int_col(0, false)],
        vec![agg(
            AggKind::Count,
            Some(int_col(1, false)),
            true,
            bigint(),
        )],
    );
    let stats = TableStats {
        fragments: vec![FragmentInfo { num_tuples: 5 }],
        columns: vec![
            ColumnRangeStat::Int {
                min: 0,
                max: 1,
                bucket: 0,
                has_nulls: false,
            },
            ColumnRangeStat::Int {
                min: 0,
                max: 9,
                bucket: 0,
                has_nulls: false,
            },
        ],
    };
    let fragment = int_fragment(vec![(g, false), (x, false)]);
    let run = run_query(&u, &stats, vec![fragment], &EngineConfig::default(), DeviceKind::Cpu)
        .unwrap();
    let rows = rows_as_pairs(&run.row_set);
    assert_eq!(
        rows,
        vec![
            (Some(0), vec![TargetValue::Int(1)]),
            (Some(1), vec![TargetValue::Int(2)]),
        ]
    );
}

/// Baseline open addressing with overflow into the small buffer, reduced by
/// rehash.
#[test]
fn test_wide_domain_baseline_path() {
    let values: Vec<Option<i64>> = vec![
        Some(5),
        Some(1_000_000),
        Some(5),
        Some(99_999_999),
        Some(1_000_000),
    ];
    let u = unit(
        vec![int_col(0, false)],
        vec![agg(AggKind::Count, None, false, bigint())],
    );
    let stats = TableStats {
        fragments: vec![FragmentInfo { num_tuples: 5 }],
        columns: vec![ColumnRangeStat::Int {
            min: 0,
            max: 100_000_000,
            bucket: 0,
            has_nulls: false,
        }],
    };
    let fragment = int_fragment(vec![(values, false)]);
    let run = run_query(&u, &stats, vec![fragment], &EngineConfig::default(), DeviceKind::Cpu)
        .unwrap();
    let rows = rows_as_pairs(&run.row_set);
    assert_eq!(
        rows,
        vec![
            (Some(5), vec![TargetValue::Int(2)]),
            (Some(1_000_000), vec![TargetValue::Int(2)]),
            (Some(99_999_999), vec![TargetValue::Int(1)]),
        ]
    );
}

/// The arrow materialisation carries keys and targets with the right types.
#[test]
fn test_record_batch_output() {
    let x = vec![1i64, 2, 2];
    let u = unit(
        vec![int_col(0, false)],
        vec![agg(AggKind::Count, None, false, bigint())],
    );
    let stats = TableStats {
        fragments: vec![FragmentInfo { num_tuples: 3 }],
        columns: vec![ColumnRangeStat::Int {
            min: 1,
            max: 2,
            bucket: 0,
            has_nulls: false,
        }],
    };
    let fragment = int_fragment(vec![(x.iter().map(|v| Some(*v)).collect(), false)]);
    let run = run_query(&u, &stats, vec![fragment], &EngineConfig::default(), DeviceKind::Cpu)
        .unwrap();
    let batch = run.row_set.to_record_batch(1).unwrap();
    assert_eq!(batch.num_columns(), 2);
    assert_eq!(batch.num_rows(), 2);
}
