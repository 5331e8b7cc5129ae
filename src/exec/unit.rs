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
//! Planner-facing input model of the group-by core.
//!
//! Responsibilities:
//! - Defines the execution unit handed over by the planner: grouping
//!   expressions, target expressions, filter quals, order entries, scan limit.
//! - Defines the minimal expression and type vocabulary the core inspects,
//!   including null sentinels and per-type buffer widths.
//! - Provides static range inference over per-fragment statistics and the
//!   transient string dictionary collaborator.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

/// Marker for an unoccupied key slot: the all-ones 64-bit pattern. No
/// legitimate key may equal it; NULL group values hash as `max + 1` instead.
pub const EMPTY_KEY_64: i64 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StringEncoding {
    Dict(i32),
    None,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SqlType {
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Text(StringEncoding),
    Array(Box<SqlType>),
}

impl SqlType {
    pub fn byte_width(&self) -> u8 {
        match self {
            SqlType::Boolean | SqlType::TinyInt => 1,
            SqlType::SmallInt => 2,
            SqlType::Int | SqlType::Float => 4,
            SqlType::BigInt | SqlType::Double => 8,
            SqlType::Text(StringEncoding::Dict(_)) => 4,
            SqlType::Text(StringEncoding::None) => 8,
            SqlType::Array(_) => 8,
        }
    }

    pub fn is_fp(&self) -> bool {
        matches!(self, SqlType::Float | SqlType::Double)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            SqlType::Boolean | SqlType::TinyInt | SqlType::SmallInt | SqlType::Int | SqlType::BigInt
        )
    }

    pub fn is_string(&self) -> bool {
        matches!(self, SqlType::Text(_))
    }

    pub fn is_dict_encoded_string(&self) -> bool {
        matches!(self, SqlType::Text(StringEncoding::Dict(_)))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, SqlType::Array(_))
    }

    pub fn elem_type(&self) -> Option<&SqlType> {
        match self {
            SqlType::Array(elem) => Some(elem),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeInfo {
    pub ty: SqlType,
    pub nullable: bool,
}

impl TypeInfo {
    pub fn new(ty: SqlType, nullable: bool) -> Self {
        Self { ty, nullable }
    }

    pub fn not_null(ty: SqlType) -> Self {
        Self { ty, nullable: false }
    }

    pub fn nullable(ty: SqlType) -> Self {
        Self { ty, nullable: true }
    }

    /// Null sentinel bit pattern at the type's logical width, widened to i64.
    pub fn null_sentinel(&self) -> i64 {
        null_sentinel_for_width(&self.ty, self.ty.byte_width())
    }
}

/// Null sentinel bit pattern for a type stored in a slot of `width` bytes.
/// Integers use the most negative value of the slot width; floating point
/// uses the most negative finite value's bit pattern.
pub fn null_sentinel_for_width(ty: &SqlType, width: u8) -> i64 {
    if ty.is_fp() {
        return match width {
            4 => f32::MIN.to_bits() as i64,
            _ => f64::MIN.to_bits() as i64,
        };
    }
    match width {
        1 => i8::MIN as i64,
        2 => i16::MIN as i64,
        4 => i32::MIN as i64,
        _ => i64::MIN,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Datum {
    Int(i64),
    Real(f64),
    Str(String),
    Null,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggKind {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    ColumnRef {
        column: usize,
        ty: TypeInfo,
    },
    Literal {
        value: Datum,
        ty: TypeInfo,
    },
    Cast {
        arg: Box<Expr>,
        ty: TypeInfo,
    },
    /// CASE with a known result domain; only the result expressions matter to
    /// this core (transient string literal registration).
    Case {
        results: Vec<Expr>,
        ty: TypeInfo,
    },
    Unnest {
        arg: Box<Expr>,
    },
    Comparison {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    IsNotNull {
        arg: Box<Expr>,
    },
    Agg(AggExpr),
}

#[derive(Clone, Debug, PartialEq)]
pub struct AggExpr {
    pub kind: AggKind,
    pub arg: Option<Box<Expr>>,
    pub distinct: bool,
    pub ty: TypeInfo,
}

impl Expr {
    pub fn type_info(&self) -> TypeInfo {
        match self {
            Expr::ColumnRef { ty, .. } | Expr::Literal { ty, .. } | Expr::Cast { ty, .. } => {
                ty.clone()
            }
            Expr::Case { ty, .. } => ty.clone(),
            Expr::Unnest { arg } => match arg.type_info().ty.elem_type() {
                Some(elem) => TypeInfo::nullable(elem.clone()),
                None => arg.type_info(),
            },
            Expr::Comparison { .. } | Expr::IsNotNull { .. } => {
                TypeInfo::not_null(SqlType::Boolean)
            }
            Expr::Agg(agg) => agg.ty.clone(),
        }
    }

    /// The column this expression reads, looking through casts and unnest.
    pub fn source_column(&self) -> Option<usize> {
        match self {
            Expr::ColumnRef { column, .. } => Some(*column),
            Expr::Cast { arg, .. } | Expr::Unnest { arg } => arg.source_column(),
            _ => None,
        }
    }

    pub fn is_unnest(&self) -> bool {
        matches!(self, Expr::Unnest { .. })
    }
}

/// Argument expression of an aggregate target, if any.
pub fn agg_arg(target: &Expr) -> Option<&Expr> {
    match target {
        Expr::Agg(agg) => agg.arg.as_deref(),
        _ => None,
    }
}

/// Summary of one target expression, as consumed by layout and codegen.
#[derive(Clone, Debug)]
pub struct TargetInfo {
    pub is_agg: bool,
    pub agg_kind: Option<AggKind>,
    pub is_distinct: bool,
    pub skip_null_val: bool,
    /// Accumulator type: the argument type for SUM/MIN/MAX/AVG, BIGINT for
    /// COUNT, the expression type for plain projections.
    pub ty: TypeInfo,
    pub arg_ty: Option<TypeInfo>,
}

pub fn target_info(target: &Expr) -> TargetInfo {
    match target {
        Expr::Agg(agg) => {
            let arg_ty = agg.arg.as_ref().map(|a| a.type_info());
            let skip_null_val = arg_ty.as_ref().map(|t| t.nullable).unwrap_or(false);
            let ty = match agg.kind {
                AggKind::Count => TypeInfo::not_null(SqlType::BigInt),
                _ => arg_ty.clone().unwrap_or_else(|| agg.ty.clone()),
            };
            TargetInfo {
                is_agg: true,
                agg_kind: Some(agg.kind),
                is_distinct: agg.distinct,
                skip_null_val,
                ty,
                arg_ty,
            }
        }
        _ => TargetInfo {
            is_agg: false,
            agg_kind: None,
            is_distinct: false,
            skip_null_val: false,
            ty: target.type_info(),
            arg_ty: None,
        },
    }
}

/// True when the filter quals prove the expression can never be null.
pub fn constrained_not_null(expr: &Expr, quals: &[Expr]) -> bool {
    quals.iter().any(|qual| match qual {
        Expr::IsNotNull { arg } => arg.as_ref() == expr,
        _ => false,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderEntry {
    /// 1-based position into the target list.
    pub tle_no: usize,
    pub is_desc: bool,
    pub nulls_first: bool,
}

/// The relational execution unit handed over by the planner.
#[derive(Clone, Debug)]
pub struct ExecutionUnit {
    pub groupby_exprs: Vec<Expr>,
    pub target_exprs: Vec<Expr>,
    pub quals: Vec<Expr>,
    pub order_entries: Vec<OrderEntry>,
    /// Upper bound on rows permitted to match the filter; zero means none.
    pub scan_limit: usize,
    pub join_hash_table: i64,
}

impl ExecutionUnit {
    pub fn is_group_by(&self) -> bool {
        !self.groupby_exprs.is_empty()
    }
}

/// Statically known range of one input column.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ColumnRangeStat {
    Int {
        min: i64,
        max: i64,
        bucket: i64,
        has_nulls: bool,
    },
    Fp {
        min: f64,
        max: f64,
        has_nulls: bool,
    },
    Unknown,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FragmentInfo {
    pub num_tuples: usize,
}

/// Per-table statistics: fragment sizes plus per-column ranges.
#[derive(Clone, Debug, Default)]
pub struct TableStats {
    pub fragments: Vec<FragmentInfo>,
    pub columns: Vec<ColumnRangeStat>,
}

impl TableStats {
    pub fn total_tuples(&self) -> usize {
        self.fragments.iter().map(|f| f.num_tuples).sum()
    }

    pub fn column(&self, idx: usize) -> ColumnRangeStat {
        self.columns
            .get(idx)
            .copied()
            .unwrap_or(ColumnRangeStat::Unknown)
    }
}

/// Statically inferable range of an expression.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExprRange {
    Integer {
        min: i64,
        max: i64,
        bucket: i64,
        has_nulls: bool,
    },
    FloatingPoint {
        min: f64,
        max: f64,
        has_nulls: bool,
    },
    Invalid,
}

impl ExprRange {
    pub fn has_nulls(&self) -> bool {
        match self {
            ExprRange::Integer { has_nulls, .. } | ExprRange::FloatingPoint { has_nulls, .. } => {
                *has_nulls
            }
            ExprRange::Invalid => false,
        }
    }
}

pub fn expression_range(expr: &Expr, stats: &TableStats) -> ExprRange {
    match expr {
        Expr::ColumnRef { column, ty } => {
            let stat = stats.column(*column);
            match stat {
                // Array columns record their element range.
                ColumnRangeStat::Int {
                    min,
                    max,
                    bucket,
                    has_nulls,
                } if ty.ty.is_integer()
                    || ty.ty.is_dict_encoded_string()
                    || matches!(&ty.ty, SqlType::Array(elem) if elem.is_integer()) =>
                {
                    ExprRange::Integer {
                        min,
                        max,
                        bucket,
                        has_nulls,
                    }
                }
                ColumnRangeStat::Fp {
                    min,
                    max,
                    has_nulls,
                } if ty.ty.is_fp() => ExprRange::FloatingPoint {
                    min,
                    max,
                    has_nulls,
                },
                _ => ExprRange::Invalid,
            }
        }
        Expr::Literal { value, .. } => match value {
            Datum::Int(v) => ExprRange::Integer {
                min: *v,
                max: *v,
                bucket: 0,
                has_nulls: false,
            },
            Datum::Real(v) => ExprRange::FloatingPoint {
                min: *v,
                max: *v,
                has_nulls: false,
            },
            _ => ExprRange::Invalid,
        },
        Expr::Cast { arg, .. } | Expr::Unnest { arg } => {
            // The element range of an array column is recorded against the
            // column itself, so unnest inherits the argument's range.
            expression_range(arg, stats)
        }
        _ => ExprRange::Invalid,
    }
}

/// One dictionary of encoded strings; transient literals get negative ids,
/// descending from -2 (0 and -1 are reserved).
pub struct StringDictionary {
    dict_id: i32,
    transients: Mutex<HashMap<String, i32>>,
    next_transient: AtomicI32,
}

impl StringDictionary {
    pub fn new(dict_id: i32) -> Self {
        Self {
            dict_id,
            transients: Mutex::new(HashMap::new()),
            next_transient: AtomicI32::new(-2),
        }
    }

    pub fn dict_id(&self) -> i32 {
        self.dict_id
    }

    pub fn get_or_add_transient(&self, value: &str) -> i32 {
        let mut guard = self.transients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = guard.get(value) {
            return *id;
        }
        let id = self.next_transient.fetch_sub(1, Ordering::AcqRel);
        guard.insert(value.to_string(), id);
        id
    }

    pub fn transient_count(&self) -> usize {
        self.transients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Registry of dictionaries keyed by the type's dictionary id. Lives in the
/// row set memory owner so transient ids stay stable for the query lifetime.
#[derive(Default)]
pub struct StringDictionaryRegistry {
    dicts: Mutex<HashMap<i32, Arc<StringDictionary>>>,
}

impl StringDictionaryRegistry {
    pub fn get_or_create(&self, dict_id: i32) -> Arc<StringDictionary> {
        let mut guard = self.dicts.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            guard
                .entry(dict_id)
                .or_insert_with(|| Arc::new(StringDictionary::new(dict_id))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sentinels() {
        assert_eq!(
            TypeInfo::nullable(SqlType::BigInt).null_sentinel(),
            i64::MIN
        );
        assert_eq!(
            TypeInfo::nullable(SqlType::Int).null_sentinel(),
            i32::MIN as i64
        );
        assert_eq!(
            null_sentinel_for_width(&SqlType::Double, 8),
            f64::MIN.to_bits() as i64
        );
        assert_eq!(
            null_sentinel_for_width(&SqlType::Float, 4),
            f32::MIN.to_bits() as i64
        );
    }

    #[test]
    fn test_expression_range_column() {
        let stats = TableStats {
            fragments: vec![FragmentInfo { num_tuples: 10 }],
            columns: vec![ColumnRangeStat::Int {
                min: 1,
                max: 7,
                bucket: 0,
                has_nulls: false,
            }],
        };
        let col = Expr::ColumnRef {
            column: 0,
            ty: TypeInfo::not_null(SqlType::Int),
        };
        match expression_range(&col, &stats) {
            ExprRange::Integer { min, max, .. } => {
                assert_eq!(min, 1);
                assert_eq!(max, 7);
            }
            other => panic!("unexpected range: {:?}", other),
        }
    }

    #[test]
    fn test_expression_range_fp_column() {
        let stats = TableStats {
            fragments: vec![],
            columns: vec![ColumnRangeStat::Fp {
                min: 0.5,
                max: 2.5,
                has_nulls: true,
            }],
        };
        let col = Expr::ColumnRef {
            column: 0,
            ty: TypeInfo::nullable(SqlType::Double),
        };
        match expression_range(&col, &stats) {
            ExprRange::FloatingPoint { has_nulls, .. } => assert!(has_nulls),
            other => panic!("unexpected range: {:?}", other),
        }
    }

    #[test]
    fn test_transient_dictionary_ids() {
        let registry = StringDictionaryRegistry::default();
        let dict = registry.get_or_create(3);
        let a = dict.get_or_add_transient("foo");
        let b = dict.get_or_add_transient("bar");
        assert_eq!(a, dict.get_or_add_transient("foo"));
        assert!(a < 0 && b < 0 && a != b);
        assert!(Arc::ptr_eq(&dict, &registry.get_or_create(3)));
    }

    #[test]
    fn test_constrained_not_null() {
        let col = Expr::ColumnRef {
            column: 2,
            ty: TypeInfo::nullable(SqlType::Int),
        };
        let quals = vec![Expr::IsNotNull {
            arg: Box::new(col.clone()),
        }];
        assert!(constrained_not_null(&col, &quals));
        let other = Expr::ColumnRef {
            column: 1,
            ty: TypeInfo::nullable(SqlType::Int),
        };
        assert!(!constrained_not_null(&other, &quals));
    }
}
