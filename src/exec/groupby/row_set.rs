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
//! Result row set materialisation.

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};

use crate::common::error::{GroupByError, GroupByResult};
use crate::exec::unit::{AggKind, Expr, TargetInfo, target_info};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TargetValue {
    Int(i64),
    Real(f64),
    Null,
}

#[derive(Clone, Debug)]
pub struct ResultRow {
    /// Group key components; `None` is the NULL group.
    pub keys: Vec<Option<i64>>,
    pub values: Vec<TargetValue>,
}

/// Final, reduced result of one execution unit. Row order is hash-table
/// order; any required ordering is the sort stage's business.
#[derive(Debug)]
pub struct ResultRowSet {
    pub targets: Vec<TargetInfo>,
    pub rows: Vec<ResultRow>,
}

impl ResultRowSet {
    pub fn new(target_exprs: &[Expr]) -> Self {
        Self {
            targets: target_exprs.iter().map(target_info).collect(),
            rows: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn target_is_real(target: &TargetInfo) -> bool {
        if target.agg_kind == Some(AggKind::Avg) {
            return true;
        }
        if target.agg_kind == Some(AggKind::Count) {
            return false;
        }
        target.ty.ty.is_fp()
    }

    /// Materialise as arrow arrays: one Int64 column per key, then one
    /// column per target (Float64 for FP and AVG targets, Int64 otherwise).
    pub fn to_record_batch(&self, key_count: usize) -> GroupByResult<RecordBatch> {
        let mut fields = Vec::with_capacity(key_count + self.targets.len());
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(key_count + self.targets.len());

        for key_idx in 0..key_count {
            fields.push(Field::new(format!("key{key_idx}"), DataType::Int64, true));
            let values: Vec<Option<i64>> =
                self.rows.iter().map(|row| row.keys[key_idx]).collect();
            columns.push(Arc::new(Int64Array::from(values)));
        }

        for (target_idx, target) in self.targets.iter().enumerate() {
            let name = format!("target{target_idx}");
            if Self::target_is_real(target) {
                fields.push(Field::new(name, DataType::Float64, true));
                let values: Vec<Option<f64>> = self
                    .rows
                    .iter()
                    .map(|row| match row.values[target_idx] {
                        TargetValue::Real(v) => Some(v),
                        TargetValue::Int(v) => Some(v as f64),
                        TargetValue::Null => None,
                    })
                    .collect();
                columns.push(Arc::new(Float64Array::from(values)));
            } else {
                fields.push(Field::new(name, DataType::Int64, true));
                let values: Vec<Option<i64>> = self
                    .rows
                    .iter()
                    .map(|row| match row.values[target_idx] {
                        TargetValue::Int(v) => Some(v),
                        TargetValue::Real(v) => Some(v as i64),
                        TargetValue::Null => None,
                    })
                    .collect();
                columns.push(Arc::new(Int64Array::from(values)));
            }
        }

        RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
            .map_err(|e| GroupByError::Unsupported(format!("arrow materialisation: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::unit::{AggExpr, SqlType, TypeInfo};

    #[test]
    fn test_record_batch_shape() {
        let targets = vec![Expr::Agg(AggExpr {
            kind: AggKind::Avg,
            arg: Some(Box::new(Expr::ColumnRef {
                column: 0,
                ty: TypeInfo::nullable(SqlType::Double),
            })),
            distinct: false,
            ty: TypeInfo::nullable(SqlType::Double),
        })];
        let mut row_set = ResultRowSet::new(&targets);
        row_set.rows.push(ResultRow {
            keys: vec![Some(42)],
            values: vec![TargetValue::Real(3.0)],
        });
        row_set.rows.push(ResultRow {
            keys: vec![None],
            values: vec![TargetValue::Null],
        });
        let batch = row_set.to_record_batch(1).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 2);
        assert_eq!(batch.column(1).data_type(), &DataType::Float64);
    }
}
