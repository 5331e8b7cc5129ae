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
//! Fragment column chunks.
//!
//! The kernel consumes flat fixed-width buffers; NULLs are materialised as
//! the type's sentinel bit pattern so the generated code never touches a
//! validity bitmap. `from_arrow` linearises an arrow array into that form.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float32Array, Float64Array, Int8Array, Int16Array, Int32Array,
    Int64Array, ListArray,
};
use arrow::datatypes::DataType;

use crate::common::error::{GroupByError, GroupByResult};
use crate::exec::unit::{SqlType, TypeInfo};

#[derive(Clone, Debug)]
enum ChunkData {
    Fixed {
        data: Vec<u8>,
        width: usize,
    },
    /// List column: per-row element runs, elements widened to 64-bit
    /// patterns with NULL elements already mapped to the sentinel.
    List {
        offsets: Vec<usize>,
        values: Vec<i64>,
    },
}

/// One column of one fragment, linearised for kernel consumption.
#[derive(Clone, Debug)]
pub struct ColumnChunk {
    ty: TypeInfo,
    rows: usize,
    data: ChunkData,
}

fn write_fixed(data: &mut Vec<u8>, width: usize, bits: i64) {
    let bytes = bits.to_le_bytes();
    data.extend_from_slice(&bytes[..width]);
}

impl ColumnChunk {
    pub fn type_info(&self) -> &TypeInfo {
        &self.ty
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Row value as a width-extended 64-bit pattern; NULL rows yield the
    /// type's sentinel.
    pub fn value_bits(&self, row: usize) -> i64 {
        match &self.data {
            ChunkData::Fixed { data, width } => {
                let start = row * width;
                let mut buf = [0u8; 8];
                buf[..*width].copy_from_slice(&data[start..start + width]);
                let raw = i64::from_le_bytes(buf);
                if self.ty.ty.is_fp() {
                    // FP patterns are not sign-extended.
                    return raw;
                }
                // Sign-extend from the stored width.
                let shift = 64 - (*width as u32) * 8;
                (raw << shift) >> shift
            }
            ChunkData::List { .. } => 0,
        }
    }

    /// Element run for a list row, when this is a list column.
    pub fn list_at(&self, row: usize) -> Option<&[i64]> {
        match &self.data {
            ChunkData::List { offsets, values } => {
                let start = offsets[row];
                let end = offsets[row + 1];
                Some(&values[start..end])
            }
            ChunkData::Fixed { .. } => None,
        }
    }

    pub fn from_arrow(array: &ArrayRef, ty: TypeInfo) -> GroupByResult<Self> {
        let rows = array.len();
        let width = ty.ty.byte_width() as usize;
        let sentinel = ty.null_sentinel();
        let mut data = Vec::with_capacity(rows * width);

        macro_rules! pack_ints {
            ($arr_ty:ty) => {{
                let arr = array
                    .as_any()
                    .downcast_ref::<$arr_ty>()
                    .ok_or_else(|| GroupByError::Unsupported("column type mismatch".into()))?;
                for row in 0..rows {
                    let bits = if arr.is_null(row) {
                        sentinel
                    } else {
                        arr.value(row) as i64
                    };
                    write_fixed(&mut data, width, bits);
                }
            }};
        }

        match array.data_type() {
            DataType::Boolean => {
                let arr = array
                    .as_any()
                    .downcast_ref::<BooleanArray>()
                    .ok_or_else(|| GroupByError::Unsupported("column type mismatch".into()))?;
                for row in 0..rows {
                    let bits = if arr.is_null(row) {
                        sentinel
                    } else if arr.value(row) {
                        1
                    } else {
                        0
                    };
                    write_fixed(&mut data, width, bits);
                }
            }
            DataType::Int8 => pack_ints!(Int8Array),
            DataType::Int16 => pack_ints!(Int16Array),
            DataType::Int32 => pack_ints!(Int32Array),
            DataType::Int64 => pack_ints!(Int64Array),
            DataType::Float32 => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Float32Array>()
                    .ok_or_else(|| GroupByError::Unsupported("column type mismatch".into()))?;
                for row in 0..rows {
                    let bits = if arr.is_null(row) {
                        sentinel
                    } else {
                        arr.value(row).to_bits() as i64
                    };
                    write_fixed(&mut data, width, bits);
                }
            }
            DataType::Float64 => {
                let arr = array
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| GroupByError::Unsupported("column type mismatch".into()))?;
                for row in 0..rows {
                    let bits = if arr.is_null(row) {
                        sentinel
                    } else {
                        arr.value(row).to_bits() as i64
                    };
                    write_fixed(&mut data, width, bits);
                }
            }
            DataType::List(_) => {
                let arr = array
                    .as_any()
                    .downcast_ref::<ListArray>()
                    .ok_or_else(|| GroupByError::Unsupported("column type mismatch".into()))?;
                let elem_ty = match ty.ty.elem_type() {
                    Some(elem) => TypeInfo::nullable(elem.clone()),
                    None => {
                        return Err(GroupByError::Unsupported(
                            "list column requires an array type".into(),
                        ));
                    }
                };
                let mut offsets = Vec::with_capacity(rows + 1);
                let mut values = Vec::new();
                offsets.push(0);
                for row in 0..rows {
                    if !arr.is_null(row) {
                        let elems: ArrayRef = arr.value(row);
                        let inner = ColumnChunk::from_arrow(&elems, elem_ty.clone())?;
                        for e in 0..inner.len() {
                            values.push(inner.value_bits(e));
                        }
                    }
                    offsets.push(values.len());
                }
                return Ok(Self {
                    ty,
                    rows,
                    data: ChunkData::List { offsets, values },
                });
            }
            other => {
                return Err(GroupByError::Unsupported(format!(
                    "unsupported fragment column type: {other:?}"
                )));
            }
        }

        Ok(Self {
            ty,
            rows,
            data: ChunkData::Fixed { data, width },
        })
    }

    /// Build a chunk straight from 64-bit patterns (already sentinel-mapped).
    pub fn from_bits(bits: &[i64], ty: TypeInfo) -> Self {
        let width = ty.ty.byte_width() as usize;
        let mut data = Vec::with_capacity(bits.len() * width);
        for b in bits {
            write_fixed(&mut data, width, *b);
        }
        Self {
            ty,
            rows: bits.len(),
            data: ChunkData::Fixed { data, width },
        }
    }
}

/// All columns of one fragment; rows are aligned across columns.
#[derive(Clone, Debug, Default)]
pub struct FragmentColumns {
    pub columns: Vec<Arc<ColumnChunk>>,
}

impl FragmentColumns {
    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Float64Array, Int32Array, Int64Array};

    use super::ColumnChunk;
    use crate::exec::unit::{SqlType, TypeInfo};

    #[test]
    fn test_int_chunk_round_trip() {
        let array: ArrayRef = Arc::new(Int64Array::from(vec![Some(1), None, Some(-5)]));
        let chunk =
            ColumnChunk::from_arrow(&array, TypeInfo::nullable(SqlType::BigInt)).unwrap();
        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.value_bits(0), 1);
        assert_eq!(chunk.value_bits(1), i64::MIN);
        assert_eq!(chunk.value_bits(2), -5);
    }

    #[test]
    fn test_narrow_int_sign_extension() {
        let array: ArrayRef = Arc::new(Int32Array::from(vec![Some(-7), Some(42)]));
        let chunk = ColumnChunk::from_arrow(&array, TypeInfo::not_null(SqlType::Int)).unwrap();
        assert_eq!(chunk.value_bits(0), -7);
        assert_eq!(chunk.value_bits(1), 42);
    }

    #[test]
    fn test_double_chunk_keeps_bits() {
        let array: ArrayRef = Arc::new(Float64Array::from(vec![Some(1.5), None]));
        let chunk =
            ColumnChunk::from_arrow(&array, TypeInfo::nullable(SqlType::Double)).unwrap();
        assert_eq!(chunk.value_bits(0), 1.5f64.to_bits() as i64);
        assert_eq!(chunk.value_bits(1), f64::MIN.to_bits() as i64);
    }
}
