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
//! JIT collaborator boundary: kernel IR, the row-function calling
//! convention, and the reference interpreter backend.

pub mod interp;
pub mod ir;

use crate::exec::unit::Expr;
use ir::Module;

/// One input column as the kernel sees it; order matches both the inner
/// `col_buffers` pointer array and the row function's column arguments.
#[derive(Clone, Debug)]
pub struct KernelColumn {
    pub column: usize,
    pub width: u8,
    pub is_fp: bool,
    pub is_list: bool,
    pub null_sentinel: i64,
}

/// Argument layout of the row function.
///
/// Grouped kernels: `groups_buffer`, `small_groups_buffer`, `crt_matched`,
/// `init_agg_vals`, `pos`, `filter_ok`, then one argument per kernel column.
/// Non-grouped kernels: one output slot pointer per aggregate slot, then
/// `pos`, `filter_ok`, and the column arguments.
#[derive(Clone, Debug)]
pub struct RowFunctionLayout {
    pub is_group_by: bool,
    pub agg_out_count: usize,
    pub pos_arg: usize,
    pub filter_arg: usize,
    /// (source column, argument index), parallel to `KernelModule::cols`.
    pub col_args: Vec<(usize, usize)>,
}

pub const GROUPS_BUFFER_ARG: usize = 0;
pub const SMALL_GROUPS_BUFFER_ARG: usize = 1;
pub const CRT_MATCHED_ARG: usize = 2;
pub const INIT_AGG_VALS_ARG: usize = 3;

impl RowFunctionLayout {
    pub fn for_group_by(columns: &[usize]) -> Self {
        let base = 4;
        Self {
            is_group_by: true,
            agg_out_count: 0,
            pos_arg: base,
            filter_arg: base + 1,
            col_args: columns
                .iter()
                .enumerate()
                .map(|(i, col)| (*col, base + 2 + i))
                .collect(),
        }
    }

    pub fn for_projection(agg_out_count: usize, columns: &[usize]) -> Self {
        Self {
            is_group_by: false,
            agg_out_count,
            pos_arg: agg_out_count,
            filter_arg: agg_out_count + 1,
            col_args: columns
                .iter()
                .enumerate()
                .map(|(i, col)| (*col, agg_out_count + 2 + i))
                .collect(),
        }
    }

    pub fn agg_out_arg(&self, slot: usize) -> usize {
        debug_assert!(!self.is_group_by && slot < self.agg_out_count);
        slot
    }

    pub fn col_arg(&self, column: usize) -> Option<usize> {
        self.col_args
            .iter()
            .find(|(col, _)| *col == column)
            .map(|(_, arg)| *arg)
    }

    pub fn arg_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.is_group_by {
            names.push("groups_buffer".to_string());
            names.push("small_groups_buffer".to_string());
            names.push("crt_matched".to_string());
            names.push("init_agg_vals".to_string());
        } else {
            for i in 0..self.agg_out_count {
                names.push(format!("agg_out{i}"));
            }
        }
        names.push("pos".to_string());
        names.push("filter_ok".to_string());
        for (col, _) in &self.col_args {
            names.push(format!("col{col}"));
        }
        names
    }
}

/// A generated kernel plus the metadata its skeleton (the per-fragment row
/// loop) needs: the filter quals it evaluates, the columns it feeds to the
/// row function, and the buffer sharing shape.
#[derive(Clone, Debug)]
pub struct KernelModule {
    pub module: Module,
    pub layout: RowFunctionLayout,
    pub cols: Vec<KernelColumn>,
    pub quals: Vec<Expr>,
    pub threads_share: bool,
    pub blocks_share: bool,
    pub scan_limit: usize,
}

#[cfg(test)]
mod tests {
    use super::RowFunctionLayout;

    #[test]
    fn test_group_by_layout() {
        let layout = RowFunctionLayout::for_group_by(&[2, 5]);
        assert_eq!(layout.pos_arg, 4);
        assert_eq!(layout.filter_arg, 5);
        assert_eq!(layout.col_arg(2), Some(6));
        assert_eq!(layout.col_arg(5), Some(7));
        assert_eq!(layout.arg_names()[0], "groups_buffer");
        assert_eq!(layout.arg_names()[2], "crt_matched");
    }

    #[test]
    fn test_projection_layout() {
        let layout = RowFunctionLayout::for_projection(3, &[0]);
        assert_eq!(layout.agg_out_arg(1), 1);
        assert_eq!(layout.pos_arg, 3);
        assert_eq!(layout.filter_arg, 4);
        assert_eq!(layout.col_arg(0), Some(5));
    }
}
