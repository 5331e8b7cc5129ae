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
//! Kernel IR.
//!
//! Responsibilities:
//! - Defines the closed set of IR node shapes aggregate codegen may emit and
//!   the module / row-function containers that hold them.
//! - Provides `IrBuilder`, the narrow construction surface handed to codegen:
//!   intrinsic calls, external calls, basic blocks, conditional branches,
//!   selects and atomic adds.
//!
//! The JIT proper (lowering this IR to machine code) is an external
//! collaborator; the reference backend in `jit::interp` executes it directly.

pub type BlockId = usize;
pub type InstrId = usize;
pub type FuncId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrType {
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Ptr,
    Void,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IrValue {
    ConstI64(i64),
    ConstI32(i32),
    ConstF64(f64),
    ConstF32(f32),
    NullPtr,
    /// Row-function (or helper-function) argument by position.
    Arg(usize),
    /// Result of a previously emitted instruction.
    Instr(InstrId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpKind {
    IntEq,
    IntNe,
    FpEq,
}

#[derive(Clone, Debug)]
pub enum Instr {
    /// Call into a runtime intrinsic by linkage name.
    Call { callee: String, args: Vec<IrValue> },
    /// Call into an external helper with an explicit return type.
    ExternalCall {
        callee: String,
        ret: IrType,
        args: Vec<IrValue>,
    },
    /// Call a function synthesized into this module (perfect hash).
    HelperCall { func: FuncId, args: Vec<IrValue> },
    BinOp {
        op: BinOpKind,
        lhs: IrValue,
        rhs: IrValue,
    },
    Cmp {
        op: CmpKind,
        lhs: IrValue,
        rhs: IrValue,
    },
    Select {
        cond: IrValue,
        on_true: IrValue,
        on_false: IrValue,
    },
    /// Integer narrowing/widening to `bits` with sign extension; FP bit
    /// patterns pass through untouched.
    CastWidth { value: IrValue, bits: u8 },
    /// Signed integer to double, yielding the double's bit pattern.
    IntToFp { value: IrValue },
    /// FP width conversion between f32 and f64 bit patterns.
    FpCast {
        value: IrValue,
        from_bits: u8,
        to_bits: u8,
    },
    /// View `base` as an array of `width`-byte slots and take the address of
    /// slot `index` (bitcast + GEP in the original backend).
    SlotPtr {
        base: IrValue,
        index: IrValue,
        width: u8,
    },
    /// Stack buffer of `count` 64-bit key components.
    AllocaKeys { count: usize },
    KeyStore {
        buf: IrValue,
        index: usize,
        value: IrValue,
    },
    KeyLoad { buf: IrValue, index: usize },
    Store {
        ptr: IrValue,
        value: IrValue,
        width: u8,
    },
    /// Monotonic atomic add of `value` onto the `width`-byte slot at `ptr`.
    AtomicAdd {
        ptr: IrValue,
        value: IrValue,
        width: u8,
    },
    CondBr {
        cond: IrValue,
        on_true: BlockId,
        on_false: BlockId,
    },
    Br { target: BlockId },
    Neg { value: IrValue },
    Trunc { value: IrValue, bits: u8 },
    Ret { value: Option<IrValue> },
}

#[derive(Clone, Debug)]
pub struct Block {
    pub label: String,
    pub instrs: Vec<InstrId>,
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub args: Vec<String>,
    pub blocks: Vec<Block>,
    pub instrs: Vec<Instr>,
    pub always_inline: bool,
}

impl Function {
    pub fn entry_block(&self) -> BlockId {
        0
    }
}

#[derive(Clone, Debug)]
pub struct Module {
    pub functions: Vec<Function>,
    pub row_func: FuncId,
}

impl Module {
    pub fn row_function(&self) -> &Function {
        &self.functions[self.row_func]
    }
}

/// Group-lookup calls carry `row_size_quad` at a fixed argument position.
/// `get_columnar_group_bin_offset` returns an index, not a pointer, and is
/// exempt from back-patching.
pub fn row_size_quad_arg_position(callee: &str) -> Option<usize> {
    match callee {
        "get_columnar_group_bin_offset" => None,
        "get_group_value_one_key" => Some(6),
        name if name.starts_with("get_group_value_fast") => Some(4),
        "get_group_value" | "get_matching_group_value_perfect_hash" => Some(4),
        _ => None,
    }
}

/// IR construction surface handed to aggregate codegen.
pub struct IrBuilder {
    module: Module,
    func: FuncId,
    insert: BlockId,
}

impl IrBuilder {
    /// Start a module whose row function has the given argument list.
    pub fn with_row_function(args: Vec<String>) -> Self {
        let row_func = Function {
            name: "row_func".to_string(),
            args,
            blocks: vec![Block {
                label: "entry".to_string(),
                instrs: Vec::new(),
            }],
            instrs: Vec::new(),
            always_inline: false,
        };
        Self {
            module: Module {
                functions: vec![row_func],
                row_func: 0,
            },
            func: 0,
            insert: 0,
        }
    }

    pub fn finish(self) -> Module {
        self.module
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut Module {
        &mut self.module
    }

    pub fn current_function(&self) -> FuncId {
        self.func
    }

    pub fn insert_point(&self) -> BlockId {
        self.insert
    }

    /// Add a helper function and move the insert point to its entry block.
    pub fn create_function(
        &mut self,
        name: &str,
        args: Vec<String>,
        always_inline: bool,
    ) -> FuncId {
        let func = Function {
            name: name.to_string(),
            args,
            blocks: vec![Block {
                label: "entry".to_string(),
                instrs: Vec::new(),
            }],
            instrs: Vec::new(),
            always_inline,
        };
        self.module.functions.push(func);
        let id = self.module.functions.len() - 1;
        self.func = id;
        self.insert = 0;
        id
    }

    pub fn set_insert_function(&mut self, func: FuncId, block: BlockId) {
        self.func = func;
        self.insert = block;
    }

    pub fn create_bb(&mut self, label: &str) -> BlockId {
        let func = &mut self.module.functions[self.func];
        func.blocks.push(Block {
            label: label.to_string(),
            instrs: Vec::new(),
        });
        func.blocks.len() - 1
    }

    pub fn set_insert_point(&mut self, block: BlockId) {
        self.insert = block;
    }

    fn push(&mut self, instr: Instr) -> IrValue {
        let func = &mut self.module.functions[self.func];
        func.instrs.push(instr);
        let id = func.instrs.len() - 1;
        func.blocks[self.insert].instrs.push(id);
        IrValue::Instr(id)
    }

    pub fn emit_call(&mut self, callee: &str, args: Vec<IrValue>) -> IrValue {
        self.push(Instr::Call {
            callee: callee.to_string(),
            args,
        })
    }

    pub fn emit_external_call(
        &mut self,
        callee: &str,
        ret: IrType,
        args: Vec<IrValue>,
    ) -> IrValue {
        self.push(Instr::ExternalCall {
            callee: callee.to_string(),
            ret,
            args,
        })
    }

    pub fn emit_helper_call(&mut self, func: FuncId, args: Vec<IrValue>) -> IrValue {
        self.push(Instr::HelperCall { func, args })
    }

    pub fn create_add(&mut self, lhs: IrValue, rhs: IrValue) -> IrValue {
        self.push(Instr::BinOp {
            op: BinOpKind::Add,
            lhs,
            rhs,
        })
    }

    pub fn create_sub(&mut self, lhs: IrValue, rhs: IrValue) -> IrValue {
        self.push(Instr::BinOp {
            op: BinOpKind::Sub,
            lhs,
            rhs,
        })
    }

    pub fn create_mul(&mut self, lhs: IrValue, rhs: IrValue) -> IrValue {
        self.push(Instr::BinOp {
            op: BinOpKind::Mul,
            lhs,
            rhs,
        })
    }

    pub fn create_icmp_eq(&mut self, lhs: IrValue, rhs: IrValue) -> IrValue {
        self.push(Instr::Cmp {
            op: CmpKind::IntEq,
            lhs,
            rhs,
        })
    }

    pub fn create_icmp_ne(&mut self, lhs: IrValue, rhs: IrValue) -> IrValue {
        self.push(Instr::Cmp {
            op: CmpKind::IntNe,
            lhs,
            rhs,
        })
    }

    pub fn create_fcmp_eq(&mut self, lhs: IrValue, rhs: IrValue) -> IrValue {
        self.push(Instr::Cmp {
            op: CmpKind::FpEq,
            lhs,
            rhs,
        })
    }

    pub fn create_select(
        &mut self,
        cond: IrValue,
        on_true: IrValue,
        on_false: IrValue,
    ) -> IrValue {
        self.push(Instr::Select {
            cond,
            on_true,
            on_false,
        })
    }

    pub fn create_cast_width(&mut self, value: IrValue, bits: u8) -> IrValue {
        self.push(Instr::CastWidth { value, bits })
    }

    pub fn create_int_to_fp(&mut self, value: IrValue) -> IrValue {
        self.push(Instr::IntToFp { value })
    }

    pub fn create_fp_cast(&mut self, value: IrValue, from_bits: u8, to_bits: u8) -> IrValue {
        self.push(Instr::FpCast {
            value,
            from_bits,
            to_bits,
        })
    }

    pub fn create_slot_ptr(&mut self, base: IrValue, index: IrValue, width: u8) -> IrValue {
        self.push(Instr::SlotPtr { base, index, width })
    }

    pub fn create_alloca_keys(&mut self, count: usize) -> IrValue {
        self.push(Instr::AllocaKeys { count })
    }

    pub fn create_key_store(&mut self, buf: IrValue, index: usize, value: IrValue) {
        self.push(Instr::KeyStore { buf, index, value });
    }

    pub fn create_key_load(&mut self, buf: IrValue, index: usize) -> IrValue {
        self.push(Instr::KeyLoad { buf, index })
    }

    pub fn create_store(&mut self, ptr: IrValue, value: IrValue, width: u8) {
        self.push(Instr::Store { ptr, value, width });
    }

    pub fn create_atomic_add(&mut self, ptr: IrValue, value: IrValue, width: u8) -> IrValue {
        self.push(Instr::AtomicAdd { ptr, value, width })
    }

    pub fn create_cond_br(&mut self, cond: IrValue, on_true: BlockId, on_false: BlockId) {
        self.push(Instr::CondBr {
            cond,
            on_true,
            on_false,
        });
    }

    pub fn create_br(&mut self, target: BlockId) {
        self.push(Instr::Br { target });
    }

    pub fn create_neg(&mut self, value: IrValue) -> IrValue {
        self.push(Instr::Neg { value })
    }

    pub fn create_trunc(&mut self, value: IrValue, bits: u8) -> IrValue {
        self.push(Instr::Trunc { value, bits })
    }

    pub fn create_ret(&mut self, value: Option<IrValue>) {
        self.push(Instr::Ret { value });
    }

    /// Replace the `row_size_quad` argument of a group-lookup call in situ.
    /// No-op for the columnar bin-offset lookup, which takes no row size.
    pub fn patch_group_lookup_row_size(&mut self, instr: IrValue, new_size_quad: i32) {
        let IrValue::Instr(id) = instr else {
            return;
        };
        let func = &mut self.module.functions[self.module.row_func];
        if let Instr::Call { callee, args } = &mut func.instrs[id] {
            if let Some(pos) = row_size_quad_arg_position(callee) {
                debug_assert!(pos < args.len());
                args[pos] = IrValue::ConstI32(new_size_quad);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_blocks_and_instrs() {
        let mut b = IrBuilder::with_row_function(vec!["groups_buffer".into(), "pos".into()]);
        let t = b.create_bb("filter_true");
        let f = b.create_bb("filter_false");
        b.create_cond_br(IrValue::Arg(1), t, f);
        b.set_insert_point(t);
        let call = b.emit_call(
            "get_group_value_fast",
            vec![
                IrValue::Arg(0),
                IrValue::ConstI64(3),
                IrValue::ConstI64(0),
                IrValue::ConstI64(0),
                IrValue::ConstI32(2),
            ],
        );
        b.patch_group_lookup_row_size(call, 5);
        let module = b.finish();
        let func = module.row_function();
        assert_eq!(func.blocks.len(), 3);
        match &func.instrs[func.blocks[1].instrs[0]] {
            Instr::Call { callee, args } => {
                assert_eq!(callee, "get_group_value_fast");
                assert_eq!(args[4], IrValue::ConstI32(5));
            }
            other => panic!("unexpected instr: {:?}", other),
        }
    }

    #[test]
    fn test_row_size_quad_positions() {
        assert_eq!(row_size_quad_arg_position("get_group_value_one_key"), Some(6));
        assert_eq!(row_size_quad_arg_position("get_group_value_fast_keyless"), Some(4));
        assert_eq!(row_size_quad_arg_position("get_group_value"), Some(4));
        assert_eq!(
            row_size_quad_arg_position("get_matching_group_value_perfect_hash"),
            Some(4)
        );
        assert_eq!(row_size_quad_arg_position("get_columnar_group_bin_offset"), None);
    }
}
