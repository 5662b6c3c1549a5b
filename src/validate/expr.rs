// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Structural validation of transcoded expressions.
//!
//! This walks the flat, naturally-aligned byte buffer produced by
//! `decode::expr::transcode_expression` and checks that every index it
//! carries (type, function, table, memory, global, element, data, and local
//! indices) is in bounds. It does not perform operand-type stack checking:
//! per-instruction type-correctness is left to the interpreter's own
//! assumption of well-typedness, consistent with how far this crate's
//! validation pass goes elsewhere.

use crate::Allocator;
use crate::types::{
    BlockType, BulkOpcode, CallIndirectOperands, DataIdx, ElemIdx, Expression, FuncIdx,
    FunctionType, GlobalIdx, LabelIdx, MemArg, Opcode, RefType, TableCopyOperands, TableIdx,
    TableInitOperands, TypeIdx, ValType,
};

use super::{Error, Validator};

#[derive(Copy, Clone, Debug)]
pub(crate) enum ExpressionValidationContext<'module, A: Allocator> {
    /// A function body, together with the total number of local variable
    /// slots available to it (parameters followed by declared locals).
    Function {
        signature: &'module FunctionType<A>,
        locals: u32,
    },
    /// A constant expression computing a value of the given type (global
    /// initializers, active segment offsets).
    Constant(ValType),
}

// A cursor over a transcoded expression's flat byte buffer, reading values
// back out using the same natural-alignment layout
// `decode::expr::ExpressionBuilder` wrote them with.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read<T: Copy>(&mut self) -> T {
        let pos = self.pos.next_multiple_of(align_of::<T>());
        let end = pos + size_of::<T>();
        debug_assert!(end <= self.data.len(), "corrupt transcoded expression");
        // Safety: `pos` is realigned to T's natural alignment and `end` is
        // within the bounds of `data`, which holds only bytes written by
        // `transcode_expression` in exactly this layout.
        let value = unsafe { self.data.as_ptr().add(pos).cast::<T>().read_unaligned() };
        self.pos = end;
        value
    }

    // Reads and discards a length-prefixed vector of `T`s.
    fn skip_vec<T: Copy>(&mut self) {
        let len: u32 = self.read();
        for _ in 0..len {
            let _: T = self.read();
        }
    }
}

pub(crate) fn validate_expression<A: Allocator>(
    validator: &mut Validator<A>,
    expr: &Expression<A>,
    context: ExpressionValidationContext<A>,
) -> Result<(), Error> {
    let locals = match context {
        ExpressionValidationContext::Function { locals, .. } => locals,
        ExpressionValidationContext::Constant(_) => 0,
    };

    let mut cursor = Cursor::new(&**expr);
    let mut depth = 0u32;
    loop {
        let op: Opcode = cursor.read();
        match op {
            Opcode::Block | Opcode::If | Opcode::Loop => {
                if let BlockType::TypeIndex(idx) = cursor.read::<BlockType>() {
                    validator.validate(&idx)?;
                }
                depth += 1;
            }
            Opcode::Br | Opcode::BrIf => {
                let _labelidx: u32 = cursor.read();
            }
            Opcode::Call | Opcode::RefFunc => {
                let funcidx = FuncIdx::new(cursor.read());
                validator.validate(&funcidx)?;
            }
            Opcode::GlobalGet | Opcode::GlobalSet => {
                let globalidx = GlobalIdx::new(cursor.read());
                validator.validate(&globalidx)?;
            }
            Opcode::LocalGet | Opcode::LocalSet | Opcode::LocalTee => {
                let index: u32 = cursor.read();
                if index >= locals {
                    return Err(Error::InvalidLocalIndex {
                        index,
                        capacity: locals,
                    });
                }
            }
            Opcode::TableGet | Opcode::TableSet => {
                let tableidx = TableIdx::new(cursor.read());
                validator.validate(&tableidx)?;
            }
            Opcode::BrTable => {
                cursor.skip_vec::<LabelIdx>();
                let _default: LabelIdx = cursor.read();
            }
            Opcode::BulkPrefix => validate_bulk_op(validator, &mut cursor)?,
            Opcode::CallIndirect => {
                let operands: CallIndirectOperands = cursor.read();
                validator.validate(&operands.table)?;
                validator.validate(&operands.ty)?;
            }
            Opcode::End => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            Opcode::F32Const => {
                let _: f32 = cursor.read();
            }
            Opcode::F64Const => {
                let _: f64 = cursor.read();
            }
            Opcode::I32Const => {
                let _: i32 = cursor.read();
            }
            Opcode::I64Const => {
                let _: i64 = cursor.read();
            }
            Opcode::F32Load
            | Opcode::F32Store
            | Opcode::F64Load
            | Opcode::F64Store
            | Opcode::I32Load
            | Opcode::I32Load8S
            | Opcode::I32Load8U
            | Opcode::I32Load16S
            | Opcode::I32Load16U
            | Opcode::I32Store
            | Opcode::I32Store8
            | Opcode::I32Store16
            | Opcode::I64Load
            | Opcode::I64Load8S
            | Opcode::I64Load8U
            | Opcode::I64Load16S
            | Opcode::I64Load16U
            | Opcode::I64Load32S
            | Opcode::I64Load32U
            | Opcode::I64Store
            | Opcode::I64Store8
            | Opcode::I64Store16
            | Opcode::I64Store32 => {
                let _: MemArg = cursor.read();
            }
            Opcode::RefNull => {
                let _: RefType = cursor.read();
            }
            Opcode::SelectT => cursor.skip_vec::<ValType>(),
            // No bytes are transcoded for these: their sole immediate is a
            // reserved zero byte that the decoder consumes without writing.
            Opcode::MemoryGrow | Opcode::MemorySize => {}
            // SIMD opcodes never reach a successfully decoded expression (see
            // decode::expr::transcode_vector_op).
            Opcode::VectorPrefix => unreachable!("SIMD opcodes are rejected at decode time"),
            _ => {} // No operands.
        }
    }

    Ok(())
}

fn validate_bulk_op<A: Allocator>(
    validator: &mut Validator<A>,
    cursor: &mut Cursor,
) -> Result<(), Error> {
    let bulk_op: BulkOpcode = cursor.read();
    match bulk_op {
        BulkOpcode::DataDrop => {
            let dataidx = DataIdx::new(cursor.read());
            validator.validate(&dataidx)?;
        }
        BulkOpcode::ElemDrop => {
            let elemidx = ElemIdx::new(cursor.read());
            validator.validate(&elemidx)?;
        }
        BulkOpcode::TableFill | BulkOpcode::TableGrow | BulkOpcode::TableSize => {
            let tableidx = TableIdx::new(cursor.read());
            validator.validate(&tableidx)?;
        }
        // The reserved memidx bytes aren't transcoded; nothing to read.
        BulkOpcode::MemoryCopy | BulkOpcode::MemoryFill => {}
        BulkOpcode::MemoryInit => {
            let dataidx = DataIdx::new(cursor.read());
            validator.validate(&dataidx)?;
        }
        BulkOpcode::TableCopy => {
            let operands: TableCopyOperands = cursor.read();
            validator.validate(&operands.src)?;
            validator.validate(&operands.dst)?;
        }
        BulkOpcode::TableInit => {
            let operands: TableInitOperands = cursor.read();
            validator.validate(&operands.table)?;
            validator.validate(&operands.elem)?;
        }
        _ => {} // No operands.
    }
    Ok(())
}
