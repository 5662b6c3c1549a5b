// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! A cursor over a transcoded expression's flat byte buffer.
//!
//! This reads values back out using the exact natural-alignment layout
//! `decode::expr::ExpressionBuilder` wrote them with, the same way
//! `validate::expr`'s private cursor does for bounds-checking. The
//! interpreter additionally needs to resolve branch targets ahead of
//! executing a `block`/`loop`/`if`, which means scanning forward for the
//! construct's matching `end` (and, for `if`, its optional `else`) without
//! disturbing the cursor actually driving execution.

use crate::core_compat::alloc::Global;
use crate::core_compat::vec::Vec;
use crate::types::{
    BlockType, BulkOpcode, CallIndirectOperands, LabelIdx, MemArg, Opcode, RefType,
    TableCopyOperands, TableInitOperands, ValType,
};

#[derive(Clone, Copy)]
pub(super) struct Cursor<'a> {
    data: &'a [u8],
    pub(super) pos: usize,
}

impl<'a> Cursor<'a> {
    pub(super) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(super) fn read<T: Copy>(&mut self) -> T {
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

    fn read_vec<T: Copy>(&mut self) -> Vec<T, Global> {
        let len: u32 = self.read();
        let mut out = Vec::with_capacity_in(len as usize, Global);
        for _ in 0..len {
            out.push(self.read());
        }
        out
    }
}

/// The decoded operands of one instruction, as read off a [`Cursor`].
///
/// Mirrors `decode::expr::transcode_expression`'s dispatch arm for arm,
/// since it must read back exactly what that function wrote.
pub(super) enum Operands {
    None,
    BlockType(BlockType),
    U32(u32),
    BrTable { labels: Vec<LabelIdx, Global>, default: LabelIdx },
    CallIndirect(CallIndirectOperands),
    F32(f32),
    F64(f64),
    I32(i32),
    I64(i64),
    MemArg(MemArg),
    RefType(RefType),
    SelectT(Vec<ValType, Global>),
    Bulk(BulkOpcode, BulkOperands),
}

pub(super) enum BulkOperands {
    None,
    U32(u32),
    TableCopy(TableCopyOperands),
    TableInit(TableInitOperands),
}

/// Reads one opcode and its operands off `cursor`, advancing past it.
pub(super) fn read_instruction(cursor: &mut Cursor) -> (Opcode, Operands) {
    let op: Opcode = cursor.read();
    let operands = match op {
        Opcode::Block | Opcode::If | Opcode::Loop => Operands::BlockType(cursor.read()),
        Opcode::Br
        | Opcode::BrIf
        | Opcode::Call
        | Opcode::GlobalGet
        | Opcode::GlobalSet
        | Opcode::LocalGet
        | Opcode::LocalSet
        | Opcode::LocalTee
        | Opcode::RefFunc
        | Opcode::TableGet
        | Opcode::TableSet => Operands::U32(cursor.read()),
        Opcode::BrTable => {
            let labels = cursor.read_vec::<LabelIdx>();
            let default = cursor.read();
            Operands::BrTable { labels, default }
        }
        Opcode::BulkPrefix => {
            let bulk_op: BulkOpcode = cursor.read();
            let operands = match bulk_op {
                BulkOpcode::DataDrop
                | BulkOpcode::ElemDrop
                | BulkOpcode::TableFill
                | BulkOpcode::TableGrow
                | BulkOpcode::TableSize
                | BulkOpcode::MemoryInit => BulkOperands::U32(cursor.read()),
                BulkOpcode::MemoryCopy | BulkOpcode::MemoryFill => BulkOperands::None,
                BulkOpcode::TableCopy => BulkOperands::TableCopy(cursor.read()),
                BulkOpcode::TableInit => BulkOperands::TableInit(cursor.read()),
                // Saturating truncation conversions: no operands.
                _ => BulkOperands::None,
            };
            Operands::Bulk(bulk_op, operands)
        }
        Opcode::CallIndirect => Operands::CallIndirect(cursor.read()),
        Opcode::F32Const => Operands::F32(cursor.read()),
        Opcode::F64Const => Operands::F64(cursor.read()),
        Opcode::I32Const => Operands::I32(cursor.read()),
        Opcode::I64Const => Operands::I64(cursor.read()),
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
        | Opcode::I64Store32 => Operands::MemArg(cursor.read()),
        Opcode::RefNull => Operands::RefType(cursor.read()),
        Opcode::SelectT => Operands::SelectT(cursor.read_vec::<ValType>()),
        // No bytes are transcoded for these.
        Opcode::MemoryGrow | Opcode::MemorySize => Operands::None,
        Opcode::VectorPrefix => {
            unreachable!("SIMD opcodes are rejected at decode time, never reach exec")
        }
        _ => Operands::None,
    };
    (op, operands)
}

/// Scans forward from `cursor`, assumed positioned at the first instruction
/// of a `block`/`if`/`loop` body, until (and past) the matching `end`.
/// Returns the position right after that `end`, and, if this is scanning an
/// `if` construct, the position of the first instruction of its `else`
/// branch (if any), both relative to the buffer `cursor` reads from.
///
/// Does not execute anything; only walks operand shapes to know where one
/// instruction ends and the next begins, exactly mirroring
/// `validate::expr::validate_expression`'s dispatch.
pub(super) fn scan_to_matching_end(mut cursor: Cursor) -> (usize, Option<usize>) {
    let mut depth = 0u32;
    let mut else_pos = None;
    loop {
        let (op, _operands) = read_instruction(&mut cursor);
        match op {
            Opcode::Block | Opcode::If | Opcode::Loop => depth += 1,
            Opcode::Else if depth == 0 => {
                if else_pos.is_none() {
                    else_pos = Some(cursor.pos);
                }
            }
            Opcode::End => {
                if depth == 0 {
                    return (cursor.pos, else_pos);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
}
