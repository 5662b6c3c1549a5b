// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The stack-machine interpreter.
//!
//! Each call activation gets its own locals vector and its own operand
//! stack; structured control flow (`block`/`loop`/`if`) is modeled by
//! recursing into a fresh call of [`exec_seq`] for each nested body rather
//! than by pushing label entries onto one shared stack. A nested body's own
//! `end`/`else` is always consumed by the recursive call that owns it, so
//! whichever of the two terminates the *current* `exec_seq` call always means
//! "this body completed normally" — it can never belong to a construct
//! nested inside it. Branches and `return` are threaded back out of that
//! recursion as an explicit [`ControlFlow`] signal, decremented one level
//! per enclosing block they pass through, until they reach the construct
//! (or call) they target. This uses the host's own call stack in place of an
//! explicit label/activation stack; §9 of the governing design notes this as
//! an acceptable alternate representation as long as the observable
//! semantics match.

mod numeric;
mod reader;

use std::rc::Rc;

use reader::{BulkOperands, Cursor, Operands};

use crate::core_compat::alloc::Global;
use crate::store::{FuncAddr, FunctionBody, ModuleInstance, Store, Value};
use crate::types::{
    BlockType, BulkOpcode, Expression, FunctionType, MemArg, Opcode, TableCopyOperands,
    TableInitOperands,
};
use crate::Module;

/// A fault raised by the running program itself (as opposed to a host-level
/// embedding error). Terminal for the call that raised it: nothing in this
/// crate offers a way to catch and resume from one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Trap {
    Unreachable,
    IntegerDivideByZero,
    /// Signed division overflow: `i32::MIN / -1` or `i64::MIN / -1`.
    IntegerOverflow,
    /// A `trunc` conversion (not its saturating `trunc_sat` counterpart) was
    /// given a NaN or out-of-range operand.
    InvalidConversionToInteger,
    OutOfBoundsMemoryAccess,
    OutOfBoundsTableAccess,
    /// `call_indirect` through a table slot holding the null reference. A
    /// table slot is never in some third "empty" state distinct from
    /// holding a null reference, so this also covers what the governing
    /// design separately calls out as "`call_indirect` on an empty slot".
    IndirectCallNullElement,
    IndirectCallTypeMismatch,
}

impl std::fmt::Display for Trap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Trap::Unreachable => "unreachable instruction executed",
            Trap::IntegerDivideByZero => "integer divide by zero",
            Trap::IntegerOverflow => "integer overflow",
            Trap::InvalidConversionToInteger => "invalid conversion to integer",
            Trap::OutOfBoundsMemoryAccess => "out of bounds memory access",
            Trap::OutOfBoundsTableAccess => "out of bounds table access",
            Trap::IndirectCallNullElement => "indirect call through a null element",
            Trap::IndirectCallTypeMismatch => "indirect call type mismatch",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for Trap {}

/// How control left a nested body: to branch `k` levels further out, or to
/// return from the enclosing call entirely. `Ok(None)` from [`exec_seq`]
/// (not a variant here) means the body ran off its own `end`/`else` and
/// control continues normally at the level that recursed into it.
#[derive(Clone, Copy, Debug)]
enum ControlFlow {
    Branch(u32),
    Return,
}

/// The state of one function activation: the module it was instantiated
/// from (for resolving its index spaces) and its locals.
struct Frame {
    module: Rc<ModuleInstance>,
    locals: Vec<Value>,
}

/// Invokes the function at `addr` with `args`, per the embedder-facing call
/// protocol: wasm-to-wasm and wasm-to-host calls share this one entry point.
///
/// Callers are trusted to supply `args` matching the callee's declared
/// signature in arity and value kind, exactly as the governing design treats
/// the host-function boundary (checked once at `register_host_function`
/// time, not on every call); a mismatched call is a caller bug, not a
/// recoverable runtime condition, and surfaces as an `unreachable!()` panic
/// from the operand stack bookkeeping rather than a typed error.
pub fn invoke(store: &mut Store, addr: FuncAddr, args: &[Value]) -> Result<Vec<Value>, Trap> {
    let mut stack = args.to_vec();
    call_function(store, addr, &mut stack)?;
    Ok(stack)
}

/// Pops this callee's arguments off `stack` (in declaration order, from the
/// bottom of the pushed range), runs the call, and pushes its results back
/// onto `stack` in the same order — the call protocol's "pops args in
/// reverse signature order, invokes, pushes results forward" described by
/// the governing design, restated here in terms of one shared caller stack.
fn call_function(store: &mut Store, addr: FuncAddr, stack: &mut Vec<Value>) -> Result<(), Trap> {
    let arity = store.func(addr).functype.parameters.len();
    let base = stack.len() - arity;
    let args: Vec<Value> = stack.drain(base..).collect();

    // Clone the callable out from under `store` before recursing: calling it
    // needs both this shared reference and a fresh `&mut Store`, and an `Rc`
    // clone is cheap enough that there's no reason to fight the borrow
    // checker over it.
    let body_kind = match &store.func(addr).body {
        FunctionBody::Host(callable) => BodyKind::Host(Rc::clone(callable)),
        FunctionBody::Wasm { module, index } => {
            BodyKind::Wasm(Rc::clone(module), *index)
        }
    };

    let results = match body_kind {
        BodyKind::Host(callable) => callable(store, &args)?,
        BodyKind::Wasm(module, index) => {
            let function = &module.source.codesec[index as usize];
            let functype = &module.source.typesec
                [*module.source.funcsec[index as usize] as usize];
            let mut locals = Vec::with_capacity(functype.parameters.len() + function.locals.len());
            locals.extend(args.iter().copied());
            locals.extend(function.locals.iter().copied().map(Value::from));

            let mut frame = Frame { module: Rc::clone(&module), locals };
            let mut callee_stack = Vec::new();
            let mut cursor = Cursor::new(&*function.code);
            match exec_seq(store, &mut frame, &mut callee_stack, &mut cursor)? {
                None => {}
                Some(ControlFlow::Return) => {
                    // `return` is stack-polymorphic: operands below the
                    // returned values may still be sitting on the stack.
                    trim_to(&mut callee_stack, 0, functype.results.len() as u32);
                }
                Some(ControlFlow::Branch(_)) => {
                    unreachable!("a function body cannot branch past its own end")
                }
            }
            callee_stack
        }
    };

    stack.extend(results);
    Ok(())
}

/// Evaluates a constant initializer expression: a global's `init`, or an
/// element segment's offset or (`elemkind`-less) per-element expression.
///
/// This is the interpreter restricted to the opcode subset a constant
/// expression may contain — `{i32,i64,f32,f64}.const`, `ref.null`, `ref.func`,
/// and `global.get` of an imported immutable global — reusing the same reader
/// rather than standing up a second evaluator. A validated module never
/// contains any other opcode in one of these positions, so anything else
/// reaching here indicates a validator bug, not a runtime condition to
/// report.
pub(crate) fn eval_const_expr(store: &Store, module: &ModuleInstance, expr: &Expression<Global>) -> Value {
    let mut cursor = Cursor::new(&*expr);
    let mut stack = Vec::new();
    loop {
        let (op, operands) = reader::read_instruction(&mut cursor);
        match op {
            Opcode::End => break,
            Opcode::I32Const => {
                let Operands::I32(v) = operands else { unreachable!() };
                stack.push(Value::I32(v));
            }
            Opcode::I64Const => {
                let Operands::I64(v) = operands else { unreachable!() };
                stack.push(Value::I64(v));
            }
            Opcode::F32Const => {
                let Operands::F32(v) = operands else { unreachable!() };
                stack.push(Value::F32(v));
            }
            Opcode::F64Const => {
                let Operands::F64(v) = operands else { unreachable!() };
                stack.push(Value::F64(v));
            }
            Opcode::RefNull => {
                let Operands::RefType(rt) = operands else { unreachable!() };
                stack.push(Value::null_for(rt));
            }
            Opcode::RefFunc => {
                let Operands::U32(idx) = operands else { unreachable!() };
                stack.push(Value::FuncRef(Some(module.funcaddrs[idx as usize])));
            }
            Opcode::GlobalGet => {
                let Operands::U32(idx) = operands else { unreachable!() };
                stack.push(store.global(module.globaladdrs[idx as usize]).value);
            }
            _ => unreachable!("non-constant opcode in initializer expression"),
        }
    }
    stack.pop().expect("constant expression produced no value")
}

/// Owned, store-independent stand-in for [`FunctionBody`] so the borrow on
/// `store` that produced it can end before `call_function` recurses into
/// `store` again.
enum BodyKind {
    Host(crate::store::HostFn),
    Wasm(Rc<ModuleInstance>, u32),
}

/// Runs instructions from `cursor` until the body's own `end` (or, for an
/// `if` without an `else` taken, its `else`), returning `Ok(None)`, or until
/// a `br`/`return` propagates out of it as `Ok(Some(_))`.
fn exec_seq(
    store: &mut Store,
    frame: &mut Frame,
    stack: &mut Vec<Value>,
    cursor: &mut Cursor,
) -> Result<Option<ControlFlow>, Trap> {
    loop {
        let (op, operands) = reader::read_instruction(cursor);
        match op {
            Opcode::End | Opcode::Else => return Ok(None),

            Opcode::Unreachable => return Err(Trap::Unreachable),
            Opcode::Nop => {}

            Opcode::Block => {
                let Operands::BlockType(bt) = operands else { unreachable!() };
                let (n_in, n_out) = block_arity(&frame.module.source, bt);
                let height = stack.len() - n_in as usize;
                let (end_pos, _else_pos) = reader::scan_to_matching_end(*cursor);
                match exec_seq(store, frame, stack, cursor)? {
                    None => {}
                    Some(ControlFlow::Branch(0)) => {
                        trim_to(stack, height, n_out);
                        cursor.pos = end_pos;
                    }
                    Some(ControlFlow::Branch(k)) => return Ok(Some(ControlFlow::Branch(k - 1))),
                    Some(ControlFlow::Return) => return Ok(Some(ControlFlow::Return)),
                }
            }
            Opcode::Loop => {
                let Operands::BlockType(bt) = operands else { unreachable!() };
                let (n_in, _n_out) = block_arity(&frame.module.source, bt);
                let height = stack.len() - n_in as usize;
                let body_start = cursor.pos;
                loop {
                    cursor.pos = body_start;
                    match exec_seq(store, frame, stack, cursor)? {
                        None => break,
                        Some(ControlFlow::Branch(0)) => {
                            trim_to(stack, height, n_in);
                        }
                        Some(ControlFlow::Branch(k)) => {
                            return Ok(Some(ControlFlow::Branch(k - 1)));
                        }
                        Some(ControlFlow::Return) => return Ok(Some(ControlFlow::Return)),
                    }
                }
            }
            Opcode::If => {
                let Operands::BlockType(bt) = operands else { unreachable!() };
                let (n_in, n_out) = block_arity(&frame.module.source, bt);
                let cond = stack.pop().expect("operand stack underflow").as_i32();
                let height = stack.len() - n_in as usize;
                let (end_pos, else_pos) = reader::scan_to_matching_end(*cursor);
                let taken = if cond != 0 {
                    Some(*cursor)
                } else {
                    else_pos.map(|pos| {
                        let mut c = *cursor;
                        c.pos = pos;
                        c
                    })
                };
                match taken {
                    Some(mut body) => match exec_seq(store, frame, stack, &mut body)? {
                        None => cursor.pos = end_pos,
                        Some(ControlFlow::Branch(0)) => {
                            trim_to(stack, height, n_out);
                            cursor.pos = end_pos;
                        }
                        Some(ControlFlow::Branch(k)) => {
                            return Ok(Some(ControlFlow::Branch(k - 1)));
                        }
                        Some(ControlFlow::Return) => return Ok(Some(ControlFlow::Return)),
                    },
                    None => cursor.pos = end_pos,
                }
            }
            Opcode::Br => {
                let Operands::U32(label) = operands else { unreachable!() };
                return Ok(Some(ControlFlow::Branch(label)));
            }
            Opcode::BrIf => {
                let Operands::U32(label) = operands else { unreachable!() };
                let cond = stack.pop().expect("operand stack underflow").as_i32();
                if cond != 0 {
                    return Ok(Some(ControlFlow::Branch(label)));
                }
            }
            Opcode::BrTable => {
                let Operands::BrTable { labels, default } = operands else { unreachable!() };
                let i = stack.pop().expect("operand stack underflow").as_u32() as usize;
                let target = labels.get(i).copied().unwrap_or(default);
                return Ok(Some(ControlFlow::Branch(*target)));
            }
            Opcode::Return => return Ok(Some(ControlFlow::Return)),

            Opcode::Call => {
                let Operands::U32(idx) = operands else { unreachable!() };
                let addr = frame.module.funcaddrs[idx as usize];
                call_function(store, addr, stack)?;
            }
            Opcode::CallIndirect => {
                let Operands::CallIndirect(ops) = operands else { unreachable!() };
                let tableaddr = frame.module.tableaddrs[*ops.table as usize];
                let i = stack.pop().expect("operand stack underflow").as_u32() as usize;
                let entry = {
                    let table = store.table(tableaddr);
                    *table
                        .elements
                        .get(i)
                        .ok_or(Trap::OutOfBoundsTableAccess)?
                };
                let funcaddr = entry.as_funcref().ok_or(Trap::IndirectCallNullElement)?;
                let expected = &frame.module.source.typesec[*ops.ty as usize];
                if !functypes_eq(expected, &store.func(funcaddr).functype) {
                    return Err(Trap::IndirectCallTypeMismatch);
                }
                call_function(store, funcaddr, stack)?;
            }

            Opcode::RefNull => {
                let Operands::RefType(rt) = operands else { unreachable!() };
                stack.push(Value::null_for(rt));
            }
            Opcode::RefIsNull => {
                let v = stack.pop().expect("operand stack underflow");
                stack.push(Value::I32(i32::from(v.is_null_ref())));
            }
            Opcode::RefFunc => {
                let Operands::U32(idx) = operands else { unreachable!() };
                let addr = frame.module.funcaddrs[idx as usize];
                stack.push(Value::FuncRef(Some(addr)));
            }

            Opcode::Drop => {
                stack.pop().expect("operand stack underflow");
            }
            Opcode::Select => {
                let cond = stack.pop().expect("operand stack underflow").as_i32();
                let b = stack.pop().expect("operand stack underflow");
                let a = stack.pop().expect("operand stack underflow");
                stack.push(if cond != 0 { a } else { b });
            }
            Opcode::SelectT => {
                let Operands::SelectT(_types) = operands else { unreachable!() };
                let cond = stack.pop().expect("operand stack underflow").as_i32();
                let b = stack.pop().expect("operand stack underflow");
                let a = stack.pop().expect("operand stack underflow");
                stack.push(if cond != 0 { a } else { b });
            }

            Opcode::LocalGet => {
                let Operands::U32(idx) = operands else { unreachable!() };
                stack.push(frame.locals[idx as usize]);
            }
            Opcode::LocalSet => {
                let Operands::U32(idx) = operands else { unreachable!() };
                frame.locals[idx as usize] = stack.pop().expect("operand stack underflow");
            }
            Opcode::LocalTee => {
                let Operands::U32(idx) = operands else { unreachable!() };
                let v = *stack.last().expect("operand stack underflow");
                frame.locals[idx as usize] = v;
            }
            Opcode::GlobalGet => {
                let Operands::U32(idx) = operands else { unreachable!() };
                let addr = frame.module.globaladdrs[idx as usize];
                stack.push(store.global(addr).value);
            }
            Opcode::GlobalSet => {
                let Operands::U32(idx) = operands else { unreachable!() };
                let addr = frame.module.globaladdrs[idx as usize];
                let v = stack.pop().expect("operand stack underflow");
                store.global_mut(addr).value = v;
            }

            Opcode::TableGet => {
                let Operands::U32(idx) = operands else { unreachable!() };
                let addr = frame.module.tableaddrs[idx as usize];
                let i = stack.pop().expect("operand stack underflow").as_u32() as usize;
                let v = *store
                    .table(addr)
                    .elements
                    .get(i)
                    .ok_or(Trap::OutOfBoundsTableAccess)?;
                stack.push(v);
            }
            Opcode::TableSet => {
                let Operands::U32(idx) = operands else { unreachable!() };
                let addr = frame.module.tableaddrs[idx as usize];
                let v = stack.pop().expect("operand stack underflow");
                let i = stack.pop().expect("operand stack underflow").as_u32() as usize;
                let table = store.table_mut(addr);
                if i >= table.elements.len() {
                    return Err(Trap::OutOfBoundsTableAccess);
                }
                table.elements[i] = v;
            }

            Opcode::I32Load => load(store, frame, stack, operands, 4, |b| {
                Value::I32(i32::from_le_bytes(b.try_into().unwrap()))
            })?,
            Opcode::I64Load => load(store, frame, stack, operands, 8, |b| {
                Value::I64(i64::from_le_bytes(b.try_into().unwrap()))
            })?,
            Opcode::F32Load => load(store, frame, stack, operands, 4, |b| {
                Value::F32(f32::from_le_bytes(b.try_into().unwrap()))
            })?,
            Opcode::F64Load => load(store, frame, stack, operands, 8, |b| {
                Value::F64(f64::from_le_bytes(b.try_into().unwrap()))
            })?,
            Opcode::I32Load8S => load(store, frame, stack, operands, 1, |b| {
                Value::I32(i32::from(b[0] as i8))
            })?,
            Opcode::I32Load8U => {
                load(store, frame, stack, operands, 1, |b| Value::I32(i32::from(b[0])))?;
            }
            Opcode::I32Load16S => load(store, frame, stack, operands, 2, |b| {
                Value::I32(i32::from(i16::from_le_bytes(b.try_into().unwrap())))
            })?,
            Opcode::I32Load16U => load(store, frame, stack, operands, 2, |b| {
                Value::I32(i32::from(u16::from_le_bytes(b.try_into().unwrap())))
            })?,
            Opcode::I64Load8S => load(store, frame, stack, operands, 1, |b| {
                Value::I64(i64::from(b[0] as i8))
            })?,
            Opcode::I64Load8U => {
                load(store, frame, stack, operands, 1, |b| Value::I64(i64::from(b[0])))?;
            }
            Opcode::I64Load16S => load(store, frame, stack, operands, 2, |b| {
                Value::I64(i64::from(i16::from_le_bytes(b.try_into().unwrap())))
            })?,
            Opcode::I64Load16U => load(store, frame, stack, operands, 2, |b| {
                Value::I64(i64::from(u16::from_le_bytes(b.try_into().unwrap())))
            })?,
            Opcode::I64Load32S => load(store, frame, stack, operands, 4, |b| {
                Value::I64(i64::from(i32::from_le_bytes(b.try_into().unwrap())))
            })?,
            Opcode::I64Load32U => load(store, frame, stack, operands, 4, |b| {
                Value::I64(i64::from(u32::from_le_bytes(b.try_into().unwrap())))
            })?,

            Opcode::I32Store => store_mem(store, frame, stack, operands, 4, |v, b| {
                b.copy_from_slice(&v.as_i32().to_le_bytes());
            })?,
            Opcode::I64Store => store_mem(store, frame, stack, operands, 8, |v, b| {
                b.copy_from_slice(&v.as_i64().to_le_bytes());
            })?,
            Opcode::F32Store => store_mem(store, frame, stack, operands, 4, |v, b| {
                b.copy_from_slice(&v.as_f32().to_le_bytes());
            })?,
            Opcode::F64Store => store_mem(store, frame, stack, operands, 8, |v, b| {
                b.copy_from_slice(&v.as_f64().to_le_bytes());
            })?,
            Opcode::I32Store8 => store_mem(store, frame, stack, operands, 1, |v, b| {
                b[0] = v.as_i32() as u8;
            })?,
            Opcode::I32Store16 => store_mem(store, frame, stack, operands, 2, |v, b| {
                b.copy_from_slice(&(v.as_i32() as u16).to_le_bytes());
            })?,
            Opcode::I64Store8 => store_mem(store, frame, stack, operands, 1, |v, b| {
                b[0] = v.as_i64() as u8;
            })?,
            Opcode::I64Store16 => store_mem(store, frame, stack, operands, 2, |v, b| {
                b.copy_from_slice(&(v.as_i64() as u16).to_le_bytes());
            })?,
            Opcode::I64Store32 => store_mem(store, frame, stack, operands, 4, |v, b| {
                b.copy_from_slice(&(v.as_i64() as u32).to_le_bytes());
            })?,

            Opcode::MemorySize => {
                let memaddr = frame.module.memaddrs[0];
                let pages = store.mem(memaddr).bytes.len() / crate::types::MemType::PAGE_SIZE;
                stack.push(Value::I32(pages as i32));
            }
            Opcode::MemoryGrow => {
                let memaddr = frame.module.memaddrs[0];
                let delta = stack.pop().expect("operand stack underflow").as_u32() as usize;
                let mem = store.mem_mut(memaddr);
                let old_pages = mem.bytes.len() / crate::types::MemType::PAGE_SIZE;
                let new_pages = old_pages + delta;
                let within_max = match mem.memtype.max_size_bytes() {
                    Some(max) => new_pages * crate::types::MemType::PAGE_SIZE <= max,
                    None => true,
                };
                if !within_max || new_pages > u32::MAX as usize {
                    stack.push(Value::I32(-1));
                } else {
                    mem.bytes.resize(new_pages * crate::types::MemType::PAGE_SIZE, 0);
                    stack.push(Value::I32(old_pages as i32));
                }
            }

            Opcode::BulkPrefix => {
                let Operands::Bulk(bulk_op, bulk_operands) = operands else { unreachable!() };
                exec_bulk(store, frame, stack, bulk_op, bulk_operands)?;
            }

            _ => numeric::exec(op, stack)?,
        }
    }
}

fn block_arity(module: &Module<Global>, bt: BlockType) -> (u32, u32) {
    match bt {
        BlockType::Empty => (0, 0),
        BlockType::Result(_) => (0, 1),
        BlockType::TypeIndex(idx) => {
            let ft = &module.typesec[*idx as usize];
            (ft.parameters.len() as u32, ft.results.len() as u32)
        }
    }
}

fn functypes_eq(a: &FunctionType<Global>, b: &FunctionType<Global>) -> bool {
    a.parameters.iter().eq(b.parameters.iter()) && a.results.iter().eq(b.results.iter())
}

/// Discards the stack values sitting above `height` that aren't among the
/// top `keep`, so only the branch target's expected result values survive —
/// the trimming a `br` to an enclosing construct performs on resolution.
fn trim_to(stack: &mut Vec<Value>, height: usize, keep: u32) {
    let keep = keep as usize;
    let total = height + keep;
    if stack.len() > total {
        let start = stack.len() - keep;
        stack.copy_within(start.., height);
        stack.truncate(total);
    }
}

fn mem_addr(memarg: &MemArg, base: u32, width: u32, len: usize) -> Result<usize, Trap> {
    let start = u64::from(base) + u64::from(memarg.offset);
    let end = start + u64::from(width);
    if end > len as u64 {
        return Err(Trap::OutOfBoundsMemoryAccess);
    }
    Ok(start as usize)
}

fn load(
    store: &mut Store,
    frame: &mut Frame,
    stack: &mut Vec<Value>,
    operands: Operands,
    width: u32,
    decode: impl Fn(&[u8]) -> Value,
) -> Result<(), Trap> {
    let Operands::MemArg(memarg) = operands else { unreachable!() };
    let base = stack.pop().expect("operand stack underflow").as_u32();
    let memaddr = frame.module.memaddrs[0];
    let mem = store.mem(memaddr);
    let addr = mem_addr(&memarg, base, width, mem.bytes.len())?;
    stack.push(decode(&mem.bytes[addr..addr + width as usize]));
    Ok(())
}

fn store_mem(
    store: &mut Store,
    frame: &mut Frame,
    stack: &mut Vec<Value>,
    operands: Operands,
    width: u32,
    encode: impl Fn(Value, &mut [u8]),
) -> Result<(), Trap> {
    let Operands::MemArg(memarg) = operands else { unreachable!() };
    let value = stack.pop().expect("operand stack underflow");
    let base = stack.pop().expect("operand stack underflow").as_u32();
    let memaddr = frame.module.memaddrs[0];
    let mem = store.mem_mut(memaddr);
    let addr = mem_addr(&memarg, base, width, mem.bytes.len())?;
    encode(value, &mut mem.bytes[addr..addr + width as usize]);
    Ok(())
}

fn exec_bulk(
    store: &mut Store,
    frame: &mut Frame,
    stack: &mut Vec<Value>,
    op: BulkOpcode,
    operands: BulkOperands,
) -> Result<(), Trap> {
    macro_rules! pop32 {
        () => {
            stack.pop().expect("operand stack underflow").as_u32() as usize
        };
    }

    match op {
        BulkOpcode::I32TruncSatF32S => {
            let a = stack.pop().expect("operand stack underflow").as_f32();
            stack.push(Value::I32(numeric::sat_trunc_to_i32(f64::from(a), true)));
        }
        BulkOpcode::I32TruncSatF32U => {
            let a = stack.pop().expect("operand stack underflow").as_f32();
            stack.push(Value::I32(numeric::sat_trunc_to_i32(f64::from(a), false)));
        }
        BulkOpcode::I32TruncSatF64S => {
            let a = stack.pop().expect("operand stack underflow").as_f64();
            stack.push(Value::I32(numeric::sat_trunc_to_i32(a, true)));
        }
        BulkOpcode::I32TruncSatF64U => {
            let a = stack.pop().expect("operand stack underflow").as_f64();
            stack.push(Value::I32(numeric::sat_trunc_to_i32(a, false)));
        }
        BulkOpcode::I64TruncSatF32S => {
            let a = stack.pop().expect("operand stack underflow").as_f32();
            stack.push(Value::I64(numeric::sat_trunc_to_i64(f64::from(a), true)));
        }
        BulkOpcode::I64TruncSatF32U => {
            let a = stack.pop().expect("operand stack underflow").as_f32();
            stack.push(Value::I64(numeric::sat_trunc_to_i64(f64::from(a), false)));
        }
        BulkOpcode::I64TruncSatF64S => {
            let a = stack.pop().expect("operand stack underflow").as_f64();
            stack.push(Value::I64(numeric::sat_trunc_to_i64(a, true)));
        }
        BulkOpcode::I64TruncSatF64U => {
            let a = stack.pop().expect("operand stack underflow").as_f64();
            stack.push(Value::I64(numeric::sat_trunc_to_i64(a, false)));
        }

        BulkOpcode::MemoryInit => {
            let BulkOperands::U32(dataidx) = operands else { unreachable!() };
            let n = pop32!();
            let s = pop32!();
            let d = pop32!();
            let dataaddr = frame.module.dataaddrs[dataidx as usize];
            let memaddr = frame.module.memaddrs[0];
            let chunk = {
                let data = store.data(dataaddr);
                let end = s.checked_add(n).ok_or(Trap::OutOfBoundsMemoryAccess)?;
                if end > data.bytes.len() {
                    return Err(Trap::OutOfBoundsMemoryAccess);
                }
                data.bytes[s..end].to_vec()
            };
            let mem = store.mem_mut(memaddr);
            let end = d.checked_add(chunk.len()).ok_or(Trap::OutOfBoundsMemoryAccess)?;
            if end > mem.bytes.len() {
                return Err(Trap::OutOfBoundsMemoryAccess);
            }
            mem.bytes[d..end].copy_from_slice(&chunk);
        }
        BulkOpcode::DataDrop => {
            let BulkOperands::U32(dataidx) = operands else { unreachable!() };
            let dataaddr = frame.module.dataaddrs[dataidx as usize];
            store.data_mut(dataaddr).bytes.clear();
        }
        BulkOpcode::MemoryCopy => {
            let n = pop32!();
            let s = pop32!();
            let d = pop32!();
            let memaddr = frame.module.memaddrs[0];
            let mem = store.mem_mut(memaddr);
            let s_end = s.checked_add(n).ok_or(Trap::OutOfBoundsMemoryAccess)?;
            let d_end = d.checked_add(n).ok_or(Trap::OutOfBoundsMemoryAccess)?;
            if s_end > mem.bytes.len() || d_end > mem.bytes.len() {
                return Err(Trap::OutOfBoundsMemoryAccess);
            }
            mem.bytes.copy_within(s..s_end, d);
        }
        BulkOpcode::MemoryFill => {
            let n = pop32!();
            let val = stack.pop().expect("operand stack underflow").as_i32() as u8;
            let d = pop32!();
            let memaddr = frame.module.memaddrs[0];
            let mem = store.mem_mut(memaddr);
            let end = d.checked_add(n).ok_or(Trap::OutOfBoundsMemoryAccess)?;
            if end > mem.bytes.len() {
                return Err(Trap::OutOfBoundsMemoryAccess);
            }
            mem.bytes[d..end].fill(val);
        }

        BulkOpcode::TableInit => {
            let BulkOperands::TableInit(TableInitOperands { table, elem }) = operands else {
                unreachable!()
            };
            let n = pop32!();
            let s = pop32!();
            let d = pop32!();
            let elemaddr = frame.module.elemaddrs[*elem as usize];
            let tableaddr = frame.module.tableaddrs[*table as usize];
            let chunk = {
                let elem_inst = store.elem(elemaddr);
                let end = s.checked_add(n).ok_or(Trap::OutOfBoundsTableAccess)?;
                if end > elem_inst.references.len() {
                    return Err(Trap::OutOfBoundsTableAccess);
                }
                elem_inst.references[s..end].to_vec()
            };
            let table_inst = store.table_mut(tableaddr);
            let end = d.checked_add(chunk.len()).ok_or(Trap::OutOfBoundsTableAccess)?;
            if end > table_inst.elements.len() {
                return Err(Trap::OutOfBoundsTableAccess);
            }
            table_inst.elements[d..end].copy_from_slice(&chunk);
        }
        BulkOpcode::ElemDrop => {
            let BulkOperands::U32(elemidx) = operands else { unreachable!() };
            let elemaddr = frame.module.elemaddrs[elemidx as usize];
            store.elem_mut(elemaddr).references.clear();
        }
        BulkOpcode::TableCopy => {
            let BulkOperands::TableCopy(TableCopyOperands { src, dst }) = operands else {
                unreachable!()
            };
            let n = pop32!();
            let s = pop32!();
            let d = pop32!();
            let srcaddr = frame.module.tableaddrs[*src as usize];
            let dstaddr = frame.module.tableaddrs[*dst as usize];
            let chunk = {
                let src_inst = store.table(srcaddr);
                let end = s.checked_add(n).ok_or(Trap::OutOfBoundsTableAccess)?;
                if end > src_inst.elements.len() {
                    return Err(Trap::OutOfBoundsTableAccess);
                }
                src_inst.elements[s..end].to_vec()
            };
            let dst_inst = store.table_mut(dstaddr);
            let end = d.checked_add(chunk.len()).ok_or(Trap::OutOfBoundsTableAccess)?;
            if end > dst_inst.elements.len() {
                return Err(Trap::OutOfBoundsTableAccess);
            }
            dst_inst.elements[d..end].copy_from_slice(&chunk);
        }
        BulkOpcode::TableFill => {
            let BulkOperands::U32(tableidx) = operands else { unreachable!() };
            let n = pop32!();
            let val = stack.pop().expect("operand stack underflow");
            let d = pop32!();
            let tableaddr = frame.module.tableaddrs[tableidx as usize];
            let table_inst = store.table_mut(tableaddr);
            let end = d.checked_add(n).ok_or(Trap::OutOfBoundsTableAccess)?;
            if end > table_inst.elements.len() {
                return Err(Trap::OutOfBoundsTableAccess);
            }
            table_inst.elements[d..end].fill(val);
        }
        BulkOpcode::TableGrow => {
            let BulkOperands::U32(tableidx) = operands else { unreachable!() };
            let n = pop32!();
            let val = stack.pop().expect("operand stack underflow");
            let tableaddr = frame.module.tableaddrs[tableidx as usize];
            let table_inst = store.table_mut(tableaddr);
            let old_len = table_inst.elements.len();
            let new_len = old_len + n;
            let within_max = match table_inst.tabletype.max_elements() {
                Some(max) => new_len <= max as usize,
                None => true,
            };
            if !within_max || new_len > u32::MAX as usize {
                stack.push(Value::I32(-1));
            } else {
                table_inst.elements.resize(new_len, val);
                stack.push(Value::I32(old_len as i32));
            }
        }
        BulkOpcode::TableSize => {
            let BulkOperands::U32(tableidx) = operands else { unreachable!() };
            let tableaddr = frame.module.tableaddrs[tableidx as usize];
            let len = store.table(tableaddr).elements.len();
            stack.push(Value::I32(len as i32));
        }
    }
    Ok(())
}
