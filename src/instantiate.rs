// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The instantiation engine: wires host-supplied imports to a decoded
//! module's declared needs and produces a fully initialized [`ModuleInstance`]
//! ready to be invoked.
//!
//! Follows a three-phase protocol:
//!
//! 1. An auxiliary instance is built holding only the address vectors an
//!    initializer expression can legally observe — imported functions and
//!    globals, plus the (not-yet-allocated) addresses module-defined
//!    functions will receive, so that `ref.func` resolves.
//! 2. Every global initializer and element segment initializer is evaluated
//!    against that auxiliary instance, via [`exec::eval_const_expr`].
//! 3. Tables, memories, globals, elements, and datas are allocated for real,
//!    the final module instance is assembled, and active element/data
//!    segments are copied into place before an optional start invocation.
//!
//! This module does not re-validate the module it is given; a module must
//! have passed [`Module::validate`] first; every index this module
//! dereferences is one [`validate::validate_module`] already checked is
//! in-range.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::vec::Vec;

use crate::core_compat::alloc::Global;
use crate::exec::{self, Trap};
use crate::store::{
    DataInstance, ElementInstance, ExternVal, FuncAddr, FunctionBody, FunctionInstance,
    GlobalInstance, MemoryInstance, ModuleInstance, Store, TableInstance, Value,
};
use crate::types::{DataMode, ElementInit, ElementMode, ExportDescriptor, ImportDescriptor};
use crate::Module;

/// A failure to instantiate a module: either the caller's externs don't
/// match what the module declares it imports, or a trap was raised while
/// copying active segments or running the start function.
///
/// Any of these aborts instantiation and discards the partially built
/// instance, but the store itself is never rolled back — whatever was
/// already allocated stays allocated.
#[derive(Clone, Copy, Debug)]
pub enum Error {
    /// The number of externs the caller supplied doesn't match the number of
    /// entries in the module's import section.
    ImportCountMismatch { expected: usize, found: usize },
    /// The extern at this position in the import section is not of the kind
    /// (func/table/memory/global) that import declares.
    ImportKindMismatch { index: usize },
    /// The extern at this position is the right kind but its actual type
    /// (function signature, table/memory limits, global value type and
    /// mutability) doesn't match the import's declared type.
    ImportTypeMismatch { index: usize },
    /// A trap was raised while copying an active element/data segment or
    /// while running the start function.
    Trap(Trap),
}

impl From<Trap> for Error {
    fn from(trap: Trap) -> Self {
        Error::Trap(trap)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ImportCountMismatch { expected, found } => write!(
                f,
                "expected {expected} import externs; caller supplied {found}"
            ),
            Error::ImportKindMismatch { index } => {
                write!(f, "import {index} is not the kind the module declares")
            }
            Error::ImportTypeMismatch { index } => {
                write!(f, "import {index} doesn't match the module's declared type")
            }
            Error::Trap(trap) => write!(f, "{trap}"),
        }
    }
}

impl std::error::Error for Error {}

/// Instantiates `module` against `store`, wiring `externs` to its imports in
/// declaration order. On success, the returned instance's functions, tables,
/// memories, globals, elements, and datas are all live in `store`.
pub fn instantiate(
    module: Rc<Module<Global>>,
    store: &mut Store,
    externs: &[ExternVal],
) -> Result<Rc<ModuleInstance>, Error> {
    if externs.len() != module.importsec.len() {
        return Err(Error::ImportCountMismatch {
            expected: module.importsec.len(),
            found: externs.len(),
        });
    }

    let mut imported_funcaddrs = Vec::new();
    let mut imported_tableaddrs = Vec::new();
    let mut imported_memaddrs = Vec::new();
    let mut imported_globaladdrs = Vec::new();
    for (index, (import, extern_val)) in module.importsec.iter().zip(externs).enumerate() {
        match (import.descriptor, extern_val) {
            (ImportDescriptor::Function(typeidx), ExternVal::Func(addr)) => {
                let declared = &module.typesec[*typeidx as usize];
                if store.func(*addr).functype != *declared {
                    return Err(Error::ImportTypeMismatch { index });
                }
                imported_funcaddrs.push(*addr);
            }
            (ImportDescriptor::Table(declared), ExternVal::Table(addr)) => {
                let actual = store.table(*addr).tabletype;
                if actual.reftype != declared.reftype || !limits_match(actual.limits, declared.limits) {
                    return Err(Error::ImportTypeMismatch { index });
                }
                imported_tableaddrs.push(*addr);
            }
            (ImportDescriptor::Memory(declared), ExternVal::Memory(addr)) => {
                let actual = store.mem(*addr).memtype;
                if !limits_match(*actual, *declared) {
                    return Err(Error::ImportTypeMismatch { index });
                }
                imported_memaddrs.push(*addr);
            }
            (ImportDescriptor::Global(declared), ExternVal::Global(addr)) => {
                if store.global(*addr).globaltype != declared {
                    return Err(Error::ImportTypeMismatch { index });
                }
                imported_globaladdrs.push(*addr);
            }
            _ => return Err(Error::ImportKindMismatch { index }),
        }
    }

    // Phase 1: every module-defined function's eventual address is
    // predictable ahead of actually allocating it (the store is append-only
    // and nothing else touches `store`'s function vector between here and
    // where phase 3 allocates them for real).
    let funcaddrs: Vec<FuncAddr> = imported_funcaddrs
        .iter()
        .copied()
        .chain((0..module.codesec.len()).map(|i| store.next_func_addr(i)))
        .collect();

    let aux = Rc::new(ModuleInstance {
        source: Rc::clone(&module),
        funcaddrs: funcaddrs.clone(),
        tableaddrs: Vec::new(),
        memaddrs: Vec::new(),
        globaladdrs: imported_globaladdrs.clone(),
        elemaddrs: Vec::new(),
        dataaddrs: Vec::new(),
        exports: HashMap::new(),
    });

    // Phase 2: evaluate every global's initializer and every element
    // segment's offset/init expressions against the auxiliary instance.
    let global_values: Vec<Value> = module
        .globalsec
        .iter()
        .map(|global| exec::eval_const_expr(store, &aux, &global.init))
        .collect();

    let elem_refs: Vec<Vec<Value>> = module
        .elemsec
        .iter()
        .map(|segment| match &segment.init {
            ElementInit::FunctionIndices(indices) => indices
                .iter()
                .map(|idx| Value::FuncRef(Some(aux.funcaddrs[**idx as usize])))
                .collect(),
            ElementInit::Expressions(exprs) => exprs
                .iter()
                .map(|expr| exec::eval_const_expr(store, &aux, expr))
                .collect(),
        })
        .collect();

    let elem_offsets: Vec<Option<i32>> = module
        .elemsec
        .iter()
        .map(|segment| match &segment.mode {
            ElementMode::Active(active) => {
                Some(exec::eval_const_expr(store, &aux, &active.offset).as_i32())
            }
            ElementMode::Passive | ElementMode::Declarative => None,
        })
        .collect();

    let data_offsets: Vec<Option<i32>> = module
        .datasec
        .iter()
        .map(|segment| match &segment.mode {
            DataMode::Active(active) => {
                Some(exec::eval_const_expr(store, &aux, &active.offset).as_i32())
            }
            DataMode::Passive() => None,
        })
        .collect();

    // Phase 3: allocate everything for real.
    let mut tableaddrs = imported_tableaddrs;
    for tabletype in module.tablesec.iter() {
        let elements = std::vec![Value::null_for(tabletype.reftype); tabletype.limits.min as usize];
        tableaddrs.push(store.alloc_table(TableInstance { tabletype: *tabletype, elements }));
    }

    let mut memaddrs = imported_memaddrs;
    for memtype in module.memsec.iter() {
        let bytes = std::vec![0u8; memtype.min_size_bytes()];
        memaddrs.push(store.alloc_mem(MemoryInstance { memtype: *memtype, bytes }));
    }

    let mut globaladdrs = imported_globaladdrs;
    for (global, value) in module.globalsec.iter().zip(global_values) {
        globaladdrs.push(store.alloc_global(GlobalInstance { globaltype: global.ty, value }));
    }

    let mut elemaddrs = Vec::new();
    for (segment, references) in module.elemsec.iter().zip(elem_refs) {
        elemaddrs.push(store.alloc_elem(ElementInstance { reftype: segment.ty, references }));
    }

    let mut dataaddrs = Vec::new();
    for segment in module.datasec.iter() {
        let bytes = segment.init.iter().copied().collect();
        dataaddrs.push(store.alloc_data(DataInstance { bytes }));
    }

    let mut exports = HashMap::new();
    for export in module.exportsec.iter() {
        let extern_val = match export.descriptor {
            ExportDescriptor::Function(idx) => ExternVal::Func(funcaddrs[*idx as usize]),
            ExportDescriptor::Table(idx) => ExternVal::Table(tableaddrs[*idx as usize]),
            ExportDescriptor::Memory(idx) => ExternVal::Memory(memaddrs[*idx as usize]),
            ExportDescriptor::Global(idx) => ExternVal::Global(globaladdrs[*idx as usize]),
        };
        let name: &str = &*export.field;
        exports.insert(name.to_string().into_boxed_str(), extern_val);
    }

    let instance = Rc::new(ModuleInstance {
        source: Rc::clone(&module),
        funcaddrs: funcaddrs.clone(),
        tableaddrs,
        memaddrs,
        globaladdrs,
        elemaddrs: elemaddrs.clone(),
        dataaddrs: dataaddrs.clone(),
        exports,
    });

    // Now that the instance those functions will back-reference exists,
    // allocate them — in the exact order phase 1 predicted their addresses
    // in, so `funcaddrs`'s tail matches reality.
    for index in 0..module.codesec.len() {
        let functype = module.typesec[*module.funcsec[index] as usize].clone();
        let addr = store.alloc_func(FunctionInstance {
            functype,
            body: FunctionBody::Wasm { module: Rc::clone(&instance), index: index as u32 },
        });
        debug_assert_eq!(addr, instance.funcaddrs[imported_funcaddrs_len(&instance) + index]);
    }

    // Active element segments: copy into their table, then drop. Declarative
    // segments are dropped immediately without ever being copied anywhere.
    for (i, segment) in module.elemsec.iter().enumerate() {
        match &segment.mode {
            ElementMode::Active(active) => {
                let offset = elem_offsets[i].expect("active segment has an offset") as u32 as usize;
                copy_elem_into_table(store, &instance, *active.table, elemaddrs[i], offset)?;
                store.elem_mut(elemaddrs[i]).references.clear();
            }
            ElementMode::Declarative => {
                store.elem_mut(elemaddrs[i]).references.clear();
            }
            ElementMode::Passive => {}
        }
    }

    // Active data segments: copy into memory, then drop.
    for (i, segment) in module.datasec.iter().enumerate() {
        if let DataMode::Active(active) = &segment.mode {
            let offset = data_offsets[i].expect("active segment has an offset") as u32 as usize;
            copy_data_into_memory(store, &instance, *active.memory, dataaddrs[i], offset)?;
            store.data_mut(dataaddrs[i]).bytes.clear();
        }
    }

    if let Some(start) = &module.startsec {
        let addr = instance.funcaddrs[**start as usize];
        exec::invoke(store, addr, &[])?;
    }

    Ok(instance)
}

// Whether a table/memory with `actual` limits satisfies an import declaring
// `declared` limits: the actual minimum must be at least as large, and if the
// import demands a maximum, the actual must have one no larger.
fn limits_match(actual: crate::types::Limits, declared: crate::types::Limits) -> bool {
    actual.min >= declared.min
        && match declared.max {
            None => true,
            Some(declared_max) => actual.max.is_some_and(|actual_max| actual_max <= declared_max),
        }
}

fn imported_funcaddrs_len(instance: &ModuleInstance) -> usize {
    instance.funcaddrs.len() - instance.source.codesec.len()
}

/// Copies an element segment's (already evaluated) references into `table`
/// at `offset`, the active-segment-copy step of phase 3's synthesized
/// `table.init`/`elem.drop` program, performed directly rather than by
/// assembling and re-interpreting bytecode for it.
fn copy_elem_into_table(
    store: &mut Store,
    instance: &ModuleInstance,
    tableidx: u32,
    elemaddr: crate::store::ElemAddr,
    offset: usize,
) -> Result<(), Trap> {
    let tableaddr = instance.tableaddrs[tableidx as usize];
    let references = store.elem(elemaddr).references.clone();
    let table = store.table_mut(tableaddr);
    let end = offset
        .checked_add(references.len())
        .ok_or(Trap::OutOfBoundsTableAccess)?;
    if end > table.elements.len() {
        return Err(Trap::OutOfBoundsTableAccess);
    }
    table.elements[offset..end].copy_from_slice(&references);
    Ok(())
}

/// The data-segment counterpart of [`copy_elem_into_table`]: phase 3's
/// `memory.init`/`data.drop` program.
fn copy_data_into_memory(
    store: &mut Store,
    instance: &ModuleInstance,
    memidx: u32,
    dataaddr: crate::store::DataAddr,
    offset: usize,
) -> Result<(), Trap> {
    let memaddr = instance.memaddrs[memidx as usize];
    let bytes = store.data(dataaddr).bytes.clone();
    let mem = store.mem_mut(memaddr);
    let end = offset.checked_add(bytes.len()).ok_or(Trap::OutOfBoundsMemoryAccess)?;
    if end > mem.bytes.len() {
        return Err(Trap::OutOfBoundsMemoryAccess);
    }
    mem.bytes[offset..end].copy_from_slice(&bytes);
    Ok(())
}
