// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The runtime store: a process-local, append-only heap of runtime
//! instances.
//!
//! Unlike the module model in [`crate::types`], which stays generic over
//! [`Allocator`](crate::Allocator) so that a decoded module can live in
//! whatever arena an embedder chooses, everything here is built against the
//! default global allocator. The store is the thing an embedder actually
//! runs against; it owns no borrowed module data and outlives any one
//! decoded [`Module`].

use std::collections::HashMap;
use std::rc::Rc;
use std::vec::Vec;

use crate::core_compat::alloc::Global;
use crate::exec::Trap;
use crate::types::{FunctionType, GlobalType, MemType, RefType, TableType};
use crate::Module;

/// A callable supplied by the embedder, invocable from guest code via the
/// same calling convention as a module-defined function.
///
/// A host function may read and mutate store contents (a memory's bytes, a
/// global's value) through the `&mut Store` it is handed, but has no way to
/// touch the interpreter's operand stack directly; the signature alone
/// enforces that boundary.
pub type HostFn = Rc<dyn Fn(&mut Store, &[Value]) -> Result<Vec<Value>, Trap>>;

/// A runtime value: the unit of currency on the interpreter's operand
/// stack and the contents of locals, globals, and table/element slots.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// A 128-bit vector lane, carried structurally but never produced or
    /// consumed by any instruction this interpreter executes.
    V128(u128),
    /// A nullable function reference, `None` being the null sentinel.
    FuncRef(Option<FuncAddr>),
    /// A nullable, host-opaque external reference.
    ExternRef(Option<u32>),
}

impl From<crate::types::Local> for Value {
    fn from(local: crate::types::Local) -> Self {
        use crate::types::Local;
        match local {
            Local::I32(v) => Value::I32(v),
            Local::I64(v) => Value::I64(v),
            Local::F32(v) => Value::F32(v),
            Local::F64(v) => Value::F64(v),
            Local::Vec(v) => Value::V128(v),
            // A freshly decoded Local is always in its zero/null default
            // state (see decode::decodable_impls::Local::from(ValType)); the
            // sentinel `0` always means the null reference here.
            Local::FuncRef(0) => Value::FuncRef(None),
            Local::FuncRef(_) => unreachable!("decoded locals are always null-valued"),
            Local::ExternRef(0) => Value::ExternRef(None),
            Local::ExternRef(_) => unreachable!("decoded locals are always null-valued"),
        }
    }
}

impl Value {
    /// The default value for a freshly allocated local, global, or table
    /// slot of the given type: zero, positive zero, or null, per §9's "do
    /// not leave locals or newly grown memory uninitialized" rule.
    pub(crate) fn default_for(ty: crate::types::ValType) -> Self {
        use crate::types::ValType;
        match ty {
            ValType::I32 => Value::I32(0),
            ValType::I64 => Value::I64(0),
            ValType::F32 => Value::F32(0.0),
            ValType::F64 => Value::F64(0.0),
            ValType::Vec => Value::V128(0),
            ValType::FuncRef => Value::FuncRef(None),
            ValType::ExternRef => Value::ExternRef(None),
        }
    }

    pub(crate) fn null_for(reftype: RefType) -> Self {
        match reftype {
            RefType::Func => Value::FuncRef(None),
            RefType::Extern => Value::ExternRef(None),
        }
    }

    pub(crate) fn as_i32(self) -> i32 {
        match self {
            Value::I32(v) => v,
            _ => unreachable!("ill-typed operand"),
        }
    }

    pub(crate) fn as_u32(self) -> u32 {
        self.as_i32() as u32
    }

    pub(crate) fn as_i64(self) -> i64 {
        match self {
            Value::I64(v) => v,
            _ => unreachable!("ill-typed operand"),
        }
    }

    pub(crate) fn as_u64(self) -> u64 {
        self.as_i64() as u64
    }

    pub(crate) fn as_f32(self) -> f32 {
        match self {
            Value::F32(v) => v,
            _ => unreachable!("ill-typed operand"),
        }
    }

    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Value::F64(v) => v,
            _ => unreachable!("ill-typed operand"),
        }
    }

    pub(crate) fn as_funcref(self) -> Option<FuncAddr> {
        match self {
            Value::FuncRef(v) => v,
            _ => unreachable!("ill-typed operand"),
        }
    }

    pub(crate) fn as_externref(self) -> Option<u32> {
        match self {
            Value::ExternRef(v) => v,
            _ => unreachable!("ill-typed operand"),
        }
    }

    pub(crate) fn is_null_ref(self) -> bool {
        match self {
            Value::FuncRef(v) => v.is_none(),
            Value::ExternRef(v) => v.is_none(),
            _ => unreachable!("ill-typed operand"),
        }
    }

    /// The value type of this value, used to validate host-function results
    /// and typed locals against their declared signature.
    pub fn valtype(&self) -> crate::types::ValType {
        use crate::types::ValType;
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
            Value::V128(_) => ValType::Vec,
            Value::FuncRef(_) => ValType::FuncRef,
            Value::ExternRef(_) => ValType::ExternRef,
        }
    }
}

// Stamps out a 1-based, store-stable address newtype. Mirrors the
// `newtype!` macro in `types::mod`, but these indices aren't parameterized
// over an allocator, so they don't reuse it directly.
macro_rules! addr {
    ($(#[$meta:meta])* pub struct $name:ident;) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
        pub struct $name(u32);

        impl $name {
            fn from_index(index: usize) -> Self {
                Self(u32::try_from(index + 1).expect("store exceeded u32 capacity"))
            }

            fn index(self) -> usize {
                (self.0 - 1) as usize
            }
        }
    };
}

addr!(
    /// A stable address of a function instance in the store.
    pub struct FuncAddr;
);
addr!(
    /// A stable address of a table instance in the store.
    pub struct TableAddr;
);
addr!(
    /// A stable address of a memory instance in the store.
    pub struct MemAddr;
);
addr!(
    /// A stable address of a global instance in the store.
    pub struct GlobalAddr;
);
addr!(
    /// A stable address of an element instance in the store.
    pub struct ElemAddr;
);
addr!(
    /// A stable address of a data instance in the store.
    pub struct DataAddr;
);

/// The callable body of a function instance.
pub enum FunctionBody {
    /// A guest function: its code lives in the originating module, so only
    /// the module back-reference and the function's index within it (in
    /// the module-defined, not composite, index space) are kept.
    Wasm {
        module: Rc<ModuleInstance>,
        index: u32,
    },
    /// A host-supplied callable.
    Host(HostFn),
}

/// `{functype, body}`: a function's signature plus how to invoke it.
pub struct FunctionInstance {
    pub functype: FunctionType<Global>,
    pub body: FunctionBody,
}

/// `{tabletype, elements}`: a resizeable array of reference values.
pub struct TableInstance {
    pub tabletype: TableType,
    pub elements: Vec<Value>,
}

/// `{memtype, bytes}`: a resizeable, zero-initialized byte buffer sized in
/// pages. The current size is `bytes.len() / MemType::PAGE_SIZE`; `memtype`
/// retains the original min/max declaration for `memory.grow`'s bound check.
pub struct MemoryInstance {
    pub memtype: MemType,
    pub bytes: Vec<u8>,
}

/// `{globaltype, value}`. A `const` global is written exactly once, at
/// allocation time; nothing in this crate's execution surface offers a
/// second write path for one (the decoder rejects `global.set` on an
/// immutable global ahead of time).
pub struct GlobalInstance {
    pub globaltype: GlobalType,
    pub value: Value,
}

/// `{reftype, references}`. Dropping an element segment clears `references`
/// to empty; the address itself remains valid.
pub struct ElementInstance {
    pub reftype: RefType,
    pub references: Vec<Value>,
}

/// `{bytes}`. Dropping a data segment clears `bytes` to empty; the address
/// itself remains valid.
pub struct DataInstance {
    pub bytes: Vec<u8>,
}

/// A tagged pair `(kind, address)`, used to wire imports and publish
/// exports.
#[derive(Clone, Copy, Debug)]
pub enum ExternVal {
    Func(FuncAddr),
    Table(TableAddr),
    Memory(MemAddr),
    Global(GlobalAddr),
}

/// A per-instantiation record of address vectors into the store, plus
/// published exports.
///
/// Each address vector lists addresses in the instance's local index space:
/// imported entities first (in the order they appear in the import
/// section), then module-defined ones in declaration order. `source` is
/// this instance's "types-ref": the decoded module it was built from, kept
/// alive for as long as any of its functions might still be called.
pub struct ModuleInstance {
    pub source: Rc<Module<Global>>,
    pub funcaddrs: Vec<FuncAddr>,
    pub tableaddrs: Vec<TableAddr>,
    pub memaddrs: Vec<MemAddr>,
    pub globaladdrs: Vec<GlobalAddr>,
    pub elemaddrs: Vec<ElemAddr>,
    pub dataaddrs: Vec<DataAddr>,
    pub exports: HashMap<Box<str>, ExternVal>,
}

impl ModuleInstance {
    pub fn resolve_export(&self, name: &str) -> Option<ExternVal> {
        self.exports.get(name).copied()
    }
}

/// The process-local heap of runtime instances. Append-only: once an
/// address is handed out it names the same instance for the store's
/// lifetime, even across failed instantiations (a failed instantiation
/// simply discards the partially built module instance; nothing already
/// allocated is rolled back).
#[derive(Default)]
pub struct Store {
    funcs: Vec<FunctionInstance>,
    tables: Vec<TableInstance>,
    mems: Vec<MemoryInstance>,
    globals: Vec<GlobalInstance>,
    elems: Vec<ElementInstance>,
    datas: Vec<DataInstance>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a host-supplied callable as a function instance, without
    /// requiring any module to be instantiated first. This is how a
    /// function import gets an [`ExternVal`] to hand to
    /// [`crate::instantiate::instantiate`].
    pub fn register_host_function(&mut self, functype: FunctionType<Global>, callable: HostFn) -> FuncAddr {
        self.alloc_func(FunctionInstance {
            functype,
            body: FunctionBody::Host(callable),
        })
    }

    /// The address a function allocated `offset` calls from now would
    /// receive, without actually allocating it.
    ///
    /// The instantiator's auxiliary frame needs the addresses of a module's
    /// own functions before those functions can actually be allocated
    /// (allocating a [`FunctionInstance::Wasm`]
    /// requires the very [`ModuleInstance`] whose construction this address
    /// is an input to). Since the store is append-only and single-threaded,
    /// the address is fully determined ahead of time as long as nothing else
    /// allocates a function in between; the instantiator relies on that.
    pub(crate) fn next_func_addr(&self, offset: usize) -> FuncAddr {
        FuncAddr::from_index(self.funcs.len() + offset)
    }

    pub(crate) fn alloc_func(&mut self, instance: FunctionInstance) -> FuncAddr {
        let addr = FuncAddr::from_index(self.funcs.len());
        self.funcs.push(instance);
        addr
    }

    pub(crate) fn alloc_table(&mut self, instance: TableInstance) -> TableAddr {
        let addr = TableAddr::from_index(self.tables.len());
        self.tables.push(instance);
        addr
    }

    pub(crate) fn alloc_mem(&mut self, instance: MemoryInstance) -> MemAddr {
        let addr = MemAddr::from_index(self.mems.len());
        self.mems.push(instance);
        addr
    }

    pub(crate) fn alloc_global(&mut self, instance: GlobalInstance) -> GlobalAddr {
        let addr = GlobalAddr::from_index(self.globals.len());
        self.globals.push(instance);
        addr
    }

    pub(crate) fn alloc_elem(&mut self, instance: ElementInstance) -> ElemAddr {
        let addr = ElemAddr::from_index(self.elems.len());
        self.elems.push(instance);
        addr
    }

    pub(crate) fn alloc_data(&mut self, instance: DataInstance) -> DataAddr {
        let addr = DataAddr::from_index(self.datas.len());
        self.datas.push(instance);
        addr
    }

    /// Looks up a function instance by address. Public so that a host
    /// function — an embedder-supplied `Fn(&mut Store, &[Value])`, defined
    /// outside this crate — can resolve addresses it was handed (e.g. a
    /// `funcref` read out of a table) the same way the interpreter does.
    pub fn func(&self, addr: FuncAddr) -> &FunctionInstance {
        &self.funcs[addr.index()]
    }

    pub fn table(&self, addr: TableAddr) -> &TableInstance {
        &self.tables[addr.index()]
    }

    pub fn table_mut(&mut self, addr: TableAddr) -> &mut TableInstance {
        &mut self.tables[addr.index()]
    }

    /// Looks up a memory instance by address. Public per §4.6: a host
    /// function "may read and mutate store contents (for example, a
    /// memory's bytes)"; this and [`Store::mem_mut`] are how.
    pub fn mem(&self, addr: MemAddr) -> &MemoryInstance {
        &self.mems[addr.index()]
    }

    pub fn mem_mut(&mut self, addr: MemAddr) -> &mut MemoryInstance {
        &mut self.mems[addr.index()]
    }

    pub fn global(&self, addr: GlobalAddr) -> &GlobalInstance {
        &self.globals[addr.index()]
    }

    pub fn global_mut(&mut self, addr: GlobalAddr) -> &mut GlobalInstance {
        &mut self.globals[addr.index()]
    }

    pub fn elem(&self, addr: ElemAddr) -> &ElementInstance {
        &self.elems[addr.index()]
    }

    pub(crate) fn elem_mut(&mut self, addr: ElemAddr) -> &mut ElementInstance {
        &mut self.elems[addr.index()]
    }

    pub fn data(&self, addr: DataAddr) -> &DataInstance {
        &self.datas[addr.index()]
    }

    pub(crate) fn data_mut(&mut self, addr: DataAddr) -> &mut DataInstance {
        &mut self.datas[addr.index()]
    }
}
