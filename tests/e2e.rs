// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! End-to-end tests driving hand-assembled module bytes through decode,
//! validate, instantiate, and execute.

use std::io::Cursor;
use std::rc::Rc;

use wafer_vm::core_compat::alloc::Global;
use wafer_vm::core_compat::vec::Vec as AllocVec;
use wafer_vm::decode::NoCustomSectionVisitor;
use wafer_vm::exec::{self, Trap};
use wafer_vm::instantiate;
use wafer_vm::store::{ExternVal, FuncAddr, ModuleInstance, Store, Value};
use wafer_vm::types::{FunctionType, ResultType, ValType};
use wafer_vm::Module;

fn host_functype(params: &[ValType], results: &[ValType]) -> FunctionType<Global> {
    let mut parameters = AllocVec::new_in(Global);
    parameters.extend_from_slice(params);
    let mut result_values = AllocVec::new_in(Global);
    result_values.extend_from_slice(results);
    FunctionType { parameters, results: ResultType::new(result_values) }
}

// --- LEB128 / module-byte assembly helpers -------------------------------

fn uleb(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

fn sleb(mut value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let sign_bit = byte & 0x40 != 0;
        if (value == 0 && !sign_bit) || (value == -1 && sign_bit) {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

fn name(s: &str) -> Vec<u8> {
    let mut out = uleb(s.len() as u64);
    out.extend_from_slice(s.as_bytes());
    out
}

fn vec_of(count: u32, mut body: Vec<u8>) -> Vec<u8> {
    let mut out = uleb(u64::from(count));
    out.append(&mut body);
    out
}

fn section(id: u8, body: Vec<u8>) -> Vec<u8> {
    let mut out = vec![id];
    out.extend(uleb(body.len() as u64));
    out.extend(body);
    out
}

fn module_bytes(sections: &[Vec<u8>]) -> Vec<u8> {
    let mut out = vec![0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];
    for s in sections {
        out.extend_from_slice(s);
    }
    out
}

const I32: u8 = 0x7f;

// A function type with the given parameter/result arities, all `i32`.
fn functype(params: u32, results: u32) -> Vec<u8> {
    let mut out = vec![0x60];
    out.extend(vec_of(params, vec![I32; params as usize]));
    out.extend(vec_of(results, vec![I32; results as usize]));
    out
}

// A function export named `field`, pointing at function index `idx`.
fn func_export(field: &str, idx: u32) -> Vec<u8> {
    let mut out = name(field);
    out.push(0x00);
    out.extend(uleb(u64::from(idx)));
    out
}

// Wraps a function body's instruction bytes with its zero-local-group
// prefix and the length prefix `Function::decode` checks against.
fn func_body(instrs: Vec<u8>) -> Vec<u8> {
    let mut code = vec![0x00]; // zero local-declaration groups
    code.extend(instrs);
    let mut out = uleb(code.len() as u64);
    out.extend(code);
    out
}

fn memarg(align: u32, offset: u32) -> Vec<u8> {
    let mut out = uleb(u64::from(align));
    out.extend(uleb(u64::from(offset)));
    out
}

fn limits_min_only(min: u32) -> Vec<u8> {
    let mut out = vec![0x00];
    out.extend(uleb(u64::from(min)));
    out
}

// A function import naming the type at `typeidx` in the type section.
fn func_import(module: &str, field: &str, typeidx: u32) -> Vec<u8> {
    let mut out = name(module);
    out.extend(name(field));
    out.push(0x00); // function import token
    out.extend(uleb(u64::from(typeidx)));
    out
}

// Decodes, validates, and instantiates `bytes` against a fresh store,
// handing back both: invoking an exported function or inspecting store
// state both require the store to outlive the instance.
fn instantiate_bytes(bytes: &[u8]) -> (Store, Rc<ModuleInstance>) {
    let module = Module::decode(Cursor::new(bytes), &mut NoCustomSectionVisitor {}, Global)
        .expect("module should decode");
    module.validate().expect("module should validate");
    let mut store = Store::new();
    let instance = instantiate::instantiate(Rc::new(module), &mut store, &[])
        .expect("module should instantiate");
    (store, instance)
}

fn export_func(instance: &ModuleInstance, field: &str) -> FuncAddr {
    match instance.resolve_export(field).expect("export exists") {
        ExternVal::Func(addr) => addr,
        other => panic!("export {field} is not a function: {other:?}"),
    }
}

// --- Scenario 1: identity ---------------------------------------------------

#[test]
fn identity_i32() {
    let bytes = module_bytes(&[
        section(1, vec_of(1, functype(1, 1))),
        section(3, vec_of(1, uleb(0))),
        section(7, vec_of(1, func_export("f", 0))),
        section(10, vec_of(1, func_body(vec![0x20, 0x00, 0x0b]))), // local.get 0; end
    ]);

    let (mut store, instance) = instantiate_bytes(&bytes);
    let f = export_func(&instance, "f");

    let result = exec::invoke(&mut store, f, &[Value::I32(42)]).expect("should not trap");
    assert_eq!(result, vec![Value::I32(42)]);
}

// --- Scenario 2: add, with wraparound --------------------------------------

#[test]
fn add_with_wraparound() {
    let bytes = module_bytes(&[
        section(1, vec_of(1, functype(2, 1))),
        section(3, vec_of(1, uleb(0))),
        section(7, vec_of(1, func_export("f", 0))),
        // local.get 0; local.get 1; i32.add; end
        section(10, vec_of(1, func_body(vec![0x20, 0x00, 0x20, 0x01, 0x6a, 0x0b]))),
    ]);

    let (mut store, instance) = instantiate_bytes(&bytes);
    let f = export_func(&instance, "f");

    let sum = exec::invoke(&mut store, f, &[Value::I32(3), Value::I32(4)]).unwrap();
    assert_eq!(sum, vec![Value::I32(7)]);

    let wrapped = exec::invoke(&mut store, f, &[Value::I32(i32::MIN), Value::I32(-1)]).unwrap();
    assert_eq!(wrapped, vec![Value::I32(i32::MAX)]);
}

// --- Scenario 3: signed divide traps ----------------------------------------

#[test]
fn signed_divide_traps() {
    let bytes = module_bytes(&[
        section(1, vec_of(1, functype(2, 1))),
        section(3, vec_of(1, uleb(0))),
        section(7, vec_of(1, func_export("f", 0))),
        // local.get 0; local.get 1; i32.div_s; end
        section(10, vec_of(1, func_body(vec![0x20, 0x00, 0x20, 0x01, 0x6d, 0x0b]))),
    ]);

    let (mut store, instance) = instantiate_bytes(&bytes);
    let f = export_func(&instance, "f");

    assert_eq!(
        exec::invoke(&mut store, f, &[Value::I32(10), Value::I32(0)]),
        Err(Trap::IntegerDivideByZero)
    );
    assert_eq!(
        exec::invoke(&mut store, f, &[Value::I32(i32::MIN), Value::I32(-1)]),
        Err(Trap::IntegerOverflow)
    );
}

// --- Scenario 4: memory round-trip ------------------------------------------

#[test]
fn memory_round_trip() {
    let mut instrs = vec![0x20, 0x00, 0x20, 0x01, 0x36];
    instrs.extend(memarg(2, 0)); // i32.store
    instrs.extend([0x20, 0x00, 0x28]);
    instrs.extend(memarg(2, 0)); // i32.load
    instrs.push(0x0b);

    let exports = vec_of(2, {
        let mut e = name("memory");
        e.push(0x02); // memory export
        e.extend(uleb(0));
        e.extend(func_export("store_load", 0));
        e
    });

    let bytes = module_bytes(&[
        section(1, vec_of(1, functype(2, 1))),
        section(3, vec_of(1, uleb(0))),
        section(5, vec_of(1, limits_min_only(1))),
        section(7, exports),
        section(10, vec_of(1, func_body(instrs))),
    ]);

    let (mut store, instance) = instantiate_bytes(&bytes);
    let f = export_func(&instance, "store_load");

    let roundtrip = exec::invoke(
        &mut store,
        f,
        &[Value::I32(64), Value::I32(0xdead_beefu32 as i32)],
    )
    .unwrap();
    assert_eq!(roundtrip, vec![Value::I32(0xdead_beefu32 as i32)]);

    let oob = exec::invoke(&mut store, f, &[Value::I32(70_000), Value::I32(0)]);
    assert_eq!(oob, Err(Trap::OutOfBoundsMemoryAccess));
}

// --- Scenario 5: active data segment ----------------------------------------

#[test]
fn active_data_segment_is_copied() {
    let offset_expr = {
        let mut e = vec![0x41]; // i32.const
        e.extend(sleb(16));
        e.push(0x0b); // end
        e
    };
    let data_segment = {
        let mut d = uleb(0); // ActiveNoMemIdx token
        d.extend(offset_expr);
        d.extend(vec_of(2, b"hi".to_vec()));
        d
    };

    let bytes = module_bytes(&[
        section(5, vec_of(1, limits_min_only(1))),
        section(11, vec_of(1, data_segment)),
    ]);

    let (store, instance) = instantiate_bytes(&bytes);
    let memaddr = instance.memaddrs[0];
    assert_eq!(&store.mem(memaddr).bytes[16..18], b"hi");
}

// --- Scenario 6: start function ----------------------------------------

#[test]
fn start_function_runs_before_instantiation_completes() {
    let global = {
        let mut g = vec![I32, 0x01]; // i32, mutable
        g.extend([0x41, 0x00, 0x0b]); // init: i32.const 0; end
        g
    };
    let global_export = {
        let mut e = name("g");
        e.push(0x03); // global export
        e.extend(uleb(0));
        e
    };
    // i32.const 1; global.set 0; end
    let start_body = func_body(vec![0x41, 0x01, 0x24, 0x00, 0x0b]);

    let bytes = module_bytes(&[
        section(1, vec_of(1, functype(0, 0))),
        section(3, vec_of(1, uleb(0))),
        section(6, vec_of(1, global)),
        section(7, vec_of(1, global_export)),
        section(8, uleb(0)),
        section(10, vec_of(1, start_body)),
    ]);

    let (store, instance) = instantiate_bytes(&bytes);
    let addr = match instance.resolve_export("g").unwrap() {
        ExternVal::Global(addr) => addr,
        other => panic!("export g is not a global: {other:?}"),
    };
    assert_eq!(store.global(addr).value, Value::I32(1));
}

// --- Scenario 7: structured control flow ------------------------------------

#[test]
fn structured_control_flow() {
    let mut instrs = vec![0x02, I32]; // block (result i32)
    instrs.extend([0x20, 0x00]); // local.get 0
    instrs.extend([0x41, 0x00]); // i32.const 0
    instrs.push(0x46); // i32.eq
    instrs.extend([0x0d, 0x00]); // br_if 0
    instrs.extend([0x41, 0x01]); // i32.const 1
    instrs.push(0x0f); // return
    instrs.push(0x0b); // end (block)
    instrs.extend([0x41, 0x00]); // i32.const 0
    instrs.push(0x0b); // end (function)

    let bytes = module_bytes(&[
        section(1, vec_of(1, functype(1, 1))),
        section(3, vec_of(1, uleb(0))),
        section(7, vec_of(1, func_export("f", 0))),
        section(10, vec_of(1, func_body(instrs))),
    ]);

    let (mut store, instance) = instantiate_bytes(&bytes);
    let f = export_func(&instance, "f");

    assert_eq!(exec::invoke(&mut store, f, &[Value::I32(0)]).unwrap(), vec![Value::I32(0)]);
    assert_eq!(exec::invoke(&mut store, f, &[Value::I32(5)]).unwrap(), vec![Value::I32(1)]);
}
