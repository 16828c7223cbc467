//! Metamethod dispatch: __index/__newindex chains, arithmetic,
//! comparison, __call, __concat, __len.

use crate::helpers::*;
use mond_bytecode::builder::{FunctionBuilder, ModuleBuilder};
use mond_bytecode::module::Module;
use mond_bytecode::opcode::{Instruction, OpCode};
use mond_core::value::TValue;
use mond_vm::interp;
use mond_vm::options::VmOptions;
use mond_vm::vm::Vm;

/// Emit `setmetatable(R[t], R[mt])` using scratch registers r..r+2.
fn emit_setmetatable(f: &mut FunctionBuilder, t: u8, mt: u8, r: u8) {
    f.get_global(r, "setmetatable");
    f.move_(r + 1, t);
    f.move_(r + 2, mt);
    f.call(r, 3, 1);
}

#[test]
fn test_index_metamethod_table() {
    // t = {}; mt = { __index = { x = 42 } }; t.x == 42
    let mut f = FunctionBuilder::new();
    f.new_table(0, 0); // t
    f.new_table(1, 0); // mt
    f.new_table(2, 0); // defaults
    f.load_number(3, 42.0);
    f.set_field(2, "x", 3);
    f.set_field(1, "__index", 2);
    emit_setmetatable(&mut f, 0, 1, 4);
    f.get_field(3, 0, "x");
    f.return_(3, 2);
    let (_, results) = run(&module_of(f));
    assert_num(&results, 0, 42.0);
}

#[test]
fn test_index_metamethod_function() {
    // __index = function(t, k) return 99 end
    let mut m = ModuleBuilder::new();
    let mut idx_fn = FunctionBuilder::new();
    idx_fn.params(2);
    idx_fn.load_number(2, 99.0);
    idx_fn.return_(2, 2);
    let idx_fn = m.add_function(idx_fn.finish());

    let mut main = FunctionBuilder::new();
    main.new_table(0, 0);
    main.new_table(1, 0);
    main.emit(Instruction::abx(OpCode::Closure, 2, idx_fn as u16));
    main.set_field(1, "__index", 2);
    emit_setmetatable(&mut main, 0, 1, 3);
    main.get_field(2, 0, "missing");
    main.return_(2, 2);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    assert_num(&results, 0, 99.0);
}

#[test]
fn test_index_chain_through_two_levels() {
    // t -> mt{__index = t2}, t2 -> mt2{__index = {deep = 7}}
    let mut f = FunctionBuilder::new();
    f.new_table(0, 0); // t
    f.new_table(1, 0); // t2
    f.new_table(2, 0); // deepest
    f.load_number(3, 7.0);
    f.set_field(2, "deep", 3);

    f.new_table(3, 0); // mt2 = { __index = deepest }
    f.set_field(3, "__index", 2);
    emit_setmetatable(&mut f, 1, 3, 4);

    f.new_table(3, 0); // mt = { __index = t2 }
    f.set_field(3, "__index", 1);
    emit_setmetatable(&mut f, 0, 3, 4);

    f.get_field(4, 0, "deep");
    f.return_(4, 2);
    let (_, results) = run(&module_of(f));
    assert_num(&results, 0, 7.0);
}

#[test]
fn test_missing_index_terminates_with_nil() {
    let mut f = FunctionBuilder::new();
    f.new_table(0, 0);
    f.new_table(1, 0); // mt without __index
    emit_setmetatable(&mut f, 0, 1, 2);
    f.get_field(2, 0, "nothing");
    f.return_(2, 2);
    let (_, results) = run(&module_of(f));
    assert_nil(&results, 0);
}

#[test]
fn test_indexing_primitive_is_type_error() {
    let mut f = FunctionBuilder::new();
    f.load_number(0, 5.0);
    f.get_field(1, 0, "x");
    f.return_(1, 2);
    let (_, err) = run_err(&module_of(f));
    assert_eq!(err.kind(), "TypeError");
}

#[test]
fn test_newindex_function_intercepts_absent_keys() {
    // log writes through __newindex into a side table; raw slot stays
    // empty.
    let mut m = ModuleBuilder::new();
    // function(t, k, v) side[k] = v end -- side captured as upvalue
    let mut ni = FunctionBuilder::new();
    ni.params(3);
    let up_side = ni.upvalue_from_local(1); // main's R1 (the side table)
    ni.emit(Instruction::abc(OpCode::GetUpval, 3, up_side, 0, false));
    ni.emit(Instruction::abc(OpCode::SetIndex, 3, 1, 2, false));
    ni.return_(0, 1);
    let ni = m.add_function(ni.finish());

    let mut main = FunctionBuilder::new();
    main.new_table(0, 0); // t
    main.new_table(1, 0); // side
    main.new_table(2, 0); // mt
    main.emit(Instruction::abx(OpCode::Closure, 3, ni as u16));
    main.set_field(2, "__newindex", 3);
    emit_setmetatable(&mut main, 0, 2, 4);
    main.load_number(4, 5.0);
    main.set_field(0, "x", 4); // routed through __newindex
    main.get_field(5, 0, "x"); // raw absent (mt has no __index): nil
    main.get_field(6, 1, "x"); // side.x == 5
    main.return_(5, 3);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    assert_nil(&results, 0);
    assert_num(&results, 1, 5.0);
}

#[test]
fn test_newindex_skipped_when_raw_slot_exists() {
    let mut m = ModuleBuilder::new();
    let mut ni = FunctionBuilder::new();
    ni.params(3);
    ni.return_(0, 1);
    let ni = m.add_function(ni.finish());

    let mut main = FunctionBuilder::new();
    main.new_table(0, 0);
    main.load_number(1, 1.0);
    main.set_field(0, "x", 1); // raw slot exists before the metatable
    main.new_table(2, 0);
    main.emit(Instruction::abx(OpCode::Closure, 3, ni as u16));
    main.set_field(2, "__newindex", 3);
    emit_setmetatable(&mut main, 0, 2, 4);
    main.load_number(4, 9.0);
    main.set_field(0, "x", 4); // raw non-nil: plain write
    main.get_field(5, 0, "x");
    main.return_(5, 2);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    assert_num(&results, 0, 9.0);
}

fn arith_mm_module(op: OpCode, mm_name: &str) -> Module {
    let mut m = ModuleBuilder::new();
    // metamethod returns 123
    let mut h = FunctionBuilder::new();
    h.params(2);
    h.load_number(2, 123.0);
    h.return_(2, 2);
    let h = m.add_function(h.finish());

    let mut main = FunctionBuilder::new();
    main.new_table(0, 0);
    main.new_table(1, 0);
    main.emit(Instruction::abx(OpCode::Closure, 2, h as u16));
    main.set_field(1, mm_name, 2);
    emit_setmetatable(&mut main, 0, 1, 3);
    main.load_number(1, 1.0);
    main.emit(Instruction::abc(op, 2, 0, 1, false));
    main.return_(2, 2);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    m.finish()
}

#[test]
fn test_arithmetic_metamethods() {
    for (op, name) in [
        (OpCode::Add, "__add"),
        (OpCode::Sub, "__sub"),
        (OpCode::Mul, "__mul"),
        (OpCode::Div, "__div"),
        (OpCode::Mod, "__mod"),
        (OpCode::Pow, "__pow"),
    ] {
        let (_, results) = run(&arith_mm_module(op, name));
        assert_num(&results, 0, 123.0);
    }
}

#[test]
fn test_unm_metamethod() {
    let mut m = ModuleBuilder::new();
    let mut h = FunctionBuilder::new();
    h.params(2);
    h.load_number(2, -8.0);
    h.return_(2, 2);
    let h = m.add_function(h.finish());

    let mut main = FunctionBuilder::new();
    main.new_table(0, 0);
    main.new_table(1, 0);
    main.emit(Instruction::abx(OpCode::Closure, 2, h as u16));
    main.set_field(1, "__unm", 2);
    emit_setmetatable(&mut main, 0, 1, 3);
    main.emit(Instruction::abc(OpCode::Unm, 2, 0, 0, false));
    main.return_(2, 2);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    assert_num(&results, 0, -8.0);
}

/// Build main returning the boolean of `R0 <op> R1` where both are
/// tables with `mm_name` installed returning `mm_result`.
fn compare_mm_module(op: OpCode, k: bool, mm_name: &str, mm_result: bool) -> Module {
    let mut m = ModuleBuilder::new();
    let mut h = FunctionBuilder::new();
    h.params(2);
    if mm_result {
        h.load_true(2);
    } else {
        h.load_false(2);
    }
    h.return_(2, 2);
    let h = m.add_function(h.finish());

    let mut main = FunctionBuilder::new();
    main.new_table(0, 0);
    main.new_table(1, 0);
    main.new_table(2, 0); // shared metatable
    main.emit(Instruction::abx(OpCode::Closure, 3, h as u16));
    main.set_field(2, mm_name, 3);
    emit_setmetatable(&mut main, 0, 2, 4);
    emit_setmetatable(&mut main, 1, 2, 4);
    main.emit(Instruction::abc(op, 0, 1, 0, k));
    let j = main.jmp();
    main.emit(Instruction::abc(OpCode::LFalseSkip, 3, 0, 0, false));
    let t = main.here();
    main.load_true(3);
    main.patch_jmp(j, t);
    main.return_(3, 2);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    m.finish()
}

#[test]
fn test_eq_metamethod_on_distinct_tables() {
    let (_, results) = run(&compare_mm_module(OpCode::Eq, true, "__eq", true));
    assert_bool(&results, 0, true);
    let (_, results) = run(&compare_mm_module(OpCode::Eq, true, "__eq", false));
    assert_bool(&results, 0, false);
}

#[test]
fn test_lt_metamethod() {
    let (_, results) = run(&compare_mm_module(OpCode::Lt, true, "__lt", true));
    assert_bool(&results, 0, true);
}

#[test]
fn test_le_falls_back_to_not_lt_swapped() {
    // No __le: a <= b computes not (b < a) through __lt.
    let (_, results) = run(&compare_mm_module(OpCode::Le, true, "__lt", false));
    assert_bool(&results, 0, true);
    let (_, results) = run(&compare_mm_module(OpCode::Le, true, "__lt", true));
    assert_bool(&results, 0, false);
}

#[test]
fn test_call_metamethod() {
    let mut m = ModuleBuilder::new();
    // __call(self, x) -> x * 2
    let mut h = FunctionBuilder::new();
    h.params(2);
    let k = h.number(2.0);
    h.emit(Instruction::abc(OpCode::MulK, 2, 1, k as u8, false));
    h.return_(2, 2);
    let h = m.add_function(h.finish());

    let mut main = FunctionBuilder::new();
    main.new_table(0, 0);
    main.new_table(1, 0);
    main.emit(Instruction::abx(OpCode::Closure, 2, h as u16));
    main.set_field(1, "__call", 2);
    emit_setmetatable(&mut main, 0, 1, 3);
    main.load_number(1, 21.0);
    main.call(0, 2, 2); // t(21)
    main.return_(0, 2);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    assert_num(&results, 0, 42.0);
}

#[test]
fn test_concat_metamethod() {
    let mut m = ModuleBuilder::new();
    let mut h = FunctionBuilder::new();
    h.params(2);
    h.load_string(2, "joined");
    h.return_(2, 2);
    let h = m.add_function(h.finish());

    let mut main = FunctionBuilder::new();
    main.new_table(0, 0);
    main.new_table(1, 0);
    main.emit(Instruction::abx(OpCode::Closure, 2, h as u16));
    main.set_field(1, "__concat", 2);
    emit_setmetatable(&mut main, 0, 1, 3);
    main.load_string(1, "s");
    main.emit(Instruction::abc(OpCode::Concat, 0, 2, 0, false));
    main.return_(0, 2);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (vm, results) = run(&m.finish());
    assert_str(&vm, &results, 0, "joined");
}

#[test]
fn test_len_metamethod() {
    let mut m = ModuleBuilder::new();
    let mut h = FunctionBuilder::new();
    h.params(1);
    h.load_number(1, 77.0);
    h.return_(1, 2);
    let h = m.add_function(h.finish());

    let mut main = FunctionBuilder::new();
    main.new_table(0, 0);
    main.new_table(1, 0);
    main.emit(Instruction::abx(OpCode::Closure, 2, h as u16));
    main.set_field(1, "__len", 2);
    emit_setmetatable(&mut main, 0, 1, 3);
    main.emit(Instruction::abc(OpCode::Len, 2, 0, 0, false));
    main.return_(2, 2);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    assert_num(&results, 0, 77.0);
}

#[test]
fn test_metamethod_chain_terminates_with_typed_error() {
    // __index leads to a number, which cannot be indexed further.
    let mut vm = Vm::create(VmOptions::default());
    let t = vm.heap.alloc_table(0, 0);
    let mt = vm.heap.alloc_table(0, 0);
    let idx_key = vm.intern("__index");
    vm.heap
        .table_put_by_id(mt, idx_key, TValue::from_number(5.0));
    vm.heap.table_set_metatable(t, Some(mt));
    let key = vm.string_value("k");
    let err = interp::table_index(&mut vm, TValue::from_table(t), key).unwrap_err();
    assert_eq!(err.kind(), "TypeError");
}

#[test]
fn test_metatable_replacement_changes_structure() {
    // Metatable "poisoning": replacing the metatable moves the table
    // to a different structure, so shape-keyed caches keep missing
    // instead of reading stale fast paths.
    let mut vm = Vm::create(VmOptions::default());
    let t = vm.heap.alloc_table(0, 0);
    let mt1 = vm.heap.alloc_table(0, 0);
    let mt2 = vm.heap.alloc_table(0, 0);
    let s0 = vm.heap.get_table(t).structure;
    vm.heap.table_set_metatable(t, Some(mt1));
    let s1 = vm.heap.get_table(t).structure;
    vm.heap.table_set_metatable(t, Some(mt2));
    let s2 = vm.heap.get_table(t).structure;
    assert_ne!(s0, s1);
    assert_ne!(s1, s2);
    assert!(vm.heap.structures.get(s1).may_have_metatable());
    assert!(vm.heap.structures.get(s2).may_have_metatable());
}
