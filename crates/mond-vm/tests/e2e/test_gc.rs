//! Stop-the-world collection: reachability through stacks, globals,
//! and upvalues.

use crate::helpers::*;
use mond_bytecode::builder::FunctionBuilder;
use mond_core::value::TValue;
use mond_vm::options::VmOptions;
use mond_vm::vm::Vm;

#[test]
fn test_unreachable_tables_are_collected() {
    let mut vm = Vm::create(VmOptions::default());
    let baseline = vm.heap.live_table_count();
    let kept = vm.heap.alloc_table(0, 0);
    for _ in 0..10 {
        vm.heap.alloc_table(0, 0);
    }
    vm.set_global_variable("kept", TValue::from_table(kept));
    vm.collect_garbage();
    assert_eq!(vm.heap.live_table_count(), baseline + 1);
    // The survivor is still usable.
    let key = vm.string_value("k");
    vm.heap
        .table_raw_set(kept, key, TValue::from_number(1.0))
        .unwrap();
    assert_eq!(vm.heap.table_raw_get(kept, key).as_number(), Some(1.0));
}

#[test]
fn test_values_reachable_through_globals_survive() {
    let mut vm = Vm::create(VmOptions::default());
    let outer = vm.heap.alloc_table(0, 0);
    let inner = vm.heap.alloc_table(0, 0);
    let key = vm.string_value("inner");
    vm.heap
        .table_raw_set(outer, key, TValue::from_table(inner))
        .unwrap();
    vm.set_global_variable("t", TValue::from_table(outer));
    let live_before = vm.heap.live_table_count();
    vm.collect_garbage();
    assert_eq!(vm.heap.live_table_count(), live_before);
    // Drop the reference; the pair becomes garbage.
    vm.set_global_variable("t", TValue::nil());
    vm.collect_garbage();
    assert_eq!(vm.heap.live_table_count(), live_before - 2);
}

#[test]
fn test_closed_upvalue_keeps_captured_table_alive() {
    use mond_bytecode::builder::ModuleBuilder;
    use mond_bytecode::opcode::{Instruction, OpCode};

    // mk() = local t = {}; t.x = 5; return function() return t.x end
    let mut m = ModuleBuilder::new();
    let mut inner = FunctionBuilder::new();
    let up = inner.upvalue_from_local(0);
    inner.emit(Instruction::abc(OpCode::GetUpval, 0, up, 0, false));
    inner.get_field(0, 0, "x");
    inner.return_(0, 2);
    let inner = m.add_function(inner.finish());

    let mut mk = FunctionBuilder::new();
    mk.new_table(0, 0);
    mk.load_number(1, 5.0);
    mk.set_field(0, "x", 1);
    mk.emit(Instruction::abx(OpCode::Closure, 1, inner as u16));
    mk.return_(1, 2);
    let mk = m.add_function(mk.finish());

    let mut main = FunctionBuilder::new();
    main.emit(Instruction::abx(OpCode::Closure, 0, mk as u16));
    main.call(0, 1, 2);
    main.set_global("counter", 0);
    main.return_(0, 1);
    let idx = m.add_function(main.finish());
    m.entry(idx);

    let (mut vm, _) = run(&m.finish());
    vm.collect_garbage();
    // The captured table survived through the closed upvalue.
    let out = vm.call_global("counter", &[]).unwrap();
    assert_eq!(out[0].as_number(), Some(5.0));
}

#[test]
fn test_allocation_pressure_triggers_collection_during_run() {
    // A loop allocating throwaway tables must not grow the heap
    // unboundedly.
    use mond_bytecode::opcode::{Instruction, OpCode};
    let mut f = FunctionBuilder::new();
    f.load_number(0, 0.0); // acc (unused tables go dead each iteration)
    f.load_number(1, 1.0);
    f.load_number(2, 20000.0);
    f.load_number(3, 1.0);
    let prep = f.emit(Instruction::asbx(OpCode::ForPrep, 1, 0));
    let body = f.new_table(5, 0);
    let looptop = f.emit(Instruction::asbx(OpCode::ForLoop, 1, 0));
    f.return_(0, 2);
    f.patch_sbx(prep, looptop);
    f.patch_sbx(looptop, body);

    let (vm, _) = run(&module_of(f));
    assert!(vm.heap.gc.cycles > 0, "collection never ran");
    assert!(
        vm.heap.live_table_count() < 1000,
        "dead tables piled up: {}",
        vm.heap.live_table_count()
    );
}
