//! Coroutines: resume/yield value plumbing, statuses, and error
//! propagation across the coroutine boundary.

use crate::helpers::*;
use mond_bytecode::builder::{FunctionBuilder, ModuleBuilder};
use mond_bytecode::opcode::{Instruction, OpCode};

/// Emit `R[dst] = coroutine.<name>` using dst and dst+1 as scratch.
fn emit_coroutine_fn(f: &mut FunctionBuilder, dst: u8, name: &str) {
    f.get_global(dst, "coroutine");
    f.get_field(dst, dst, name);
}

#[test]
fn test_yield_and_resume_value_plumbing() {
    let mut m = ModuleBuilder::new();
    // body(a) = local b = yield(a + 1); return b * 10
    let mut body = FunctionBuilder::new();
    body.params(1);
    emit_coroutine_fn(&mut body, 1, "yield");
    let k1 = body.number(1.0);
    body.emit(Instruction::abc(OpCode::AddK, 2, 0, k1 as u8, false));
    body.call(1, 2, 2); // R1 = yield(a+1); resume value lands here
    let k10 = body.number(10.0);
    body.emit(Instruction::abc(OpCode::MulK, 1, 1, k10 as u8, false));
    body.return_(1, 2);
    let body = m.add_function(body.finish());

    let mut main = FunctionBuilder::new();
    emit_coroutine_fn(&mut main, 0, "create");
    main.emit(Instruction::abx(OpCode::Closure, 1, body as u16));
    main.call(0, 2, 2); // R0 = co
    // first resume: passes 5, receives (true, 6)
    emit_coroutine_fn(&mut main, 1, "resume");
    main.move_(2, 0);
    main.load_number(3, 5.0);
    main.call(1, 3, 3); // R1 = true, R2 = 6
    main.set_global("ok1", 1);
    main.set_global("v1", 2);
    // second resume: passes 7, body finishes with 70
    emit_coroutine_fn(&mut main, 1, "resume");
    main.move_(2, 0);
    main.load_number(3, 7.0);
    main.call(1, 3, 3);
    main.set_global("ok2", 1);
    main.set_global("v2", 2);
    // status afterwards
    emit_coroutine_fn(&mut main, 1, "status");
    main.move_(2, 0);
    main.call(1, 2, 2);
    main.return_(1, 2);
    let idx = m.add_function(main.finish());
    m.entry(idx);

    let (mut vm, results) = run(&m.finish());
    assert_str(&vm, &results, 0, "dead");
    assert_eq!(vm.get_global_variable("ok1").as_bool(), Some(true));
    assert_eq!(vm.get_global_variable("v1").as_number(), Some(6.0));
    assert_eq!(vm.get_global_variable("ok2").as_bool(), Some(true));
    assert_eq!(vm.get_global_variable("v2").as_number(), Some(70.0));
}

#[test]
fn test_coroutine_error_propagates_as_status() {
    // resume of a body calling error("oops") returns (false, msg); the
    // main program continues.
    let mut m = ModuleBuilder::new();
    let mut body = FunctionBuilder::new();
    body.get_global(0, "error");
    body.load_string(1, "oops");
    body.call(0, 2, 1);
    body.return_(0, 1);
    let body = m.add_function(body.finish());

    let mut main = FunctionBuilder::new();
    emit_coroutine_fn(&mut main, 0, "create");
    main.emit(Instruction::abx(OpCode::Closure, 1, body as u16));
    main.call(0, 2, 2);
    emit_coroutine_fn(&mut main, 1, "resume");
    main.move_(2, 0);
    main.call(1, 2, 3); // R1 = false, R2 = message
    // main continues running after the failed resume
    main.load_number(3, 1.0);
    main.return_(1, 4);
    let idx = m.add_function(main.finish());
    m.entry(idx);

    let (vm, results) = run(&m.finish());
    assert_bool(&results, 0, false);
    let msg = vm.value_to_str(results[1]).expect("error message");
    assert!(msg.ends_with("oops"), "got {msg:?}");
    assert_num(&results, 2, 1.0);
}

#[test]
fn test_resume_dead_coroutine_reports_failure() {
    let mut m = ModuleBuilder::new();
    let mut body = FunctionBuilder::new();
    body.load_number(0, 1.0);
    body.return_(0, 2);
    let body = m.add_function(body.finish());

    let mut main = FunctionBuilder::new();
    emit_coroutine_fn(&mut main, 0, "create");
    main.emit(Instruction::abx(OpCode::Closure, 1, body as u16));
    main.call(0, 2, 2);
    emit_coroutine_fn(&mut main, 1, "resume");
    main.move_(2, 0);
    main.call(1, 2, 1); // run to completion
    emit_coroutine_fn(&mut main, 1, "resume");
    main.move_(2, 0);
    main.call(1, 2, 3); // resume the dead coroutine
    main.return_(1, 3);
    let idx = m.add_function(main.finish());
    m.entry(idx);

    let (vm, results) = run(&m.finish());
    assert_bool(&results, 0, false);
    assert_str(&vm, &results, 1, "cannot resume dead coroutine");
}

#[test]
fn test_yield_from_main_is_coroutine_error() {
    let mut f = FunctionBuilder::new();
    emit_coroutine_fn(&mut f, 0, "yield");
    f.call(0, 1, 1);
    f.return_(0, 1);
    let (_, err) = run_err(&module_of(f));
    assert_eq!(err.kind(), "CoroutineError");
}

#[test]
fn test_yield_across_metamethod_boundary_is_error() {
    // A body whose __index metamethod yields: the yield crosses a
    // native (metamethod-call) boundary and must fail; resume reports
    // (false, error).
    let mut m = ModuleBuilder::new();
    // __index handler: yields
    let mut h = FunctionBuilder::new();
    h.params(2);
    emit_coroutine_fn(&mut h, 2, "yield");
    h.call(2, 1, 1);
    h.return_(0, 1);
    let h = m.add_function(h.finish());

    // body: t = setmetatable({}, {__index = h}); return t.q
    let mut body = FunctionBuilder::new();
    body.new_table(0, 0);
    body.new_table(1, 0);
    body.emit(Instruction::abx(OpCode::Closure, 2, h as u16));
    body.set_field(1, "__index", 2);
    body.get_global(2, "setmetatable");
    body.move_(3, 0);
    body.move_(4, 1);
    body.call(2, 3, 1);
    body.get_field(2, 0, "q");
    body.return_(2, 2);
    let body = m.add_function(body.finish());

    let mut main = FunctionBuilder::new();
    emit_coroutine_fn(&mut main, 0, "create");
    main.emit(Instruction::abx(OpCode::Closure, 1, body as u16));
    main.call(0, 2, 2);
    emit_coroutine_fn(&mut main, 1, "resume");
    main.move_(2, 0);
    main.call(1, 2, 3);
    main.return_(1, 3);
    let idx = m.add_function(main.finish());
    m.entry(idx);

    let (vm, results) = run(&m.finish());
    assert_bool(&results, 0, false);
    let msg = vm.value_to_str(results[1]).expect("message");
    assert!(msg.contains("boundary"), "got {msg:?}");
}

#[test]
fn test_nested_coroutines() {
    // An inner coroutine resumed from an outer coroutine's body.
    let mut m = ModuleBuilder::new();
    let mut inner = FunctionBuilder::new();
    inner.load_number(0, 11.0);
    inner.return_(0, 2);
    let inner = m.add_function(inner.finish());

    let mut outer = FunctionBuilder::new();
    emit_coroutine_fn(&mut outer, 0, "create");
    outer.emit(Instruction::abx(OpCode::Closure, 1, inner as u16));
    outer.call(0, 2, 2);
    emit_coroutine_fn(&mut outer, 1, "resume");
    outer.move_(2, 0);
    outer.call(1, 2, 3); // true, 11
    outer.return_(2, 2); // return the inner value
    let outer = m.add_function(outer.finish());

    let mut main = FunctionBuilder::new();
    emit_coroutine_fn(&mut main, 0, "create");
    main.emit(Instruction::abx(OpCode::Closure, 1, outer as u16));
    main.call(0, 2, 2);
    emit_coroutine_fn(&mut main, 1, "resume");
    main.move_(2, 0);
    main.call(1, 2, 3);
    main.return_(1, 3);
    let idx = m.add_function(main.finish());
    m.entry(idx);

    let (_, results) = run(&m.finish());
    assert_bool(&results, 0, true);
    assert_num(&results, 1, 11.0);
}

#[test]
fn test_status_of_suspended_coroutine() {
    let mut m = ModuleBuilder::new();
    let mut body = FunctionBuilder::new();
    emit_coroutine_fn(&mut body, 0, "yield");
    body.call(0, 1, 1);
    body.return_(0, 1);
    let body = m.add_function(body.finish());

    let mut main = FunctionBuilder::new();
    emit_coroutine_fn(&mut main, 0, "create");
    main.emit(Instruction::abx(OpCode::Closure, 1, body as u16));
    main.call(0, 2, 2);
    emit_coroutine_fn(&mut main, 1, "status");
    main.move_(2, 0);
    main.call(1, 2, 2); // "suspended" before first resume
    main.set_global("before", 1);
    emit_coroutine_fn(&mut main, 1, "resume");
    main.move_(2, 0);
    main.call(1, 2, 1);
    emit_coroutine_fn(&mut main, 1, "status");
    main.move_(2, 0);
    main.call(1, 2, 2); // "suspended" again (parked at the yield)
    main.return_(1, 2);
    let idx = m.add_function(main.finish());
    m.entry(idx);

    let (mut vm, results) = run(&m.finish());
    assert_str(&vm, &results, 0, "suspended");
    let before = vm.get_global_variable("before");
    assert_eq!(vm.value_to_str(before), Some("suspended"));
}
