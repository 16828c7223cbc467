//! Calling convention: multi-returns, varargs, tail calls, closures,
//! protected calls, and error propagation.

use crate::helpers::*;
use mond_bytecode::builder::{FunctionBuilder, ModuleBuilder};
use mond_bytecode::opcode::{Instruction, OpCode};
use mond_core::value::TValue;

#[test]
fn test_fib_recursion() {
    let (_, results) = run(&fib_module(10.0));
    assert_num(&results, 0, 55.0);
}

#[test]
fn test_multiple_returns_padded_with_nil() {
    let mut m = ModuleBuilder::new();
    let mut g = FunctionBuilder::new();
    g.load_number(0, 1.0);
    g.load_number(1, 2.0);
    g.return_(0, 3); // two values
    let g = m.add_function(g.finish());

    let mut main = FunctionBuilder::new();
    main.emit(Instruction::abx(OpCode::Closure, 0, g as u16));
    main.call(0, 1, 4); // want 3 results: pad with nil
    main.return_(0, 4);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    assert_num(&results, 0, 1.0);
    assert_num(&results, 1, 2.0);
    assert_nil(&results, 2);
}

#[test]
fn test_open_call_propagates_all_results() {
    // return g() forwards everything g returns.
    let mut m = ModuleBuilder::new();
    let mut g = FunctionBuilder::new();
    g.load_number(0, 1.0);
    g.load_number(1, 2.0);
    g.load_number(2, 3.0);
    g.return_(0, 4);
    let g = m.add_function(g.finish());

    let mut main = FunctionBuilder::new();
    main.emit(Instruction::abx(OpCode::Closure, 0, g as u16));
    main.call(0, 1, 0); // all results, top set
    main.return_(0, 0); // return all up to top
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    assert_eq!(results.len(), 3);
    assert_num(&results, 2, 3.0);
}

#[test]
fn test_varargs_forwarding() {
    // v(...) = return ...; main returns v(7, 8)
    let mut m = ModuleBuilder::new();
    let mut v = FunctionBuilder::new();
    v.vararg();
    v.emit(Instruction::abc(OpCode::VarArg, 0, 0, 0, false));
    v.return_(0, 0);
    let v = m.add_function(v.finish());

    let mut main = FunctionBuilder::new();
    main.emit(Instruction::abx(OpCode::Closure, 0, v as u16));
    main.load_number(1, 7.0);
    main.load_number(2, 8.0);
    main.call(0, 3, 0);
    main.return_(0, 0);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    assert_eq!(results.len(), 2);
    assert_num(&results, 0, 7.0);
    assert_num(&results, 1, 8.0);
}

#[test]
fn test_vararg_with_fixed_params() {
    // f(a, ...) = return a, (first vararg)
    let mut m = ModuleBuilder::new();
    let mut f = FunctionBuilder::new();
    f.params(1);
    f.vararg();
    f.emit(Instruction::abc(OpCode::VarArg, 1, 0, 2, false)); // one vararg
    f.return_(0, 3);
    let f = m.add_function(f.finish());

    let mut main = FunctionBuilder::new();
    main.emit(Instruction::abx(OpCode::Closure, 0, f as u16));
    main.load_number(1, 10.0);
    main.load_number(2, 20.0);
    main.load_number(3, 30.0);
    main.call(0, 4, 3);
    main.return_(0, 3);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    assert_num(&results, 0, 10.0);
    assert_num(&results, 1, 20.0);
}

#[test]
fn test_deep_tail_recursion_runs_in_bounded_frames() {
    // countdown(n): if n == 0 then return n end; return countdown(n-1)
    // 10000 iterations against a 200-frame call-depth bound.
    let mut m = ModuleBuilder::new();
    let mut f = FunctionBuilder::new();
    f.params(1);
    let k0 = f.number(0.0);
    f.emit(Instruction::abc(OpCode::EqK, 0, k0 as u8, 0, true));
    let j = f.jmp();
    f.get_global(1, "countdown");
    let k1 = f.number(1.0);
    f.emit(Instruction::abc(OpCode::SubK, 2, 0, k1 as u8, false));
    f.tail_call(1, 2);
    f.return_(1, 0);
    let done = f.here();
    f.patch_jmp(j, done);
    f.return_(0, 2);
    let f = m.add_function(f.finish());

    let mut main = FunctionBuilder::new();
    main.emit(Instruction::abx(OpCode::Closure, 0, f as u16));
    main.set_global("countdown", 0);
    main.get_global(0, "countdown");
    main.load_number(1, 10000.0);
    main.call(0, 2, 2);
    main.return_(0, 2);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    assert_num(&results, 0, 0.0);
}

#[test]
fn test_non_tail_recursion_overflows() {
    // f() = 1 + f() blows the frame bound; pcall catches it.
    let mut m = ModuleBuilder::new();
    let mut f = FunctionBuilder::new();
    f.get_global(0, "f");
    f.call(0, 1, 2);
    let k1 = f.number(1.0);
    f.emit(Instruction::abc(OpCode::AddK, 0, 0, k1 as u8, false));
    f.return_(0, 2);
    let f = m.add_function(f.finish());

    let mut main = FunctionBuilder::new();
    main.emit(Instruction::abx(OpCode::Closure, 0, f as u16));
    main.set_global("f", 0);
    main.get_global(0, "pcall");
    main.get_global(1, "f");
    main.call(0, 2, 3); // ok, err
    main.return_(0, 3);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (vm, results) = run(&m.finish());
    assert_bool(&results, 0, false);
    assert_str(&vm, &results, 1, "stack overflow");
}

#[test]
fn test_closure_upvalue_capture_and_close() {
    // counter: local n = 0; return function() n = n + 1; return n end
    let mut m = ModuleBuilder::new();
    let mut inner = FunctionBuilder::new();
    let up_n = inner.upvalue_from_local(0);
    inner.emit(Instruction::abc(OpCode::GetUpval, 0, up_n, 0, false));
    let k1 = inner.number(1.0);
    inner.emit(Instruction::abc(OpCode::AddK, 0, 0, k1 as u8, false));
    inner.emit(Instruction::abc(OpCode::SetUpval, 0, up_n, 0, false));
    inner.return_(0, 2);
    let inner = m.add_function(inner.finish());

    let mut mk = FunctionBuilder::new();
    mk.load_number(0, 0.0); // n
    mk.emit(Instruction::abx(OpCode::Closure, 1, inner as u16));
    mk.emit(Instruction::abc(OpCode::Close, 0, 0, 0, false));
    mk.return_(1, 2);
    let mk = m.add_function(mk.finish());

    let mut main = FunctionBuilder::new();
    main.emit(Instruction::abx(OpCode::Closure, 0, mk as u16));
    main.call(0, 1, 2); // counter closure in R0
    main.move_(1, 0);
    main.call(1, 1, 2); // 1
    main.move_(2, 0);
    main.call(2, 1, 2); // 2
    main.move_(3, 0);
    main.call(3, 1, 2); // 3
    main.return_(3, 2);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    assert_num(&results, 0, 3.0);
}

#[test]
fn test_two_closures_share_open_upvalue() {
    let mut m = ModuleBuilder::new();
    // bump() => n = n + 10
    let mut bump = FunctionBuilder::new();
    let up = bump.upvalue_from_local(0);
    bump.emit(Instruction::abc(OpCode::GetUpval, 0, up, 0, false));
    let k = bump.number(10.0);
    bump.emit(Instruction::abc(OpCode::AddK, 0, 0, k as u8, false));
    bump.emit(Instruction::abc(OpCode::SetUpval, 0, up, 0, false));
    bump.return_(0, 1);
    let bump = m.add_function(bump.finish());
    // get() => n
    let mut get = FunctionBuilder::new();
    let up = get.upvalue_from_local(0);
    get.emit(Instruction::abc(OpCode::GetUpval, 0, up, 0, false));
    get.return_(0, 2);
    let get = m.add_function(get.finish());

    let mut mk = FunctionBuilder::new();
    mk.load_number(0, 5.0);
    mk.emit(Instruction::abx(OpCode::Closure, 1, bump as u16));
    mk.emit(Instruction::abx(OpCode::Closure, 2, get as u16));
    mk.return_(1, 3);
    let mk = m.add_function(mk.finish());

    let mut main = FunctionBuilder::new();
    main.emit(Instruction::abx(OpCode::Closure, 0, mk as u16));
    main.call(0, 1, 3); // R0 = bump, R1 = get
    main.move_(2, 0);
    main.call(2, 1, 1);
    main.move_(2, 1);
    main.call(2, 1, 2);
    main.return_(2, 2);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    // Both closures saw the same (closed) slot: 5 + 10.
    assert_num(&results, 0, 15.0);
}

#[test]
fn test_pcall_success_tuple() {
    let mut m = ModuleBuilder::new();
    let mut f = FunctionBuilder::new();
    f.params(1);
    let k = f.number(1.0);
    f.emit(Instruction::abc(OpCode::AddK, 1, 0, k as u8, false));
    f.return_(1, 2);
    let f = m.add_function(f.finish());

    let mut main = FunctionBuilder::new();
    main.get_global(0, "pcall");
    main.emit(Instruction::abx(OpCode::Closure, 1, f as u16));
    main.load_number(2, 5.0);
    main.call(0, 3, 3); // ok, result
    main.return_(0, 3);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    assert_bool(&results, 0, true);
    assert_num(&results, 1, 6.0);
}

#[test]
fn test_pcall_catches_user_error_value() {
    // error({}) carries the table payload through pcall unchanged.
    let mut m = ModuleBuilder::new();
    let mut f = FunctionBuilder::new();
    f.get_global(0, "error");
    f.new_table(1, 0);
    f.load_number(2, 1.0);
    f.set_field(1, "tag", 2);
    f.call(0, 2, 1);
    f.return_(0, 1);
    let f = m.add_function(f.finish());

    let mut main = FunctionBuilder::new();
    main.get_global(0, "pcall");
    main.emit(Instruction::abx(OpCode::Closure, 1, f as u16));
    main.call(0, 2, 3);
    main.return_(0, 3);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (mut vm, results) = run(&m.finish());
    assert_bool(&results, 0, false);
    // The payload is the table itself, with its field intact.
    let tag_key = vm.string_value("tag");
    let tag = vm
        .heap
        .table_raw_get(results[1].as_table_idx().expect("table payload"), tag_key);
    assert_eq!(tag.as_number(), Some(1.0));
}

#[test]
fn test_error_string_gets_position_prefix() {
    let mut m = ModuleBuilder::new();
    let mut f = FunctionBuilder::new();
    f.source("err_test");
    f.line(3);
    f.get_global(0, "error");
    f.load_string(1, "boom");
    f.call(0, 2, 1);
    f.return_(0, 1);
    let f = m.add_function(f.finish());

    let mut main = FunctionBuilder::new();
    main.get_global(0, "pcall");
    main.emit(Instruction::abx(OpCode::Closure, 1, f as u16));
    main.call(0, 2, 3);
    main.return_(0, 3);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (vm, results) = run(&m.finish());
    assert_bool(&results, 0, false);
    let msg = vm.value_to_str(results[1]).expect("string error");
    assert!(msg.ends_with("boom"), "got {msg:?}");
    assert!(msg.starts_with("err_test:"), "got {msg:?}");
}

#[test]
fn test_xpcall_handler_transforms_error() {
    let mut m = ModuleBuilder::new();
    let mut f = FunctionBuilder::new();
    f.get_global(0, "error");
    f.load_string(1, "boom");
    f.call(0, 2, 1);
    f.return_(0, 1);
    let f = m.add_function(f.finish());

    // handler(msg) = "handled:" .. msg
    let mut h = FunctionBuilder::new();
    h.params(1);
    h.load_string(1, "handled:");
    h.move_(2, 0);
    h.emit(Instruction::abc(OpCode::Concat, 1, 2, 0, false));
    h.return_(1, 2);
    let h = m.add_function(h.finish());

    let mut main = FunctionBuilder::new();
    main.get_global(0, "xpcall");
    main.emit(Instruction::abx(OpCode::Closure, 1, f as u16));
    main.emit(Instruction::abx(OpCode::Closure, 2, h as u16));
    main.call(0, 3, 3);
    main.return_(0, 3);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (vm, results) = run(&m.finish());
    assert_bool(&results, 0, false);
    let msg = vm.value_to_str(results[1]).expect("string");
    assert!(msg.starts_with("handled:"), "got {msg:?}");
    assert!(msg.ends_with("boom"), "got {msg:?}");
}

#[test]
fn test_xpcall_handler_runs_before_unwind() {
    // The handler observes the erroring frame still on the stack.
    let mut m = ModuleBuilder::new();
    let mut f = FunctionBuilder::new();
    f.get_global(0, "error");
    f.load_string(1, "x");
    f.call(0, 2, 1);
    f.return_(0, 1);
    let f = m.add_function(f.finish());

    let mut h = FunctionBuilder::new();
    h.params(1);
    h.load_number(1, 1.0);
    h.return_(1, 2);
    let h = m.add_function(h.finish());

    let mut main = FunctionBuilder::new();
    main.get_global(0, "xpcall");
    main.emit(Instruction::abx(OpCode::Closure, 1, f as u16));
    main.emit(Instruction::abx(OpCode::Closure, 2, h as u16));
    main.call(0, 3, 3);
    main.return_(0, 3);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    assert_bool(&results, 0, false);
    assert_num(&results, 1, 1.0);
}

#[test]
fn test_uncaught_error_surfaces_as_status() {
    let mut f = FunctionBuilder::new();
    f.get_global(0, "error");
    f.load_string(1, "unhandled");
    f.call(0, 2, 1);
    f.return_(0, 1);
    let (_, err) = run_err(&module_of(f));
    assert_eq!(err.kind(), "UserError");
}

#[test]
fn test_call_non_function_is_type_error() {
    let mut f = FunctionBuilder::new();
    f.load_number(0, 3.0);
    f.call(0, 1, 1);
    f.return_(0, 1);
    let (_, err) = run_err(&module_of(f));
    assert_eq!(err.kind(), "TypeError");
}

#[test]
fn test_builtin_type_and_tostring() {
    let mut f = FunctionBuilder::new();
    f.get_global(0, "type");
    f.new_table(1, 0);
    f.call(0, 2, 2);
    f.get_global(1, "tostring");
    f.load_number(2, 42.0);
    f.call(1, 2, 2);
    f.return_(0, 3);
    let (vm, results) = run(&module_of(f));
    assert_str(&vm, &results, 0, "table");
    assert_str(&vm, &results, 1, "42");
}

#[test]
fn test_rawget_rawset_builtins_bypass_metamethods() {
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
    main.get_global(2, "setmetatable");
    main.move_(3, 0);
    main.move_(4, 1);
    main.call(2, 3, 1);
    // t.x through __index: 99; rawget(t, "x"): nil
    main.get_field(2, 0, "x");
    main.get_global(3, "rawget");
    main.move_(4, 0);
    main.load_string(5, "x");
    main.call(3, 3, 2);
    main.return_(2, 3);
    let idx = m.add_function(main.finish());
    m.entry(idx);
    let (_, results) = run(&m.finish());
    assert_num(&results, 0, 99.0);
    assert_nil(&results, 1);
}

#[test]
fn test_getmetatable_roundtrip() {
    let mut f = FunctionBuilder::new();
    f.new_table(0, 0);
    f.new_table(1, 0);
    f.get_global(2, "setmetatable");
    f.move_(3, 0);
    f.move_(4, 1);
    f.call(2, 3, 1);
    f.get_global(2, "getmetatable");
    f.move_(3, 0);
    f.call(2, 2, 2);
    // same table identity?
    f.emit(Instruction::abc(OpCode::Eq, 1, 2, 0, true));
    let j = f.jmp();
    f.emit(Instruction::abc(OpCode::LFalseSkip, 5, 0, 0, false));
    let t = f.here();
    f.load_true(5);
    f.patch_jmp(j, t);
    f.return_(5, 2);
    let (_, results) = run(&module_of(f));
    assert_bool(&results, 0, true);
}

#[test]
fn test_host_call_value_entry_point() {
    // The embedding API can call an engine function directly.
    let mut m = ModuleBuilder::new();
    let mut dbl = FunctionBuilder::new();
    dbl.params(1);
    let k = dbl.number(2.0);
    dbl.emit(Instruction::abc(OpCode::MulK, 1, 0, k as u8, false));
    dbl.return_(1, 2);
    let dbl = m.add_function(dbl.finish());

    let mut main = FunctionBuilder::new();
    main.emit(Instruction::abx(OpCode::Closure, 0, dbl as u16));
    main.set_global("double", 0);
    main.return_(0, 1);
    let idx = m.add_function(main.finish());
    m.entry(idx);

    let (mut vm, _) = run(&m.finish());
    let out = vm
        .call_global("double", &[TValue::from_number(21.0)])
        .unwrap();
    assert_eq!(out[0].as_number(), Some(42.0));
}
