//! Shared helpers: module assembly and result assertions.

use mond_bytecode::builder::{FunctionBuilder, ModuleBuilder};
use mond_bytecode::module::Module;
use mond_core::value::TValue;
use mond_vm::error::LuaError;
use mond_vm::interp;
use mond_vm::options::VmOptions;
use mond_vm::vm::Vm;

/// Wrap a single function into a module.
pub fn module_of(f: FunctionBuilder) -> Module {
    let mut m = ModuleBuilder::new();
    let idx = m.add_function(f.finish());
    m.entry(idx);
    m.finish()
}

/// Run a module to completion, panicking on error.
pub fn run(module: &Module) -> (Vm, Vec<TValue>) {
    let mut vm = Vm::create(VmOptions::default());
    let results = vm
        .launch_script(module)
        .unwrap_or_else(|e| panic!("runtime error: {e}"));
    (vm, results)
}

/// Run a module expecting an error.
pub fn run_err(module: &Module) -> (Vm, LuaError) {
    let mut vm = Vm::create(VmOptions::default());
    match vm.launch_script(module) {
        Err(e) => (vm, e),
        Ok(vals) => panic!("expected error, got {} results: {vals:?}", vals.len()),
    }
}

/// Run a module and also report the code-block index of the module's
/// function 0 (for IC-site introspection).
pub fn run_with_base(module: &Module) -> (Vm, u32, Vec<TValue>) {
    let mut vm = Vm::create(VmOptions::default());
    let entry_cb = vm.load_module(module);
    let base_cb = entry_cb - module.entry;
    let closure = vm.heap.alloc_closure(entry_cb, Vec::new());
    let results = interp::call_value(&mut vm, TValue::from_closure(closure), &[])
        .unwrap_or_else(|e| panic!("runtime error: {e}"));
    (vm, base_cb, results)
}

pub fn assert_num(results: &[TValue], idx: usize, expected: f64) {
    let val = results
        .get(idx)
        .unwrap_or_else(|| panic!("missing result[{idx}]"));
    let got = val
        .as_number()
        .unwrap_or_else(|| panic!("result[{idx}] = {val:?}, expected number {expected}"));
    assert!(
        (got - expected).abs() < 1e-9,
        "result[{idx}] = {got}, expected {expected}"
    );
}

pub fn assert_bool(results: &[TValue], idx: usize, expected: bool) {
    let val = results[idx];
    assert_eq!(
        val.as_bool(),
        Some(expected),
        "result[{idx}] = {val:?}, expected {expected}"
    );
}

pub fn assert_nil(results: &[TValue], idx: usize) {
    assert!(
        results[idx].is_nil(),
        "result[{idx}] = {:?}, expected nil",
        results[idx]
    );
}

pub fn assert_str(vm: &Vm, results: &[TValue], idx: usize, expected: &str) {
    let got = vm
        .value_to_str(results[idx])
        .unwrap_or_else(|| panic!("result[{idx}] = {:?}, expected string", results[idx]));
    assert_eq!(got, expected, "result[{idx}]");
}

/// Build the recursive fib module: `fib(n) = n < 2 and n or
/// fib(n-1)+fib(n-2)`, entry returns fib(arg).
pub fn fib_module(arg: f64) -> Module {
    use mond_bytecode::opcode::{Instruction, OpCode};

    let mut m = ModuleBuilder::new();

    let mut f = FunctionBuilder::new();
    f.params(1);
    let k2 = f.number(2.0);
    f.load_k(1, k2); // R1 = 2
    f.emit(Instruction::abc(OpCode::Lt, 0, 1, 0, true)); // n < 2 ?
    let j = f.jmp(); // taken when n < 2
    f.get_global(1, "fib");
    let k1 = f.number(1.0);
    f.emit(Instruction::abc(OpCode::SubK, 2, 0, k1 as u8, false));
    f.call(1, 2, 2); // R1 = fib(n-1)
    f.get_global(2, "fib");
    f.emit(Instruction::abc(OpCode::SubK, 3, 0, k2 as u8, false));
    f.call(2, 2, 2); // R2 = fib(n-2)
    f.emit(Instruction::abc(OpCode::Add, 1, 1, 2, false));
    f.return_(1, 2);
    let ret_n = f.here();
    f.patch_jmp(j, ret_n);
    f.return_(0, 2);
    let fib_idx = m.add_function(f.finish());

    let mut main = FunctionBuilder::new();
    main.emit(Instruction::abx(OpCode::Closure, 0, fib_idx as u16));
    main.set_global("fib", 0);
    main.get_global(0, "fib");
    main.load_number(1, arg);
    main.call(0, 2, 2);
    main.return_(0, 2);
    let main_idx = m.add_function(main.finish());
    m.entry(main_idx);
    m.finish()
}
