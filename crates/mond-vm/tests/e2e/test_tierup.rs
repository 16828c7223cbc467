//! Tier-up accounting on the interpreter side. (Actual baseline code
//! generation is exercised in the jit crate's tests.)

use crate::helpers::*;
use mond_bytecode::opcode::BYTES_PER_INSTRUCTION;
use mond_vm::codeblock::BestEntry;
use mond_vm::options::{TierPolicy, VmOptions};
use mond_vm::vm::Vm;

#[test]
fn test_counter_tracks_bytes_retired() {
    let module = fib_module(10.0);
    let mut vm = Vm::create(VmOptions::default());
    let results = vm.launch_script(&module).unwrap();
    assert_eq!(results[0].as_number(), Some(55.0));
    // fib ran hot: its counter retired far more bytes than one pass.
    let fib_cb = vm
        .code_blocks
        .iter()
        .find(|cb| cb.num_params == 1)
        .expect("fib code block");
    assert!(fib_cb.exec_counter > fib_cb.bytecode_len_bytes());
    // Every retired unit is a whole instruction.
    assert_eq!(fib_cb.exec_counter % BYTES_PER_INSTRUCTION, 0);
}

#[test]
fn test_threshold_is_length_times_multiplier() {
    let module = fib_module(5.0);
    let mut vm = Vm::create(VmOptions::default());
    vm.launch_script(&module).unwrap();
    for cb in &vm.code_blocks {
        assert_eq!(
            cb.tier_up_threshold,
            cb.bytecode_len_bytes() * vm.options.tier_up_multiplier
        );
    }
}

#[test]
fn test_force_interpreter_never_tiers_up() {
    let module = fib_module(12.0);
    let mut vm = Vm::create(VmOptions {
        tier_policy: TierPolicy::ForceInterpreter,
        ..VmOptions::default()
    });
    let results = vm.launch_script(&module).unwrap();
    assert_eq!(results[0].as_number(), Some(144.0));
    for cb in &vm.code_blocks {
        assert_eq!(cb.tier_up_threshold, u64::MAX);
        assert!(cb.baseline.is_none());
        assert_eq!(cb.best_entry, BestEntry::Interpreter);
    }
}

#[test]
fn test_no_hook_means_no_tier_up() {
    // Past-threshold execution without an installed generator stays on
    // the interpreter and keeps producing correct results.
    let module = fib_module(15.0);
    let mut vm = Vm::create(VmOptions::default());
    assert!(vm.tier_up.is_none());
    let results = vm.launch_script(&module).unwrap();
    assert_eq!(results[0].as_number(), Some(610.0));
    for cb in &vm.code_blocks {
        assert!(cb.baseline.is_none());
    }
}
