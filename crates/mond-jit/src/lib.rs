//! Mond baseline tier: copy-and-patch code generation.
//!
//! The offline pipeline (built once per process) lowers each bytecode
//! variant to a relocatable binary template (a stencil) whose holes
//! are numbered operand slots, runtime-helper symbols, and section
//! addresses. The runtime driver assembles a function by concatenating
//! stencils and filling the holes, then late-patches intra-function
//! branches. Property-access stencils carry an extracted IC path that
//! the runtime appends to a site's chain as it observes new shapes.

pub mod arena;
pub mod codegen;
pub mod emitter;
pub mod library;
pub mod runtime;
pub mod stencil;

use mond_vm::codeblock::BaselineStub;
use mond_vm::vm::Vm;

/// Install the baseline code generator on a VM. On hosts where the
/// generated code cannot execute (non-x86-64 or non-unix), this is a
/// no-op and the VM stays interpreter-only.
pub fn attach(vm: &mut Vm) {
    #[cfg(all(target_arch = "x86_64", unix))]
    {
        vm.tier_up = Some(tier_up_compile);
    }
    #[cfg(not(all(target_arch = "x86_64", unix)))]
    {
        let _ = vm;
    }
}

#[cfg(all(target_arch = "x86_64", unix))]
fn tier_up_compile(vm: &mut Vm, cb_idx: u32) -> Option<BaselineStub> {
    codegen::compile_code_block(vm, cb_idx).ok()
}

#[cfg(not(all(target_arch = "x86_64", unix)))]
#[allow(dead_code)]
fn tier_up_compile(_vm: &mut Vm, _cb_idx: u32) -> Option<BaselineStub> {
    None
}
