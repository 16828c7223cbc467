//! Linked code blocks and the baseline-tier installation surface.

use crate::ic::{IcSite, NO_IC_SITE};
use crate::vm::Vm;
use mond_bytecode::module::{Constant, Module, UnlinkedCodeBlock, UpvalueDesc};
use mond_bytecode::opcode::{Instruction, OpCode, BYTES_PER_INSTRUCTION};
use mond_core::string::StringId;
use mond_core::value::TValue;
use std::any::Any;

/// Native entry point of a baseline-compiled function.
///
/// - `vm`: the full VM state
/// - `base`: absolute stack slot of the frame's register 0
/// - `entry`: bytecode index to start at (resolved through the code's
///   entry dispatch table)
///
/// Returns one of the `SIG_*` status codes.
pub type BaselineEntryFn = unsafe extern "C" fn(vm: *mut Vm, base: u64, entry: u64) -> i64;

/// The frame returned; results are already delivered.
pub const SIG_RETURN: i64 = 0;
/// An error is pending in `vm.pending_error`.
pub const SIG_ERROR: i64 = -1;
/// The frame was replaced by a tail call; re-enter the (new) top frame.
pub const SIG_TAILCALL: i64 = -2;

/// An installed baseline artifact. The jit crate builds these; the VM
/// only needs the entry point and the bytecode -> native map.
pub struct BaselineStub {
    pub enter: BaselineEntryFn,
    /// Native code offset of each bytecode's fast path (introspection
    /// and audit; entry dispatch goes through the code's own table).
    pub code_offsets: Vec<u32>,
    /// Owns the executable memory and per-site metadata.
    pub keepalive: Box<dyn Any>,
}

/// Hook installed by the baseline code generator. Returns None when the
/// code block cannot be compiled (the block then stays on the
/// interpreter for good).
pub type TierUpHook = fn(&mut Vm, u32) -> Option<BaselineStub>;

/// Which entry point calls to this function take.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BestEntry {
    Interpreter,
    Baseline,
}

/// A function instantiated against a global environment: bytecode,
/// linked constants, tier bookkeeping, and per-site inline caches.
pub struct CodeBlock {
    pub code: Vec<Instruction>,
    /// Constant pool with strings interned against the VM.
    pub constants: Vec<TValue>,
    pub upvalues: Vec<UpvalueDesc>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_frame_size: u8,
    pub lines: Vec<u32>,
    pub source: Option<StringId>,
    /// Code-block index of this module's function 0; Closure operands
    /// are relative to it.
    pub sibling_base: u32,
    /// Bytes of bytecode retired in this function.
    pub exec_counter: u64,
    /// Tier-up trigger: bytecode length in bytes times the multiplier.
    pub tier_up_threshold: u64,
    /// Set when a tier-up attempt failed; never retried.
    pub tier_up_failed: bool,
    pub best_entry: BestEntry,
    pub baseline: Option<BaselineStub>,
    /// Interpreter-tier IC sites.
    pub ic_sites: Vec<IcSite>,
    /// pc -> ic_sites index (NO_IC_SITE when the pc has none).
    pub ic_site_of: Vec<u32>,
    /// NewTable site ordinal -> VM allocation-site profile index.
    pub alloc_site_ids: Vec<u32>,
}

impl CodeBlock {
    /// Bytecode length in bytes (the tier-up accounting unit).
    pub fn bytecode_len_bytes(&self) -> u64 {
        self.code.len() as u64 * BYTES_PER_INSTRUCTION
    }

    pub fn line_of(&self, pc: usize) -> u32 {
        self.lines.get(pc).copied().unwrap_or(0)
    }

    /// The IC site for a pc, if that instruction owns one.
    pub fn ic_site_index(&self, pc: usize) -> Option<usize> {
        match self.ic_site_of.get(pc) {
            Some(&s) if s != NO_IC_SITE => Some(s as usize),
            _ => None,
        }
    }
}

/// Instantiate every function of a module against the VM's global
/// environment. Returns the code-block index of the module entry.
pub fn instantiate_module(vm: &mut Vm, module: &Module) -> u32 {
    let sibling_base = vm.code_blocks.len() as u32;
    for f in &module.functions {
        let cb = link_function(vm, f, sibling_base);
        vm.code_blocks.push(cb);
    }
    sibling_base + module.entry
}

fn link_function(vm: &mut Vm, f: &UnlinkedCodeBlock, sibling_base: u32) -> CodeBlock {
    let constants = f
        .constants
        .iter()
        .map(|k| match k {
            Constant::Nil => TValue::nil(),
            Constant::Bool(b) => TValue::from_bool(*b),
            Constant::Number(n) => TValue::from_number(*n),
            Constant::String(bytes) => TValue::from_string_id(vm.strings.intern(bytes)),
        })
        .collect();

    // Allocate IC sites for property-access instructions and profile
    // slots for table-allocation sites.
    let mut ic_sites = Vec::new();
    let mut ic_site_of = vec![NO_IC_SITE; f.code.len()];
    let mut alloc_site_ids = Vec::new();
    for (pc, inst) in f.code.iter().enumerate() {
        match inst.opcode() {
            OpCode::GetGlobal | OpCode::SetGlobal | OpCode::GetField | OpCode::SetField => {
                ic_site_of[pc] = ic_sites.len() as u32;
                ic_sites.push(IcSite::new());
            }
            OpCode::NewTable => {
                let ordinal = inst.c() as usize;
                if alloc_site_ids.len() <= ordinal {
                    alloc_site_ids.resize(ordinal + 1, 0);
                }
                alloc_site_ids[ordinal] = vm.alloc_sites.len() as u32;
                vm.alloc_sites.push(0);
            }
            _ => {}
        }
    }

    let len_bytes = f.code.len() as u64 * BYTES_PER_INSTRUCTION;
    let tier_up_threshold = vm.tier_up_threshold_for(len_bytes);

    CodeBlock {
        code: f.code.clone(),
        constants,
        upvalues: f.upvalues.clone(),
        num_params: f.num_params,
        is_vararg: f.is_vararg,
        max_frame_size: f.max_frame_size,
        lines: f.lines.clone(),
        source: f.source.as_ref().map(|s| vm.strings.intern(s.as_bytes())),
        sibling_base,
        exec_counter: 0,
        tier_up_threshold,
        tier_up_failed: false,
        best_entry: BestEntry::Interpreter,
        baseline: None,
        ic_sites,
        ic_site_of,
        alloc_site_ids,
    }
}
