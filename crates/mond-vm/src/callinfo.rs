//! Call frame bookkeeping.

use mond_core::heap::{Closure, GcIdx};
use mond_core::value::TValue;

/// Marker for "all results" in the wanted-results field.
pub const MULTRET: i32 = -1;

/// Set on a frame entered through pcall/xpcall. Describes where the
/// (ok, ...) tuple is reported when the frame returns or an error
/// unwinds to it.
#[derive(Clone, Debug)]
pub struct ProtectedCall {
    /// Absolute stack slot of the protected-call result window (the
    /// slot the status boolean lands in).
    pub report_base: usize,
    /// Results wanted by the pcall call site (MULTRET = all).
    pub wanted: i32,
    /// xpcall handler, run before the stack unwinds.
    pub handler: Option<TValue>,
}

/// A call frame on a coroutine's frame stack. The frame is a window on
/// the value stack: slot `func_idx` holds the callee, registers are
/// `base + i`.
#[derive(Clone, Debug)]
pub struct CallInfo {
    /// Absolute stack slot of the callee value.
    pub func_idx: usize,
    /// Absolute stack slot of register 0. `func_idx + 1` for fixed-arity
    /// frames; above the vararg section for vararg frames.
    pub base: usize,
    /// Index of the next instruction to execute.
    pub pc: usize,
    /// Index into the VM's code block table.
    pub code_block: u32,
    pub closure: Option<GcIdx<Closure>>,
    /// Results the caller expects at `func_idx` (MULTRET = all).
    pub wanted: i32,
    /// Live top of this frame (absolute), maintained by multi-value
    /// operations (open calls, VarArg).
    pub top: usize,
    /// `base + max_frame_size` at entry; the frame's reserved ceiling.
    pub stack_limit: usize,
    /// Extra arguments window for vararg functions: (start, count).
    pub vararg: Option<(usize, usize)>,
    pub protected: Option<ProtectedCall>,
}

impl CallInfo {
    pub fn new(func_idx: usize, base: usize, code_block: u32) -> Self {
        CallInfo {
            func_idx,
            base,
            pc: 0,
            code_block,
            closure: None,
            wanted: MULTRET,
            top: base,
            stack_limit: base,
            vararg: None,
            protected: None,
        }
    }
}
