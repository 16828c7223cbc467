//! Coroutine state. Each coroutine owns a value stack, a frame stack,
//! and an open-upvalue list; resume/yield switch the active coroutine
//! by swapping this state with the VM's working set.

use crate::callinfo::CallInfo;
use mond_core::heap::{GcIdx, UpVal};
use mond_core::value::TValue;

/// Index of the root (main) coroutine.
pub const MAIN_COROUTINE: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoroutineStatus {
    Suspended,
    Running,
    /// Resumed another coroutine and is waiting for it.
    Normal,
    Dead,
}

impl CoroutineStatus {
    pub fn name(&self) -> &'static str {
        match self {
            CoroutineStatus::Suspended => "suspended",
            CoroutineStatus::Running => "running",
            CoroutineStatus::Normal => "normal",
            CoroutineStatus::Dead => "dead",
        }
    }
}

/// Saved execution state of a coroutine. While a coroutine is the
/// active one, its stack/frames/open_upvals live on the Vm and the
/// fields here are stale.
pub struct Coroutine {
    pub stack: Vec<TValue>,
    pub frames: Vec<CallInfo>,
    /// Open upvalues into this coroutine's stack, sorted by slot.
    pub open_upvals: Vec<(usize, GcIdx<UpVal>)>,
    pub status: CoroutineStatus,
    /// The body closure, consumed on first resume.
    pub body: TValue,
    pub started: bool,
    /// Where resume arguments land when suspended at a yield:
    /// (absolute result slot, wanted count).
    pub resume_target: Option<(usize, i32)>,
    /// The run-nesting depth this coroutine was resumed at; yield is
    /// legal only from that exact depth (no native frame in between).
    pub resume_boundary: u64,
}

impl Coroutine {
    pub fn main() -> Self {
        Coroutine {
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvals: Vec::new(),
            status: CoroutineStatus::Running,
            body: TValue::nil(),
            started: true,
            resume_target: None,
            resume_boundary: 0,
        }
    }

    pub fn new(body: TValue) -> Self {
        Coroutine {
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvals: Vec::new(),
            status: CoroutineStatus::Suspended,
            body,
            started: false,
            resume_target: None,
            resume_boundary: 0,
        }
    }
}
