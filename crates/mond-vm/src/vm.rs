//! VM state and the host entry API.

use crate::builtins;
use crate::callinfo::CallInfo;
use crate::codeblock::{instantiate_module, CodeBlock, TierUpHook};
use crate::coroutine::{Coroutine, CoroutineStatus, MAIN_COROUTINE};
use crate::error::LuaError;
use crate::interp;
use crate::metamethod::MetamethodNames;
use crate::options::{TierPolicy, VmOptions, ALLOW_INTERPRETER_TIER_UP_TO_BASELINE_JIT};
use mond_bytecode::module::Module;
use mond_core::heap::{GcHeap, GcIdx, UpVal, UpValLocation};
use mond_core::string::StringId;
use mond_core::structure::StructureId;
use mond_core::table::Table;
use mond_core::value::TValue;

/// The virtual machine. Holds the heap, the string interner, every
/// instantiated code block, and the active coroutine's working state.
pub struct Vm {
    // Active coroutine working set (swapped on resume/yield).
    pub stack: Vec<TValue>,
    pub frames: Vec<CallInfo>,
    pub open_upvals: Vec<(usize, GcIdx<UpVal>)>,
    /// Index of the active coroutine.
    pub current: u32,

    pub heap: GcHeap,
    pub strings: mond_core::string::StringInterner,
    pub code_blocks: Vec<CodeBlock>,
    pub coroutines: Vec<Coroutine>,
    /// The designated globals table.
    pub globals: GcIdx<Table>,
    pub mm: MetamethodNames,
    pub options: VmOptions,

    /// Allocation-site profile: observed final named-slot counts.
    pub alloc_sites: Vec<u8>,

    /// Floors of nested run() instances (frame index whose return ends
    /// the run).
    pub run_floors: Vec<usize>,
    /// Nesting depth of run() instances (yield legality checks).
    pub run_depth: u64,
    /// Results surfaced by the floor frame's return.
    pub pending_return: Option<Vec<TValue>>,
    /// Error surfaced by baseline code (SIG_ERROR).
    pub pending_error: Option<LuaError>,

    /// Installed by the baseline code generator crate.
    pub tier_up: Option<TierUpHook>,
}

impl Vm {
    /// Initialize process state: heap, interner, root structures,
    /// globals table, metamethod names, and the core builtins.
    pub fn create(options: VmOptions) -> Self {
        let mut heap = GcHeap::new();
        let mut strings = mond_core::string::StringInterner::new();
        let globals = heap.alloc_table(0, 0);
        let mm = MetamethodNames::init(&mut strings);

        let mut vm = Vm {
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvals: Vec::new(),
            current: MAIN_COROUTINE,
            heap,
            strings,
            code_blocks: Vec::new(),
            coroutines: vec![Coroutine::main()],
            globals,
            mm,
            options,
            alloc_sites: Vec::new(),
            run_floors: Vec::new(),
            run_depth: 0,
            pending_return: None,
            pending_error: None,
            tier_up: None,
        };
        builtins::register(&mut vm);
        vm
    }

    /// Tier-up trigger value for a function of `len_bytes` bytecode
    /// bytes under the current policy.
    pub fn tier_up_threshold_for(&self, len_bytes: u64) -> u64 {
        if !ALLOW_INTERPRETER_TIER_UP_TO_BASELINE_JIT {
            return u64::MAX;
        }
        match self.options.tier_policy {
            TierPolicy::ForceInterpreter => u64::MAX,
            TierPolicy::ForceBaseline => 0,
            TierPolicy::Default => len_bytes.saturating_mul(self.options.tier_up_multiplier),
        }
    }

    /// Instantiate a module against the global environment. Returns the
    /// entry code block index.
    pub fn load_module(&mut self, module: &Module) -> u32 {
        instantiate_module(self, module)
    }

    /// Instantiate a module, install its entry function on the root
    /// coroutine, and run to completion.
    pub fn launch_script(&mut self, module: &Module) -> Result<Vec<TValue>, LuaError> {
        let entry_cb = self.load_module(module);
        let closure = self.heap.alloc_closure(entry_cb, Vec::new());
        interp::call_value(self, TValue::from_closure(closure), &[])
    }

    /// Read a named global.
    pub fn get_global_variable(&mut self, name: &str) -> TValue {
        let sid = self.strings.intern(name.as_bytes());
        self.heap
            .get_table(self.globals)
            .get_by_id(&self.heap.structures, sid)
    }

    /// Write a named global.
    pub fn set_global_variable(&mut self, name: &str, value: TValue) {
        let sid = self.strings.intern(name.as_bytes());
        self.heap.table_put_by_id(self.globals, sid, value);
    }

    /// Call a global function with arguments (test convenience).
    pub fn call_global(&mut self, name: &str, args: &[TValue]) -> Result<Vec<TValue>, LuaError> {
        let f = self.get_global_variable(name);
        interp::call_value(self, f, args)
    }

    pub fn intern(&mut self, s: &str) -> StringId {
        self.strings.intern(s.as_bytes())
    }

    pub fn string_value(&mut self, s: &str) -> TValue {
        TValue::from_string_id(self.intern(s))
    }

    /// Read string bytes out of a value (test convenience).
    pub fn value_to_str(&self, v: TValue) -> Option<&str> {
        let sid = v.as_string_id()?;
        std::str::from_utf8(self.strings.get_bytes(sid)).ok()
    }

    // ---- Upvalue plumbing ----

    /// Current value of an upvalue, wherever it lives.
    pub fn upval_value(&self, uv: GcIdx<UpVal>) -> TValue {
        match self.heap.get_upval(uv).location {
            UpValLocation::Open { coroutine, slot } => {
                if coroutine == self.current {
                    self.stack[slot]
                } else {
                    self.coroutines[coroutine as usize].stack[slot]
                }
            }
            UpValLocation::Closed(v) => v,
        }
    }

    pub fn set_upval_value(&mut self, uv: GcIdx<UpVal>, value: TValue) {
        match self.heap.get_upval(uv).location {
            UpValLocation::Open { coroutine, slot } => {
                if coroutine == self.current {
                    self.stack[slot] = value;
                } else {
                    self.coroutines[coroutine as usize].stack[slot] = value;
                }
            }
            UpValLocation::Closed(_) => {
                self.heap.get_upval_mut(uv).location = UpValLocation::Closed(value);
            }
        }
    }

    /// Find or create an open upvalue for a slot on the active
    /// coroutine's stack.
    pub fn find_or_create_open_upval(&mut self, slot: usize) -> GcIdx<UpVal> {
        for &(s, uv) in &self.open_upvals {
            if s == slot {
                return uv;
            }
        }
        let uv = self.heap.alloc_upval(UpValLocation::Open {
            coroutine: self.current,
            slot,
        });
        self.open_upvals.push((slot, uv));
        self.open_upvals.sort_by(|a, b| b.0.cmp(&a.0));
        uv
    }

    /// Close open upvalues at or above `level`, in descending slot
    /// order along the open list.
    pub fn close_upvalues(&mut self, level: usize) {
        let mut i = 0;
        while i < self.open_upvals.len() {
            let (slot, uv) = self.open_upvals[i];
            if slot >= level {
                let val = self.stack[slot];
                self.heap.get_upval_mut(uv).location = UpValLocation::Closed(val);
                self.open_upvals.remove(i);
            } else {
                i += 1;
            }
        }
    }

    // ---- GC orchestration ----

    /// Run a full collection with every coroutine stack, the globals,
    /// and all constants as roots.
    pub fn collect_garbage(&mut self) -> usize {
        let mut roots: Vec<TValue> = Vec::new();
        roots.push(TValue::from_table(self.globals));
        roots.extend(self.stack.iter().copied().filter(|v| v.is_ref()));
        for ci in &self.frames {
            if let Some(cl) = ci.closure {
                roots.push(TValue::from_closure(cl));
            }
        }
        for co in &self.coroutines {
            roots.push(co.body);
            roots.extend(co.stack.iter().copied().filter(|v| v.is_ref()));
            for ci in &co.frames {
                if let Some(cl) = ci.closure {
                    roots.push(TValue::from_closure(cl));
                }
            }
            for &(_, uv) in &co.open_upvals {
                roots.push(TValue::from_ref(mond_core::heap::REF_SUB_UPVAL, uv.0));
            }
        }
        for &(_, uv) in &self.open_upvals {
            roots.push(TValue::from_ref(mond_core::heap::REF_SUB_UPVAL, uv.0));
        }
        for cb in &self.code_blocks {
            roots.extend(cb.constants.iter().copied().filter(|v| v.is_ref()));
        }
        let freed = self.heap.collect(&roots);
        // Cached table identities may have died: flush every site.
        for cb in &mut self.code_blocks {
            for site in &mut cb.ic_sites {
                site.flush();
            }
        }
        freed
    }

    // ---- Test introspection ----

    /// Structure identity of a table value.
    pub fn table_structure(&self, v: TValue) -> Option<StructureId> {
        let idx = v.as_table_idx()?;
        Some(self.heap.get_table(idx).structure)
    }

    /// Inline named-storage capacity of a table value.
    pub fn table_inline_capacity(&self, v: TValue) -> Option<u8> {
        let idx = v.as_table_idx()?;
        Some(self.heap.get_table(idx).inline_capacity())
    }

    /// (hits, misses, entries, demoted) of the IC site at a pc.
    pub fn ic_site_stats(&self, cb: u32, pc: usize) -> Option<(u64, u64, usize, bool)> {
        let block = self.code_blocks.get(cb as usize)?;
        let site = &block.ic_sites[block.ic_site_index(pc)?];
        Some((site.hits, site.misses, site.entry_count(), site.demoted))
    }

    /// Status of a coroutine value (accounting for the active one).
    pub fn coroutine_status(&self, co: u32) -> CoroutineStatus {
        if co == self.current {
            CoroutineStatus::Running
        } else {
            self.coroutines[co as usize].status
        }
    }
}
