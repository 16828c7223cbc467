//! Arena heap with typed indices, object headers, and mark-sweep GC.

use crate::string::StringInterner;
use crate::structure::{optimal_inline_capacity, StructureRegistry};
use crate::table::Table;
use crate::value::TValue;
use std::marker::PhantomData;

/// A typed index into an arena in the GcHeap.
#[derive(Debug)]
pub struct GcIdx<T>(pub u32, pub PhantomData<T>);

impl<T> GcIdx<T> {
    pub fn new(i: u32) -> Self {
        GcIdx(i, PhantomData)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl<T> Clone for GcIdx<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcIdx<T> {}

impl<T> PartialEq for GcIdx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for GcIdx<T> {}

impl<T> std::hash::Hash for GcIdx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// Entity sub-tags stored in the reference payload (bits 44-46).
pub const REF_SUB_STRING: u64 = 0;
pub const REF_SUB_TABLE: u64 = 1;
pub const REF_SUB_CLOSURE: u64 = 2;
pub const REF_SUB_NATIVE: u64 = 3;
pub const REF_SUB_THREAD: u64 = 4;
pub const REF_SUB_UPVAL: u64 = 5;

pub const REF_SUB_SHIFT: u64 = 44;
pub const REF_SUB_MASK: u64 = 0x7;
/// Mask for the arena index within the payload (lower 44 bits).
pub const REF_INDEX_MASK: u64 = (1u64 << 44) - 1;

/// One-byte entity type tag at the head of every heap cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EntityType {
    String = 0,
    Table,
    Function,
    Thread,
    Upvalue,
    Structure,
    CodeBlock,
    BaselineCodeBlock,
}

/// Two-color scheme for the stop-the-world collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GcColor {
    White,
    Black,
}

/// Per-entity bookkeeping: type tag, color, size class.
#[derive(Clone, Copy, Debug)]
pub struct ObjectHeader {
    pub ty: EntityType,
    pub color: GcColor,
    pub size_class: u8,
}

impl ObjectHeader {
    fn new(ty: EntityType, size_class: u8) -> Self {
        ObjectHeader {
            ty,
            color: GcColor::White,
            size_class,
        }
    }
}

struct Cell<T> {
    header: ObjectHeader,
    value: T,
}

/// A closure: an executable (code block id) plus captured upvalues.
#[derive(Debug)]
pub struct Closure {
    pub code_block: u32,
    pub upvalues: Vec<GcIdx<UpVal>>,
}

/// Error type for native functions.
#[derive(Debug)]
pub enum NativeError {
    Message(String),
    /// error() with an arbitrary engine value.
    Value(TValue),
}

impl From<String> for NativeError {
    fn from(s: String) -> Self {
        NativeError::Message(s)
    }
}

/// Context passed to simple native functions.
pub struct NativeContext<'a> {
    pub args: &'a [TValue],
    pub heap: &'a mut GcHeap,
    pub strings: &'a mut StringInterner,
}

pub type NativeFn = fn(&mut NativeContext) -> Result<Vec<TValue>, NativeError>;

/// How a native function is invoked. Simple natives get a NativeContext;
/// the rest need the full VM state and are dispatched inside the
/// interpreter's call path.
#[derive(Clone, Copy)]
pub enum NativeKind {
    Simple(NativeFn),
    Pcall,
    Xpcall,
    Error,
    CoroutineCreate,
    CoroutineResume,
    CoroutineYield,
    CoroutineStatus,
}

/// A host (Rust) function callable from bytecode.
pub struct NativeFunction {
    pub kind: NativeKind,
    pub name: &'static str,
}

/// An upvalue: open (pointing at a stack slot of a coroutine) or closed
/// (owning its value).
#[derive(Debug)]
pub struct UpVal {
    pub location: UpValLocation,
}

#[derive(Debug)]
pub enum UpValLocation {
    /// Stack slot index on the owning coroutine's value stack.
    Open { coroutine: u32, slot: usize },
    Closed(TValue),
}

/// GC accounting: allocation debt drives collection scheduling.
pub struct GcState {
    pub enabled: bool,
    /// Total bytes allocated (approximate).
    pub total_alloc: usize,
    /// Allocation threshold before next collection.
    pub threshold: usize,
    /// Pause parameter (percentage: 200 = collect when alloc doubles).
    pub pause: u32,
    /// Number of completed collections (test introspection).
    pub cycles: u64,
}

impl GcState {
    fn new() -> Self {
        GcState {
            enabled: true,
            total_alloc: 0,
            threshold: 64 * 1024,
            pause: 200,
            cycles: 0,
        }
    }
}

/// Arena-based heap. Structures and interned strings are immortal;
/// tables, closures, natives, and upvalues are collected.
pub struct GcHeap {
    tables: Vec<Option<Cell<Table>>>,
    table_free: Vec<u32>,
    closures: Vec<Option<Cell<Closure>>>,
    closure_free: Vec<u32>,
    natives: Vec<Option<Cell<NativeFunction>>>,
    native_free: Vec<u32>,
    upvals: Vec<Option<Cell<UpVal>>>,
    upval_free: Vec<u32>,
    pub structures: StructureRegistry,
    pub gc: GcState,
}

impl GcHeap {
    pub fn new() -> Self {
        GcHeap {
            tables: Vec::new(),
            table_free: Vec::new(),
            closures: Vec::new(),
            closure_free: Vec::new(),
            natives: Vec::new(),
            native_free: Vec::new(),
            upvals: Vec::new(),
            upval_free: Vec::new(),
            structures: StructureRegistry::new(),
            gc: GcState::new(),
        }
    }

    fn push_cell<T>(
        arena: &mut Vec<Option<Cell<T>>>,
        free: &mut Vec<u32>,
        cell: Cell<T>,
    ) -> GcIdx<T> {
        if let Some(idx) = free.pop() {
            arena[idx as usize] = Some(cell);
            GcIdx::new(idx)
        } else {
            let idx = arena.len() as u32;
            arena.push(Some(cell));
            GcIdx::new(idx)
        }
    }

    // ---- Tables ----

    /// Allocate an empty table seeded from the singleton structure for
    /// `inline_capacity` (rounded up to a capacity class).
    pub fn alloc_table(&mut self, inline_capacity: u8, array_hint: usize) -> GcIdx<Table> {
        let cap = optimal_inline_capacity(inline_capacity as usize);
        let seed = self.structures.root_for_capacity(cap);
        let size_est = 64 + cap as usize * 8 + array_hint * 8;
        self.gc.total_alloc += size_est;
        let table = Table::new(seed, cap, array_hint);
        let size_class = cap.trailing_zeros().min(7) as u8;
        Self::push_cell(
            &mut self.tables,
            &mut self.table_free,
            Cell {
                header: ObjectHeader::new(EntityType::Table, size_class),
                value: table,
            },
        )
    }

    pub fn get_table(&self, idx: GcIdx<Table>) -> &Table {
        &self.tables[idx.0 as usize]
            .as_ref()
            .expect("table was freed")
            .value
    }

    pub fn get_table_mut(&mut self, idx: GcIdx<Table>) -> &mut Table {
        &mut self.tables[idx.0 as usize]
            .as_mut()
            .expect("table was freed")
            .value
    }

    /// Raw read on a table by arbitrary key.
    pub fn table_raw_get(&self, idx: GcIdx<Table>, key: TValue) -> TValue {
        self.get_table(idx).raw_get(&self.structures, key)
    }

    /// Raw write on a table by arbitrary key; transitions the structure
    /// and updates the allocation-site profile output through the VM.
    pub fn table_raw_set(
        &mut self,
        idx: GcIdx<Table>,
        key: TValue,
        value: TValue,
    ) -> Result<(), &'static str> {
        let cell = self.tables[idx.0 as usize]
            .as_mut()
            .expect("table was freed");
        cell.value.raw_set(&mut self.structures, key, value)
    }

    /// Raw named-property write. Returns true if the structure changed.
    pub fn table_put_by_id(
        &mut self,
        idx: GcIdx<Table>,
        key: crate::string::StringId,
        value: TValue,
    ) -> bool {
        let cell = self.tables[idx.0 as usize]
            .as_mut()
            .expect("table was freed");
        cell.value.put_by_id(&mut self.structures, key, value)
    }

    /// Install or clear a table's metatable. The structure transitions
    /// to the identity-keyed sibling, so inline caches keyed on the old
    /// structure miss from now on.
    pub fn table_set_metatable(&mut self, idx: GcIdx<Table>, mt: Option<GcIdx<Table>>) {
        let cell = self.tables[idx.0 as usize]
            .as_mut()
            .expect("table was freed");
        let s = cell.value.structure;
        cell.value.structure = match mt {
            Some(m) => self.structures.set_metatable(s, m),
            None => self.structures.clear_metatable(s),
        };
        cell.value.metatable = mt;
    }

    // ---- Closures / natives / upvalues ----

    pub fn alloc_closure(&mut self, code_block: u32, upvalues: Vec<GcIdx<UpVal>>) -> GcIdx<Closure> {
        self.gc.total_alloc += 32 + upvalues.len() * 4;
        Self::push_cell(
            &mut self.closures,
            &mut self.closure_free,
            Cell {
                header: ObjectHeader::new(EntityType::Function, 0),
                value: Closure {
                    code_block,
                    upvalues,
                },
            },
        )
    }

    pub fn get_closure(&self, idx: GcIdx<Closure>) -> &Closure {
        &self.closures[idx.0 as usize]
            .as_ref()
            .expect("closure was freed")
            .value
    }

    pub fn alloc_native(&mut self, kind: NativeKind, name: &'static str) -> GcIdx<NativeFunction> {
        self.gc.total_alloc += 24;
        Self::push_cell(
            &mut self.natives,
            &mut self.native_free,
            Cell {
                header: ObjectHeader::new(EntityType::Function, 0),
                value: NativeFunction { kind, name },
            },
        )
    }

    pub fn get_native(&self, idx: GcIdx<NativeFunction>) -> &NativeFunction {
        &self.natives[idx.0 as usize]
            .as_ref()
            .expect("native fn was freed")
            .value
    }

    pub fn alloc_upval(&mut self, location: UpValLocation) -> GcIdx<UpVal> {
        self.gc.total_alloc += 16;
        Self::push_cell(
            &mut self.upvals,
            &mut self.upval_free,
            Cell {
                header: ObjectHeader::new(EntityType::Upvalue, 0),
                value: UpVal { location },
            },
        )
    }

    pub fn get_upval(&self, idx: GcIdx<UpVal>) -> &UpVal {
        &self.upvals[idx.0 as usize]
            .as_ref()
            .expect("upval was freed")
            .value
    }

    pub fn get_upval_mut(&mut self, idx: GcIdx<UpVal>) -> &mut UpVal {
        &mut self.upvals[idx.0 as usize]
            .as_mut()
            .expect("upval was freed")
            .value
    }

    // ---- Mark-sweep collection ----

    /// Whether enough debt accumulated to run a collection.
    pub fn should_collect(&self) -> bool {
        self.gc.enabled && self.gc.total_alloc > self.gc.threshold
    }

    /// Full stop-the-world collection. `roots` must contain every value
    /// reachable from outside the heap (coroutine stacks, globals, code
    /// block constants). Threads are VM-owned and not collected here.
    pub fn collect(&mut self, roots: &[TValue]) -> usize {
        // Whiten everything.
        for cell in self.tables.iter_mut().flatten() {
            cell.header.color = GcColor::White;
        }
        for cell in self.closures.iter_mut().flatten() {
            cell.header.color = GcColor::White;
        }
        for cell in self.natives.iter_mut().flatten() {
            cell.header.color = GcColor::White;
        }
        for cell in self.upvals.iter_mut().flatten() {
            cell.header.color = GcColor::White;
        }

        // Mark with an explicit worklist.
        let mut work: Vec<TValue> = roots.to_vec();
        while let Some(v) = work.pop() {
            if !v.is_ref() {
                continue;
            }
            let idx = v.ref_index().unwrap() as usize;
            match v.ref_sub_tag().unwrap() {
                REF_SUB_TABLE => {
                    if let Some(cell) = self.tables.get_mut(idx).and_then(|c| c.as_mut()) {
                        if cell.header.color == GcColor::Black {
                            continue;
                        }
                        cell.header.color = GcColor::Black;
                        if let Some(mt) = cell.value.metatable {
                            work.push(TValue::from_table(mt));
                        }
                        cell.value.for_each_value(|child| {
                            if child.is_ref() {
                                work.push(child);
                            }
                        });
                    }
                }
                REF_SUB_CLOSURE => {
                    if let Some(cell) = self.closures.get_mut(idx).and_then(|c| c.as_mut()) {
                        if cell.header.color == GcColor::Black {
                            continue;
                        }
                        cell.header.color = GcColor::Black;
                        for &uv in &cell.value.upvalues {
                            work.push(TValue::from_ref(REF_SUB_UPVAL, uv.0));
                        }
                    }
                }
                REF_SUB_NATIVE => {
                    if let Some(cell) = self.natives.get_mut(idx).and_then(|c| c.as_mut()) {
                        cell.header.color = GcColor::Black;
                    }
                }
                REF_SUB_UPVAL => {
                    if let Some(cell) = self.upvals.get_mut(idx).and_then(|c| c.as_mut()) {
                        if cell.header.color == GcColor::Black {
                            continue;
                        }
                        cell.header.color = GcColor::Black;
                        if let UpValLocation::Closed(val) = cell.value.location {
                            if val.is_ref() {
                                work.push(val);
                            }
                        }
                        // Open upvalues point at stack slots; stacks are roots.
                    }
                }
                // Strings are interner-owned; threads are VM-owned.
                _ => {}
            }
        }

        // Sweep whites into the free lists.
        let mut freed = 0usize;
        for (i, slot) in self.tables.iter_mut().enumerate() {
            if matches!(slot, Some(c) if c.header.color == GcColor::White) {
                *slot = None;
                self.table_free.push(i as u32);
                freed += 64;
            }
        }
        for (i, slot) in self.closures.iter_mut().enumerate() {
            if matches!(slot, Some(c) if c.header.color == GcColor::White) {
                *slot = None;
                self.closure_free.push(i as u32);
                freed += 32;
            }
        }
        for (i, slot) in self.natives.iter_mut().enumerate() {
            if matches!(slot, Some(c) if c.header.color == GcColor::White) {
                *slot = None;
                self.native_free.push(i as u32);
                freed += 24;
            }
        }
        for (i, slot) in self.upvals.iter_mut().enumerate() {
            if matches!(slot, Some(c) if c.header.color == GcColor::White) {
                *slot = None;
                self.upval_free.push(i as u32);
                freed += 16;
            }
        }

        self.gc.total_alloc = self.gc.total_alloc.saturating_sub(freed);
        self.gc.threshold =
            ((self.gc.total_alloc as u64 * self.gc.pause as u64 / 100) as usize).max(64 * 1024);
        self.gc.cycles += 1;
        freed
    }

    /// Number of live tables (test introspection).
    pub fn live_table_count(&self) -> usize {
        self.tables.iter().filter(|c| c.is_some()).count()
    }
}

impl Default for GcHeap {
    fn default() -> Self {
        Self::new()
    }
}
