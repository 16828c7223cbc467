//! Metamethod names and lookup.

use mond_core::heap::GcHeap;
use mond_core::string::{StringId, StringInterner};
use mond_core::value::TValue;

/// Pre-interned metamethod name ids.
pub struct MetamethodNames {
    pub add: StringId,
    pub sub: StringId,
    pub mul: StringId,
    pub div: StringId,
    pub mod_: StringId,
    pub pow: StringId,
    pub unm: StringId,
    pub eq: StringId,
    pub lt: StringId,
    pub le: StringId,
    pub index: StringId,
    pub newindex: StringId,
    pub call: StringId,
    pub len: StringId,
    pub concat: StringId,
}

impl MetamethodNames {
    pub fn init(strings: &mut StringInterner) -> Self {
        MetamethodNames {
            add: strings.intern(b"__add"),
            sub: strings.intern(b"__sub"),
            mul: strings.intern(b"__mul"),
            div: strings.intern(b"__div"),
            mod_: strings.intern(b"__mod"),
            pow: strings.intern(b"__pow"),
            unm: strings.intern(b"__unm"),
            eq: strings.intern(b"__eq"),
            lt: strings.intern(b"__lt"),
            le: strings.intern(b"__le"),
            index: strings.intern(b"__index"),
            newindex: strings.intern(b"__newindex"),
            call: strings.intern(b"__call"),
            len: strings.intern(b"__len"),
            concat: strings.intern(b"__concat"),
        }
    }
}

/// Look up a metamethod on a value. Only tables carry metatables in the
/// core; the host library layer owns type-wide metatables.
pub fn get_metamethod(val: TValue, mm_name: StringId, heap: &GcHeap) -> Option<TValue> {
    let table_idx = val.as_table_idx()?;
    let mt_idx = heap.get_table(table_idx).metatable?;
    let mm_val = heap.get_table(mt_idx).get_by_id(&heap.structures, mm_name);
    if mm_val.is_nil() {
        None
    } else {
        Some(mm_val)
    }
}

/// The raw metatable of a value, if any.
pub fn get_metatable(val: TValue, heap: &GcHeap) -> Option<TValue> {
    let table_idx = val.as_table_idx()?;
    heap.get_table(table_idx)
        .metatable
        .map(TValue::from_table)
}
