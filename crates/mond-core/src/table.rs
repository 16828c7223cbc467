//! Hybrid table object: structure-driven named slots plus a butterfly.
//!
//! Named (string-keyed) properties resolve through the table's structure
//! into fixed inline storage or the butterfly's out-of-line region.
//! Integer keys live in the butterfly's contiguous 1-based array part;
//! everything else lands in the butterfly hash. A property is stored in
//! exactly one of these places, never two.

use crate::heap::GcIdx;
use crate::string::StringId;
use crate::structure::{slot_location, SlotLocation, StructureId, StructureRegistry};
use crate::value::TValue;
use indexmap::IndexMap;

/// Sentinel for tables not born at a profiled allocation site.
pub const NO_ALLOC_SITE: u32 = u32::MAX;

/// A key in the hash part of a butterfly. Strings never appear here:
/// they are named properties and resolve through the structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    Int(i64),
    /// Non-integral float key, stored as raw bits (bit-exact hashing).
    Float(u64),
    Bool(bool),
    /// Heap reference key (table, function, thread), raw value bits.
    Ref(u64),
}

/// Out-of-line storage block: array part, overflow named slots, hash.
pub struct Butterfly {
    /// Contiguous array part; array[0] holds key 1.
    pub array: Vec<TValue>,
    /// Named-property slots beyond the inline capacity.
    out_of_line: Vec<TValue>,
    /// Everything else (insertion-order preserving).
    hash: IndexMap<TableKey, TValue>,
}

impl Butterfly {
    fn new(array_hint: usize) -> Self {
        Butterfly {
            array: Vec::with_capacity(array_hint),
            out_of_line: Vec::new(),
            hash: IndexMap::new(),
        }
    }
}

/// Result of probing a named-property read; this is what an inline cache
/// records about a (structure, key) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GetByIdInfo {
    pub kind: GetByIdKind,
    pub may_have_metatable: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GetByIdKind {
    Inline(u8),
    Outline(u32),
    /// The structure has no such key. Cacheable only when the structure
    /// cannot have a metatable; otherwise the nil result must keep
    /// re-probing the metatable chain.
    MustBeNil { cacheable: bool },
}

/// Result of probing a named-property write for the put inline cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutByIdKind {
    /// The slot already exists; a cached write is sound.
    Existing(SlotLocation),
    /// The write would transition the structure; not cached.
    Transition,
}

pub struct Table {
    pub structure: StructureId,
    /// Fixed inline named-property storage, sized by the structure's
    /// capacity class at birth.
    inline: Box<[TValue]>,
    butterfly: Option<Box<Butterfly>>,
    /// Mirrored from the structure for fast metamethod lookup.
    pub metatable: Option<GcIdx<Table>>,
    /// Allocation-site ordinal for the inline-capacity profile.
    pub alloc_site: u32,
}

impl Table {
    /// Create an empty table seeded from a structure.
    pub fn new(structure: StructureId, inline_capacity: u8, array_hint: usize) -> Self {
        Table {
            structure,
            inline: vec![TValue::nil(); inline_capacity as usize].into_boxed_slice(),
            butterfly: if array_hint > 0 {
                Some(Box::new(Butterfly::new(array_hint)))
            } else {
                None
            },
            metatable: None,
            alloc_site: NO_ALLOC_SITE,
        }
    }

    fn butterfly_mut(&mut self) -> &mut Butterfly {
        self.butterfly.get_or_insert_with(|| Box::new(Butterfly::new(0)))
    }

    // ---- Named properties (ById) ----

    /// Raw read of a named property (no metamethods).
    pub fn get_by_id(&self, reg: &StructureRegistry, key: StringId) -> TValue {
        match reg.slot_of(self.structure, key) {
            Some(slot) => self.read_slot(slot_location(slot, self.inline.len() as u8)),
            None => TValue::nil(),
        }
    }

    /// Probe a named-property read, producing what an IC would record.
    pub fn prepare_get_by_id(&self, reg: &StructureRegistry, key: StringId) -> GetByIdInfo {
        let st = reg.get(self.structure);
        let may = st.may_have_metatable();
        match st.slot_of(key) {
            Some(slot) => match slot_location(slot, self.inline.len() as u8) {
                SlotLocation::Inline(i) => GetByIdInfo {
                    kind: GetByIdKind::Inline(i),
                    may_have_metatable: may,
                },
                SlotLocation::Outline(o) => GetByIdInfo {
                    kind: GetByIdKind::Outline(o),
                    may_have_metatable: may,
                },
            },
            None => GetByIdInfo {
                kind: GetByIdKind::MustBeNil { cacheable: !may },
                may_have_metatable: may,
            },
        }
    }

    /// Probe a named-property write for the put IC.
    pub fn prepare_put_by_id(&self, reg: &StructureRegistry, key: StringId) -> PutByIdKind {
        match reg.slot_of(self.structure, key) {
            Some(slot) => PutByIdKind::Existing(slot_location(slot, self.inline.len() as u8)),
            None => PutByIdKind::Transition,
        }
    }

    /// Read a resolved slot.
    pub fn read_slot(&self, loc: SlotLocation) -> TValue {
        match loc {
            SlotLocation::Inline(i) => self.inline[i as usize],
            SlotLocation::Outline(o) => self
                .butterfly
                .as_ref()
                .and_then(|b| b.out_of_line.get(o as usize).copied())
                .unwrap_or(TValue::nil()),
        }
    }

    /// Write a resolved slot, growing the out-of-line region if needed.
    pub fn write_slot(&mut self, loc: SlotLocation, value: TValue) {
        match loc {
            SlotLocation::Inline(i) => self.inline[i as usize] = value,
            SlotLocation::Outline(o) => {
                let b = self.butterfly_mut();
                if b.out_of_line.len() <= o as usize {
                    b.out_of_line.resize(o as usize + 1, TValue::nil());
                }
                b.out_of_line[o as usize] = value;
            }
        }
    }

    /// Raw write of a named property, transitioning the structure when
    /// the key is new. Returns true if a transition happened.
    pub fn put_by_id(&mut self, reg: &mut StructureRegistry, key: StringId, value: TValue) -> bool {
        if let Some(slot) = reg.slot_of(self.structure, key) {
            self.write_slot(slot_location(slot, self.inline.len() as u8), value);
            return false;
        }
        let (child, slot) = reg.add_property(self.structure, key);
        self.structure = child;
        self.write_slot(slot_location(slot, self.inline.len() as u8), value);
        true
    }

    // ---- Array part (ByVal with integer keys) ----

    /// Raw indexed read with an integer key (1-based array part).
    pub fn get_array(&self, i: i64) -> TValue {
        if let Some(b) = &self.butterfly {
            if i >= 1 && (i as usize) <= b.array.len() {
                return b.array[(i - 1) as usize];
            }
            return b.hash.get(&TableKey::Int(i)).copied().unwrap_or(TValue::nil());
        }
        TValue::nil()
    }

    /// Raw indexed write with an integer key. Assigning `array[len+1]`
    /// extends the array and migrates newly contiguous hash entries in.
    pub fn set_array(&mut self, i: i64, value: TValue) {
        let b = self.butterfly_mut();
        if i >= 1 {
            let idx = (i - 1) as usize;
            if idx < b.array.len() {
                b.array[idx] = value;
                return;
            }
            if idx == b.array.len() && !value.is_nil() {
                b.array.push(value);
                // Pull in hash entries that are now contiguous.
                loop {
                    let next = b.array.len() as i64 + 1;
                    match b.hash.shift_remove(&TableKey::Int(next)) {
                        Some(v) if !v.is_nil() => b.array.push(v),
                        _ => break,
                    }
                }
                return;
            }
        }
        if value.is_nil() {
            b.hash.shift_remove(&TableKey::Int(i));
        } else {
            b.hash.insert(TableKey::Int(i), value);
        }
    }

    // ---- Generic raw access ----

    /// Raw get dispatching on the key's runtime type. nil and NaN keys
    /// always miss.
    pub fn raw_get(&self, reg: &StructureRegistry, key: TValue) -> TValue {
        if let Some(sid) = key.as_string_id() {
            return self.get_by_id(reg, sid);
        }
        if let Some(i) = key.as_int_key() {
            return self.get_array(i);
        }
        match tvalue_to_table_key(key) {
            Some(tk) => self
                .butterfly
                .as_ref()
                .and_then(|b| b.hash.get(&tk).copied())
                .unwrap_or(TValue::nil()),
            None => TValue::nil(),
        }
    }

    /// Raw set dispatching on the key's runtime type. nil and NaN keys
    /// are write errors.
    pub fn raw_set(
        &mut self,
        reg: &mut StructureRegistry,
        key: TValue,
        value: TValue,
    ) -> Result<(), &'static str> {
        if key.is_nil() {
            return Err("table index is nil");
        }
        if let Some(f) = key.as_number() {
            if f.is_nan() {
                return Err("table index is NaN");
            }
        }
        if let Some(sid) = key.as_string_id() {
            self.put_by_id(reg, sid, value);
            return Ok(());
        }
        if let Some(i) = key.as_int_key() {
            self.set_array(i, value);
            return Ok(());
        }
        let tk = tvalue_to_table_key(key).expect("non-nil non-NaN key");
        let b = self.butterfly_mut();
        if value.is_nil() {
            b.hash.shift_remove(&tk);
        } else {
            b.hash.insert(tk, value);
        }
        Ok(())
    }

    /// The `#` border: largest n with array[1..n] non-nil, found by
    /// binary search when the tail is nil.
    pub fn length(&self) -> i64 {
        let array = match &self.butterfly {
            Some(b) => &b.array,
            None => return 0,
        };
        if array.is_empty() {
            return 0;
        }
        if !array.last().unwrap().is_nil() {
            return array.len() as i64;
        }
        let mut lo = 0usize;
        let mut hi = array.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if array[mid].is_nil() {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo as i64
    }

    /// Count of populated named-property slots (structure key count).
    pub fn named_slot_count(&self, reg: &StructureRegistry) -> usize {
        reg.get(self.structure).key_count()
    }

    /// Inline storage capacity (test introspection).
    pub fn inline_capacity(&self) -> u8 {
        self.inline.len() as u8
    }

    /// Visit every value stored in the table (GC traversal).
    pub fn for_each_value<F: FnMut(TValue)>(&self, mut f: F) {
        for &v in self.inline.iter() {
            f(v);
        }
        if let Some(b) = &self.butterfly {
            for &v in &b.array {
                f(v);
            }
            for &v in &b.out_of_line {
                f(v);
            }
            for (k, &v) in &b.hash {
                if let TableKey::Ref(bits) = k {
                    f(TValue::from_raw_bits(*bits));
                }
                f(v);
            }
        }
    }
}

/// Convert a value to a hash key. Strings and integral numbers are
/// handled before this; nil and NaN return None.
fn tvalue_to_table_key(v: TValue) -> Option<TableKey> {
    if v.is_nil() {
        return None;
    }
    if let Some(f) = v.as_number() {
        if f.is_nan() {
            return None;
        }
        if let Some(i) = v.as_int_key() {
            return Some(TableKey::Int(i));
        }
        return Some(TableKey::Float(f.to_bits()));
    }
    if let Some(b) = v.as_bool() {
        return Some(TableKey::Bool(b));
    }
    // Reference identity (tables, functions, threads).
    Some(TableKey::Ref(v.raw_bits()))
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (alen, hlen) = match &self.butterfly {
            Some(b) => (b.array.len(), b.hash.len()),
            None => (0, 0),
        };
        write!(
            f,
            "table(structure=#{}, array={}, hash={})",
            self.structure.0, alen, hlen
        )
    }
}
