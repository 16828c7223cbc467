//! Hidden classes ("structures") describing table property layouts.
//!
//! A structure records the ordered named-property keys of a family of
//! tables, its inline storage capacity class, and a memoized transition
//! map so that two independent insertions of the same key into
//! equal-shaped tables resolve to the same child structure. Structures
//! are immutable except for memoizing new children; tables point at
//! their current structure and retarget on transition.

use crate::heap::GcIdx;
use crate::string::StringId;
use crate::table::Table;
use bitflags::bitflags;
use std::collections::HashMap;

bitflags! {
    /// Structure-level flags consulted by the inline cache protocol.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StructureFlags: u8 {
        /// Tables of this structure have a metatable installed.
        const HAS_METATABLE = 1 << 0;
        /// Some structure on the path from the root here had a
        /// metatable; once set, never cleared on descendants.
        const MAY_HAVE_METATABLE = 1 << 1;
    }
}

/// Identity of a structure in the registry. Referential uniqueness of
/// transitions makes this usable as an inline-cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StructureId(pub u32);

/// Edge labels in the transition DAG.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
enum TransitionKey {
    AddProperty(StringId),
    SetMetatable(u32),
    ClearMetatable,
}

/// Where a named-property slot lives on the table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlotLocation {
    /// Index into the table's inline storage.
    Inline(u8),
    /// Index into the butterfly's out-of-line named region.
    Outline(u32),
}

/// Map an ordinal slot to its storage location given the inline capacity.
#[inline]
pub fn slot_location(slot: u32, inline_capacity: u8) -> SlotLocation {
    if slot < inline_capacity as u32 {
        SlotLocation::Inline(slot as u8)
    } else {
        SlotLocation::Outline(slot - inline_capacity as u32)
    }
}

/// A hidden class: ordered key list plus transition bookkeeping.
pub struct Structure {
    /// Ordered property keys; the slot of keys[i] is i.
    keys: Vec<StringId>,
    /// key -> ordinal slot, for O(1) resolution.
    slots: HashMap<StringId, u32>,
    /// Inline storage capacity class of tables born from this structure.
    pub inline_capacity: u8,
    /// The structure this one was materialized from.
    pub parent: Option<StructureId>,
    /// Memoized children, keyed by the transition that creates them.
    transitions: HashMap<TransitionKey, StructureId>,
    /// Metatable shared by all tables of this structure (identity-keyed
    /// transitions guarantee the sharing).
    pub metatable: Option<GcIdx<Table>>,
    pub flags: StructureFlags,
}

impl Structure {
    fn empty(inline_capacity: u8) -> Self {
        Structure {
            keys: Vec::new(),
            slots: HashMap::new(),
            inline_capacity,
            parent: None,
            transitions: HashMap::new(),
            metatable: None,
            flags: StructureFlags::empty(),
        }
    }

    /// Number of named properties described by this structure.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Ordinal slot of a key, if present.
    pub fn slot_of(&self, key: StringId) -> Option<u32> {
        self.slots.get(&key).copied()
    }

    /// The ordered key list.
    pub fn keys(&self) -> &[StringId] {
        &self.keys
    }

    pub fn may_have_metatable(&self) -> bool {
        self.flags.contains(StructureFlags::MAY_HAVE_METATABLE)
    }

    pub fn has_metatable(&self) -> bool {
        self.flags.contains(StructureFlags::HAS_METATABLE)
    }
}

/// Inline-capacity classes. A table-literal site observed to grow to k
/// named slots is reallocated from the smallest class >= k.
pub const INLINE_CAPACITY_CLASSES: [u8; 7] = [0, 1, 2, 4, 8, 16, 32];

/// Smallest power-of-two capacity class >= k, clamped to the largest class.
pub fn optimal_inline_capacity(k: usize) -> u8 {
    let max = *INLINE_CAPACITY_CLASSES.last().unwrap() as usize;
    if k == 0 {
        0
    } else if k >= max {
        max as u8
    } else {
        k.next_power_of_two() as u8
    }
}

/// The process-wide structure table: one root (empty) structure per
/// inline-capacity class, plus every structure ever materialized.
pub struct StructureRegistry {
    structures: Vec<Structure>,
    roots: [StructureId; INLINE_CAPACITY_CLASSES.len()],
}

impl StructureRegistry {
    pub fn new() -> Self {
        let mut structures = Vec::with_capacity(INLINE_CAPACITY_CLASSES.len());
        let mut roots = [StructureId(0); INLINE_CAPACITY_CLASSES.len()];
        for (i, &cap) in INLINE_CAPACITY_CLASSES.iter().enumerate() {
            roots[i] = StructureId(structures.len() as u32);
            structures.push(Structure::empty(cap));
        }
        StructureRegistry { structures, roots }
    }

    pub fn get(&self, id: StructureId) -> &Structure {
        &self.structures[id.0 as usize]
    }

    /// The singleton empty structure for an inline capacity.
    pub fn root_for_capacity(&self, capacity: u8) -> StructureId {
        let class = INLINE_CAPACITY_CLASSES
            .iter()
            .position(|&c| c >= capacity)
            .unwrap_or(INLINE_CAPACITY_CLASSES.len() - 1);
        self.roots[class]
    }

    pub fn slot_of(&self, id: StructureId, key: StringId) -> Option<u32> {
        self.get(id).slot_of(key)
    }

    /// Number of structures ever materialized (test introspection).
    pub fn len(&self) -> usize {
        self.structures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.structures.is_empty()
    }

    /// Resolve the structure reached by adding `key`, materializing and
    /// memoizing the child if needed. Returns the child id and the slot
    /// ordinal of the key. If the key already exists, no transition
    /// happens and the current id is returned.
    pub fn add_property(&mut self, id: StructureId, key: StringId) -> (StructureId, u32) {
        if let Some(slot) = self.get(id).slot_of(key) {
            return (id, slot);
        }
        let tkey = TransitionKey::AddProperty(key);
        if let Some(&child) = self.structures[id.0 as usize].transitions.get(&tkey) {
            let slot = self.get(child).slot_of(key).expect("memoized child has key");
            return (child, slot);
        }

        let src = &self.structures[id.0 as usize];
        let mut keys = src.keys.clone();
        let mut slots = src.slots.clone();
        let slot = keys.len() as u32;
        keys.push(key);
        slots.insert(key, slot);
        let child = Structure {
            keys,
            slots,
            inline_capacity: src.inline_capacity,
            parent: Some(id),
            transitions: HashMap::new(),
            metatable: src.metatable,
            flags: src.flags,
        };
        let child_id = StructureId(self.structures.len() as u32);
        self.structures.push(child);
        self.structures[id.0 as usize]
            .transitions
            .insert(tkey, child_id);
        (child_id, slot)
    }

    /// Transition to the sibling structure with `mt` installed. Keyed by
    /// metatable identity so tables sharing shape and metatable share the
    /// sibling.
    pub fn set_metatable(&mut self, id: StructureId, mt: GcIdx<Table>) -> StructureId {
        if self.get(id).metatable == Some(mt) {
            return id;
        }
        let tkey = TransitionKey::SetMetatable(mt.0);
        if let Some(&sib) = self.structures[id.0 as usize].transitions.get(&tkey) {
            return sib;
        }
        let src = &self.structures[id.0 as usize];
        let sibling = Structure {
            keys: src.keys.clone(),
            slots: src.slots.clone(),
            inline_capacity: src.inline_capacity,
            parent: Some(id),
            transitions: HashMap::new(),
            metatable: Some(mt),
            flags: src.flags | StructureFlags::HAS_METATABLE | StructureFlags::MAY_HAVE_METATABLE,
        };
        let sib_id = StructureId(self.structures.len() as u32);
        self.structures.push(sibling);
        self.structures[id.0 as usize]
            .transitions
            .insert(tkey, sib_id);
        sib_id
    }

    /// Transition to the sibling with no metatable. MAY_HAVE_METATABLE
    /// stays set: inline caches keyed on the old observation class must
    /// keep missing, never read stale fast paths.
    pub fn clear_metatable(&mut self, id: StructureId) -> StructureId {
        if self.get(id).metatable.is_none() {
            return id;
        }
        let tkey = TransitionKey::ClearMetatable;
        if let Some(&sib) = self.structures[id.0 as usize].transitions.get(&tkey) {
            return sib;
        }
        let src = &self.structures[id.0 as usize];
        let mut flags = src.flags;
        flags.remove(StructureFlags::HAS_METATABLE);
        let sibling = Structure {
            keys: src.keys.clone(),
            slots: src.slots.clone(),
            inline_capacity: src.inline_capacity,
            parent: Some(id),
            transitions: HashMap::new(),
            metatable: None,
            flags,
        };
        let sib_id = StructureId(self.structures.len() as u32);
        self.structures.push(sibling);
        self.structures[id.0 as usize]
            .transitions
            .insert(tkey, sib_id);
        sib_id
    }
}

impl Default for StructureRegistry {
    fn default() -> Self {
        Self::new()
    }
}
