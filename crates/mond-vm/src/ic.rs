//! Interpreter-tier inline caches for property access.
//!
//! Each property-access bytecode instance owns a site: a small ordered
//! list of (structure, effect) entries. A hit dispatches on structure
//! identity alone: no key compare, no hash probe. A miss runs the full
//! probe and either extends the site or, past the capacity bound,
//! demotes it to the generic path for good.
//!
//! Effects stay sound without invalidation because structures are
//! immutable: any mutation that would change the observation (new key,
//! metatable installed) moves the table to a different structure, and
//! the stale entry simply never matches again.

use mond_core::heap::GcIdx;
use mond_core::structure::{SlotLocation, StructureId};
use mond_core::table::{GetByIdInfo, GetByIdKind, Table};

/// Capacity bound per site; overflow demotes to the generic path.
pub const IC_CAPACITY: usize = 4;

/// Sentinel in a code block's pc -> site map.
pub const NO_IC_SITE: u32 = u32::MAX;

/// How a cached hit computes its result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IcEffectKind {
    InlineSlot(u8),
    OutlineSlot(u32),
    MustBeNil,
    /// The key is absent on the receiver but resolves through the
    /// metatable's `__index` table. The receiver's structure pins its
    /// metatable identity; the remaining guards are checked on hit,
    /// and a nil slot value falls back to the generic chain.
    IndexTableSlot {
        /// Expected structure of the metatable (pins the __index slot).
        mt_structure: StructureId,
        /// Where __index lives on the metatable.
        mt_index_slot: SlotLocation,
        /// The observed __index table (identity compare on hit).
        index_table: GcIdx<Table>,
        /// Where the key lives on the __index table.
        index_slot: SlotLocation,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct IcEffect {
    pub kind: IcEffectKind,
    /// The mayHaveMetatable bit observed at record time. When set, a
    /// nil result must still consult the metatable chain.
    pub may_have_metatable: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct IcEntry {
    pub structure: StructureId,
    pub effect: IcEffect,
}

/// One property-access site (get or put flavor).
#[derive(Clone, Debug, Default)]
pub struct IcSite {
    entries: Vec<IcEntry>,
    pub demoted: bool,
    pub hits: u64,
    pub misses: u64,
}

impl IcSite {
    pub fn new() -> Self {
        IcSite::default()
    }

    /// Dispatch on structure identity. Counts a hit on success.
    pub fn lookup(&mut self, structure: StructureId) -> Option<IcEffect> {
        for e in &self.entries {
            if e.structure == structure {
                self.hits += 1;
                return Some(e.effect);
            }
        }
        self.misses += 1;
        None
    }

    /// Record a new entry unless the site is demoted; demote on
    /// capacity overflow. Returns true if recorded.
    pub fn record(&mut self, structure: StructureId, effect: IcEffect) -> bool {
        if self.demoted {
            return false;
        }
        if self.entries.len() >= IC_CAPACITY {
            self.demoted = true;
            self.entries.clear();
            return false;
        }
        self.entries.push(IcEntry { structure, effect });
        true
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Site-level flush: drop every entry but keep the demotion state
    /// and counters. Used when cached table identities may have died
    /// (garbage collection).
    pub fn flush(&mut self) {
        self.entries.clear();
    }
}

/// Derive the cacheable effect from a full probe, if the observation is
/// cacheable at all.
pub fn effect_for_get(info: &GetByIdInfo) -> Option<IcEffect> {
    let kind = match info.kind {
        GetByIdKind::Inline(i) => IcEffectKind::InlineSlot(i),
        GetByIdKind::Outline(o) => IcEffectKind::OutlineSlot(o),
        GetByIdKind::MustBeNil { cacheable: true } => IcEffectKind::MustBeNil,
        GetByIdKind::MustBeNil { cacheable: false } => return None,
    };
    Some(IcEffect {
        kind,
        may_have_metatable: info.may_have_metatable,
    })
}
