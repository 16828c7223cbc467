//! The stencil data model: relocatable native-code templates.
//!
//! A stencil carries pre-fixup byte vectors for its fast path, slow
//! path, and (when it contains inline-cache logic) IC path, plus the
//! relocation records that turn them into runnable code. Hole bytes are
//! pre-filled with a recognizable placeholder so unpatched output is
//! detectable.

use std::collections::HashMap;
use std::fmt;

/// Fill byte for unpatched relocation fields.
pub const PLACEHOLDER_BYTE: u8 = 0xAA;

/// Hole ordinals below this index `the variant's operand vector; at or
/// above it, manually reserved placeholders (site ids, chain slots).
pub const EXTRA_HOLE_BASE: u32 = 10000;
/// The property-access site id of an IC-carrying stencil.
pub const HOLE_IC_SITE: u32 = EXTRA_HOLE_BASE;
/// The IC chain-head address slot in an IC-carrying fast path.
pub const HOLE_IC_CHAIN: u32 = EXTRA_HOLE_BASE + 1;

/// Relocation field encodings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocType {
    /// Absolute 64-bit.
    Abs64,
    /// Absolute 32-bit, zero-extended; overflow is a codegen error.
    Abs32,
    /// Absolute 32-bit, sign-extended; overflow is a codegen error.
    Abs32S,
    /// PC-relative 32-bit (addend carries the usual -4).
    Pc32,
}

/// Identity of a shared constant data object. Emitted once per process
/// and deduplicated by this id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SharedObjectId {
    /// 16 bytes: the boolean false/true value bit patterns.
    BoolPair,
}

/// A shared constant blob definition.
#[derive(Clone, Debug)]
pub struct SharedConstantDataObject {
    pub id: SharedObjectId,
    pub alignment: usize,
    pub bytes: Vec<u8>,
}

impl SharedConstantDataObject {
    pub fn define(id: SharedObjectId) -> Self {
        match id {
            SharedObjectId::BoolPair => {
                let f = mond_core::value::TValue::from_bool(false).raw_bits();
                let t = mond_core::value::TValue::from_bool(true).raw_bits();
                let mut bytes = Vec::with_capacity(16);
                bytes.extend_from_slice(&f.to_le_bytes());
                bytes.extend_from_slice(&t.to_le_bytes());
                SharedConstantDataObject {
                    id,
                    alignment: 8,
                    bytes,
                }
            }
        }
    }
}

/// Symbolic relocation targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SymKind {
    /// Start of this bytecode's fast path logic.
    FastPathAddr,
    /// Start of this bytecode's slow path logic.
    SlowPathAddr,
    /// Start of the current piece of IC logic (IC extraction only).
    IcPathAddr,
    /// This stencil's private data object.
    PrivateDataAddr,
    /// The main logic's private data, as seen from extracted IC logic.
    /// The IC-path codegen resolves it to the owning site's cell.
    MainLogicPrivateDataAddr,
    /// A deduplicated shared constant data object.
    SharedConstantDataObject(SharedObjectId),
    /// A runtime helper, keyed by symbol name.
    ExternalCSymbol(&'static str),
    /// A numbered placeholder filled with a bytecode operand value.
    StencilHole(u32),
}

#[derive(Clone, Debug)]
pub struct RelocationRecord {
    /// Byte offset of the field within its section.
    pub offset: usize,
    pub ty: RelocType,
    pub sym: SymKind,
    pub addend: i64,
}

impl RelocationRecord {
    fn field_len(&self) -> usize {
        match self.ty {
            RelocType::Abs64 => 8,
            _ => 4,
        }
    }
}

/// Positions of conditional-branch displacements filled in by the
/// driver's late-patch pass once every bytecode's address is known.
#[derive(Clone, Copy, Debug)]
pub struct CondBrLatePatchRecord {
    pub offset: usize,
    pub is_64bit: bool,
}

/// Per-instantiation read-only data; cannot be shared because it
/// embeds code-section relocations (e.g. the entry dispatch table).
#[derive(Clone, Debug, Default)]
pub struct PrivateDataObject {
    pub alignment: usize,
    pub bytes: Vec<u8>,
    pub relocations: Vec<RelocationRecord>,
}

/// Errors raised while patching or assembling stencils.
#[derive(Debug)]
pub enum CodegenError {
    RelocOverflow(&'static str),
    UnknownSymbol(&'static str),
    MissingOperand(u32),
    ArenaExhausted,
    ArenaUnavailable,
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::RelocOverflow(what) => write!(f, "relocation overflow ({what})"),
            CodegenError::UnknownSymbol(s) => write!(f, "unknown runtime symbol '{s}'"),
            CodegenError::MissingOperand(ord) => write!(f, "missing operand for hole {ord}"),
            CodegenError::ArenaExhausted => write!(f, "code arena exhausted"),
            CodegenError::ArenaUnavailable => write!(f, "executable memory unavailable"),
        }
    }
}

impl std::error::Error for CodegenError {}

/// Addresses and tables a patch pass resolves against.
pub struct PatchContext<'a> {
    /// This bytecode's fast path start.
    pub fast_addr: u64,
    /// This bytecode's slow path start.
    pub slow_addr: u64,
    /// The IC entry being instantiated (IC-path codegen only).
    pub ic_addr: u64,
    /// This stencil's private data start.
    pub data_addr: u64,
    /// For IC-path codegen: the owning site's continuation cell.
    pub main_pdo_addr: u64,
    pub symbols: &'a HashMap<&'static str, u64>,
    pub shared: &'a HashMap<SharedObjectId, u64>,
    /// Values for manually reserved hole ordinals (>= EXTRA_HOLE_BASE).
    pub extra_holes: &'a HashMap<u32, u64>,
}

/// Apply a relocation list to a section image that will live at
/// `section_addr`. This is the entire patch logic; byte copying is the
/// driver's job so identical-stencil runs can be memcpy-coalesced.
pub fn apply_relocations(
    section_addr: u64,
    dest: &mut [u8],
    relos: &[RelocationRecord],
    ctx: &PatchContext<'_>,
    operands: &[u64],
) -> Result<(), CodegenError> {
    for r in relos {
        let s: u64 = match &r.sym {
            SymKind::FastPathAddr => ctx.fast_addr,
            SymKind::SlowPathAddr => ctx.slow_addr,
            SymKind::IcPathAddr => ctx.ic_addr,
            SymKind::PrivateDataAddr => ctx.data_addr,
            SymKind::MainLogicPrivateDataAddr => ctx.main_pdo_addr,
            SymKind::SharedConstantDataObject(id) => *ctx
                .shared
                .get(id)
                .ok_or(CodegenError::UnknownSymbol("shared data object"))?,
            SymKind::ExternalCSymbol(name) => *ctx
                .symbols
                .get(name)
                .ok_or(CodegenError::UnknownSymbol(name))?,
            SymKind::StencilHole(ord) => {
                if *ord >= EXTRA_HOLE_BASE {
                    *ctx.extra_holes
                        .get(ord)
                        .ok_or(CodegenError::MissingOperand(*ord))?
                } else {
                    *operands
                        .get(*ord as usize)
                        .ok_or(CodegenError::MissingOperand(*ord))?
                }
            }
        };
        let val = (s as i64).wrapping_add(r.addend);
        let off = r.offset;
        match r.ty {
            RelocType::Abs64 => {
                dest[off..off + 8].copy_from_slice(&(val as u64).to_le_bytes());
            }
            RelocType::Abs32 => {
                let v = u32::try_from(val).map_err(|_| CodegenError::RelocOverflow("abs32"))?;
                dest[off..off + 4].copy_from_slice(&v.to_le_bytes());
            }
            RelocType::Abs32S => {
                let v = i32::try_from(val).map_err(|_| CodegenError::RelocOverflow("abs32s"))?;
                dest[off..off + 4].copy_from_slice(&v.to_le_bytes());
            }
            RelocType::Pc32 => {
                let p = section_addr as i64 + off as i64;
                let rel = val - p;
                let v = i32::try_from(rel).map_err(|_| CodegenError::RelocOverflow("pc32"))?;
                dest[off..off + 4].copy_from_slice(&v.to_le_bytes());
            }
        }
    }
    Ok(())
}

/// A relocatable template for one bytecode variant.
#[derive(Clone, Debug, Default)]
pub struct Stencil {
    pub fast_path_code: Vec<u8>,
    pub slow_path_code: Vec<u8>,
    /// Extracted inline-cache logic (one chain entry), when present.
    pub ic_path_code: Vec<u8>,
    pub fast_relos: Vec<RelocationRecord>,
    pub slow_relos: Vec<RelocationRecord>,
    pub ic_relos: Vec<RelocationRecord>,
    /// Shared blobs this stencil references (emitted once per process).
    pub shared_objects: Vec<SharedObjectId>,
    pub private_data: PrivateDataObject,
    /// Named constants resolved at stencil-build time (region sizes,
    /// label offsets such as the IC chain slot and continuation).
    pub label_distances: HashMap<&'static str, usize>,
    /// Conditional-branch fields in the fast path to late-patch.
    pub cond_br_fixups: Vec<CondBrLatePatchRecord>,
}

impl Stencil {
    pub fn label(&self, name: &'static str) -> usize {
        *self
            .label_distances
            .get(name)
            .unwrap_or_else(|| panic!("stencil has no label '{name}'"))
    }

    /// Patch helper for the fast path (patch logic only; the driver
    /// copies the bytes).
    pub fn codegen_fastpath(
        &self,
        section_addr: u64,
        dest: &mut [u8],
        ctx: &PatchContext<'_>,
        operands: &[u64],
    ) -> Result<(), CodegenError> {
        apply_relocations(section_addr, dest, &self.fast_relos, ctx, operands)
    }

    pub fn codegen_slowpath(
        &self,
        section_addr: u64,
        dest: &mut [u8],
        ctx: &PatchContext<'_>,
        operands: &[u64],
    ) -> Result<(), CodegenError> {
        apply_relocations(section_addr, dest, &self.slow_relos, ctx, operands)
    }

    pub fn codegen_icpath(
        &self,
        section_addr: u64,
        dest: &mut [u8],
        ctx: &PatchContext<'_>,
        operands: &[u64],
    ) -> Result<(), CodegenError> {
        apply_relocations(section_addr, dest, &self.ic_relos, ctx, operands)
    }

    pub fn codegen_datasec(
        &self,
        section_addr: u64,
        dest: &mut [u8],
        ctx: &PatchContext<'_>,
        operands: &[u64],
    ) -> Result<(), CodegenError> {
        apply_relocations(section_addr, dest, &self.private_data.relocations, ctx, operands)
    }

    /// Marker vector: true at every byte covered by a relocation field
    /// of the given section (audit and patch-completeness checks).
    pub fn reloc_marker(code_len: usize, relos: &[RelocationRecord]) -> Vec<bool> {
        let mut marks = vec![false; code_len];
        for r in relos {
            for i in r.offset..r.offset + r.field_len() {
                if i < marks.len() {
                    marks[i] = true;
                }
            }
        }
        marks
    }
}

/// Scan an assembled image for a run of 8 placeholder bytes: evidence
/// of an unpatched hole.
pub fn contains_placeholder_run(bytes: &[u8]) -> bool {
    bytes
        .windows(8)
        .any(|w| w.iter().all(|&b| b == PLACEHOLDER_BYTE))
}
