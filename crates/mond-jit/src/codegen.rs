//! The runtime codegen driver and the baseline-tier mutable state.
//!
//! For each bytecode of a function, in order: compute the fast/slow
//! destination offsets, copy the variant's pre-fixup bytes, and invoke
//! the variant's patch helpers with operands decoded from the
//! serialized SlowPathData. A late-patch pass then fills every
//! conditional-branch displacement once all bytecode addresses are
//! known. Property-access bytecodes register chain-growable IC sites.

use crate::arena::CodeArena;
use crate::library::{library, VariantKey};
use crate::stencil::{
    contains_placeholder_run, CodegenError, PatchContext, SharedObjectId, HOLE_IC_CHAIN,
    HOLE_IC_SITE,
};
use mond_bytecode::opcode::{Instruction, OpCode};
use mond_bytecode::operands::{operand_layout_variant, read_field, OperandKind};
use mond_core::structure::{SlotLocation, StructureId};
use mond_core::table::{GetByIdInfo, GetByIdKind};
use mond_vm::codeblock::{BaselineEntryFn, BaselineStub};
use mond_vm::ic::IC_CAPACITY;
use mond_vm::vm::Vm;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

// Packed-effect encoding shared with the IC hit helpers.
pub const PACKED_SLOT_MASK: u64 = 0xFFFF_FFFF;
pub const PACKED_BIT_INLINE: u64 = 1 << 32;
pub const PACKED_BIT_MAY: u64 = 1 << 33;
pub const PACKED_BIT_MUSTBENIL: u64 = 1 << 34;
pub const PACKED_BIT_CONST: u64 = 1 << 35;
pub const PACKED_SITE_SHIFT: u64 = 40;

/// A baseline-tier property-access site: where its chain-head slot
/// lives in the installed code, the continuation cell in the
/// function's data section, and the chain bookkeeping.
pub struct BaselineIcSite {
    pub variant: VariantKey,
    /// Address of the imm64 chain-head field inside the fast path.
    pub chain_patch_addr: usize,
    /// Current head of the effect chain.
    pub chain_head: usize,
    /// The slow-path miss handler (tail of every chain).
    pub miss_addr: usize,
    /// Cell holding the fast-path continuation address.
    pub cont_cell_addr: usize,
    /// SetField-with-k variants read their value from the constant
    /// pool; the miss/hit helpers need to know.
    pub value_is_const: bool,
    pub count: u8,
    pub demoted: bool,
    pub hits: u64,
}

/// Baseline-tier mutable process state: the code arena, the shared
/// constant data interning table, and every IC site ever created.
pub struct JitState {
    pub arena: CodeArena,
    pub shared: HashMap<SharedObjectId, u64>,
    pub ic_sites: Vec<BaselineIcSite>,
    /// Per-chain-entry hit counts, keyed by entry address.
    pub entry_hits: HashMap<u64, u64>,
}

static JIT: OnceLock<Option<Mutex<JitState>>> = OnceLock::new();

pub fn jit_state() -> Option<&'static Mutex<JitState>> {
    JIT.get_or_init(|| {
        CodeArena::new().ok().map(|arena| {
            Mutex::new(JitState {
                arena,
                shared: HashMap::new(),
                ic_sites: Vec::new(),
                entry_hits: HashMap::new(),
            })
        })
    })
    .as_ref()
}

/// (entries, hits, demoted) for a baseline IC site.
pub fn site_stats(site_id: usize) -> Option<(u8, u64, bool)> {
    let jit = jit_state()?.lock().ok()?;
    let site = jit.ic_sites.get(site_id)?;
    Some((site.count, site.hits, site.demoted))
}

pub(crate) fn site_value_is_const(site_id: usize) -> bool {
    jit_state()
        .and_then(|m| m.lock().ok().map(|j| j.ic_sites[site_id].value_is_const))
        .unwrap_or(false)
}

pub(crate) fn note_ic_hit(packed: u64, entry: u64) {
    let site = (packed >> PACKED_SITE_SHIFT) as usize;
    if let Some(m) = jit_state() {
        if let Ok(mut jit) = m.lock() {
            if let Some(s) = jit.ic_sites.get_mut(site) {
                s.hits += 1;
            }
            *jit.entry_hits.entry(entry).or_insert(0) += 1;
        }
    }
}

/// Per-instruction persisted operand record consumed by the codegen
/// helpers and the slow-path machinery.
#[derive(Clone, Debug)]
pub struct SlowPathData {
    pub op: OpCode,
    pub k: bool,
    /// Ordered operand values per the variant's layout; constant slots
    /// hold the constant's value bits.
    pub operands: Vec<u64>,
}

/// Per-function artifact owned by the installed BaselineStub.
pub struct BaselineData {
    pub slab_addr: usize,
    pub slab_len: usize,
    /// Slab offset of each bytecode's fast path.
    pub fast_offsets: Vec<u32>,
    /// Global IC site ids created for this function, in bytecode order.
    pub site_ids: Vec<u32>,
    pub slow_path_data: Vec<SlowPathData>,
}

fn is_ic_op(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::GetGlobal | OpCode::SetGlobal | OpCode::GetField | OpCode::SetField
    )
}

/// Bytecode index a variant's late-patched branch lands on.
fn cond_br_target(op: OpCode, inst: Instruction, pc: usize) -> Option<usize> {
    match op {
        OpCode::Jmp => Some((pc as i64 + 1 + inst.get_sj() as i64) as usize),
        OpCode::ForPrep | OpCode::ForLoop => Some((pc as i64 + 1 + inst.sbx() as i64) as usize),
        OpCode::Eq
        | OpCode::EqK
        | OpCode::Lt
        | OpCode::Le
        | OpCode::Test
        | OpCode::TestSet
        | OpCode::LFalseSkip => Some(pc + 2),
        _ => None,
    }
}

/// Generate baseline code for a code block and build the installable
/// stub.
pub fn compile_code_block(vm: &mut Vm, cb_idx: u32) -> Result<BaselineStub, CodegenError> {
    let lib = library();
    let (code, constants) = {
        let cb = &vm.code_blocks[cb_idx as usize];
        (cb.code.clone(), cb.constants.clone())
    };
    let n = code.len();

    // Pass 1: section offsets.
    let prologue_len = lib.prologue.fast_path_code.len();
    let mut fast_offsets: Vec<usize> = Vec::with_capacity(n);
    let mut slow_offsets: Vec<usize> = Vec::with_capacity(n);
    let mut fast_total = prologue_len;
    let mut slow_total = 0usize;
    let mut ic_count = 0usize;
    for inst in &code {
        let st = lib.variant(inst.opcode(), inst.k());
        fast_offsets.push(fast_total);
        fast_total += st.fast_path_code.len();
        slow_offsets.push(slow_total);
        slow_total += st.slow_path_code.len();
        if is_ic_op(inst.opcode()) {
            ic_count += 1;
        }
    }
    let slow_base = fast_total;
    let data_base = (fast_total + slow_total + 7) & !7;
    let data_len = n * 8 + ic_count * 8;
    let total = data_base + data_len;

    let state = jit_state().ok_or(CodegenError::ArenaUnavailable)?;
    let mut jit = state.lock().expect("jit state lock");

    // Shared constant data objects are emitted once per process and
    // interned by identity.
    for obj in &lib.shared_objects {
        if !jit.shared.contains_key(&obj.id) {
            let addr = jit.arena.alloc(obj.bytes.len(), obj.alignment)?;
            unsafe { jit.arena.install(addr, &obj.bytes) };
            jit.shared.insert(obj.id, addr as u64);
        }
    }

    let slab = jit.arena.alloc(total, 16)?;
    let mut image = vec![0u8; total];

    // Prologue: entry dispatch through the private data table.
    image[..prologue_len].copy_from_slice(&lib.prologue.fast_path_code);
    {
        let extra = HashMap::new();
        let ctx = PatchContext {
            fast_addr: slab as u64,
            slow_addr: (slab + slow_base) as u64,
            ic_addr: 0,
            data_addr: (slab + data_base) as u64,
            main_pdo_addr: (slab + data_base) as u64,
            symbols: &lib.symbols,
            shared: &jit.shared,
            extra_holes: &extra,
        };
        lib.prologue
            .codegen_fastpath(slab as u64, &mut image[..prologue_len], &ctx, &[])?;
    }

    // Pass 2: copy each variant's pre-fixup bytes (the driver owns the
    // copies so identical-stencil runs could be coalesced) and run the
    // patch helpers with the decoded SlowPathData.
    let mut slow_path_data = Vec::with_capacity(n);
    let mut site_ids = Vec::with_capacity(ic_count);
    for (i, inst) in code.iter().enumerate() {
        let op = inst.opcode();
        let st = lib.variant(op, inst.k());
        let fast_off = fast_offsets[i];
        let slow_off = slow_base + slow_offsets[i];
        let flen = st.fast_path_code.len();
        let slen = st.slow_path_code.len();
        image[fast_off..fast_off + flen].copy_from_slice(&st.fast_path_code);
        image[slow_off..slow_off + slen].copy_from_slice(&st.slow_path_code);

        // The bytecode operand vector, per the variant's layout.
        let layout = operand_layout_variant(op, inst.k());
        let mut operands = Vec::with_capacity(layout.len());
        for slot in layout {
            let raw = read_field(*inst, slot.field);
            operands.push(match slot.kind {
                OperandKind::Constant => constants[raw as usize].raw_bits(),
                _ => raw,
            });
        }

        let mut extra = HashMap::new();
        if is_ic_op(op) {
            let site_ord = site_ids.len();
            let cell_off = data_base + n * 8 + site_ord * 8;
            let cont_addr = slab + fast_off + st.label("ic_continuation");
            let miss_addr = slab + slow_off;
            let chain_patch_addr = slab + fast_off + st.label("ic_chain_imm");
            let global_site = jit.ic_sites.len();
            jit.ic_sites.push(BaselineIcSite {
                variant: VariantKey::of(op, inst.k()),
                chain_patch_addr,
                chain_head: miss_addr,
                miss_addr,
                cont_cell_addr: slab + cell_off,
                value_is_const: matches!(op, OpCode::SetField) && inst.k(),
                count: 0,
                demoted: false,
                hits: 0,
            });
            site_ids.push(global_site as u32);
            extra.insert(HOLE_IC_SITE, global_site as u64);
            extra.insert(HOLE_IC_CHAIN, miss_addr as u64);
            image[cell_off..cell_off + 8].copy_from_slice(&(cont_addr as u64).to_le_bytes());
        }

        let ctx = PatchContext {
            fast_addr: (slab + fast_off) as u64,
            slow_addr: (slab + slow_off) as u64,
            ic_addr: 0,
            data_addr: (slab + data_base) as u64,
            main_pdo_addr: (slab + data_base) as u64,
            symbols: &lib.symbols,
            shared: &jit.shared,
            extra_holes: &extra,
        };
        st.codegen_fastpath(
            (slab + fast_off) as u64,
            &mut image[fast_off..fast_off + flen],
            &ctx,
            &operands,
        )?;
        st.codegen_slowpath(
            (slab + slow_off) as u64,
            &mut image[slow_off..slow_off + slen],
            &ctx,
            &operands,
        )?;

        slow_path_data.push(SlowPathData {
            op,
            k: inst.k(),
            operands,
        });
    }

    // Entry dispatch table: absolute fast-path address per bytecode.
    for (i, &off) in fast_offsets.iter().enumerate() {
        let entry = (slab + off) as u64;
        image[data_base + i * 8..data_base + i * 8 + 8].copy_from_slice(&entry.to_le_bytes());
    }

    // Late-patch pass: conditional-branch displacements, now that every
    // bytecode's native address is known (targets may be earlier or
    // later in the function).
    for (i, inst) in code.iter().enumerate() {
        let op = inst.opcode();
        let st = lib.variant(op, inst.k());
        if st.cond_br_fixups.is_empty() {
            continue;
        }
        let target = cond_br_target(op, *inst, i)
            .ok_or(CodegenError::RelocOverflow("late patch without target"))?;
        let target_off = if target < n {
            fast_offsets[target]
        } else if target == n {
            // Branch to function end: no instruction follows; this is
            // malformed bytecode (functions end in Return).
            return Err(CodegenError::RelocOverflow("branch past function end"));
        } else {
            return Err(CodegenError::RelocOverflow("branch target out of range"));
        };
        for rec in &st.cond_br_fixups {
            let field = fast_offsets[i] + rec.offset;
            let rel = target_off as i64 - (field as i64 + 4);
            let rel = i32::try_from(rel).map_err(|_| CodegenError::RelocOverflow("cond br"))?;
            image[field..field + 4].copy_from_slice(&rel.to_le_bytes());
        }
    }

    // Patch completeness: no placeholder bit patterns may survive.
    if contains_placeholder_run(&image) {
        return Err(CodegenError::RelocOverflow("unpatched placeholder"));
    }

    unsafe { jit.arena.install(slab, &image) };

    // Safety: the slab now holds a complete function image following
    // the BaselineEntryFn ABI.
    let enter: BaselineEntryFn = unsafe { std::mem::transmute(slab) };
    Ok(BaselineStub {
        enter,
        code_offsets: fast_offsets.iter().map(|&o| o as u32).collect(),
        keepalive: Box::new(BaselineData {
            slab_addr: slab,
            slab_len: total,
            fast_offsets: fast_offsets.iter().map(|&o| o as u32).collect(),
            site_ids,
            slow_path_data,
        }),
    })
}

// ---- IC chain growth (the IC-path codegen) ----

fn packed_for_get(info: &GetByIdInfo) -> Option<u64> {
    let mut packed = match info.kind {
        GetByIdKind::Inline(i) => i as u64 | PACKED_BIT_INLINE,
        GetByIdKind::Outline(o) => o as u64,
        GetByIdKind::MustBeNil { cacheable: true } => PACKED_BIT_MUSTBENIL,
        GetByIdKind::MustBeNil { cacheable: false } => return None,
    };
    if info.may_have_metatable {
        packed |= PACKED_BIT_MAY;
    }
    Some(packed)
}

/// Grow a get-site's chain with the effect observed by a miss.
pub fn append_get_effect(site_id: usize, structure: StructureId, info: &GetByIdInfo, dest: u64) {
    if let Some(packed) = packed_for_get(info) {
        append_effect(site_id, structure.0, packed, dest);
    }
}

/// Grow a put-site's chain with an existing-slot observation.
pub fn append_put_effect(
    site_id: usize,
    structure: StructureId,
    loc: SlotLocation,
    may_have_metatable: bool,
    valspec: u64,
) {
    let mut packed = match loc {
        SlotLocation::Inline(i) => i as u64 | PACKED_BIT_INLINE,
        SlotLocation::Outline(o) => o as u64,
    };
    if may_have_metatable {
        packed |= PACKED_BIT_MAY;
    }
    if site_value_is_const(site_id) {
        packed |= PACKED_BIT_CONST;
    }
    append_effect(site_id, structure.0, packed, valspec);
}

/// Instantiate one IC effect from the variant's extracted IC path and
/// prepend it to the site's chain.
fn append_effect(site_id: usize, structure_id: u32, packed: u64, spec: u64) {
    let Some(state) = jit_state() else { return };
    let lib = library();
    let Ok(mut jit) = state.lock() else { return };

    let (variant, cont_cell, chain_head, chain_patch, count, demoted) = {
        let site = &jit.ic_sites[site_id];
        (
            site.variant,
            site.cont_cell_addr,
            site.chain_head,
            site.chain_patch_addr,
            site.count,
            site.demoted,
        )
    };
    if demoted {
        return;
    }
    if count as usize >= IC_CAPACITY {
        jit.ic_sites[site_id].demoted = true;
        return;
    }

    let st = lib.variant(variant.op, variant.k);
    let mut buf = st.ic_path_code.clone();
    let entry = match jit.arena.alloc(buf.len(), 16) {
        Ok(a) => a,
        Err(_) => {
            jit.ic_sites[site_id].demoted = true;
            return;
        }
    };

    let packed = packed | ((site_id as u64) << PACKED_SITE_SHIFT);
    let operands = [structure_id as u64, packed, spec, chain_head as u64];
    let extra = HashMap::new();
    let ctx = PatchContext {
        fast_addr: 0,
        slow_addr: 0,
        ic_addr: entry as u64,
        data_addr: 0,
        main_pdo_addr: cont_cell as u64,
        symbols: &lib.symbols,
        shared: &jit.shared,
        extra_holes: &extra,
    };
    if st.codegen_icpath(entry as u64, &mut buf, &ctx, &operands).is_err() {
        jit.ic_sites[site_id].demoted = true;
        return;
    }
    unsafe {
        jit.arena.install(entry, &buf);
        // Re-point the fast path's chain-head slot at the new entry.
        std::ptr::write_unaligned(chain_patch as *mut u64, entry as u64);
    }
    let site = &mut jit.ic_sites[site_id];
    site.chain_head = entry;
    site.count += 1;
}
