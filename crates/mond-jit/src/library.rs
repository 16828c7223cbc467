//! The offline stencil pipeline.
//!
//! Each bytecode variant's reference implementation is the same Rust
//! routine the interpreter semantics use; the template for a variant
//! marshals its operand holes into the helper's argument registers and
//! calls it, with control-flow variants branching on the helper's
//! verdict. The pipeline runs once per process into a singleton
//! library.
//!
//! Register conventions inside generated code:
//! - rbx: VM pointer
//! - r14: frame base (absolute slot of register 0)
//! - r13: property-access scratch (table bits live across IC dispatch)

use crate::emitter::{Asm, Cond, Reg};
use crate::runtime;
use crate::stencil::{
    SharedConstantDataObject, SharedObjectId, Stencil, SymKind, HOLE_IC_CHAIN, HOLE_IC_SITE,
};
use mond_bytecode::opcode::OpCode;
use std::collections::HashMap;
use std::sync::OnceLock;

/// A bytecode shape specialized on operand kinds. The k flag refines
/// SetField/SetIndex (value from constant pool vs register).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VariantKey {
    pub op: OpCode,
    pub k: bool,
}

impl VariantKey {
    pub fn of(op: OpCode, k: bool) -> Self {
        // Only the value-source flag distinguishes codegen variants.
        let k = k && matches!(op, OpCode::SetField | OpCode::SetIndex);
        VariantKey { op, k }
    }
}

/// One helper argument: an operand hole or a build-time immediate.
#[derive(Clone, Copy)]
enum ArgSpec {
    Hole(u32),
    Imm(u64),
}

use ArgSpec::{Hole, Imm};

const ARG_REGS: [Reg; 4] = [Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Arithmetic operator encodings shared with the runtime helpers.
pub const ARITH_ADD: u64 = 0;
pub const ARITH_SUB: u64 = 1;
pub const ARITH_MUL: u64 = 2;
pub const ARITH_DIV: u64 = 3;
pub const ARITH_MOD: u64 = 4;
pub const ARITH_POW: u64 = 5;

pub struct StencilLibrary {
    pub prologue: Stencil,
    variants: HashMap<VariantKey, Stencil>,
    pub shared_objects: Vec<SharedConstantDataObject>,
    pub symbols: HashMap<&'static str, u64>,
}

impl StencilLibrary {
    pub fn variant(&self, op: OpCode, k: bool) -> &Stencil {
        self.variants
            .get(&VariantKey::of(op, k))
            .expect("every opcode has a stencil")
    }
}

/// The process-wide stencil library, built on first use.
pub fn library() -> &'static StencilLibrary {
    static LIB: OnceLock<StencilLibrary> = OnceLock::new();
    LIB.get_or_init(build_library)
}

fn build_library() -> StencilLibrary {
    let mut variants = HashMap::new();
    let mut add = |op: OpCode, k: bool, s: Stencil| {
        variants.insert(VariantKey::of(op, k), s);
    };

    add(OpCode::Move, false, plain("jit_rt_move", &[Hole(0), Hole(1)]));
    add(OpCode::LoadK, false, plain("jit_rt_load_k", &[Hole(0), Hole(1)]));
    add(
        OpCode::LoadNil,
        false,
        plain("jit_rt_load_nil", &[Hole(0), Hole(1)]),
    );
    add(OpCode::LoadTrue, false, load_bool(true, false));
    add(OpCode::LoadFalse, false, load_bool(false, false));
    add(OpCode::LFalseSkip, false, load_bool(false, true));
    add(
        OpCode::NewTable,
        false,
        plain("jit_rt_new_table", &[Hole(0), Hole(1), Hole(2)]),
    );
    add(OpCode::GetGlobal, false, ic_get(None, 0, 1));
    add(OpCode::SetGlobal, false, ic_put(None, 1, 0));
    add(
        OpCode::GetUpval,
        false,
        plain("jit_rt_get_upval", &[Hole(0), Hole(1)]),
    );
    add(
        OpCode::SetUpval,
        false,
        plain("jit_rt_set_upval", &[Hole(0), Hole(1)]),
    );
    add(OpCode::GetField, false, ic_get(Some(1), 0, 2));
    for k in [false, true] {
        add(OpCode::SetField, k, ic_put(Some(0), 1, 2));
        add(
            OpCode::SetIndex,
            k,
            plain(
                "jit_rt_set_index",
                &[Hole(0), Hole(1), Hole(2), Imm(k as u64)],
            ),
        );
    }
    add(
        OpCode::GetIndex,
        false,
        plain("jit_rt_get_index", &[Hole(0), Hole(1), Hole(2)]),
    );

    for (op, code) in [
        (OpCode::Add, ARITH_ADD),
        (OpCode::Sub, ARITH_SUB),
        (OpCode::Mul, ARITH_MUL),
        (OpCode::Div, ARITH_DIV),
        (OpCode::Mod, ARITH_MOD),
        (OpCode::Pow, ARITH_POW),
    ] {
        add(
            op,
            false,
            plain("jit_rt_arith", &[Imm(code), Hole(0), Hole(1), Hole(2)]),
        );
    }
    for (op, code) in [
        (OpCode::AddK, ARITH_ADD),
        (OpCode::SubK, ARITH_SUB),
        (OpCode::MulK, ARITH_MUL),
        (OpCode::DivK, ARITH_DIV),
        (OpCode::ModK, ARITH_MOD),
        (OpCode::PowK, ARITH_POW),
    ] {
        add(
            op,
            false,
            plain("jit_rt_arith_k", &[Imm(code), Hole(0), Hole(1), Hole(2)]),
        );
    }

    add(OpCode::Unm, false, plain("jit_rt_unm", &[Hole(0), Hole(1)]));
    add(OpCode::Not, false, plain("jit_rt_not", &[Hole(0), Hole(1)]));
    add(OpCode::Len, false, plain("jit_rt_len", &[Hole(0), Hole(1)]));
    add(
        OpCode::Concat,
        false,
        plain("jit_rt_concat", &[Hole(0), Hole(1)]),
    );

    add(OpCode::Jmp, false, jump_only());
    add(
        OpCode::Eq,
        false,
        branch("jit_rt_eq", &[Hole(0), Hole(1), Hole(2)]),
    );
    add(
        OpCode::EqK,
        false,
        branch("jit_rt_eq_k", &[Hole(0), Hole(1), Hole(2)]),
    );
    add(
        OpCode::Lt,
        false,
        branch("jit_rt_lt", &[Hole(0), Hole(1), Hole(2)]),
    );
    add(
        OpCode::Le,
        false,
        branch("jit_rt_le", &[Hole(0), Hole(1), Hole(2)]),
    );
    add(OpCode::Test, false, branch("jit_rt_test", &[Hole(0), Hole(1)]));
    add(
        OpCode::TestSet,
        false,
        branch("jit_rt_test_set", &[Hole(0), Hole(1), Hole(2)]),
    );

    add(
        OpCode::Call,
        false,
        plain("jit_rt_call", &[Hole(0), Hole(1), Hole(2)]),
    );
    add(OpCode::TailCall, false, tail_call("jit_rt_tailcall", &[Hole(0), Hole(1)]));
    add(OpCode::Return, false, return_shape("jit_rt_return", &[Hole(0), Hole(1)]));
    add(
        OpCode::VarArg,
        false,
        plain("jit_rt_vararg", &[Hole(0), Hole(1)]),
    );
    add(
        OpCode::Closure,
        false,
        plain("jit_rt_closure", &[Hole(0), Hole(1)]),
    );
    add(OpCode::Close, false, plain("jit_rt_close", &[Hole(0)]));
    add(OpCode::ForPrep, false, for_prep("jit_rt_forprep", &[Hole(0)]));
    add(OpCode::ForLoop, false, branch("jit_rt_forloop", &[Hole(0)]));
    add(
        OpCode::SetList,
        false,
        plain("jit_rt_setlist", &[Hole(0), Hole(1), Hole(2)]),
    );

    StencilLibrary {
        prologue: prologue(),
        variants,
        shared_objects: vec![SharedConstantDataObject::define(SharedObjectId::BoolPair)],
        symbols: runtime::symbol_table(),
    }
}

// ---- Emission helpers ----

fn emit_vm_args(a: &mut Asm) {
    a.mov_reg_reg(Reg::Rdi, Reg::Rbx);
    a.mov_reg_reg(Reg::Rsi, Reg::R14);
}

fn emit_extra_args(a: &mut Asm, specs: &[ArgSpec]) {
    debug_assert!(specs.len() <= ARG_REGS.len());
    for (i, spec) in specs.iter().enumerate() {
        match spec {
            Hole(ord) => {
                a.mov_reg_imm64_reloc(ARG_REGS[i], SymKind::StencilHole(*ord), 0);
            }
            Imm(v) => a.mov_reg_imm64(ARG_REGS[i], *v),
        }
    }
}

fn emit_helper_call(a: &mut Asm, sym: &'static str) {
    a.mov_reg_imm64_reloc(Reg::Rax, SymKind::ExternalCSymbol(sym), 0);
    a.call_rax();
}

fn finish(fast: Asm, slow: Asm) -> Stencil {
    let mut s = Stencil {
        fast_path_code: fast.code,
        slow_path_code: slow.code,
        fast_relos: fast.relos,
        slow_relos: slow.relos,
        cond_br_fixups: fast.cond_brs,
        ..Stencil::default()
    };
    debug_assert!(slow.cond_brs.is_empty());
    s.label_distances.insert("fastpath_len", s.fast_path_code.len());
    s.label_distances.insert("slowpath_len", s.slow_path_code.len());
    s
}

fn epilogue_only() -> Asm {
    let mut slow = Asm::new();
    slow.epilogue();
    slow
}

/// Straight-line op: call the helper, exit on negative status.
fn plain(sym: &'static str, specs: &[ArgSpec]) -> Stencil {
    let mut fast = Asm::new();
    emit_vm_args(&mut fast);
    emit_extra_args(&mut fast, specs);
    emit_helper_call(&mut fast, sym);
    fast.test_rax();
    fast.jcc_reloc(Cond::Sign, SymKind::SlowPathAddr, -4);
    finish(fast, epilogue_only())
}

/// Conditional op: helper answers 1 (take the branch), 0 (fall
/// through), negative (error). The branch field is late-patched.
fn branch(sym: &'static str, specs: &[ArgSpec]) -> Stencil {
    let mut fast = Asm::new();
    emit_vm_args(&mut fast);
    emit_extra_args(&mut fast, specs);
    emit_helper_call(&mut fast, sym);
    fast.cmp_rax_imm8(1);
    fast.jcc_condbr(Cond::Eq);
    fast.test_rax();
    fast.jcc_reloc(Cond::Sign, SymKind::SlowPathAddr, -4);
    finish(fast, epilogue_only())
}

/// Unconditional intra-function jump; target late-patched.
fn jump_only() -> Stencil {
    let mut fast = Asm::new();
    fast.jmp_condbr();
    finish(fast, Asm::new())
}

/// ForPrep: set up the loop registers, then always jump to the loop
/// tail.
fn for_prep(sym: &'static str, specs: &[ArgSpec]) -> Stencil {
    let mut fast = Asm::new();
    emit_vm_args(&mut fast);
    emit_extra_args(&mut fast, specs);
    emit_helper_call(&mut fast, sym);
    fast.test_rax();
    fast.jcc_reloc(Cond::Sign, SymKind::SlowPathAddr, -4);
    fast.jmp_condbr();
    finish(fast, epilogue_only())
}

/// Return: the helper delivers results and pops the frame; the status
/// it leaves in rax rides the epilogue out.
fn return_shape(sym: &'static str, specs: &[ArgSpec]) -> Stencil {
    let mut fast = Asm::new();
    emit_vm_args(&mut fast);
    emit_extra_args(&mut fast, specs);
    emit_helper_call(&mut fast, sym);
    fast.epilogue();
    finish(fast, Asm::new())
}

/// TailCall: any nonzero status (frame replaced, or error) exits with
/// that status; zero falls through to the following Return.
fn tail_call(sym: &'static str, specs: &[ArgSpec]) -> Stencil {
    let mut fast = Asm::new();
    emit_vm_args(&mut fast);
    emit_extra_args(&mut fast, specs);
    emit_helper_call(&mut fast, sym);
    fast.test_rax();
    fast.jcc_reloc(Cond::Ne, SymKind::SlowPathAddr, -4);
    finish(fast, epilogue_only())
}

/// LoadTrue/LoadFalse/LFalseSkip: read the boolean bit pattern from
/// the shared constant pair, store it, optionally skip the next
/// bytecode.
fn load_bool(value: bool, skip: bool) -> Stencil {
    let mut fast = Asm::new();
    fast.mov_rax_rip_shared(SharedObjectId::BoolPair, if value { 8 } else { 0 });
    emit_vm_args(&mut fast);
    fast.mov_reg_imm64_reloc(Reg::Rdx, SymKind::StencilHole(0), 0);
    fast.mov_reg_reg(Reg::Rcx, Reg::Rax);
    emit_helper_call(&mut fast, "jit_rt_write_reg");
    if skip {
        fast.jmp_condbr();
    }
    let mut s = finish(fast, Asm::new());
    s.shared_objects.push(SharedObjectId::BoolPair);
    s
}

/// GetById with inline-cache dispatch. The fast path loads the base
/// (a register, or the globals table), parks its bits in r13, and
/// jumps through the site's chain-head slot. The slow path is the miss
/// handler; the IC path is one extracted chain entry.
///
/// `table_reg_ord`: operand hole of the base register (None = globals).
/// `dest_ord`: operand hole of the destination register.
/// `key_ord`: operand hole of the key constant (value bits).
fn ic_get(table_reg_ord: Option<u32>, dest_ord: u32, key_ord: u32) -> Stencil {
    let mut s = ic_common(table_reg_ord, |slow, cont_off| {
        emit_vm_args(slow);
        slow.mov_reg_reg(Reg::Rdx, Reg::R13);
        slow.mov_reg_imm64_reloc(Reg::Rcx, SymKind::StencilHole(HOLE_IC_SITE), 0);
        slow.mov_reg_imm64_reloc(Reg::R8, SymKind::StencilHole(dest_ord), 0);
        slow.mov_reg_imm64_reloc(Reg::R9, SymKind::StencilHole(key_ord), 0);
        emit_helper_call(slow, "jit_rt_get_by_id_miss");
        slow.test_rax();
        let err = slow.jcc_local(Cond::Sign);
        slow.jmp_reloc(SymKind::FastPathAddr, cont_off as i64 - 4);
        slow.bind(err);
        slow.epilogue();
    });
    let (code, relos) = ic_effect_template("jit_rt_ic_hit");
    s.ic_path_code = code;
    s.ic_relos = relos;
    s
}

/// PutById with inline-cache dispatch.
fn ic_put(table_reg_ord: Option<u32>, key_ord: u32, valspec_ord: u32) -> Stencil {
    let mut s = ic_common(table_reg_ord, |slow, cont_off| {
        emit_vm_args(slow);
        slow.mov_reg_reg(Reg::Rdx, Reg::R13);
        slow.mov_reg_imm64_reloc(Reg::Rcx, SymKind::StencilHole(HOLE_IC_SITE), 0);
        slow.mov_reg_imm64_reloc(Reg::R8, SymKind::StencilHole(key_ord), 0);
        slow.mov_reg_imm64_reloc(Reg::R9, SymKind::StencilHole(valspec_ord), 0);
        emit_helper_call(slow, "jit_rt_put_by_id_miss");
        slow.test_rax();
        let err = slow.jcc_local(Cond::Sign);
        slow.jmp_reloc(SymKind::FastPathAddr, cont_off as i64 - 4);
        slow.bind(err);
        slow.epilogue();
    });
    let (code, relos) = ic_effect_template("jit_rt_ic_put_hit");
    s.ic_path_code = code;
    s.ic_relos = relos;
    s
}

fn ic_common(
    table_reg_ord: Option<u32>,
    build_miss: impl FnOnce(&mut Asm, usize),
) -> Stencil {
    let mut fast = Asm::new();
    match table_reg_ord {
        Some(ord) => {
            emit_vm_args(&mut fast);
            fast.mov_reg_imm64_reloc(Reg::Rdx, SymKind::StencilHole(ord), 0);
            emit_helper_call(&mut fast, "jit_rt_read_reg");
        }
        None => {
            fast.mov_reg_reg(Reg::Rdi, Reg::Rbx);
            emit_helper_call(&mut fast, "jit_rt_globals_bits");
        }
    }
    fast.mov_reg_reg(Reg::R13, Reg::Rax);
    let chain_imm = fast.mov_reg_imm64_reloc(Reg::Rax, SymKind::StencilHole(HOLE_IC_CHAIN), 0);
    fast.jmp_rax();
    let continuation = fast.here();

    let mut slow = Asm::new();
    build_miss(&mut slow, continuation);

    let mut s = finish(fast, slow);
    s.label_distances.insert("ic_chain_imm", chain_imm);
    s.label_distances.insert("ic_continuation", continuation);
    s
}

/// One IC chain entry: compare the observed structure identity, apply
/// the recorded effect on a hit, fall to the next entry (or the miss
/// handler) otherwise.
///
/// IC hole ordinals: 0 = expected structure id, 1 = packed effect,
/// 2 = destination register / value spec, 3 = next-in-chain address.
fn ic_effect_template(hit_sym: &'static str) -> (Vec<u8>, Vec<crate::stencil::RelocationRecord>) {
    let mut a = Asm::new();
    a.mov_reg_reg(Reg::Rdi, Reg::Rbx);
    a.mov_reg_reg(Reg::Rsi, Reg::R13);
    emit_helper_call(&mut a, "jit_rt_structure_id");
    a.mov_reg_imm64_reloc(Reg::Rcx, SymKind::StencilHole(0), 0);
    a.cmp_rax_rcx();
    let miss1 = a.jcc_local(Cond::Ne);

    emit_vm_args(&mut a);
    a.mov_reg_reg(Reg::Rdx, Reg::R13);
    a.mov_reg_imm64_reloc(Reg::Rcx, SymKind::StencilHole(1), 0);
    a.mov_reg_imm64_reloc(Reg::R8, SymKind::StencilHole(2), 0);
    a.mov_reg_imm64_reloc(Reg::R9, SymKind::IcPathAddr, 0);
    emit_helper_call(&mut a, hit_sym);
    a.cmp_rax_imm8(1);
    let miss2 = a.jcc_local(Cond::Ne);

    // Hit: continue the main fast path through the site's
    // continuation cell in the main logic's private data.
    a.mov_reg_imm64_reloc(Reg::Rax, SymKind::MainLogicPrivateDataAddr, 0);
    a.mov_rax_deref_rax();
    a.jmp_rax();

    // Miss: chain to the next entry (initially the slow-path miss
    // handler).
    a.bind(miss1);
    a.bind(miss2);
    a.mov_reg_imm64_reloc(Reg::Rax, SymKind::StencilHole(3), 0);
    a.jmp_rax();

    (a.code, a.relos)
}

/// The function entry: save callee-saved registers, adopt the helper
/// register conventions, and dispatch through the entry table in the
/// private data section to the requested bytecode.
fn prologue() -> Stencil {
    let mut a = Asm::new();
    a.push_reg(Reg::Rbp);
    a.mov_reg_reg(Reg::Rbp, Reg::Rsp);
    a.push_reg(Reg::Rbx);
    a.push_reg(Reg::R13);
    a.push_reg(Reg::R14);
    a.push_reg(Reg::R15);
    a.mov_reg_reg(Reg::Rbx, Reg::Rdi);
    a.mov_reg_reg(Reg::R14, Reg::Rsi);
    a.mov_reg_imm64_reloc(Reg::Rax, SymKind::PrivateDataAddr, 0);
    a.mov_rax_index_rdx8();
    a.jmp_rax();

    let mut s = Stencil {
        fast_path_code: a.code,
        fast_relos: a.relos,
        ..Stencil::default()
    };
    s.private_data.alignment = 8;
    s.label_distances.insert("fastpath_len", s.fast_path_code.len());
    s
}
