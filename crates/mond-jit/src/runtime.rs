//! Runtime helpers called from generated code.
//!
//! These are the external symbols the stencils reference. Each one is a
//! thin `extern "C"` shell over the same routines that define the
//! interpreter's semantics, so both tiers observe identical behavior.
//! Status protocol: 0 = continue, 1 = take the branch (conditional
//! variants), SIG_TAILCALL = frame replaced, negative = error pending
//! in `vm.pending_error`.

use crate::codegen::{
    self, PACKED_BIT_CONST, PACKED_BIT_INLINE, PACKED_BIT_MAY, PACKED_BIT_MUSTBENIL,
    PACKED_SITE_SHIFT, PACKED_SLOT_MASK,
};
use crate::library::{ARITH_ADD, ARITH_DIV, ARITH_MOD, ARITH_MUL, ARITH_POW, ARITH_SUB};
use mond_bytecode::module::UpvalueDesc;
use mond_core::structure::SlotLocation;
use mond_core::table::NO_ALLOC_SITE;
use mond_core::value::TValue;
use mond_vm::arith::ArithOp;
use mond_vm::codeblock::{SIG_ERROR, SIG_RETURN, SIG_TAILCALL};
use mond_vm::error::LuaError;
use mond_vm::interp;
use mond_vm::vm::Vm;
use std::collections::HashMap;

/// Fixed symbol table handed to the stencil library: every helper a
/// template may reference, keyed by name.
pub fn symbol_table() -> HashMap<&'static str, u64> {
    let mut t: HashMap<&'static str, u64> = HashMap::new();
    t.insert("jit_rt_move", jit_rt_move as *const u8 as u64);
    t.insert("jit_rt_load_k", jit_rt_load_k as *const u8 as u64);
    t.insert("jit_rt_load_nil", jit_rt_load_nil as *const u8 as u64);
    t.insert("jit_rt_write_reg", jit_rt_write_reg as *const u8 as u64);
    t.insert("jit_rt_new_table", jit_rt_new_table as *const u8 as u64);
    t.insert("jit_rt_get_upval", jit_rt_get_upval as *const u8 as u64);
    t.insert("jit_rt_set_upval", jit_rt_set_upval as *const u8 as u64);
    t.insert("jit_rt_get_index", jit_rt_get_index as *const u8 as u64);
    t.insert("jit_rt_set_index", jit_rt_set_index as *const u8 as u64);
    t.insert("jit_rt_arith", jit_rt_arith as *const u8 as u64);
    t.insert("jit_rt_arith_k", jit_rt_arith_k as *const u8 as u64);
    t.insert("jit_rt_unm", jit_rt_unm as *const u8 as u64);
    t.insert("jit_rt_not", jit_rt_not as *const u8 as u64);
    t.insert("jit_rt_len", jit_rt_len as *const u8 as u64);
    t.insert("jit_rt_concat", jit_rt_concat as *const u8 as u64);
    t.insert("jit_rt_eq", jit_rt_eq as *const u8 as u64);
    t.insert("jit_rt_eq_k", jit_rt_eq_k as *const u8 as u64);
    t.insert("jit_rt_lt", jit_rt_lt as *const u8 as u64);
    t.insert("jit_rt_le", jit_rt_le as *const u8 as u64);
    t.insert("jit_rt_test", jit_rt_test as *const u8 as u64);
    t.insert("jit_rt_test_set", jit_rt_test_set as *const u8 as u64);
    t.insert("jit_rt_call", jit_rt_call as *const u8 as u64);
    t.insert("jit_rt_tailcall", jit_rt_tailcall as *const u8 as u64);
    t.insert("jit_rt_return", jit_rt_return as *const u8 as u64);
    t.insert("jit_rt_vararg", jit_rt_vararg as *const u8 as u64);
    t.insert("jit_rt_closure", jit_rt_closure as *const u8 as u64);
    t.insert("jit_rt_close", jit_rt_close as *const u8 as u64);
    t.insert("jit_rt_forprep", jit_rt_forprep as *const u8 as u64);
    t.insert("jit_rt_forloop", jit_rt_forloop as *const u8 as u64);
    t.insert("jit_rt_setlist", jit_rt_setlist as *const u8 as u64);
    t.insert("jit_rt_read_reg", jit_rt_read_reg as *const u8 as u64);
    t.insert("jit_rt_globals_bits", jit_rt_globals_bits as *const u8 as u64);
    t.insert("jit_rt_structure_id", jit_rt_structure_id as *const u8 as u64);
    t.insert("jit_rt_ic_hit", jit_rt_ic_hit as *const u8 as u64);
    t.insert("jit_rt_ic_put_hit", jit_rt_ic_put_hit as *const u8 as u64);
    t.insert(
        "jit_rt_get_by_id_miss",
        jit_rt_get_by_id_miss as *const u8 as u64,
    );
    t.insert(
        "jit_rt_put_by_id_miss",
        jit_rt_put_by_id_miss as *const u8 as u64,
    );
    t
}

fn fail(vm: &mut Vm, e: LuaError) -> i64 {
    vm.pending_error = Some(e);
    SIG_ERROR
}

fn ok_or_fail(vm: &mut Vm, r: Result<(), LuaError>) -> i64 {
    match r {
        Ok(()) => 0,
        Err(e) => fail(vm, e),
    }
}

fn decode_arith(op: u64) -> ArithOp {
    match op {
        ARITH_ADD => ArithOp::Add,
        ARITH_SUB => ArithOp::Sub,
        ARITH_MUL => ArithOp::Mul,
        ARITH_DIV => ArithOp::Div,
        ARITH_MOD => ArithOp::Mod,
        ARITH_POW => ArithOp::Pow,
        _ => ArithOp::Add,
    }
}

// ---- Register and constant plumbing ----

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_move(vm: *mut Vm, base: u64, a: u64, b: u64) -> i64 {
    let vm = &mut *vm;
    vm.stack[(base + a) as usize] = vm.stack[(base + b) as usize];
    0
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_load_k(vm: *mut Vm, base: u64, a: u64, bits: u64) -> i64 {
    let vm = &mut *vm;
    vm.stack[(base + a) as usize] = TValue::from_raw_bits(bits);
    0
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_load_nil(vm: *mut Vm, base: u64, a: u64, b: u64) -> i64 {
    let vm = &mut *vm;
    for i in a..=a + b {
        vm.stack[(base + i) as usize] = TValue::nil();
    }
    0
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_write_reg(vm: *mut Vm, base: u64, a: u64, bits: u64) -> i64 {
    let vm = &mut *vm;
    vm.stack[(base + a) as usize] = TValue::from_raw_bits(bits);
    0
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_new_table(
    vm: *mut Vm,
    base: u64,
    a: u64,
    hint: u64,
    ordinal: u64,
) -> i64 {
    let vm = &mut *vm;
    let cb_idx = vm.frames.last().expect("frame").code_block as usize;
    let site_id = vm.code_blocks[cb_idx]
        .alloc_site_ids
        .get(ordinal as usize)
        .copied()
        .unwrap_or(NO_ALLOC_SITE);
    let observed = if site_id == NO_ALLOC_SITE {
        0
    } else {
        vm.alloc_sites[site_id as usize]
    };
    let t = vm.heap.alloc_table(observed, hint as usize);
    vm.heap.get_table_mut(t).alloc_site = site_id;
    vm.stack[(base + a) as usize] = TValue::from_table(t);
    if vm.heap.should_collect() {
        vm.collect_garbage();
    }
    0
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_get_upval(vm: *mut Vm, base: u64, a: u64, b: u64) -> i64 {
    let vm = &mut *vm;
    let cl = vm.frames.last().expect("frame").closure.expect("closure");
    let uv = vm.heap.get_closure(cl).upvalues[b as usize];
    vm.stack[(base + a) as usize] = vm.upval_value(uv);
    0
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_set_upval(vm: *mut Vm, base: u64, a: u64, b: u64) -> i64 {
    let vm = &mut *vm;
    let cl = vm.frames.last().expect("frame").closure.expect("closure");
    let uv = vm.heap.get_closure(cl).upvalues[b as usize];
    let v = vm.stack[(base + a) as usize];
    vm.set_upval_value(uv, v);
    0
}

// ---- Tables ----

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_get_index(
    vm: *mut Vm,
    base: u64,
    a: u64,
    b: u64,
    c: u64,
) -> i64 {
    let vm = &mut *vm;
    let t = vm.stack[(base + b) as usize];
    let key = vm.stack[(base + c) as usize];
    match interp::table_index(vm, t, key) {
        Ok(v) => {
            vm.stack[(base + a) as usize] = v;
            0
        }
        Err(e) => fail(vm, e),
    }
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_set_index(
    vm: *mut Vm,
    base: u64,
    a: u64,
    b: u64,
    c_spec: u64,
    k: u64,
) -> i64 {
    let vm = &mut *vm;
    let t = vm.stack[(base + a) as usize];
    let key = vm.stack[(base + b) as usize];
    let val = if k != 0 {
        TValue::from_raw_bits(c_spec)
    } else {
        vm.stack[(base + c_spec) as usize]
    };
    let r = interp::table_newindex(vm, t, key, val);
    ok_or_fail(vm, r)
}

// ---- Arithmetic and friends ----

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_arith(
    vm: *mut Vm,
    base: u64,
    op: u64,
    a: u64,
    b: u64,
    c: u64,
) -> i64 {
    let vm = &mut *vm;
    let lhs = vm.stack[(base + b) as usize];
    let rhs = vm.stack[(base + c) as usize];
    match interp::binary_arith(vm, decode_arith(op), lhs, rhs) {
        Ok(v) => {
            vm.stack[(base + a) as usize] = v;
            0
        }
        Err(e) => fail(vm, e),
    }
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_arith_k(
    vm: *mut Vm,
    base: u64,
    op: u64,
    a: u64,
    b: u64,
    kbits: u64,
) -> i64 {
    let vm = &mut *vm;
    let lhs = vm.stack[(base + b) as usize];
    let rhs = TValue::from_raw_bits(kbits);
    match interp::binary_arith(vm, decode_arith(op), lhs, rhs) {
        Ok(v) => {
            vm.stack[(base + a) as usize] = v;
            0
        }
        Err(e) => fail(vm, e),
    }
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_unm(vm: *mut Vm, base: u64, a: u64, b: u64) -> i64 {
    let vm = &mut *vm;
    let v = vm.stack[(base + b) as usize];
    match interp::unary_minus(vm, v) {
        Ok(r) => {
            vm.stack[(base + a) as usize] = r;
            0
        }
        Err(e) => fail(vm, e),
    }
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_not(vm: *mut Vm, base: u64, a: u64, b: u64) -> i64 {
    let vm = &mut *vm;
    let v = vm.stack[(base + b) as usize];
    vm.stack[(base + a) as usize] = TValue::from_bool(v.is_falsy());
    0
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_len(vm: *mut Vm, base: u64, a: u64, b: u64) -> i64 {
    let vm = &mut *vm;
    let v = vm.stack[(base + b) as usize];
    match interp::length_of(vm, v) {
        Ok(r) => {
            vm.stack[(base + a) as usize] = r;
            0
        }
        Err(e) => fail(vm, e),
    }
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_concat(vm: *mut Vm, base: u64, a: u64, b: u64) -> i64 {
    let vm = &mut *vm;
    match interp::concat_range(vm, (base + a) as usize, b as usize) {
        Ok(v) => {
            vm.stack[(base + a) as usize] = v;
            0
        }
        Err(e) => fail(vm, e),
    }
}

// ---- Conditionals (1 = take the branch, 0 = fall through) ----

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_eq(vm: *mut Vm, base: u64, a: u64, b: u64, k: u64) -> i64 {
    let vm = &mut *vm;
    let va = vm.stack[(base + a) as usize];
    let vb = vm.stack[(base + b) as usize];
    match interp::value_eq(vm, va, vb) {
        Ok(eq) => (eq != (k != 0)) as i64,
        Err(e) => fail(vm, e),
    }
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_eq_k(vm: *mut Vm, base: u64, a: u64, kbits: u64, k: u64) -> i64 {
    let vm = &mut *vm;
    let va = vm.stack[(base + a) as usize];
    let vb = TValue::from_raw_bits(kbits);
    match interp::value_eq(vm, va, vb) {
        Ok(eq) => (eq != (k != 0)) as i64,
        Err(e) => fail(vm, e),
    }
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_lt(vm: *mut Vm, base: u64, a: u64, b: u64, k: u64) -> i64 {
    let vm = &mut *vm;
    let va = vm.stack[(base + a) as usize];
    let vb = vm.stack[(base + b) as usize];
    match interp::value_lt(vm, va, vb) {
        Ok(lt) => (lt != (k != 0)) as i64,
        Err(e) => fail(vm, e),
    }
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_le(vm: *mut Vm, base: u64, a: u64, b: u64, k: u64) -> i64 {
    let vm = &mut *vm;
    let va = vm.stack[(base + a) as usize];
    let vb = vm.stack[(base + b) as usize];
    match interp::value_le(vm, va, vb) {
        Ok(le) => (le != (k != 0)) as i64,
        Err(e) => fail(vm, e),
    }
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_test(vm: *mut Vm, base: u64, a: u64, k: u64) -> i64 {
    let vm = &mut *vm;
    let va = vm.stack[(base + a) as usize];
    (va.is_truthy() != (k != 0)) as i64
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_test_set(
    vm: *mut Vm,
    base: u64,
    a: u64,
    b: u64,
    k: u64,
) -> i64 {
    let vm = &mut *vm;
    let vb = vm.stack[(base + b) as usize];
    if vb.is_truthy() == (k != 0) {
        vm.stack[(base + a) as usize] = vb;
        0
    } else {
        1
    }
}

// ---- Calls and frame control ----

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_call(vm: *mut Vm, base: u64, a: u64, b: u64, c: u64) -> i64 {
    let vm = &mut *vm;
    let f_slot = (base + a) as usize;
    let nargs = if b > 0 {
        (b - 1) as usize
    } else {
        let top = vm.frames.last().expect("frame").top;
        top.saturating_sub(f_slot + 1)
    };
    let wanted = c as i32 - 1;
    let r = interp::call_at(vm, f_slot, nargs, wanted);
    ok_or_fail(vm, r)
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_tailcall(vm: *mut Vm, base: u64, a: u64, b: u64) -> i64 {
    let vm = &mut *vm;
    let _ = base;
    match interp::tail_call_at(vm, a as usize, b as usize) {
        Ok(true) => SIG_TAILCALL,
        Ok(false) => 0,
        Err(e) => fail(vm, e),
    }
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_return(vm: *mut Vm, base: u64, a: u64, b: u64) -> i64 {
    let vm = &mut *vm;
    let _ = base;
    interp::do_return(vm, a as usize, b as usize);
    SIG_RETURN
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_vararg(vm: *mut Vm, base: u64, a: u64, c: u64) -> i64 {
    let vm = &mut *vm;
    let ci = vm.frames.last().expect("frame").clone();
    let (start, count) = ci.vararg.unwrap_or((0, 0));
    let a = a as usize;
    let c = c as usize;
    let n = if c > 0 { c - 1 } else { count };
    interp::ensure_stack(vm, ci.base + a + n);
    for i in 0..n {
        vm.stack[ci.base + a + i] = if i < count {
            vm.stack[start + i]
        } else {
            TValue::nil()
        };
    }
    if c == 0 {
        vm.frames.last_mut().expect("frame").top = ci.base + a + count;
    }
    let _ = base;
    0
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_closure(vm: *mut Vm, base: u64, a: u64, bx: u64) -> i64 {
    let vm = &mut *vm;
    let ci = vm.frames.last().expect("frame");
    let cb_idx = ci.code_block as usize;
    let parent = ci.closure;
    let child_idx = vm.code_blocks[cb_idx].sibling_base + bx as u32;
    let descs = vm.code_blocks[child_idx as usize].upvalues.clone();
    let mut ups = Vec::with_capacity(descs.len());
    for d in descs {
        match d {
            UpvalueDesc::FromParentLocal(r) => {
                ups.push(vm.find_or_create_open_upval((base + r as u64) as usize));
            }
            UpvalueDesc::FromParentUpvalue(i) => {
                let Some(p) = parent else {
                    return fail(
                        vm,
                        LuaError::Type("upvalue capture without enclosing closure".to_string()),
                    );
                };
                ups.push(vm.heap.get_closure(p).upvalues[i as usize]);
            }
        }
    }
    let cl = vm.heap.alloc_closure(child_idx, ups);
    vm.stack[(base + a) as usize] = TValue::from_closure(cl);
    0
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_close(vm: *mut Vm, base: u64, a: u64) -> i64 {
    let vm = &mut *vm;
    vm.close_upvalues((base + a) as usize);
    0
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_forprep(vm: *mut Vm, base: u64, a: u64) -> i64 {
    let vm = &mut *vm;
    let slot = (base + a) as usize;
    let read = |vm: &Vm, i: usize, what: &str| {
        mond_vm::coerce::to_number(vm.stack[i], &vm.strings)
            .ok_or_else(|| LuaError::Type(format!("{what} must be a number")))
    };
    let init = match read(vm, slot, "'for' initial value") {
        Ok(v) => v,
        Err(e) => return fail(vm, e),
    };
    let limit = match read(vm, slot + 1, "'for' limit") {
        Ok(v) => v,
        Err(e) => return fail(vm, e),
    };
    let step = match read(vm, slot + 2, "'for' step") {
        Ok(v) => v,
        Err(e) => return fail(vm, e),
    };
    if step == 0.0 {
        return fail(vm, LuaError::Type("'for' step is zero".to_string()));
    }
    vm.stack[slot] = TValue::from_number(init - step);
    vm.stack[slot + 1] = TValue::from_number(limit);
    vm.stack[slot + 2] = TValue::from_number(step);
    0
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_forloop(vm: *mut Vm, base: u64, a: u64) -> i64 {
    let vm = &mut *vm;
    let slot = (base + a) as usize;
    let (i, limit, step) = match (
        vm.stack[slot].as_number(),
        vm.stack[slot + 1].as_number(),
        vm.stack[slot + 2].as_number(),
    ) {
        (Some(i), Some(l), Some(s)) => (i, l, s),
        _ => {
            return fail(
                vm,
                LuaError::Type("'for' counter must be a number".to_string()),
            )
        }
    };
    let next = i + step;
    let continues = if step > 0.0 { next <= limit } else { next >= limit };
    if continues {
        vm.stack[slot] = TValue::from_number(next);
        vm.stack[slot + 3] = TValue::from_number(next);
        1
    } else {
        0
    }
}

/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_setlist(vm: *mut Vm, base: u64, a: u64, b: u64, c: u64) -> i64 {
    let vm = &mut *vm;
    let a = a as usize;
    let slot = base as usize + a;
    let tv = vm.stack[slot];
    let Some(tidx) = tv.as_table_idx() else {
        return fail(
            vm,
            LuaError::Type("attempt to index a non-table value".to_string()),
        );
    };
    let n = if b > 0 {
        b as usize
    } else {
        let top = vm.frames.last().expect("frame").top;
        top.saturating_sub(slot + 1)
    };
    let offset = c as usize * interp::FIELDS_PER_FLUSH;
    for i in 0..n {
        let v = vm.stack[slot + 1 + i];
        vm.heap
            .get_table_mut(tidx)
            .set_array((offset + i + 1) as i64, v);
    }
    0
}

// ---- Property access (inline-cached) ----

/// Value bits of the frame register `r`.
///
/// # Safety
/// `vm` must point at a live Vm whose top frame owns `base`.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_read_reg(vm: *mut Vm, base: u64, r: u64) -> i64 {
    let vm = &mut *vm;
    vm.stack[(base + r) as usize].raw_bits() as i64
}

/// Value bits of the designated globals table.
///
/// # Safety
/// `vm` must point at a live Vm.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_globals_bits(vm: *mut Vm) -> i64 {
    let vm = &mut *vm;
    TValue::from_table(vm.globals).raw_bits() as i64
}

/// Structure identity of a table value; -1 for anything else (never a
/// valid structure id, so IC entries simply miss).
///
/// # Safety
/// `vm` must point at a live Vm.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_structure_id(vm: *mut Vm, bits: u64) -> i64 {
    let vm = &mut *vm;
    match TValue::from_raw_bits(bits).as_table_idx() {
        Some(tidx) => vm.heap.get_table(tidx).structure.0 as i64,
        None => -1,
    }
}

/// Apply a cached GetById effect. Returns 1 when the read completed,
/// 0 when the miss handler must run (nil result with a possible
/// metatable).
///
/// # Safety
/// `vm` must point at a live Vm; `packed` must come from this site's
/// recorded effect.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_ic_hit(
    vm: *mut Vm,
    base: u64,
    table_bits: u64,
    packed: u64,
    dest: u64,
    entry: u64,
) -> i64 {
    let vm = &mut *vm;
    codegen::note_ic_hit(packed, entry);
    let Some(tidx) = TValue::from_raw_bits(table_bits).as_table_idx() else {
        return 0;
    };
    let may = packed & PACKED_BIT_MAY != 0;
    let result = if packed & PACKED_BIT_MUSTBENIL != 0 {
        TValue::nil()
    } else {
        let slot = (packed & PACKED_SLOT_MASK) as u32;
        let loc = if packed & PACKED_BIT_INLINE != 0 {
            SlotLocation::Inline(slot as u8)
        } else {
            SlotLocation::Outline(slot)
        };
        vm.heap.get_table(tidx).read_slot(loc)
    };
    if result.is_nil() && may {
        return 0;
    }
    vm.stack[(base + dest) as usize] = result;
    1
}

/// Apply a cached PutById effect (existing slot, no metatable in the
/// observation class). Returns 1 when the write completed, 0 for the
/// miss handler.
///
/// # Safety
/// `vm` must point at a live Vm; `packed` must come from this site's
/// recorded effect.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_ic_put_hit(
    vm: *mut Vm,
    base: u64,
    table_bits: u64,
    packed: u64,
    valspec: u64,
    entry: u64,
) -> i64 {
    let vm = &mut *vm;
    codegen::note_ic_hit(packed, entry);
    if packed & PACKED_BIT_MAY != 0 {
        return 0;
    }
    let Some(tidx) = TValue::from_raw_bits(table_bits).as_table_idx() else {
        return 0;
    };
    let value = if packed & PACKED_BIT_CONST != 0 {
        TValue::from_raw_bits(valspec)
    } else {
        vm.stack[(base + valspec) as usize]
    };
    let slot = (packed & PACKED_SLOT_MASK) as u32;
    let loc = if packed & PACKED_BIT_INLINE != 0 {
        SlotLocation::Inline(slot as u8)
    } else {
        SlotLocation::Outline(slot)
    };
    vm.heap.get_table_mut(tidx).write_slot(loc, value);
    1
}

/// GetById miss: run the full probe and metamethod protocol, then grow
/// the site's IC chain with the observed effect when cacheable.
///
/// # Safety
/// `vm` must point at a live Vm; `site_id` must be a live site.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_get_by_id_miss(
    vm: *mut Vm,
    base: u64,
    table_bits: u64,
    site_id: u64,
    dest: u64,
    key_bits: u64,
) -> i64 {
    let vm = &mut *vm;
    let tv = TValue::from_raw_bits(table_bits);
    let keyv = TValue::from_raw_bits(key_bits);
    let Some(key) = keyv.as_string_id() else {
        return fail(
            vm,
            LuaError::Type("property key constant must be a string".to_string()),
        );
    };

    let result = if let Some(tidx) = tv.as_table_idx() {
        let structure = vm.heap.get_table(tidx).structure;
        let info = vm
            .heap
            .get_table(tidx)
            .prepare_get_by_id(&vm.heap.structures, key);
        codegen::append_get_effect(site_id as usize, structure, &info, dest);
        let t = vm.heap.get_table(tidx);
        let raw = match info.kind {
            mond_core::table::GetByIdKind::Inline(i) => t.read_slot(SlotLocation::Inline(i)),
            mond_core::table::GetByIdKind::Outline(o) => t.read_slot(SlotLocation::Outline(o)),
            mond_core::table::GetByIdKind::MustBeNil { .. } => TValue::nil(),
        };
        if raw.is_nil() && info.may_have_metatable {
            match interp::table_index(vm, tv, keyv) {
                Ok(v) => v,
                Err(e) => return fail(vm, e),
            }
        } else {
            raw
        }
    } else {
        match interp::table_index(vm, tv, keyv) {
            Ok(v) => v,
            Err(e) => return fail(vm, e),
        }
    };
    vm.stack[(base + dest) as usize] = result;
    0
}

/// PutById miss: record an existing-slot observation when there is
/// one, then run the full write protocol.
///
/// # Safety
/// `vm` must point at a live Vm; `site_id` must be a live site.
#[no_mangle]
pub unsafe extern "C" fn jit_rt_put_by_id_miss(
    vm: *mut Vm,
    base: u64,
    table_bits: u64,
    site_id: u64,
    key_bits: u64,
    valspec: u64,
) -> i64 {
    let vm = &mut *vm;
    let tv = TValue::from_raw_bits(table_bits);
    let keyv = TValue::from_raw_bits(key_bits);
    let Some(key) = keyv.as_string_id() else {
        return fail(
            vm,
            LuaError::Type("property key constant must be a string".to_string()),
        );
    };
    let is_const = codegen::site_value_is_const(site_id as usize);
    let value = if is_const {
        TValue::from_raw_bits(valspec)
    } else {
        vm.stack[(base + valspec) as usize]
    };

    if let Some(tidx) = tv.as_table_idx() {
        let structure = vm.heap.get_table(tidx).structure;
        let probe = vm
            .heap
            .get_table(tidx)
            .prepare_put_by_id(&vm.heap.structures, key);
        if let mond_core::table::PutByIdKind::Existing(loc) = probe {
            let may = vm.heap.structures.get(structure).may_have_metatable();
            codegen::append_put_effect(site_id as usize, structure, loc, may, valspec);
        }
    }
    let r = interp::table_newindex(vm, tv, keyv, value);
    ok_or_fail(vm, r)
}
