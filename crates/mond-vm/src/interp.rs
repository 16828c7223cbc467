//! Bytecode dispatch, calling convention, and the slow-path protocol
//! routines shared with the baseline tier.
//!
//! The routines that define the interpreter's semantics (table access,
//! metamethod fallback, arithmetic with coercion, frame push/return)
//! are exported; baseline-generated code calls the same ones.

use crate::arith::{self, ArithOp, ArithResult};
use crate::callinfo::{CallInfo, ProtectedCall, MULTRET};
use crate::codeblock::{BestEntry, SIG_ERROR, SIG_RETURN, SIG_TAILCALL};
use crate::compare::{self, CompareResult};
use crate::coerce;
use crate::coroutine::{Coroutine, CoroutineStatus, MAIN_COROUTINE};
use crate::error::LuaError;
use crate::ic::{effect_for_get, IcEffect, IcEffectKind};
use crate::metamethod::get_metamethod;
use crate::vm::Vm;
use mond_bytecode::opcode::{Instruction, OpCode, BYTES_PER_INSTRUCTION};
use mond_core::heap::{GcIdx, NativeContext, NativeKind};
use mond_core::object::type_name;
use mond_core::string::StringId;
use mond_core::structure::SlotLocation;
use mond_core::table::{GetByIdKind, PutByIdKind, Table, NO_ALLOC_SITE};
use mond_core::value::TValue;

/// Bound on `__index`/`__newindex` chain length.
const MAX_META_CHAIN: usize = 100;

/// Array-part block size of one SetList instruction.
pub const FIELDS_PER_FLUSH: usize = 50;

/// Why a run loop stopped before its floor frame returned.
pub enum Unwind {
    Error(LuaError),
    Yield(Vec<TValue>),
}

enum Flow {
    Normal,
    Yield(Vec<TValue>),
}

// ---- Entry points ----

/// Call any callable value with arguments and run it to completion.
/// Yields cannot cross this boundary.
pub fn call_value(vm: &mut Vm, f: TValue, args: &[TValue]) -> Result<Vec<TValue>, LuaError> {
    if f.as_closure_idx().is_some() {
        let base = frame_ceiling(vm);
        ensure_stack(vm, base + 1 + args.len());
        vm.stack[base] = f;
        vm.stack[base + 1..base + 1 + args.len()].copy_from_slice(args);
        let floor = vm.frames.len();
        push_frame(vm, base, args.len(), MULTRET)?;
        match run(vm, floor) {
            Ok(vals) => Ok(vals),
            Err(Unwind::Error(e)) => Err(e),
            Err(Unwind::Yield(_)) => Err(LuaError::Coroutine(
                "attempt to yield across a native boundary".to_string(),
            )),
        }
    } else if let Some(nidx) = f.as_native_idx() {
        let kind = vm.heap.get_native(nidx).kind;
        call_vm_native(vm, kind, args)
    } else if let Some(mm) = get_metamethod(f, vm.mm.call, &vm.heap) {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(f);
        full.extend_from_slice(args);
        call_value(vm, mm, &full)
    } else {
        Err(type_error("call", f))
    }
}

/// Call a callable and keep only the first result (metamethod helper).
pub fn call_value_1(vm: &mut Vm, f: TValue, args: &[TValue]) -> Result<TValue, LuaError> {
    let vals = call_value(vm, f, args)?;
    Ok(vals.first().copied().unwrap_or(TValue::nil()))
}

/// Perform a full call at an in-place call window (callee at `f_slot`,
/// arguments following) and run the callee to completion. This is the
/// Call operation as seen from native code: the baseline tier's call
/// helper is a thin shell over it.
pub fn call_at(vm: &mut Vm, f_slot: usize, nargs: usize, wanted: i32) -> Result<(), LuaError> {
    let depth0 = vm.frames.len();
    match do_call(vm, f_slot, nargs, wanted)? {
        Flow::Yield(_) => Err(LuaError::Coroutine(
            "attempt to yield across a native boundary".to_string(),
        )),
        Flow::Normal => {
            if vm.frames.len() > depth0 {
                match run(vm, depth0) {
                    Ok(vals) => {
                        place_results(vm, f_slot, &vals, wanted);
                        Ok(())
                    }
                    Err(Unwind::Error(e)) => Err(e),
                    Err(Unwind::Yield(_)) => Err(LuaError::Coroutine(
                        "attempt to yield across a native boundary".to_string(),
                    )),
                }
            } else {
                Ok(())
            }
        }
    }
}

/// The TailCall operation as seen from native code. Returns true when
/// the frame was replaced in place by a closure callee (the caller must
/// re-enter the new frame); false when the callee ran to completion
/// with all results at the call window.
pub fn tail_call_at(vm: &mut Vm, a: usize, b: usize) -> Result<bool, LuaError> {
    let ci = vm.frames.last().expect("frame").clone();
    let f_slot = ci.base + a;
    let nargs = if b > 0 {
        b - 1
    } else {
        ci.top.saturating_sub(f_slot + 1)
    };
    let callee = vm.stack[f_slot];
    if callee.as_closure_idx().is_some() {
        vm.close_upvalues(ci.base);
        for i in 0..=nargs {
            vm.stack[ci.func_idx + i] = vm.stack[f_slot + i];
        }
        vm.frames.pop();
        push_frame(vm, ci.func_idx, nargs, ci.wanted)?;
        vm.frames.last_mut().expect("frame").protected = ci.protected;
        Ok(true)
    } else {
        call_at(vm, f_slot, nargs, MULTRET)?;
        Ok(false)
    }
}

/// Execute frames until the frame at index `floor` returns.
pub fn run(vm: &mut Vm, floor: usize) -> Result<Vec<TValue>, Unwind> {
    vm.run_floors.push(floor);
    vm.run_depth += 1;
    let result = run_inner(vm, floor);
    vm.run_depth -= 1;
    vm.run_floors.pop();
    result
}

fn run_inner(vm: &mut Vm, floor: usize) -> Result<Vec<TValue>, Unwind> {
    loop {
        debug_assert!(vm.frames.len() > floor);

        // Baseline tier: enter the top frame's native code when it has
        // some. The policy restricts baseline frames to the root
        // coroutine so that yield never crosses a native frame.
        if vm.current == MAIN_COROUTINE {
            match try_enter_baseline(vm) {
                Some(Ok(())) => {
                    if vm.frames.len() == floor {
                        return Ok(vm.pending_return.take().unwrap_or_default());
                    }
                    continue;
                }
                Some(Err(e)) => {
                    handle_error(vm, floor, e)?;
                    if vm.frames.len() == floor {
                        return Ok(vm.pending_return.take().unwrap_or_default());
                    }
                    continue;
                }
                None => {}
            }
        }

        // Fetch and retire one instruction.
        let ci_idx = vm.frames.len() - 1;
        let (cb_idx, pc) = {
            let ci = &vm.frames[ci_idx];
            (ci.code_block as usize, ci.pc)
        };
        let inst = match vm.code_blocks[cb_idx].code.get(pc) {
            Some(&i) => i,
            None => {
                // Fell off the end: implicit return of no values.
                let surfaced = finish_frame_with(vm, Vec::new());
                if surfaced || vm.frames.len() == floor {
                    return Ok(vm.pending_return.take().unwrap_or_default());
                }
                continue;
            }
        };
        vm.frames[ci_idx].pc = pc + 1;
        vm.code_blocks[cb_idx].exec_counter += BYTES_PER_INSTRUCTION;

        match step(vm, inst) {
            Ok(Flow::Normal) => {
                if vm.frames.len() == floor {
                    return Ok(vm.pending_return.take().unwrap_or_default());
                }
            }
            Ok(Flow::Yield(vals)) => return Err(Unwind::Yield(vals)),
            Err(e) => {
                handle_error(vm, floor, e)?;
                if vm.frames.len() == floor {
                    return Ok(vm.pending_return.take().unwrap_or_default());
                }
            }
        }
    }
}

/// Unwind an error to the nearest protected frame above `floor`. The
/// xpcall handler runs before any frame is popped.
fn handle_error(vm: &mut Vm, floor: usize, err: LuaError) -> Result<(), Unwind> {
    let prot_idx = vm.frames[floor..]
        .iter()
        .rposition(|ci| ci.protected.is_some())
        .map(|i| i + floor);

    match prot_idx {
        Some(idx) => {
            let prot = vm.frames[idx].protected.clone().expect("protected frame");
            let mut errval = err.to_value(&mut vm.strings);
            if let Some(handler) = prot.handler {
                // Handler observes the stack before unwinding. A failing
                // handler's own error value is reported instead.
                errval = match call_value_1(vm, handler, &[errval]) {
                    Ok(v) => v,
                    Err(e) => e.to_value(&mut vm.strings),
                };
            }
            // Unwind: close upvalues of every dying frame.
            while vm.frames.len() > idx {
                let base = vm.frames.last().expect("frame").base;
                vm.close_upvalues(base);
                vm.frames.pop();
            }
            if idx == floor {
                // The protected frame was this run's floor: surface the
                // tuple to the host/native caller instead.
                vm.pending_return = Some(vec![TValue::from_bool(false), errval]);
            } else {
                place_results(
                    vm,
                    prot.report_base,
                    &[TValue::from_bool(false), errval],
                    prot.wanted,
                );
            }
            Ok(())
        }
        None => {
            while vm.frames.len() > floor {
                let base = vm.frames.last().expect("frame").base;
                vm.close_upvalues(base);
                vm.frames.pop();
            }
            Err(Unwind::Error(err))
        }
    }
}

// ---- Frame machinery (shared with the baseline tier) ----

/// First free stack slot above the active frame's reserved window.
pub fn frame_ceiling(vm: &Vm) -> usize {
    vm.frames
        .last()
        .map(|ci| ci.stack_limit.max(ci.top))
        .unwrap_or(0)
}

pub fn ensure_stack(vm: &mut Vm, n: usize) {
    if vm.stack.len() < n {
        vm.stack.resize(n, TValue::nil());
    }
}

/// Push a frame for the closure at `func_idx` with `nargs` arguments in
/// place. Checks call depth and reserves stack room from the callee's
/// declared frame size.
pub fn push_frame(vm: &mut Vm, func_idx: usize, nargs: usize, wanted: i32) -> Result<(), LuaError> {
    let callee = vm.stack[func_idx];
    let cl_idx = callee
        .as_closure_idx()
        .ok_or_else(|| type_error("call", callee))?;
    if vm.frames.len() >= vm.options.max_call_depth {
        return Err(LuaError::StackOverflow);
    }
    let cb_idx = vm.heap.get_closure(cl_idx).code_block;
    let cb = &vm.code_blocks[cb_idx as usize];
    let num_params = cb.num_params as usize;
    let max_frame = cb.max_frame_size as usize;
    let is_vararg = cb.is_vararg;

    let (base, vararg) = if is_vararg {
        let nvar = nargs.saturating_sub(num_params);
        let base = func_idx + 1 + nargs;
        ensure_stack(vm, base + max_frame);
        for i in 0..num_params {
            vm.stack[base + i] = if i < nargs {
                vm.stack[func_idx + 1 + i]
            } else {
                TValue::nil()
            };
        }
        for i in num_params..max_frame {
            vm.stack[base + i] = TValue::nil();
        }
        (base, Some((func_idx + 1 + num_params, nvar)))
    } else {
        let base = func_idx + 1;
        ensure_stack(vm, base + max_frame);
        for i in nargs.min(num_params)..max_frame {
            vm.stack[base + i] = TValue::nil();
        }
        (base, None)
    };

    let mut ci = CallInfo::new(func_idx, base, cb_idx);
    ci.closure = Some(cl_idx);
    ci.wanted = wanted;
    ci.top = base + num_params;
    ci.stack_limit = base + max_frame;
    ci.vararg = vararg;
    vm.frames.push(ci);

    maybe_tier_up(vm, cb_idx);
    Ok(())
}

/// Finish the top frame, delivering `vals` per the calling convention.
/// Returns true when the frame was this run's floor (results surfaced
/// through `vm.pending_return`).
pub fn finish_frame_with(vm: &mut Vm, vals: Vec<TValue>) -> bool {
    let ci_idx = vm.frames.len() - 1;
    let ci = vm.frames[ci_idx].clone();
    vm.close_upvalues(ci.base);

    let floor = *vm.run_floors.last().expect("active run");
    if ci_idx == floor {
        // A protected floor frame surfaces its (true, ...) tuple.
        let out = if ci.protected.is_some() {
            let mut out = Vec::with_capacity(vals.len() + 1);
            out.push(TValue::from_bool(true));
            out.extend(vals);
            out
        } else {
            vals
        };
        vm.pending_return = Some(out);
        vm.frames.pop();
        return true;
    }

    if let Some(prot) = ci.protected.clone() {
        vm.frames.pop();
        let mut out = Vec::with_capacity(vals.len() + 1);
        out.push(TValue::from_bool(true));
        out.extend(vals);
        place_results(vm, prot.report_base, &out, prot.wanted);
        return false;
    }

    vm.frames.pop();
    place_results(vm, ci.func_idx, &vals, ci.wanted);
    false
}

/// Execute a Return whose values sit in the frame's registers.
pub fn do_return(vm: &mut Vm, a: usize, b: usize) -> bool {
    let ci = vm.frames.last().expect("frame").clone();
    let first = ci.base + a;
    let count = if b > 0 {
        b - 1
    } else {
        ci.top.saturating_sub(first)
    };
    let vals: Vec<TValue> = (0..count).map(|i| vm.stack[first + i]).collect();
    finish_frame_with(vm, vals)
}

fn maybe_tier_up(vm: &mut Vm, cb_idx: u32) {
    let cb = &vm.code_blocks[cb_idx as usize];
    if cb.baseline.is_some() || cb.tier_up_failed {
        return;
    }
    if cb.exec_counter < cb.tier_up_threshold {
        return;
    }
    let Some(hook) = vm.tier_up else { return };
    match hook(vm, cb_idx) {
        Some(stub) => {
            let cb = &mut vm.code_blocks[cb_idx as usize];
            cb.baseline = Some(stub);
            cb.best_entry = BestEntry::Baseline;
        }
        None => {
            vm.code_blocks[cb_idx as usize].tier_up_failed = true;
        }
    }
}

/// Enter the top frame's baseline code at its current pc, trampolining
/// through tail calls. None when the top frame has no baseline code.
fn try_enter_baseline(vm: &mut Vm) -> Option<Result<(), LuaError>> {
    loop {
        let ci = vm.frames.last()?;
        let cb = &vm.code_blocks[ci.code_block as usize];
        if ci.pc >= cb.code.len() {
            return None;
        }
        let stub = cb.baseline.as_ref()?;
        let enter = stub.enter;
        let base = ci.base as u64;
        let entry = ci.pc as u64;
        // Safety: the stub was generated for this code block and the
        // helper ABI; vm outlives the call.
        let status = unsafe { enter(vm as *mut Vm, base, entry) };
        match status {
            SIG_RETURN => return Some(Ok(())),
            SIG_TAILCALL => continue,
            SIG_ERROR => {
                let e = vm
                    .pending_error
                    .take()
                    .unwrap_or_else(|| LuaError::Type("baseline error without payload".into()));
                return Some(Err(e));
            }
            other => {
                return Some(Err(LuaError::Type(format!(
                    "baseline code returned unknown status {other}"
                ))))
            }
        }
    }
}

// ---- The dispatch loop body ----

fn step(vm: &mut Vm, inst: Instruction) -> Result<Flow, LuaError> {
    let ci_idx = vm.frames.len() - 1;
    let (base, cb_idx) = {
        let ci = &vm.frames[ci_idx];
        (ci.base, ci.code_block as usize)
    };
    let a = inst.a() as usize;

    match inst.opcode() {
        OpCode::Move => {
            let b = inst.b() as usize;
            vm.stack[base + a] = vm.stack[base + b];
        }

        OpCode::LoadK => {
            let bx = inst.bx() as usize;
            vm.stack[base + a] = vm.code_blocks[cb_idx].constants[bx];
        }

        OpCode::LoadNil => {
            let b = inst.b() as usize;
            for i in a..=a + b {
                vm.stack[base + i] = TValue::nil();
            }
        }

        OpCode::LoadTrue => {
            vm.stack[base + a] = TValue::from_bool(true);
        }

        OpCode::LoadFalse => {
            vm.stack[base + a] = TValue::from_bool(false);
        }

        OpCode::LFalseSkip => {
            vm.stack[base + a] = TValue::from_bool(false);
            vm.frames[ci_idx].pc += 1;
        }

        OpCode::NewTable => {
            let b = inst.b() as usize;
            let ordinal = inst.c() as usize;
            let site_id = vm.code_blocks[cb_idx]
                .alloc_site_ids
                .get(ordinal)
                .copied()
                .unwrap_or(NO_ALLOC_SITE);
            let observed = if site_id == NO_ALLOC_SITE {
                0
            } else {
                vm.alloc_sites[site_id as usize]
            };
            let t = vm.heap.alloc_table(observed, b);
            vm.heap.get_table_mut(t).alloc_site = site_id;
            vm.stack[base + a] = TValue::from_table(t);
            if vm.heap.should_collect() {
                vm.collect_garbage();
            }
        }

        OpCode::GetGlobal => {
            let key = constant_string_key(vm, cb_idx, inst.bx() as usize)?;
            let globals = vm.globals;
            let pc = vm.frames[ci_idx].pc - 1;
            let v = get_by_id_with_ic(vm, globals, key, cb_idx, pc)?;
            vm.stack[base + a] = v;
        }

        OpCode::SetGlobal => {
            let key = constant_string_key(vm, cb_idx, inst.bx() as usize)?;
            let globals = vm.globals;
            let pc = vm.frames[ci_idx].pc - 1;
            let v = vm.stack[base + a];
            set_by_id_with_ic(vm, globals, key, v, cb_idx, pc)?;
        }

        OpCode::GetUpval => {
            let b = inst.b() as usize;
            let cl = vm.frames[ci_idx].closure.expect("closure frame");
            let uv = vm.heap.get_closure(cl).upvalues[b];
            vm.stack[base + a] = vm.upval_value(uv);
        }

        OpCode::SetUpval => {
            let b = inst.b() as usize;
            let cl = vm.frames[ci_idx].closure.expect("closure frame");
            let uv = vm.heap.get_closure(cl).upvalues[b];
            let v = vm.stack[base + a];
            vm.set_upval_value(uv, v);
        }

        OpCode::GetField => {
            let b = inst.b() as usize;
            let key = constant_string_key(vm, cb_idx, inst.c() as usize)?;
            let tv = vm.stack[base + b];
            let pc = vm.frames[ci_idx].pc - 1;
            let v = match tv.as_table_idx() {
                Some(tidx) => get_by_id_with_ic(vm, tidx, key, cb_idx, pc)?,
                None => table_index(vm, tv, TValue::from_string_id(key))?,
            };
            vm.stack[base + a] = v;
        }

        OpCode::SetField => {
            let key = constant_string_key(vm, cb_idx, inst.b() as usize)?;
            let c = inst.c() as usize;
            let val = if inst.k() {
                vm.code_blocks[cb_idx].constants[c]
            } else {
                vm.stack[base + c]
            };
            let tv = vm.stack[base + a];
            let pc = vm.frames[ci_idx].pc - 1;
            match tv.as_table_idx() {
                Some(tidx) => set_by_id_with_ic(vm, tidx, key, val, cb_idx, pc)?,
                None => table_newindex(vm, tv, TValue::from_string_id(key), val)?,
            }
        }

        OpCode::GetIndex => {
            let b = inst.b() as usize;
            let c = inst.c() as usize;
            let tv = vm.stack[base + b];
            let key = vm.stack[base + c];
            vm.stack[base + a] = table_index(vm, tv, key)?;
        }

        OpCode::SetIndex => {
            let b = inst.b() as usize;
            let c = inst.c() as usize;
            let val = if inst.k() {
                vm.code_blocks[cb_idx].constants[c]
            } else {
                vm.stack[base + c]
            };
            let tv = vm.stack[base + a];
            let key = vm.stack[base + b];
            table_newindex(vm, tv, key, val)?;
        }

        OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow => {
            let b = inst.b() as usize;
            let c = inst.c() as usize;
            let lhs = vm.stack[base + b];
            let rhs = vm.stack[base + c];
            vm.stack[base + a] = binary_arith(vm, arith_op_of(inst.opcode()), lhs, rhs)?;
        }

        OpCode::AddK
        | OpCode::SubK
        | OpCode::MulK
        | OpCode::DivK
        | OpCode::ModK
        | OpCode::PowK => {
            let b = inst.b() as usize;
            let c = inst.c() as usize;
            let lhs = vm.stack[base + b];
            let rhs = vm.code_blocks[cb_idx].constants[c];
            vm.stack[base + a] = binary_arith(vm, arith_op_of(inst.opcode()), lhs, rhs)?;
        }

        OpCode::Unm => {
            let b = inst.b() as usize;
            let v = vm.stack[base + b];
            vm.stack[base + a] = unary_minus(vm, v)?;
        }

        OpCode::Not => {
            let b = inst.b() as usize;
            vm.stack[base + a] = TValue::from_bool(vm.stack[base + b].is_falsy());
        }

        OpCode::Len => {
            let b = inst.b() as usize;
            let v = vm.stack[base + b];
            vm.stack[base + a] = length_of(vm, v)?;
        }

        OpCode::Concat => {
            let b = inst.b() as usize;
            let v = concat_range(vm, base + a, b)?;
            vm.stack[base + a] = v;
        }

        OpCode::Jmp => {
            let sj = inst.get_sj();
            let ci = &mut vm.frames[ci_idx];
            ci.pc = (ci.pc as i64 + sj as i64) as usize;
            if sj < 0 {
                maybe_tier_up(vm, cb_idx as u32);
            }
        }

        OpCode::Eq => {
            let b = inst.b() as usize;
            let va = vm.stack[base + a];
            let vb = vm.stack[base + b];
            let eq = value_eq(vm, va, vb)?;
            if eq != inst.k() {
                vm.frames[ci_idx].pc += 1;
            }
        }

        OpCode::EqK => {
            let b = inst.b() as usize;
            let va = vm.stack[base + a];
            let vb = vm.code_blocks[cb_idx].constants[b];
            let eq = value_eq(vm, va, vb)?;
            if eq != inst.k() {
                vm.frames[ci_idx].pc += 1;
            }
        }

        OpCode::Lt => {
            let b = inst.b() as usize;
            let va = vm.stack[base + a];
            let vb = vm.stack[base + b];
            let lt = value_lt(vm, va, vb)?;
            if lt != inst.k() {
                vm.frames[ci_idx].pc += 1;
            }
        }

        OpCode::Le => {
            let b = inst.b() as usize;
            let va = vm.stack[base + a];
            let vb = vm.stack[base + b];
            let le = value_le(vm, va, vb)?;
            if le != inst.k() {
                vm.frames[ci_idx].pc += 1;
            }
        }

        OpCode::Test => {
            let va = vm.stack[base + a];
            if va.is_truthy() != inst.k() {
                vm.frames[ci_idx].pc += 1;
            }
        }

        OpCode::TestSet => {
            let b = inst.b() as usize;
            let vb = vm.stack[base + b];
            if vb.is_truthy() == inst.k() {
                vm.stack[base + a] = vb;
            } else {
                vm.frames[ci_idx].pc += 1;
            }
        }

        OpCode::Call => {
            let b = inst.b() as usize;
            let c = inst.c() as usize;
            let f_slot = base + a;
            let nargs = if b > 0 {
                b - 1
            } else {
                vm.frames[ci_idx].top.saturating_sub(f_slot + 1)
            };
            let wanted = c as i32 - 1;
            return do_call(vm, f_slot, nargs, wanted);
        }

        OpCode::TailCall => {
            let b = inst.b() as usize;
            // Closure callees reuse the frame; anything else runs to
            // completion here and the following Return A 0 delivers.
            tail_call_at(vm, a, b)?;
        }

        OpCode::Return => {
            let b = inst.b() as usize;
            do_return(vm, a, b);
        }

        OpCode::VarArg => {
            let c = inst.c() as usize;
            let ci = vm.frames[ci_idx].clone();
            let (start, count) = ci.vararg.unwrap_or((0, 0));
            let n = if c > 0 { c - 1 } else { count };
            ensure_stack(vm, ci.base + a + n);
            for i in 0..n {
                vm.stack[ci.base + a + i] = if i < count {
                    vm.stack[start + i]
                } else {
                    TValue::nil()
                };
            }
            if c == 0 {
                vm.frames[ci_idx].top = ci.base + a + count;
            }
        }

        OpCode::Closure => {
            let bx = inst.bx() as u32;
            let child_idx = vm.code_blocks[cb_idx].sibling_base + bx;
            let descs = vm.code_blocks[child_idx as usize].upvalues.clone();
            let parent = vm.frames[ci_idx].closure;
            let mut ups = Vec::with_capacity(descs.len());
            for d in descs {
                match d {
                    mond_bytecode::module::UpvalueDesc::FromParentLocal(r) => {
                        ups.push(vm.find_or_create_open_upval(base + r as usize));
                    }
                    mond_bytecode::module::UpvalueDesc::FromParentUpvalue(i) => {
                        let p = parent.ok_or_else(|| {
                            LuaError::Type("upvalue capture without enclosing closure".to_string())
                        })?;
                        ups.push(vm.heap.get_closure(p).upvalues[i as usize]);
                    }
                }
            }
            let cl = vm.heap.alloc_closure(child_idx, ups);
            vm.stack[base + a] = TValue::from_closure(cl);
        }

        OpCode::Close => {
            vm.close_upvalues(base + a);
        }

        OpCode::ForPrep => {
            let sbx = inst.sbx();
            let init = for_number(vm, base + a, "'for' initial value")?;
            let limit = for_number(vm, base + a + 1, "'for' limit")?;
            let step = for_number(vm, base + a + 2, "'for' step")?;
            if step == 0.0 {
                return Err(LuaError::Type("'for' step is zero".to_string()));
            }
            vm.stack[base + a] = TValue::from_number(init - step);
            vm.stack[base + a + 1] = TValue::from_number(limit);
            vm.stack[base + a + 2] = TValue::from_number(step);
            let ci = &mut vm.frames[ci_idx];
            ci.pc = (ci.pc as i64 + sbx as i64) as usize;
        }

        OpCode::ForLoop => {
            let sbx = inst.sbx();
            let i = for_number(vm, base + a, "'for' counter")?;
            let limit = for_number(vm, base + a + 1, "'for' limit")?;
            let step = for_number(vm, base + a + 2, "'for' step")?;
            let next = i + step;
            let continues = if step > 0.0 { next <= limit } else { next >= limit };
            if continues {
                vm.stack[base + a] = TValue::from_number(next);
                vm.stack[base + a + 3] = TValue::from_number(next);
                let ci = &mut vm.frames[ci_idx];
                ci.pc = (ci.pc as i64 + sbx as i64) as usize;
                maybe_tier_up(vm, cb_idx as u32);
            }
        }

        OpCode::SetList => {
            let b = inst.b() as usize;
            let c = inst.c() as usize;
            let ci = vm.frames[ci_idx].clone();
            let tv = vm.stack[base + a];
            let tidx = tv
                .as_table_idx()
                .ok_or_else(|| type_error("index", tv))?;
            let n = if b > 0 {
                b
            } else {
                ci.top.saturating_sub(base + a + 1)
            };
            let offset = c * FIELDS_PER_FLUSH;
            for i in 0..n {
                let v = vm.stack[base + a + 1 + i];
                vm.heap
                    .get_table_mut(tidx)
                    .set_array((offset + i + 1) as i64, v);
            }
        }
    }

    Ok(Flow::Normal)
}

// ---- Calls ----

fn do_call(vm: &mut Vm, f_slot: usize, nargs: usize, wanted: i32) -> Result<Flow, LuaError> {
    let callee = vm.stack[f_slot];
    if callee.as_closure_idx().is_some() {
        push_frame(vm, f_slot, nargs, wanted)?;
        return Ok(Flow::Normal);
    }
    if let Some(nidx) = callee.as_native_idx() {
        let kind = vm.heap.get_native(nidx).kind;
        return dispatch_native(vm, kind, f_slot, nargs, wanted);
    }
    if let Some(mm) = get_metamethod(callee, vm.mm.call, &vm.heap) {
        ensure_stack(vm, f_slot + 2 + nargs);
        for i in (0..=nargs).rev() {
            vm.stack[f_slot + 1 + i] = vm.stack[f_slot + i];
        }
        vm.stack[f_slot] = mm;
        return do_call(vm, f_slot, nargs + 1, wanted);
    }
    Err(type_error("call", callee))
}

fn dispatch_native(
    vm: &mut Vm,
    kind: NativeKind,
    f_slot: usize,
    nargs: usize,
    wanted: i32,
) -> Result<Flow, LuaError> {
    match kind {
        NativeKind::Simple(f) => {
            let args: Vec<TValue> = vm.stack[f_slot + 1..f_slot + 1 + nargs].to_vec();
            let res = {
                let mut ctx = NativeContext {
                    args: &args,
                    heap: &mut vm.heap,
                    strings: &mut vm.strings,
                };
                f(&mut ctx)
            }
            .map_err(LuaError::from)?;
            place_results(vm, f_slot, &res, wanted);
            Ok(Flow::Normal)
        }

        NativeKind::Error => {
            let v = arg(vm, f_slot, nargs, 0);
            Err(user_error(vm, v))
        }

        NativeKind::Pcall | NativeKind::Xpcall => {
            do_protected_call(vm, kind, f_slot, nargs, wanted)
        }

        NativeKind::CoroutineCreate => {
            let f = arg(vm, f_slot, nargs, 0);
            if !f.is_function() {
                return Err(LuaError::Type(
                    "bad argument #1 to 'create' (function expected)".to_string(),
                ));
            }
            let idx = vm.coroutines.len() as u32;
            vm.coroutines.push(Coroutine::new(f));
            place_results(vm, f_slot, &[TValue::from_thread(idx)], wanted);
            Ok(Flow::Normal)
        }

        NativeKind::CoroutineStatus => {
            let co = arg(vm, f_slot, nargs, 0);
            let idx = co.as_thread_idx().ok_or_else(|| {
                LuaError::Type("bad argument #1 to 'status' (coroutine expected)".to_string())
            })?;
            let status = vm.coroutine_status(idx);
            let sid = vm.strings.intern(status.name().as_bytes());
            place_results(vm, f_slot, &[TValue::from_string_id(sid)], wanted);
            Ok(Flow::Normal)
        }

        NativeKind::CoroutineResume => do_resume(vm, f_slot, nargs, wanted),

        NativeKind::CoroutineYield => {
            if vm.current == MAIN_COROUTINE {
                return Err(LuaError::Coroutine(
                    "attempt to yield from outside a coroutine".to_string(),
                ));
            }
            if vm.run_depth != vm.coroutines[vm.current as usize].resume_boundary {
                return Err(LuaError::Coroutine(
                    "attempt to yield across a native boundary".to_string(),
                ));
            }
            let vals: Vec<TValue> = vm.stack[f_slot + 1..f_slot + 1 + nargs].to_vec();
            vm.coroutines[vm.current as usize].resume_target = Some((f_slot, wanted));
            Ok(Flow::Yield(vals))
        }
    }
}

fn arg(vm: &Vm, f_slot: usize, nargs: usize, i: usize) -> TValue {
    if i < nargs {
        vm.stack[f_slot + 1 + i]
    } else {
        TValue::nil()
    }
}

fn place_results(vm: &mut Vm, at: usize, vals: &[TValue], wanted: i32) {
    let n = if wanted < 0 {
        vals.len()
    } else {
        wanted as usize
    };
    ensure_stack(vm, at + n);
    for i in 0..n {
        vm.stack[at + i] = vals.get(i).copied().unwrap_or(TValue::nil());
    }
    if wanted < 0 {
        if let Some(ci) = vm.frames.last_mut() {
            ci.top = at + vals.len();
        }
    }
}

fn do_protected_call(
    vm: &mut Vm,
    kind: NativeKind,
    f_slot: usize,
    nargs: usize,
    wanted: i32,
) -> Result<Flow, LuaError> {
    let is_xpcall = matches!(kind, NativeKind::Xpcall);
    let f = arg(vm, f_slot, nargs, 0);
    let handler = if is_xpcall {
        Some(arg(vm, f_slot, nargs, 1))
    } else {
        None
    };
    let inner_nargs = if is_xpcall { 0 } else { nargs.saturating_sub(1) };

    if f.as_closure_idx().is_some() {
        match push_frame(vm, f_slot + 1, inner_nargs, MULTRET) {
            Ok(()) => {
                vm.frames.last_mut().expect("frame").protected = Some(ProtectedCall {
                    report_base: f_slot,
                    wanted,
                    handler,
                });
                Ok(Flow::Normal)
            }
            Err(e) => {
                deliver_caught(vm, f_slot, wanted, handler, e);
                Ok(Flow::Normal)
            }
        }
    } else {
        // Native or non-callable: run to completion here, catching.
        let args: Vec<TValue> = vm.stack[f_slot + 2..f_slot + 2 + inner_nargs].to_vec();
        match call_value(vm, f, &args) {
            Ok(mut vals) => {
                vals.insert(0, TValue::from_bool(true));
                place_results(vm, f_slot, &vals, wanted);
                Ok(Flow::Normal)
            }
            Err(e) => {
                deliver_caught(vm, f_slot, wanted, handler, e);
                Ok(Flow::Normal)
            }
        }
    }
}

fn deliver_caught(
    vm: &mut Vm,
    report_base: usize,
    wanted: i32,
    handler: Option<TValue>,
    err: LuaError,
) {
    let mut errval = err.to_value(&mut vm.strings);
    if let Some(h) = handler {
        errval = match call_value_1(vm, h, &[errval]) {
            Ok(v) => v,
            Err(e) => e.to_value(&mut vm.strings),
        };
    }
    place_results(
        vm,
        report_base,
        &[TValue::from_bool(false), errval],
        wanted,
    );
}

fn do_resume(vm: &mut Vm, f_slot: usize, nargs: usize, wanted: i32) -> Result<Flow, LuaError> {
    let co = arg(vm, f_slot, nargs, 0);
    let resume_args: Vec<TValue> = if nargs > 1 {
        vm.stack[f_slot + 2..f_slot + 1 + nargs].to_vec()
    } else {
        Vec::new()
    };
    let results = resume_coroutine(vm, co, &resume_args)?;
    place_results(vm, f_slot, &results, wanted);
    Ok(Flow::Normal)
}

/// Resume a coroutine value with arguments, returning the
/// (ok, ...) result tuple.
pub fn resume_coroutine(
    vm: &mut Vm,
    co: TValue,
    resume_args: &[TValue],
) -> Result<Vec<TValue>, LuaError> {
    let co_idx = co.as_thread_idx().ok_or_else(|| {
        LuaError::Type("bad argument #1 to 'resume' (coroutine expected)".to_string())
    })? as usize;

    let status = vm.coroutines[co_idx].status;
    if status != CoroutineStatus::Suspended {
        let msg = match status {
            CoroutineStatus::Dead => "cannot resume dead coroutine",
            _ => "cannot resume non-suspended coroutine",
        };
        let sid = vm.strings.intern(msg.as_bytes());
        return Ok(vec![TValue::from_bool(false), TValue::from_string_id(sid)]);
    }

    let caller = vm.current;

    // Swap the working set over to the target coroutine.
    swap_coroutine_state(vm, caller);
    vm.current = co_idx as u32;
    swap_coroutine_state(vm, co_idx as u32);
    vm.coroutines[caller as usize].status = CoroutineStatus::Normal;
    vm.coroutines[co_idx].status = CoroutineStatus::Running;
    vm.coroutines[co_idx].resume_boundary = vm.run_depth + 1;

    let outcome = if !vm.coroutines[co_idx].started {
        vm.coroutines[co_idx].started = true;
        let body = vm.coroutines[co_idx].body;
        vm.stack.clear();
        vm.stack.push(body);
        vm.stack.extend_from_slice(resume_args);
        vm.frames.clear();
        match push_frame(vm, 0, resume_args.len(), MULTRET) {
            Ok(()) => run(vm, 0),
            Err(e) => Err(Unwind::Error(e)),
        }
    } else {
        let (slot, resume_wanted) = vm.coroutines[co_idx]
            .resume_target
            .take()
            .expect("suspended coroutine has a resume target");
        place_results(vm, slot, resume_args, resume_wanted);
        run(vm, 0)
    };

    // Swap back to the caller.
    swap_coroutine_state(vm, co_idx as u32);
    vm.current = caller;
    swap_coroutine_state(vm, caller);
    vm.coroutines[caller as usize].status = CoroutineStatus::Running;

    let mut results = Vec::new();
    match outcome {
        Ok(vals) => {
            vm.coroutines[co_idx].status = CoroutineStatus::Dead;
            results.push(TValue::from_bool(true));
            results.extend(vals);
        }
        Err(Unwind::Yield(vals)) => {
            vm.coroutines[co_idx].status = CoroutineStatus::Suspended;
            results.push(TValue::from_bool(true));
            results.extend(vals);
        }
        Err(Unwind::Error(e)) => {
            vm.coroutines[co_idx].status = CoroutineStatus::Dead;
            results.push(TValue::from_bool(false));
            let v = e.to_value(&mut vm.strings);
            results.push(v);
        }
    }
    Ok(results)
}

/// Exchange the VM working set with a coroutine's saved state.
fn swap_coroutine_state(vm: &mut Vm, idx: u32) {
    let co = &mut vm.coroutines[idx as usize];
    std::mem::swap(&mut vm.stack, &mut co.stack);
    std::mem::swap(&mut vm.frames, &mut co.frames);
    std::mem::swap(&mut vm.open_upvals, &mut co.open_upvals);
}

/// Call a VM-dispatched native outside a bytecode call site (metamethod
/// or host invocation paths).
fn call_vm_native(vm: &mut Vm, kind: NativeKind, args: &[TValue]) -> Result<Vec<TValue>, LuaError> {
    match kind {
        NativeKind::Simple(f) => {
            let mut ctx = NativeContext {
                args,
                heap: &mut vm.heap,
                strings: &mut vm.strings,
            };
            f(&mut ctx).map_err(LuaError::from)
        }
        NativeKind::Error => {
            let v = args.first().copied().unwrap_or(TValue::nil());
            Err(user_error(vm, v))
        }
        NativeKind::Pcall => {
            let f = args.first().copied().unwrap_or(TValue::nil());
            match call_value(vm, f, args.get(1..).unwrap_or(&[])) {
                Ok(mut vals) => {
                    vals.insert(0, TValue::from_bool(true));
                    Ok(vals)
                }
                Err(e) => {
                    let v = e.to_value(&mut vm.strings);
                    Ok(vec![TValue::from_bool(false), v])
                }
            }
        }
        NativeKind::Xpcall => {
            let f = args.first().copied().unwrap_or(TValue::nil());
            let handler = args.get(1).copied().unwrap_or(TValue::nil());
            match call_value(vm, f, &[]) {
                Ok(mut vals) => {
                    vals.insert(0, TValue::from_bool(true));
                    Ok(vals)
                }
                Err(e) => {
                    let ev = e.to_value(&mut vm.strings);
                    let handled = call_value_1(vm, handler, &[ev])?;
                    Ok(vec![TValue::from_bool(false), handled])
                }
            }
        }
        NativeKind::CoroutineYield => Err(LuaError::Coroutine(
            "attempt to yield across a native boundary".to_string(),
        )),
        NativeKind::CoroutineCreate => {
            let f = args.first().copied().unwrap_or(TValue::nil());
            if !f.is_function() {
                return Err(LuaError::Type(
                    "bad argument #1 to 'create' (function expected)".to_string(),
                ));
            }
            let idx = vm.coroutines.len() as u32;
            vm.coroutines.push(Coroutine::new(f));
            Ok(vec![TValue::from_thread(idx)])
        }
        NativeKind::CoroutineStatus => {
            let idx = args
                .first()
                .and_then(|v| v.as_thread_idx())
                .ok_or_else(|| {
                    LuaError::Type("bad argument #1 to 'status' (coroutine expected)".to_string())
                })?;
            let status = vm.coroutine_status(idx);
            let sid = vm.strings.intern(status.name().as_bytes());
            Ok(vec![TValue::from_string_id(sid)])
        }
        NativeKind::CoroutineResume => {
            let co = args.first().copied().unwrap_or(TValue::nil());
            resume_coroutine(vm, co, args.get(1..).unwrap_or(&[]))
        }
    }
}

// ---- Shared protocol routines ----

fn arith_op_of(op: OpCode) -> ArithOp {
    match op {
        OpCode::Add | OpCode::AddK => ArithOp::Add,
        OpCode::Sub | OpCode::SubK => ArithOp::Sub,
        OpCode::Mul | OpCode::MulK => ArithOp::Mul,
        OpCode::Div | OpCode::DivK => ArithOp::Div,
        OpCode::Mod | OpCode::ModK => ArithOp::Mod,
        _ => ArithOp::Pow,
    }
}

fn mm_name_for(vm: &Vm, op: ArithOp) -> StringId {
    match op {
        ArithOp::Add => vm.mm.add,
        ArithOp::Sub => vm.mm.sub,
        ArithOp::Mul => vm.mm.mul,
        ArithOp::Div => vm.mm.div,
        ArithOp::Mod => vm.mm.mod_,
        ArithOp::Pow => vm.mm.pow,
    }
}

/// Binary arithmetic with coercion and metamethod fallback.
pub fn binary_arith(
    vm: &mut Vm,
    op: ArithOp,
    lhs: TValue,
    rhs: TValue,
) -> Result<TValue, LuaError> {
    match arith::arith_op(op, lhs, rhs, &vm.strings) {
        ArithResult::Ok(v) => Ok(v),
        ArithResult::NeedMetamethod => {
            let name = mm_name_for(vm, op);
            let mm = get_metamethod(lhs, name, &vm.heap)
                .or_else(|| get_metamethod(rhs, name, &vm.heap));
            match mm {
                Some(mm) => call_value_1(vm, mm, &[lhs, rhs]),
                None => Err(arith_error(lhs, rhs)),
            }
        }
    }
}

/// Unary minus with metamethod fallback.
pub fn unary_minus(vm: &mut Vm, v: TValue) -> Result<TValue, LuaError> {
    match arith::arith_unm(v, &vm.strings) {
        ArithResult::Ok(r) => Ok(r),
        ArithResult::NeedMetamethod => match get_metamethod(v, vm.mm.unm, &vm.heap) {
            Some(mm) => call_value_1(vm, mm, &[v, v]),
            None => Err(arith_error(v, v)),
        },
    }
}

fn arith_error(lhs: TValue, rhs: TValue) -> LuaError {
    let non_numeric = |v: TValue| !v.is_number() && !v.is_string();
    if non_numeric(lhs) {
        type_error("perform arithmetic on", lhs)
    } else if non_numeric(rhs) {
        type_error("perform arithmetic on", rhs)
    } else {
        // A string operand without numeric syntax.
        LuaError::ArithCoercion("attempt to perform arithmetic on a string value".to_string())
    }
}

/// The # operator.
pub fn length_of(vm: &mut Vm, v: TValue) -> Result<TValue, LuaError> {
    if let Some(len) = arith::str_len(v, &vm.strings) {
        return Ok(TValue::from_number(len as f64));
    }
    if let Some(mm) = get_metamethod(v, vm.mm.len, &vm.heap) {
        return call_value_1(vm, mm, &[v, v]);
    }
    if let Some(tidx) = v.as_table_idx() {
        return Ok(TValue::from_number(vm.heap.get_table(tidx).length() as f64));
    }
    Err(type_error("get length of", v))
}

/// Right-associative concatenation over `count` registers at `first`.
pub fn concat_range(vm: &mut Vm, first: usize, count: usize) -> Result<TValue, LuaError> {
    if count == 0 {
        return Ok(vm.string_value(""));
    }
    let mut acc = vm.stack[first + count - 1];
    for i in (0..count - 1).rev() {
        let lhs = vm.stack[first + i];
        acc = concat2(vm, lhs, acc)?;
    }
    Ok(acc)
}

fn concat2(vm: &mut Vm, l: TValue, r: TValue) -> Result<TValue, LuaError> {
    let l_ok = l.is_string() || l.is_number();
    let r_ok = r.is_string() || r.is_number();
    if l_ok && r_ok {
        let lv = coerce::to_string_for_concat(l, &mut vm.strings).expect("concatenable");
        let rv = coerce::to_string_for_concat(r, &mut vm.strings).expect("concatenable");
        let mut bytes = vm.strings.get_bytes(lv.as_string_id().unwrap()).to_vec();
        bytes.extend_from_slice(vm.strings.get_bytes(rv.as_string_id().unwrap()));
        let sid = vm.strings.intern(&bytes);
        return Ok(TValue::from_string_id(sid));
    }
    let mm = get_metamethod(l, vm.mm.concat, &vm.heap)
        .or_else(|| get_metamethod(r, vm.mm.concat, &vm.heap));
    match mm {
        Some(mm) => call_value_1(vm, mm, &[l, r]),
        None => Err(type_error("concatenate", if l_ok { r } else { l })),
    }
}

/// Equality with the __eq protocol (same-type rule: only table pairs
/// consult the metamethod).
pub fn value_eq(vm: &mut Vm, a: TValue, b: TValue) -> Result<bool, LuaError> {
    match compare::raw_eq(a, b) {
        Some(x) => Ok(x),
        None => {
            let mm = get_metamethod(a, vm.mm.eq, &vm.heap)
                .or_else(|| get_metamethod(b, vm.mm.eq, &vm.heap));
            match mm {
                Some(mm) => Ok(call_value_1(vm, mm, &[a, b])?.is_truthy()),
                None => Ok(false),
            }
        }
    }
}

pub fn value_lt(vm: &mut Vm, a: TValue, b: TValue) -> Result<bool, LuaError> {
    match compare::raw_lt(a, b, &vm.strings) {
        CompareResult::Ok(x) => Ok(x),
        CompareResult::NeedMetamethod => {
            let mm = get_metamethod(a, vm.mm.lt, &vm.heap)
                .or_else(|| get_metamethod(b, vm.mm.lt, &vm.heap));
            match mm {
                Some(mm) => Ok(call_value_1(vm, mm, &[a, b])?.is_truthy()),
                None => Err(compare_error(a, b)),
            }
        }
    }
}

/// Less-or-equal; falls back to not-lt-swapped when __le is absent.
pub fn value_le(vm: &mut Vm, a: TValue, b: TValue) -> Result<bool, LuaError> {
    match compare::raw_le(a, b, &vm.strings) {
        CompareResult::Ok(x) => Ok(x),
        CompareResult::NeedMetamethod => {
            let mm = get_metamethod(a, vm.mm.le, &vm.heap)
                .or_else(|| get_metamethod(b, vm.mm.le, &vm.heap));
            if let Some(mm) = mm {
                return Ok(call_value_1(vm, mm, &[a, b])?.is_truthy());
            }
            let mm = get_metamethod(a, vm.mm.lt, &vm.heap)
                .or_else(|| get_metamethod(b, vm.mm.lt, &vm.heap));
            match mm {
                Some(mm) => Ok(!call_value_1(vm, mm, &[b, a])?.is_truthy()),
                None => Err(compare_error(a, b)),
            }
        }
    }
}

fn compare_error(a: TValue, b: TValue) -> LuaError {
    LuaError::Type(format!(
        "attempt to compare {} with {}",
        type_name(a),
        type_name(b)
    ))
}

fn type_error(verb: &str, v: TValue) -> LuaError {
    LuaError::Type(format!("attempt to {verb} a {} value", type_name(v)))
}

/// Build a UserError from error(), prefixing position info onto string
/// payloads.
pub fn user_error(vm: &mut Vm, v: TValue) -> LuaError {
    if let Some(sid) = v.as_string_id() {
        if let Some(ci) = vm.frames.last() {
            let cb = &vm.code_blocks[ci.code_block as usize];
            let line = cb.line_of(ci.pc.saturating_sub(1));
            let source = cb
                .source
                .map(|s| String::from_utf8_lossy(vm.strings.get_bytes(s)).into_owned())
                .unwrap_or_else(|| "?".to_string());
            let msg = String::from_utf8_lossy(vm.strings.get_bytes(sid)).into_owned();
            let full = format!("{source}:{line}: {msg}");
            let full_sid = vm.strings.intern(full.as_bytes());
            return LuaError::User(TValue::from_string_id(full_sid));
        }
    }
    LuaError::User(v)
}

fn for_number(vm: &Vm, slot: usize, what: &str) -> Result<f64, LuaError> {
    coerce::to_number(vm.stack[slot], &vm.strings)
        .ok_or_else(|| LuaError::Type(format!("{what} must be a number")))
}

fn constant_string_key(vm: &Vm, cb_idx: usize, k: usize) -> Result<StringId, LuaError> {
    vm.code_blocks[cb_idx].constants[k]
        .as_string_id()
        .ok_or_else(|| LuaError::Type("property key constant must be a string".to_string()))
}

// ---- Property access with inline caches ----

fn read_effect(t: &Table, effect: IcEffect) -> TValue {
    match effect.kind {
        IcEffectKind::InlineSlot(i) => t.read_slot(SlotLocation::Inline(i)),
        IcEffectKind::OutlineSlot(o) => t.read_slot(SlotLocation::Outline(o)),
        IcEffectKind::MustBeNil | IcEffectKind::IndexTableSlot { .. } => TValue::nil(),
    }
}

/// Apply a cached through-metatable read. None means a guard failed or
/// the slot was nil; the caller re-enters the generic chain.
fn read_index_table_effect(
    vm: &Vm,
    tidx: GcIdx<Table>,
    mt_structure: mond_core::structure::StructureId,
    mt_index_slot: SlotLocation,
    index_table: GcIdx<Table>,
    index_slot: SlotLocation,
) -> Option<TValue> {
    let t = vm.heap.get_table(tidx);
    let mt_idx = vm.heap.structures.get(t.structure).metatable?;
    let mt = vm.heap.get_table(mt_idx);
    if mt.structure != mt_structure {
        return None;
    }
    let idx_val = mt.read_slot(mt_index_slot);
    if idx_val.as_table_idx() != Some(index_table) {
        return None;
    }
    let v = vm.heap.get_table(index_table).read_slot(index_slot);
    if v.is_nil() {
        None
    } else {
        Some(v)
    }
}

/// When a key is absent but resolves through a table-valued `__index`,
/// derive the cacheable effect for that observation.
fn index_table_effect(vm: &Vm, tidx: GcIdx<Table>, key: StringId) -> Option<IcEffect> {
    use mond_core::structure::slot_location;
    let t = vm.heap.get_table(tidx);
    let mt_idx = t.metatable?;
    let mt = vm.heap.get_table(mt_idx);
    let mi_slot = vm.heap.structures.slot_of(mt.structure, vm.mm.index)?;
    let mt_index_slot = slot_location(mi_slot, mt.inline_capacity());
    let index_table = mt.read_slot(mt_index_slot).as_table_idx()?;
    let it = vm.heap.get_table(index_table);
    let islot = vm.heap.structures.slot_of(it.structure, key)?;
    let index_slot = slot_location(islot, it.inline_capacity());
    if it.read_slot(index_slot).is_nil() {
        return None;
    }
    Some(IcEffect {
        kind: IcEffectKind::IndexTableSlot {
            mt_structure: mt.structure,
            mt_index_slot,
            index_table,
            index_slot,
        },
        may_have_metatable: true,
    })
}

/// GetById through the pc's inline cache: dispatch on structure
/// identity, fall back to the full probe on miss, recording the
/// observation when cacheable.
pub fn get_by_id_with_ic(
    vm: &mut Vm,
    tidx: GcIdx<Table>,
    key: StringId,
    cb_idx: usize,
    pc: usize,
) -> Result<TValue, LuaError> {
    let structure = vm.heap.get_table(tidx).structure;
    let site_idx = vm.code_blocks[cb_idx].ic_site_index(pc);

    let mut cached: Option<IcEffect> = None;
    if let Some(si) = site_idx {
        cached = vm.code_blocks[cb_idx].ic_sites[si].lookup(structure);
    }

    let (result, may_mt) = match cached {
        Some(IcEffect {
            kind:
                IcEffectKind::IndexTableSlot {
                    mt_structure,
                    mt_index_slot,
                    index_table,
                    index_slot,
                },
            ..
        }) => {
            match read_index_table_effect(
                vm,
                tidx,
                mt_structure,
                mt_index_slot,
                index_table,
                index_slot,
            ) {
                Some(v) => return Ok(v),
                // A guard failed or the slot went nil: generic chain.
                None => {
                    return table_index(vm, TValue::from_table(tidx), TValue::from_string_id(key))
                }
            }
        }
        Some(effect) => {
            let t = vm.heap.get_table(tidx);
            (read_effect(t, effect), effect.may_have_metatable)
        }
        None => {
            let info = {
                let t = vm.heap.get_table(tidx);
                t.prepare_get_by_id(&vm.heap.structures, key)
            };
            let recorded = effect_for_get(&info).or_else(|| index_table_effect(vm, tidx, key));
            if let (Some(si), Some(eff)) = (site_idx, recorded) {
                vm.code_blocks[cb_idx].ic_sites[si].record(structure, eff);
            }
            let t = vm.heap.get_table(tidx);
            let raw = match info.kind {
                GetByIdKind::Inline(i) => t.read_slot(SlotLocation::Inline(i)),
                GetByIdKind::Outline(o) => t.read_slot(SlotLocation::Outline(o)),
                GetByIdKind::MustBeNil { .. } => TValue::nil(),
            };
            (raw, info.may_have_metatable)
        }
    };

    if result.is_nil() && may_mt {
        return table_index(vm, TValue::from_table(tidx), TValue::from_string_id(key));
    }
    Ok(result)
}

/// PutById through the pc's inline cache. Only existing-slot writes on
/// metatable-free structures take the cached fast path.
pub fn set_by_id_with_ic(
    vm: &mut Vm,
    tidx: GcIdx<Table>,
    key: StringId,
    value: TValue,
    cb_idx: usize,
    pc: usize,
) -> Result<(), LuaError> {
    let structure = vm.heap.get_table(tidx).structure;
    let site_idx = vm.code_blocks[cb_idx].ic_site_index(pc);

    if let Some(si) = site_idx {
        if let Some(effect) = vm.code_blocks[cb_idx].ic_sites[si].lookup(structure) {
            if !effect.may_have_metatable {
                let loc = match effect.kind {
                    IcEffectKind::InlineSlot(i) => SlotLocation::Inline(i),
                    IcEffectKind::OutlineSlot(o) => SlotLocation::Outline(o),
                    // Never recorded for puts.
                    IcEffectKind::MustBeNil | IcEffectKind::IndexTableSlot { .. } => {
                        return table_newindex(
                            vm,
                            TValue::from_table(tidx),
                            TValue::from_string_id(key),
                            value,
                        );
                    }
                };
                vm.heap.get_table_mut(tidx).write_slot(loc, value);
                return Ok(());
            }
            return table_newindex(
                vm,
                TValue::from_table(tidx),
                TValue::from_string_id(key),
                value,
            );
        }
        // Miss: record an existing-slot observation when there is one.
        let probe = {
            let t = vm.heap.get_table(tidx);
            t.prepare_put_by_id(&vm.heap.structures, key)
        };
        if let PutByIdKind::Existing(loc) = probe {
            let may = vm
                .heap
                .structures
                .get(structure)
                .may_have_metatable();
            let kind = match loc {
                SlotLocation::Inline(i) => IcEffectKind::InlineSlot(i),
                SlotLocation::Outline(o) => IcEffectKind::OutlineSlot(o),
            };
            vm.code_blocks[cb_idx].ic_sites[si].record(
                structure,
                IcEffect {
                    kind,
                    may_have_metatable: may,
                },
            );
        }
    }

    table_newindex(
        vm,
        TValue::from_table(tidx),
        TValue::from_string_id(key),
        value,
    )
}

/// Full indexed read: raw access plus the __index chain.
pub fn table_index(vm: &mut Vm, base_val: TValue, key: TValue) -> Result<TValue, LuaError> {
    let mut base = base_val;
    for _ in 0..MAX_META_CHAIN {
        if let Some(tidx) = base.as_table_idx() {
            let raw = vm.heap.table_raw_get(tidx, key);
            if !raw.is_nil() {
                return Ok(raw);
            }
            let Some(mt) = vm.heap.get_table(tidx).metatable else {
                return Ok(TValue::nil());
            };
            let mm = vm
                .heap
                .get_table(mt)
                .get_by_id(&vm.heap.structures, vm.mm.index);
            if mm.is_nil() {
                return Ok(TValue::nil());
            }
            if mm.is_function() {
                return call_value_1(vm, mm, &[base, key]);
            }
            base = mm;
        } else {
            let Some(mm) = get_metamethod(base, vm.mm.index, &vm.heap) else {
                return Err(type_error("index", base));
            };
            if mm.is_function() {
                return call_value_1(vm, mm, &[base, key]);
            }
            base = mm;
        }
    }
    Err(LuaError::Type("'__index' chain too long; possible loop".to_string()))
}

/// Full indexed write: the __newindex chain, then a raw write.
pub fn table_newindex(
    vm: &mut Vm,
    target: TValue,
    key: TValue,
    value: TValue,
) -> Result<(), LuaError> {
    let mut t = target;
    for _ in 0..MAX_META_CHAIN {
        if let Some(tidx) = t.as_table_idx() {
            let raw = vm.heap.table_raw_get(tidx, key);
            if !raw.is_nil() {
                return raw_table_write(vm, tidx, key, value);
            }
            let mm = match vm.heap.get_table(tidx).metatable {
                Some(mt) => vm
                    .heap
                    .get_table(mt)
                    .get_by_id(&vm.heap.structures, vm.mm.newindex),
                None => TValue::nil(),
            };
            if mm.is_nil() {
                return raw_table_write(vm, tidx, key, value);
            }
            if mm.is_function() {
                call_value(vm, mm, &[t, key, value])?;
                return Ok(());
            }
            t = mm;
        } else {
            let Some(mm) = get_metamethod(t, vm.mm.newindex, &vm.heap) else {
                return Err(type_error("index", t));
            };
            if mm.is_function() {
                call_value(vm, mm, &[t, key, value])?;
                return Ok(());
            }
            t = mm;
        }
    }
    Err(LuaError::Type(
        "'__newindex' chain too long; possible loop".to_string(),
    ))
}

/// Raw table write with BadKey checking and allocation-site profiling.
pub fn raw_table_write(
    vm: &mut Vm,
    tidx: GcIdx<Table>,
    key: TValue,
    value: TValue,
) -> Result<(), LuaError> {
    if let Some(sid) = key.as_string_id() {
        let transitioned = vm.heap.table_put_by_id(tidx, sid, value);
        if transitioned {
            update_alloc_profile(vm, tidx);
        }
        Ok(())
    } else {
        vm.heap
            .table_raw_set(tidx, key, value)
            .map_err(|m| LuaError::BadKey(m.to_string()))
    }
}

fn update_alloc_profile(vm: &mut Vm, tidx: GcIdx<Table>) {
    let t = vm.heap.get_table(tidx);
    let site = t.alloc_site;
    if site == NO_ALLOC_SITE {
        return;
    }
    let count = t.named_slot_count(&vm.heap.structures).min(255) as u8;
    let p = &mut vm.alloc_sites[site as usize];
    if count > *p {
        *p = count;
    }
}
