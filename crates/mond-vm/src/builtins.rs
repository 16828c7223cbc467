//! Core-protocol host functions registered into the globals table.
//!
//! Only the functions the core semantics need live here: error
//! handling, raw table access, metatable management, coroutines, and
//! the small introspection trio (print/type/tostring). The full
//! standard library is an external collaborator.

use crate::coerce;
use crate::vm::Vm;
use mond_core::heap::{GcHeap, NativeContext, NativeError, NativeKind};
use mond_core::object::type_name;
use mond_core::string::StringInterner;
use mond_core::value::TValue;

pub fn register(vm: &mut Vm) {
    let simple: &[(&'static str, mond_core::heap::NativeFn)] = &[
        ("print", native_print),
        ("type", native_type),
        ("tostring", native_tostring),
        ("tonumber", native_tonumber),
        ("rawget", native_rawget),
        ("rawset", native_rawset),
        ("rawequal", native_rawequal),
        ("setmetatable", native_setmetatable),
        ("getmetatable", native_getmetatable),
    ];
    for &(name, f) in simple {
        register_native(vm, name, NativeKind::Simple(f));
    }

    register_native(vm, "pcall", NativeKind::Pcall);
    register_native(vm, "xpcall", NativeKind::Xpcall);
    register_native(vm, "error", NativeKind::Error);

    // The coroutine table.
    let co_table = vm.heap.alloc_table(4, 0);
    for (name, kind) in [
        ("create", NativeKind::CoroutineCreate),
        ("resume", NativeKind::CoroutineResume),
        ("yield", NativeKind::CoroutineYield),
        ("status", NativeKind::CoroutineStatus),
    ] {
        let idx = vm.heap.alloc_native(kind, name);
        let sid = vm.strings.intern(name.as_bytes());
        vm.heap
            .table_put_by_id(co_table, sid, TValue::from_native(idx));
    }
    let sid = vm.strings.intern(b"coroutine");
    vm.heap
        .table_put_by_id(vm.globals, sid, TValue::from_table(co_table));

    let g_sid = vm.strings.intern(b"_G");
    vm.heap
        .table_put_by_id(vm.globals, g_sid, TValue::from_table(vm.globals));
}

fn register_native(vm: &mut Vm, name: &'static str, kind: NativeKind) {
    let idx = vm.heap.alloc_native(kind, name);
    let sid = vm.strings.intern(name.as_bytes());
    vm.heap
        .table_put_by_id(vm.globals, sid, TValue::from_native(idx));
}

/// Format a value for print/tostring.
pub fn format_value(val: TValue, _heap: &GcHeap, strings: &StringInterner) -> String {
    if val.is_nil() {
        "nil".to_string()
    } else if let Some(b) = val.as_bool() {
        b.to_string()
    } else if let Some(f) = val.as_number() {
        coerce::number_to_string(f)
    } else if let Some(sid) = val.as_string_id() {
        String::from_utf8_lossy(strings.get_bytes(sid)).into_owned()
    } else {
        format!(
            "{}: 0x{:010x}",
            type_name(val),
            val.ref_index().unwrap_or(0)
        )
    }
}

fn native_print(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    let mut out = String::new();
    for (i, arg) in ctx.args.iter().enumerate() {
        if i > 0 {
            out.push('\t');
        }
        out.push_str(&format_value(*arg, ctx.heap, ctx.strings));
    }
    println!("{out}");
    Ok(vec![])
}

fn native_type(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    let val = ctx.args.first().copied().unwrap_or(TValue::nil());
    let sid = ctx.strings.intern(type_name(val).as_bytes());
    Ok(vec![TValue::from_string_id(sid)])
}

fn native_tostring(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    let val = ctx.args.first().copied().unwrap_or(TValue::nil());
    let s = format_value(val, ctx.heap, ctx.strings);
    let sid = ctx.strings.intern(s.as_bytes());
    Ok(vec![TValue::from_string_id(sid)])
}

fn native_tonumber(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    let val = ctx.args.first().copied().unwrap_or(TValue::nil());
    match coerce::to_number(val, ctx.strings) {
        Some(f) => Ok(vec![TValue::from_number(f)]),
        None => Ok(vec![TValue::nil()]),
    }
}

fn arg_table(
    ctx: &NativeContext,
    i: usize,
    who: &str,
) -> Result<mond_core::heap::GcIdx<mond_core::table::Table>, NativeError> {
    ctx.args
        .get(i)
        .and_then(|v| v.as_table_idx())
        .ok_or_else(|| NativeError::Message(format!("bad argument #{} to '{who}' (table expected)", i + 1)))
}

fn native_rawget(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    let t = arg_table(ctx, 0, "rawget")?;
    let key = ctx.args.get(1).copied().unwrap_or(TValue::nil());
    Ok(vec![ctx.heap.table_raw_get(t, key)])
}

fn native_rawset(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    let t = arg_table(ctx, 0, "rawset")?;
    let key = ctx.args.get(1).copied().unwrap_or(TValue::nil());
    let val = ctx.args.get(2).copied().unwrap_or(TValue::nil());
    ctx.heap
        .table_raw_set(t, key, val)
        .map_err(|e| NativeError::Message(e.to_string()))?;
    Ok(vec![ctx.args[0]])
}

fn native_rawequal(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    let a = ctx.args.first().copied().unwrap_or(TValue::nil());
    let b = ctx.args.get(1).copied().unwrap_or(TValue::nil());
    Ok(vec![TValue::from_bool(a == b)])
}

fn native_setmetatable(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    let t = arg_table(ctx, 0, "setmetatable")?;
    let mt_val = ctx.args.get(1).copied().unwrap_or(TValue::nil());
    let mt = if mt_val.is_nil() {
        None
    } else {
        Some(mt_val.as_table_idx().ok_or_else(|| {
            NativeError::Message(
                "bad argument #2 to 'setmetatable' (nil or table expected)".to_string(),
            )
        })?)
    };
    ctx.heap.table_set_metatable(t, mt);
    Ok(vec![ctx.args[0]])
}

fn native_getmetatable(ctx: &mut NativeContext) -> Result<Vec<TValue>, NativeError> {
    let val = ctx.args.first().copied().unwrap_or(TValue::nil());
    match val.as_table_idx().and_then(|t| ctx.heap.get_table(t).metatable) {
        Some(mt) => Ok(vec![TValue::from_table(mt)]),
        None => Ok(vec![TValue::nil()]),
    }
}
