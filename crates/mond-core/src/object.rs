//! Type name helpers for engine values.

use crate::heap::*;
use crate::value::TValue;

/// Get the language-level type name for a value.
pub fn type_name(val: TValue) -> &'static str {
    if val.is_nil() {
        "nil"
    } else if val.is_bool() {
        "boolean"
    } else if val.is_number() {
        "number"
    } else if val.is_ref() {
        match val.ref_sub_tag() {
            Some(REF_SUB_STRING) => "string",
            Some(REF_SUB_TABLE) => "table",
            Some(REF_SUB_CLOSURE) | Some(REF_SUB_NATIVE) => "function",
            Some(REF_SUB_THREAD) => "thread",
            _ => "userdata",
        }
    } else {
        "unknown"
    }
}
