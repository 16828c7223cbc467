//! Raw equality and ordering. Metamethod fallbacks live in the
//! dispatch layer; these helpers report when one is needed.

use mond_core::string::StringInterner;
use mond_core::value::TValue;

/// Raw (primitive) equality: bit/identity semantics with NaN handling.
/// Returns None when both operands are tables with different
/// identities; the __eq protocol applies then.
pub fn raw_eq(a: TValue, b: TValue) -> Option<bool> {
    if a == b {
        return Some(true);
    }
    if a.is_table() && b.is_table() {
        // Distinct tables: __eq may still equate them.
        return None;
    }
    Some(false)
}

/// Result of a raw ordering attempt.
pub enum CompareResult {
    Ok(bool),
    NeedMetamethod,
}

/// Raw less-than: number pairs and string pairs only.
pub fn raw_lt(a: TValue, b: TValue, strings: &StringInterner) -> CompareResult {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return CompareResult::Ok(x < y);
    }
    if let (Some(sa), Some(sb)) = (a.as_string_id(), b.as_string_id()) {
        return CompareResult::Ok(strings.get_bytes(sa) < strings.get_bytes(sb));
    }
    CompareResult::NeedMetamethod
}

/// Raw less-or-equal: number pairs and string pairs only.
pub fn raw_le(a: TValue, b: TValue, strings: &StringInterner) -> CompareResult {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return CompareResult::Ok(x <= y);
    }
    if let (Some(sa), Some(sb)) = (a.as_string_id(), b.as_string_id()) {
        return CompareResult::Ok(strings.get_bytes(sa) <= strings.get_bytes(sb));
    }
    CompareResult::NeedMetamethod
}
