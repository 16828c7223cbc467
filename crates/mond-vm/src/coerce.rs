//! Number/string coercion helpers.

use mond_core::string::StringInterner;
use mond_core::value::TValue;

/// Convert a value to a number: numbers pass through, strings with
/// numeric syntax (decimal or 0x hex, surrounding whitespace allowed)
/// convert. Everything else is None.
pub fn to_number(v: TValue, strings: &StringInterner) -> Option<f64> {
    if let Some(f) = v.as_number() {
        return Some(f);
    }
    if let Some(sid) = v.as_string_id() {
        return parse_number(strings.get_bytes(sid));
    }
    None
}

/// Parse numeric syntax from string bytes.
pub fn parse_number(bytes: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(bytes).ok()?.trim();
    if s.is_empty() {
        return None;
    }
    // Hex literals (integer-valued).
    let (neg, rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s),
    };
    if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        let n = u64::from_str_radix(hex, 16).ok()? as f64;
        return Some(if neg { -n } else { n });
    }
    s.parse::<f64>().ok()
}

/// Format a number the way the language prints it ("%.14g").
pub fn number_to_string(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == f.trunc() && f.abs() < 1e15 {
        // Integer-valued numbers print without a decimal point.
        return format!("{}", f as i64);
    }
    let mut s = format!("{:.14e}", f);
    // Reformat from exponent notation when %g would not use it.
    if let Some(exp_pos) = s.find('e') {
        let exp: i32 = s[exp_pos + 1..].parse().unwrap_or(0);
        if (-5..15).contains(&exp) {
            s = format!("{f}");
        }
    }
    s
}

/// Convert a value to string bytes for concatenation. Only numbers and
/// strings concatenate without a metamethod.
pub fn to_string_for_concat(v: TValue, strings: &mut StringInterner) -> Option<TValue> {
    if v.is_string() {
        return Some(v);
    }
    if let Some(f) = v.as_number() {
        let s = number_to_string(f);
        return Some(TValue::from_string_id(strings.intern(s.as_bytes())));
    }
    None
}
