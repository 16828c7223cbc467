//! Runtime error types.

use mond_core::string::StringInterner;
use mond_core::value::TValue;
use std::fmt;

/// A recoverable runtime error. Unwinds to the nearest protected call
/// or coroutine boundary.
#[derive(Clone, Debug)]
pub enum LuaError {
    /// Operation on an unsupported type with no metamethod.
    Type(String),
    /// Arithmetic on a string without numeric syntax (and no metamethod).
    ArithCoercion(String),
    /// Call-frame depth or value-stack limit exceeded.
    StackOverflow,
    /// nil or NaN used as a table key on write.
    BadKey(String),
    /// Illegal coroutine operation (yield outside a coroutine, yield
    /// across a native boundary, resume of a dead coroutine).
    Coroutine(String),
    /// error() with an arbitrary engine value.
    User(TValue),
}

impl LuaError {
    /// Convert into an engine value for pcall/xpcall/resume results.
    pub fn to_value(&self, strings: &mut StringInterner) -> TValue {
        match self {
            LuaError::User(v) => *v,
            other => {
                let msg = other.to_string();
                TValue::from_string_id(strings.intern(msg.as_bytes()))
            }
        }
    }

    /// Short kind name (test introspection).
    pub fn kind(&self) -> &'static str {
        match self {
            LuaError::Type(_) => "TypeError",
            LuaError::ArithCoercion(_) => "ArithCoercionError",
            LuaError::StackOverflow => "StackOverflow",
            LuaError::BadKey(_) => "BadKey",
            LuaError::Coroutine(_) => "CoroutineError",
            LuaError::User(_) => "UserError",
        }
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaError::Type(msg) => write!(f, "{msg}"),
            LuaError::ArithCoercion(msg) => write!(f, "{msg}"),
            LuaError::StackOverflow => write!(f, "stack overflow"),
            LuaError::BadKey(msg) => write!(f, "{msg}"),
            LuaError::Coroutine(msg) => write!(f, "{msg}"),
            LuaError::User(v) => write!(f, "{v:?}"),
        }
    }
}

impl std::error::Error for LuaError {}

impl From<mond_core::heap::NativeError> for LuaError {
    fn from(e: mond_core::heap::NativeError) -> Self {
        match e {
            mond_core::heap::NativeError::Message(m) => LuaError::Type(m),
            mond_core::heap::NativeError::Value(v) => LuaError::User(v),
        }
    }
}
