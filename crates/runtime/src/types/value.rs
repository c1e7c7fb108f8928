//! The core value type used in the Milk runtime

use crate::{MFunction, MString, MTable, MThread, MUserData};
use std::fmt;

/// The core value type for Milk
///
/// Heap variants are shared references: cloning a Table or Function value aliases
/// the same object, and equality for those variants is referential identity.
#[derive(Clone, Default)]
pub enum MValue {
    /// The absence of a value
    #[default]
    Nil,

    /// A boolean, can be either true or false
    Bool(bool),

    /// A number, represented as a 64 bit float
    Number(f64),

    /// An immutable byte string with a precomputed hash
    Str(MString),

    /// The mixed array and hash container used in Milk
    Table(MTable),

    /// A script closure or a host function
    Function(MFunction),

    /// An opaque host payload with an optional metatable
    UserData(MUserData),

    /// A coroutine
    Thread(MThread),
}

impl MValue {
    /// True unless the value is nil or false
    pub fn is_truthy(&self) -> bool {
        !matches!(self, MValue::Nil | MValue::Bool(false))
    }

    /// True if the value is nil
    pub fn is_nil(&self) -> bool {
        matches!(self, MValue::Nil)
    }

    /// The value's type tag
    ///
    /// These are the tag names used by type assertions and by Type().
    pub fn type_name(&self) -> &'static str {
        use MValue::*;
        match self {
            Nil => "nil",
            Bool(_) => "bool",
            Number(_) => "number",
            Str(_) => "string",
            Table(_) => "table",
            Function(_) => "function",
            UserData(_) => "userdata",
            Thread(_) => "thread",
        }
    }

    /// The value's number, coercing numeric strings the way arithmetic does
    pub fn as_coerced_number(&self) -> Option<f64> {
        match self {
            MValue::Number(n) => Some(*n),
            MValue::Str(s) => parse_number(s),
            _ => None,
        }
    }

    /// True for the value kinds that convert to strings in concatenation
    pub fn can_convert_to_string(&self) -> bool {
        matches!(self, MValue::Number(_) | MValue::Str(_))
    }
}

impl fmt::Display for MValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use MValue::*;
        match self {
            Nil => f.write_str("nil"),
            Bool(b) => write!(f, "{b}"),
            Number(n) => f.write_str(&number_to_string(*n)),
            Str(s) => f.write_str(s),
            Table(t) => write!(f, "table: {:#x}", t.ptr_id()),
            Function(function) => write!(f, "function: {:#x}", function.ptr_id()),
            UserData(u) => write!(f, "userdata: {:#x}", u.ptr_id()),
            Thread(t) => write!(f, "thread: {:#x}", t.ptr_id()),
        }
    }
}

impl fmt::Debug for MValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MValue::Str(s) => write!(f, "{s:?}"),
            other => write!(f, "{other}"),
        }
    }
}

impl PartialEq for MValue {
    fn eq(&self, other: &Self) -> bool {
        use MValue::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Bool(a), Bool(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Table(a), Table(b)) => a.ptr_eq(b),
            (Function(a), Function(b)) => a.ptr_eq(b),
            (UserData(a), UserData(b)) => a.ptr_eq(b),
            (Thread(a), Thread(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<bool> for MValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for MValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for MValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for MValue {
    fn from(value: &str) -> Self {
        Self::Str(value.into())
    }
}

impl From<String> for MValue {
    fn from(value: String) -> Self {
        Self::Str(value.into())
    }
}

impl From<MString> for MValue {
    fn from(value: MString) -> Self {
        Self::Str(value)
    }
}

impl From<MTable> for MValue {
    fn from(value: MTable) -> Self {
        Self::Table(value)
    }
}

impl From<MFunction> for MValue {
    fn from(value: MFunction) -> Self {
        Self::Function(value)
    }
}

impl From<MUserData> for MValue {
    fn from(value: MUserData) -> Self {
        Self::UserData(value)
    }
}

impl From<MThread> for MValue {
    fn from(value: MThread) -> Self {
        Self::Thread(value)
    }
}

/// Renders a number the way ToString and concatenation do
///
/// Finite values use the shortest representation that parses back to the same
/// number, so `ToNumber(ToString(n)) == n` holds for every finite n.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        if n > 0.0 {
            "inf".to_string()
        } else {
            "-inf".to_string()
        }
    } else {
        format!("{n}")
    }
}

/// Parses a numeric literal the way arithmetic coercion does
///
/// Accepts decimal floats and the 0x/0b/0o integer prefixes from the language's
/// numeric syntax, with optional sign and surrounding whitespace.
pub fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (negative, digits) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let lower = digits.to_ascii_lowercase();
    let unsigned = if let Some(hex) = lower.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()? as f64
    } else if let Some(bin) = lower.strip_prefix("0b") {
        i64::from_str_radix(bin, 2).ok()? as f64
    } else if let Some(oct) = lower.strip_prefix("0o") {
        i64::from_str_radix(oct, 8).ok()? as f64
    } else {
        let n: f64 = digits.parse().ok()?;
        // reject "inf"/"nan" spellings, only digit forms coerce
        if !digits.bytes().any(|b| b.is_ascii_digit()) {
            return None;
        }
        n
    };

    Some(if negative { -unsigned } else { unsigned })
}
