use crate::{Error, MString, MValue, Result};
use std::hash::{Hash, Hasher};

/// A value that has been checked for use as a table key
///
/// Keys are never nil and never NaN; reference-typed keys hash and compare by
/// identity, primitives by value. Negative zero is canonicalized to zero so that
/// `t[0.0]` and `t[-0.0]` address the same slot.
#[derive(Clone, Debug)]
pub enum ValueKey {
    /// A boolean key
    Bool(bool),
    /// A (non-NaN) number key
    Number(f64),
    /// A string key
    Str(MString),
    /// A reference-typed key, compared by identity
    Ref(RefKey),
}

impl ValueKey {
    /// Checks a value for use as a table key
    ///
    /// Fails for nil and NaN keys, the two values that tables reject.
    pub fn new(value: MValue) -> Result<Self> {
        let result = match value {
            MValue::Nil => return Err(Error::from("table index is nil")),
            MValue::Number(n) if n.is_nan() => return Err(Error::from("table index is NaN")),
            MValue::Number(n) => Self::Number(if n == 0.0 { 0.0 } else { n }),
            MValue::Bool(b) => Self::Bool(b),
            MValue::Str(s) => Self::Str(s),
            other => Self::Ref(RefKey::new(other)),
        };
        Ok(result)
    }

    /// A key for the given integer index
    pub fn int(i: i64) -> Self {
        Self::Number(i as f64)
    }

    /// A key for the given string
    pub fn str(s: &str) -> Self {
        Self::Str(s.into())
    }

    /// The key as a value
    pub fn value(&self) -> MValue {
        match self {
            Self::Bool(b) => MValue::Bool(*b),
            Self::Number(n) => MValue::Number(*n),
            Self::Str(s) => MValue::Str(s.clone()),
            Self::Ref(r) => r.value.clone(),
        }
    }

    /// The key's integer index, when it's an exactly integral number
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }
}

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        use ValueKey::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Ref(a), Ref(b)) => a.ptr == b.ptr,
            _ => false,
        }
    }
}

impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            Self::Number(n) => {
                state.write_u8(2);
                state.write_u64(n.to_bits());
            }
            Self::Str(s) => {
                state.write_u8(3);
                s.hash(state);
            }
            Self::Ref(r) => {
                state.write_u8(4);
                state.write_usize(r.ptr);
            }
        }
    }
}

/// A reference-typed table key, held by identity
#[derive(Clone, Debug)]
pub struct RefKey {
    value: MValue,
    ptr: usize,
}

impl RefKey {
    fn new(value: MValue) -> Self {
        let ptr = match &value {
            MValue::Table(t) => t.ptr_id(),
            MValue::Function(f) => f.ptr_id(),
            MValue::UserData(u) => u.ptr_id(),
            MValue::Thread(t) => t.ptr_id(),
            _ => unreachable!("RefKey is only made for reference types"),
        };
        Self { value, ptr }
    }
}
