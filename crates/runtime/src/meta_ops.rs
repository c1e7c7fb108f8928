use crate::{MTable, MValue, MilkVm};

/// The metamethod keys recognized by the runtime
///
/// Each operator consults a fixed key in the operand's metatable; the names are
/// ordinary string keys, so scripts install metamethods with plain table writes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetaMethod {
    /// `__add`
    Add,
    /// `__sub`
    Sub,
    /// `__mul`
    Mul,
    /// `__div`
    Div,
    /// `__mod`
    Mod,
    /// `__pow`
    Pow,
    /// `__unm`
    Unm,
    /// `__band`
    BAnd,
    /// `__bor`
    BOr,
    /// `__shl`
    Shl,
    /// `__shr`
    Shr,
    /// `__eq`
    Eq,
    /// `__lt`
    Lt,
    /// `__le`
    Le,
    /// `__len`
    Len,
    /// `__concat`
    Concat,
    /// `__index`
    Index,
    /// `__newindex`
    NewIndex,
    /// `__call`
    Call,
    /// `__tostring`
    ToString,
    /// `__metatable`
    Metatable,
}

impl MetaMethod {
    /// The key the metamethod is stored under
    pub fn name(&self) -> &'static str {
        use MetaMethod::*;
        match self {
            Add => "__add",
            Sub => "__sub",
            Mul => "__mul",
            Div => "__div",
            Mod => "__mod",
            Pow => "__pow",
            Unm => "__unm",
            BAnd => "__band",
            BOr => "__bor",
            Shl => "__shl",
            Shr => "__shr",
            Eq => "__eq",
            Lt => "__lt",
            Le => "__le",
            Len => "__len",
            Concat => "__concat",
            Index => "__index",
            NewIndex => "__newindex",
            Call => "__call",
            ToString => "__tostring",
            Metatable => "__metatable",
        }
    }
}

impl MilkVm {
    /// The metatable attached to a value
    ///
    /// Tables and userdata carry their own metatable; other types share a
    /// per-type metatable installed via the debug library (the string library
    /// installs the string metatable at startup).
    pub fn metatable_of(&self, value: &MValue) -> Option<MTable> {
        match value {
            MValue::Table(t) => t.metatable(),
            MValue::UserData(u) => u.metatable(),
            other => self.type_metatable(other.type_name()),
        }
    }

    /// Looks up a metamethod on the given value
    pub fn get_metamethod(&self, value: &MValue, method: MetaMethod) -> Option<MValue> {
        let metatable = self.metatable_of(value)?;
        match metatable.raw_get_str(method.name()) {
            MValue::Nil => None,
            found => Some(found),
        }
    }

    /// Looks up a metamethod on the left operand, then on the right
    pub(crate) fn binary_metamethod(
        &self,
        lhs: &MValue,
        rhs: &MValue,
        method: MetaMethod,
    ) -> Option<MValue> {
        self.get_metamethod(lhs, method)
            .or_else(|| self.get_metamethod(rhs, method))
    }
}
