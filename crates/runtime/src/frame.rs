use crate::{MFunction, MValue};
use milk_bytecode::FunctionProto;
use std::rc::Rc;

/// An activation record for one function invocation
///
/// Register x of the frame is registry slot `local_base + x`. The function value
/// itself sits at `base`, and results are delivered to `return_base` in the
/// caller's window when the frame returns.
pub(crate) struct CallFrame {
    pub function: MFunction,
    pub pc: usize,
    pub base: usize,
    pub local_base: usize,
    pub return_base: usize,
    pub nargs: usize,
    // The caller's expected result count, or MULTRET
    pub nret: i32,
    // Arguments beyond the declared parameters, for variadic functions
    pub varargs: Vec<MValue>,
    // The number of tail calls that have reused this frame, for tracebacks
    pub tail_calls: u32,
}

impl CallFrame {
    pub fn proto(&self) -> Option<Rc<FunctionProto>> {
        self.function.proto()
    }
}
