use crate::Instruction;
use std::{fmt, fmt::Write, rc::Rc};

/// A value in a prototype's constant pool
///
/// The pool holds the literals referenced by LOADK and by RK operands.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    /// The nil literal
    Nil,
    /// A boolean literal
    Bool(bool),
    /// A numeric literal
    Number(f64),
    /// A string literal
    Str(Rc<str>),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Nil => f.write_str("nil"),
            Constant::Bool(b) => write!(f, "{b}"),
            Constant::Number(n) => write!(f, "{n}"),
            Constant::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// How a closure's upvalue binds to its enclosing function
///
/// The descriptors are carried as pseudo-instructions following CLOSURE
/// (MOVE captures a parent local, GETUPVAL shares a parent upvalue); the
/// names here are debug info only.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpvalueName(pub Option<Rc<str>>);

/// A compiled, immutable description of a Milk function
///
/// Prototypes are produced by the compiler (or a [ProtoBuilder](crate::ProtoBuilder))
/// and live for the lifetime of the loaded chunk. Closures pair a prototype with
/// bound upvalue cells at runtime.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FunctionProto {
    /// The instruction stream
    pub code: Vec<Instruction>,
    /// The constant pool
    pub constants: Vec<Constant>,
    /// Prototypes of nested functions, indexed by CLOSURE's Bx operand
    pub protos: Vec<Rc<FunctionProto>>,
    /// The number of declared parameters
    pub num_params: u8,
    /// Whether extra arguments are collected as varargs
    pub is_vararg: bool,
    /// The number of upvalues, and so the number of pseudo-instructions after CLOSURE
    pub num_upvalues: u8,
    /// The number of registers the function uses
    pub used_registers: u8,
    /// The name of the defining source
    pub source: Rc<str>,
    /// The name the function was bound to, when known
    pub name: Option<Rc<str>>,
    /// The line on which the function's definition starts
    pub line_defined: u32,
    /// The line on which the function's definition ends
    pub last_line_defined: u32,
    /// The source line for each instruction
    pub source_lines: Vec<u32>,
    /// Debug names for the function's upvalues
    pub upvalue_names: Vec<UpvalueName>,
}

impl FunctionProto {
    /// The source line that produced the instruction at the given ip
    pub fn line_at(&self, ip: usize) -> u32 {
        self.source_lines.get(ip).copied().unwrap_or(0)
    }

    /// A name for the function suitable for error messages and tracebacks
    pub fn name_for_display(&self) -> String {
        match &self.name {
            Some(name) => format!("function '{name}'"),
            None if self.line_defined == 0 => "main chunk".to_string(),
            None => format!("function <{}:{}>", self.source, self.line_defined),
        }
    }

    /// Renders the prototype's instructions, annotated, one per line
    ///
    /// Nested prototypes are appended after the parent's listing.
    pub fn disassemble(&self) -> String {
        let mut result = String::new();
        self.disassemble_into(&mut result);
        result
    }

    fn disassemble_into(&self, result: &mut String) {
        writeln!(
            result,
            "; {} ({}{} params, {} upvalues, {} registers)",
            self.name_for_display(),
            self.num_params,
            if self.is_vararg { "+" } else { "" },
            self.num_upvalues,
            self.used_registers,
        )
        .ok();

        for (ip, instruction) in self.code.iter().enumerate() {
            writeln!(result, "[{:3}] {instruction}", ip).ok();
        }

        for proto in self.protos.iter() {
            result.push('\n');
            proto.disassemble_into(result);
        }
    }
}
