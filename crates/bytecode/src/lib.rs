//! Contains the Milk runtime's bytecode representation and proto assembler
//!
//! Chunks of Milk bytecode are produced by an external compiler (or by the
//! [ProtoBuilder] directly, which is how the runtime's tests assemble their
//! programs), and consumed by the `milk_runtime` virtual machine.

#![warn(missing_docs)]

mod builder;
mod chunk;
mod instruction;
mod op;

pub use crate::{
    builder::{BuildError, ProtoBuilder},
    chunk::{Constant, FunctionProto, UpvalueName},
    instruction::{Instruction, MAX_ARG_A, MAX_ARG_B, MAX_ARG_BX, MAX_ARG_C, MAX_ARG_SBX, RK_BIT},
    op::Op,
};
