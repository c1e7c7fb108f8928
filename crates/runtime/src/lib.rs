//! Contains the virtual machine and core library for the Milk language
//!
//! The runtime executes [FunctionProto](milk_bytecode::FunctionProto)s produced by an
//! external compiler: values, tables, closures, coroutines, metamethod dispatch, and
//! the host-function interface all live here, along with the pattern matcher used by
//! the string library.

#![warn(missing_docs)]

// error's macros are textually scoped, so it comes before the modules using them
mod error;

mod api;
mod frame;
mod io;
mod meta_ops;
mod registry;
mod types;
mod vm;

pub mod core_lib;
pub mod pattern;
pub mod prelude;

pub use crate::{
    error::{Error, Result},
    io::{DefaultStderr, DefaultStdout, MilkWrite},
    meta_ops::MetaMethod,
    types::{
        number_to_string, parse_number, FunctionName, MFunction, MString, MTable, MThread,
        MUserData, MValue, MilkUserData, NativeFn, ThreadStatus, Upvalue, ValueKey,
    },
    vm::{MilkVm, MilkVmSettings, MULTRET, YIELD},
};
