//! A collection of useful items to make it easier to work with `milk_runtime`

#[doc(inline)]
pub use crate::{
    runtime_error, DefaultStderr, DefaultStdout, Error, MFunction, MString, MTable, MThread,
    MUserData, MValue, MetaMethod, MilkUserData, MilkVm, MilkVmSettings, MilkWrite, Result,
    ThreadStatus, ValueKey, MULTRET, YIELD,
};
