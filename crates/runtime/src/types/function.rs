use crate::{MTable, MValue, MilkVm, Result, Upvalue};
use milk_bytecode::FunctionProto;
use std::{cell::RefCell, rc::Rc};

/// The signature of a host function
///
/// Host functions see their arguments through the VM's stack interface and
/// return the number of results they've pushed, or [YIELD](crate::YIELD) to
/// suspend the calling coroutine.
pub type NativeFn = Box<dyn Fn(&mut MilkVm) -> Result<i32>>;

/// The name a function was registered or bound under, when known
pub type FunctionName = Option<Rc<str>>;

pub(crate) struct ScriptFunction {
    pub proto: Rc<FunctionProto>,
    pub upvalues: Vec<Upvalue>,
    pub env: RefCell<MTable>,
}

pub(crate) struct NativeFunction {
    pub callback: NativeFn,
    pub upvalues: Vec<MValue>,
    pub name: FunctionName,
    pub env: MTable,
}

pub(crate) enum FunctionInner {
    Script(ScriptFunction),
    Native(NativeFunction),
}

/// The function type used in Milk
///
/// A function is either a script closure (a prototype paired with upvalue cells
/// and an environment table) or a host function. Functions are shared references
/// compared by identity.
#[derive(Clone)]
pub struct MFunction {
    inner: Rc<FunctionInner>,
}

impl MFunction {
    /// Makes a script closure from a prototype, its bound upvalues, and its environment
    pub fn script(proto: Rc<FunctionProto>, upvalues: Vec<Upvalue>, env: MTable) -> Self {
        Self {
            inner: Rc::new(FunctionInner::Script(ScriptFunction {
                proto,
                upvalues,
                env: RefCell::new(env),
            })),
        }
    }

    /// Makes a host function
    pub fn native(
        name: Option<&str>,
        env: MTable,
        callback: impl Fn(&mut MilkVm) -> Result<i32> + 'static,
    ) -> Self {
        Self::native_with_upvalues(name, env, callback, Vec::new())
    }

    /// Makes a host function with bound upvalues
    pub fn native_with_upvalues(
        name: Option<&str>,
        env: MTable,
        callback: impl Fn(&mut MilkVm) -> Result<i32> + 'static,
        upvalues: Vec<MValue>,
    ) -> Self {
        Self {
            inner: Rc::new(FunctionInner::Native(NativeFunction {
                callback: Box::new(callback),
                upvalues,
                name: name.map(Rc::from),
                env,
            })),
        }
    }

    pub(crate) fn inner(&self) -> &FunctionInner {
        &self.inner
    }

    /// True for host functions
    pub fn is_native(&self) -> bool {
        matches!(&*self.inner, FunctionInner::Native(_))
    }

    /// The script closure's prototype
    pub fn proto(&self) -> Option<Rc<FunctionProto>> {
        match &*self.inner {
            FunctionInner::Script(f) => Some(f.proto.clone()),
            FunctionInner::Native(_) => None,
        }
    }

    /// The function's environment table
    pub fn env(&self) -> MTable {
        match &*self.inner {
            FunctionInner::Script(f) => f.env.borrow().clone(),
            FunctionInner::Native(f) => f.env.clone(),
        }
    }

    /// Replaces a script closure's environment, returning false for host functions
    pub fn set_env(&self, env: MTable) -> bool {
        match &*self.inner {
            FunctionInner::Script(f) => {
                *f.env.borrow_mut() = env;
                true
            }
            FunctionInner::Native(_) => false,
        }
    }

    /// The name the function is known by, when there is one
    pub fn name(&self) -> FunctionName {
        match &*self.inner {
            FunctionInner::Script(f) => f.proto.name.clone(),
            FunctionInner::Native(f) => f.name.clone(),
        }
    }

    /// A name for the function suitable for error messages
    pub fn name_for_error(&self) -> String {
        match self.name() {
            Some(name) => name.to_string(),
            None => "?".to_string(),
        }
    }

    /// The number of upvalues the function binds
    pub fn upvalue_count(&self) -> usize {
        match &*self.inner {
            FunctionInner::Script(f) => f.upvalues.len(),
            FunctionInner::Native(f) => f.upvalues.len(),
        }
    }

    /// The current value of the upvalue at the given index
    pub fn get_upvalue(&self, index: usize) -> Option<MValue> {
        match &*self.inner {
            FunctionInner::Script(f) => f.upvalues.get(index).map(Upvalue::get),
            FunctionInner::Native(f) => f.upvalues.get(index).cloned(),
        }
    }

    /// Assigns to a script closure's upvalue
    ///
    /// Host function upvalues are bound at construction and can't be reassigned.
    pub fn set_upvalue(&self, index: usize, value: MValue) -> bool {
        match &*self.inner {
            FunctionInner::Script(f) => match f.upvalues.get(index) {
                Some(cell) => {
                    cell.set(value);
                    true
                }
                None => false,
            },
            FunctionInner::Native(_) => false,
        }
    }

    /// The debug name of the upvalue at the given index
    pub fn upvalue_name(&self, index: usize) -> Option<Rc<str>> {
        match &*self.inner {
            FunctionInner::Script(f) => f
                .proto
                .upvalue_names
                .get(index)
                .and_then(|name| name.0.clone()),
            FunctionInner::Native(_) => None,
        }
    }

    /// An address that identifies the function
    pub fn ptr_id(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }

    /// True if both values alias the same function
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}
