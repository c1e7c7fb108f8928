//! The stack-based interface host functions use to talk to the runtime
//!
//! Host functions observe a 1-based value stack scoped to their own call frame:
//! argument 1 is `get(1)`, results are pushed and counted in the function's
//! return value. The `check_*`/`opt_*` helpers produce the conventional
//! "bad argument" errors when validation fails.

use crate::{
    error::ErrorKind,
    runtime_error,
    vm::{CallOutcome, LoopOutcome},
    Error, MFunction, MString, MTable, MThread, MUserData, MValue, MetaMethod, MilkUserData,
    MilkVm, Result, MULTRET,
};

impl MilkVm {
    // ------------------------------------------------------------------------
    // Stack manipulation

    /// The number of values in the current frame's window
    pub fn get_top(&self) -> usize {
        self.reg_top().saturating_sub(self.frame_local_base())
    }

    /// Moves the frame's top; negative indices count back from the current top
    pub fn set_top(&mut self, index: i64) -> Result<()> {
        let local_base = self.frame_local_base() as i64;
        let top = self.reg_top() as i64;
        let new_top = if index >= 0 {
            local_base + index
        } else {
            top + index + 1
        };
        self.reg_set_top(new_top.max(local_base) as usize)
    }

    /// Pushes a value onto the frame's stack
    pub fn push(&mut self, value: impl Into<MValue>) -> Result<()> {
        self.reg_push(value.into())
    }

    /// Pops `count` values from the frame's stack
    pub fn pop(&mut self, count: usize) {
        let top = self.get_top();
        let _ = self.set_top(top.saturating_sub(count) as i64);
    }

    /// Inserts a value at the given 1-based position, shifting values above it up
    pub fn insert(&mut self, value: MValue, index: usize) -> Result<()> {
        let position = self.frame_local_base() + index.saturating_sub(1);
        self.registry().borrow_mut().insert(value, position)
    }

    /// The value at the given index; 1-based, negative counts back from the top
    pub fn get(&self, index: i64) -> MValue {
        let local_base = self.frame_local_base();
        let top = self.reg_top();
        if index > 0 {
            let absolute = local_base + index as usize - 1;
            if absolute < top {
                self.reg_get(absolute)
            } else {
                MValue::Nil
            }
        } else if index < 0 {
            let absolute = top as i64 + index;
            if absolute >= local_base as i64 {
                self.reg_get(absolute as usize)
            } else {
                MValue::Nil
            }
        } else {
            MValue::Nil
        }
    }

    /// The bound upvalue of the executing host function, 1-based
    pub fn upvalue(&self, index: usize) -> MValue {
        self.frame_function()
            .and_then(|f| f.get_upvalue(index.saturating_sub(1)))
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Error reporting

    /// Raises a runtime error prefixed with the current source position
    pub fn raise<T>(&self, message: impl std::fmt::Display) -> Result<T> {
        Err(Error::from(format!("{}{}", self.where_string(), message)))
    }

    /// Raises the conventional "bad argument" error for the given argument
    pub fn arg_error<T>(&self, index: usize, message: impl Into<String>) -> Result<T> {
        Err(Error::from(ErrorKind::BadArgument {
            index,
            name: self.current_function_name(),
            message: message.into(),
        }))
    }

    fn type_arg_error<T>(&self, index: usize, expected: &str) -> Result<T> {
        let got = match self.get(index as i64) {
            MValue::Nil if index > self.get_top() => "no value".to_string(),
            value => value.type_name().to_string(),
        };
        self.arg_error(index, format!("{expected} expected, got {got}"))
    }

    pub(crate) fn current_function_name(&self) -> String {
        self.frame_function()
            .map(|f| f.name_for_error())
            .unwrap_or_else(|| "?".to_string())
    }

    // ------------------------------------------------------------------------
    // Argument validation

    /// The argument at the given index, which must be present
    pub fn check_any(&self, index: usize) -> Result<MValue> {
        if index > self.get_top() {
            return self.arg_error(index, "value expected");
        }
        Ok(self.get(index as i64))
    }

    /// The argument at the given index as a number, coercing numeric strings
    pub fn check_number(&self, index: usize) -> Result<f64> {
        match self.get(index as i64).as_coerced_number() {
            Some(n) => Ok(n),
            None => self.type_arg_error(index, "number"),
        }
    }

    /// The argument at the given index as an integer
    pub fn check_int(&self, index: usize) -> Result<i64> {
        Ok(self.check_number(index)? as i64)
    }

    /// The argument at the given index as a string; numbers convert
    pub fn check_string(&self, index: usize) -> Result<MString> {
        match self.get(index as i64) {
            MValue::Str(s) => Ok(s),
            MValue::Number(n) => Ok(MString::from(crate::number_to_string(n))),
            _ => self.type_arg_error(index, "string"),
        }
    }

    /// The argument at the given index as a bool, using truthiness
    pub fn check_bool(&self, index: usize) -> Result<bool> {
        Ok(self.check_any(index)?.is_truthy())
    }

    /// The argument at the given index, which must be a table
    pub fn check_table(&self, index: usize) -> Result<MTable> {
        match self.get(index as i64) {
            MValue::Table(t) => Ok(t),
            _ => self.type_arg_error(index, "table"),
        }
    }

    /// The argument at the given index, which must be a function
    pub fn check_function(&self, index: usize) -> Result<MFunction> {
        match self.get(index as i64) {
            MValue::Function(f) => Ok(f),
            _ => self.type_arg_error(index, "function"),
        }
    }

    /// The argument at the given index, which must be a thread
    pub fn check_thread(&self, index: usize) -> Result<MThread> {
        match self.get(index as i64) {
            MValue::Thread(t) => Ok(t),
            _ => self.type_arg_error(index, "thread"),
        }
    }

    /// The argument at the given index, which must be a userdata
    pub fn check_userdata(&self, index: usize) -> Result<MUserData> {
        match self.get(index as i64) {
            MValue::UserData(u) => Ok(u),
            _ => self.type_arg_error(index, "userdata"),
        }
    }

    /// The argument at the given index as a number, or the default when nil or missing
    pub fn opt_number(&self, index: usize, default: f64) -> Result<f64> {
        match self.get(index as i64) {
            MValue::Nil => Ok(default),
            _ => self.check_number(index),
        }
    }

    /// The argument at the given index as an integer, or the default when nil or missing
    pub fn opt_int(&self, index: usize, default: i64) -> Result<i64> {
        match self.get(index as i64) {
            MValue::Nil => Ok(default),
            _ => self.check_int(index),
        }
    }

    /// The argument at the given index as a string, or the default when nil or missing
    pub fn opt_string(&self, index: usize, default: &str) -> Result<MString> {
        match self.get(index as i64) {
            MValue::Nil => Ok(default.into()),
            _ => self.check_string(index),
        }
    }

    // ------------------------------------------------------------------------
    // Value construction

    /// Makes an empty table
    pub fn new_table(&self) -> MTable {
        MTable::new()
    }

    /// Makes a table with the given capacity hints
    pub fn create_table(&self, array: usize, hash: usize) -> MTable {
        MTable::with_capacity(array, hash)
    }

    /// Wraps a host payload as a userdata value
    pub fn new_userdata(&self, data: impl MilkUserData) -> MUserData {
        MUserData::new(data)
    }

    /// Makes a host function whose environment is the globals table
    pub fn new_function(
        &self,
        name: Option<&str>,
        callback: impl Fn(&mut MilkVm) -> Result<i32> + 'static,
    ) -> MFunction {
        MFunction::native(name, self.globals(), callback)
    }

    /// Makes a host function closing over the given upvalues
    pub fn new_closure(
        &self,
        name: Option<&str>,
        callback: impl Fn(&mut MilkVm) -> Result<i32> + 'static,
        upvalues: Vec<MValue>,
    ) -> MFunction {
        MFunction::native_with_upvalues(name, self.globals(), callback, upvalues)
    }

    // ------------------------------------------------------------------------
    // Table access

    /// Reads `table[key]` without metamethods
    pub fn raw_get(&self, table: &MTable, key: &MValue) -> MValue {
        table.raw_get(key)
    }

    /// Writes `table[key] = value` without metamethods
    pub fn raw_set(&self, table: &MTable, key: MValue, value: MValue) -> Result<()> {
        table.raw_set(key, value)
    }

    /// Reads `object[name]` with metamethods
    pub fn get_field(&mut self, object: &MValue, name: &str) -> Result<MValue> {
        self.index_value(object, &MValue::Str(name.into()))
    }

    /// Writes `object[name] = value` with metamethods
    pub fn set_field(&mut self, object: &MValue, name: &str, value: MValue) -> Result<()> {
        self.set_index(object, MValue::Str(name.into()), value)
    }

    /// Reads `object[key]` with metamethods
    pub fn get_table(&mut self, object: &MValue, key: &MValue) -> Result<MValue> {
        self.index_value(object, key)
    }

    /// Writes `object[key] = value` with metamethods
    pub fn set_table(&mut self, object: &MValue, key: MValue, value: MValue) -> Result<()> {
        self.set_index(object, key, value)
    }

    /// Visits every non-nil pair of a table
    pub fn for_each(
        &mut self,
        table: &MTable,
        mut f: impl FnMut(&mut MilkVm, MValue, MValue) -> Result<()>,
    ) -> Result<()> {
        for (key, value) in table.pairs() {
            f(self, key, value)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Calling

    /// Calls the function below the top `nargs` values, unprotected
    ///
    /// The function and its arguments are consumed, and `nret` results (or all
    /// results for [MULTRET]) take their place.
    pub fn call(&mut self, nargs: usize, nret: i32) -> Result<()> {
        let top = self.reg_top();
        if top < self.frame_local_base() + nargs + 1 {
            return runtime_error!("not enough values on the stack for the call");
        }
        let base = top - nargs - 1;
        match self.do_call(base, nargs, nret, base)? {
            CallOutcome::ScriptFrame => {
                let depth = self.exec_mut().frames.len();
                match self.run_loop(depth, false)? {
                    LoopOutcome::Done => Ok(()),
                    LoopOutcome::Yield(_) => unreachable!("yield through a non-boundary loop"),
                }
            }
            CallOutcome::NativeDone => Ok(()),
            CallOutcome::NativeYield(_) => {
                self.exec_mut().pending_resume = None;
                runtime_error!("attempt to yield across a host call boundary")
            }
        }
    }

    /// Calls the function below the top `nargs` values, catching errors
    ///
    /// On failure the stack is restored, the optional handler transforms the
    /// error value, and the (possibly transformed) error is returned.
    pub fn pcall(&mut self, nargs: usize, nret: i32, handler: Option<MValue>) -> Result<()> {
        let top = self.reg_top();
        if top < self.frame_local_base() + nargs + 1 {
            return runtime_error!("not enough values on the stack for the call");
        }
        let base = top - nargs - 1;
        let saved_frames = self.exec_mut().frames.len();

        match self.call(nargs, nret) {
            Ok(()) => Ok(()),
            Err(error) => {
                // unwinding closes upvalues and discards frames up to here
                self.exec_mut().frames.truncate(saved_frames);
                self.close_upvalues(base);
                self.reg_set_top(base)?;
                match handler {
                    Some(handler) => {
                        let transformed = self.call_value(handler, &[error.value()])?;
                        Err(Error::from_value(transformed))
                    }
                    None => Err(error),
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Metatables

    /// The metatable of a value as scripts see it, respecting `__metatable`
    pub fn get_metatable(&self, value: &MValue) -> MValue {
        match self.metatable_of(value) {
            Some(mt) => {
                let protected = mt.raw_get_str(MetaMethod::Metatable.name());
                if protected.is_nil() {
                    MValue::Table(mt)
                } else {
                    protected
                }
            }
            None => MValue::Nil,
        }
    }

    /// Replaces a value's metatable, refusing when `__metatable` protects it
    pub fn set_metatable(&self, value: &MValue, metatable: Option<MTable>) -> Result<()> {
        if let Some(existing) = self.metatable_of(value) {
            if !existing.raw_get_str(MetaMethod::Metatable.name()).is_nil() {
                return runtime_error!("cannot change a protected metatable");
            }
        }
        self.set_metatable_raw(value, metatable)
    }

    /// Replaces a value's metatable without the `__metatable` check
    pub fn set_metatable_raw(&self, value: &MValue, metatable: Option<MTable>) -> Result<()> {
        match value {
            MValue::Table(t) => t.set_metatable(metatable),
            MValue::UserData(u) => u.set_metatable(metatable),
            MValue::Nil => return runtime_error!("cannot set metatable to a nil value"),
            other => self.set_type_metatable(other.type_name(), metatable),
        }
        Ok(())
    }

    /// Reads a named field from a value's metatable
    pub fn get_meta_field(&self, value: &MValue, name: &str) -> MValue {
        match self.metatable_of(value) {
            Some(mt) => mt.raw_get_str(name),
            None => MValue::Nil,
        }
    }

    // ------------------------------------------------------------------------
    // Conversions

    /// Renders a value as a string, honoring `__tostring`
    pub fn to_string_meta(&mut self, value: &MValue) -> Result<MString> {
        match self.get_metamethod(value, MetaMethod::ToString) {
            Some(handler) => match self.call_value(handler, &[value.clone()])? {
                MValue::Str(s) => Ok(s),
                other => Ok(MString::from(other.to_string())),
            },
            None => Ok(MString::from(value.to_string())),
        }
    }

    // ------------------------------------------------------------------------
    // Module registration

    /// Installs a module table into the globals under the given name
    pub fn register_module(&self, name: &str, module: MTable) {
        self.globals().raw_set_str(name, MValue::Table(module));
    }

    /// Adds a host function to a module table
    ///
    /// The wrapped closure's environment is the module table itself.
    pub fn add_module_fn(
        &self,
        module: &MTable,
        name: &str,
        callback: impl Fn(&mut MilkVm) -> Result<i32> + 'static,
    ) {
        let function = MFunction::native(Some(name), module.clone(), callback);
        module.raw_set_str(name, MValue::Function(function));
    }
}
