use crate::{
    error::ErrorKind,
    frame::CallFrame,
    io::{DefaultStderr, DefaultStdout, MilkWrite},
    registry::Registry,
    runtime_error,
    types::function::FunctionInner,
    types::thread::PendingResume,
    Error, MFunction, MString, MTable, MThread, MValue, MetaMethod, Result, ThreadStatus, Upvalue,
};
use milk_bytecode::{Constant, FunctionProto, Instruction, Op};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::{
    cell::{RefCell, RefMut},
    rc::Rc,
};

/// The expected-result count meaning "collect all results"
pub const MULTRET: i32 = -1;

/// The host-function return sentinel that yields the calling coroutine
pub const YIELD: i32 = -1;

// The stride of SETLIST's bulk table stores
const FIELDS_PER_FLUSH: usize = 50;

/// The configurable settings used by a Milk runtime
pub struct MilkVmSettings {
    /// The register stack limit per thread, in slots
    pub registry_size: usize,
    /// The increment the register stack grows by
    pub registry_grow_step: usize,
    /// The call frame limit per thread
    pub call_stack_size: usize,
    /// The bound on `__index`/`__newindex` chains, guarding metatable cycles
    pub max_index_chain: usize,
    /// The writer used by Print and PrintLn
    pub stdout: Rc<dyn MilkWrite>,
    /// The writer used for uncaught error reports
    pub stderr: Rc<dyn MilkWrite>,
}

impl Default for MilkVmSettings {
    fn default() -> Self {
        Self {
            registry_size: 256 * 20,
            registry_grow_step: 32,
            call_stack_size: 256,
            max_index_chain: 100,
            stdout: Rc::new(DefaultStdout),
            stderr: Rc::new(DefaultStderr),
        }
    }
}

// State shared between all threads of one interpreter instance
pub(crate) struct VmContext {
    pub settings: MilkVmSettings,
    pub globals: MTable,
    pub main_thread: MThread,
    pub current_thread: RefCell<MThread>,
    // Shared metatables for the non-container types, keyed by type tag
    pub type_metatables: RefCell<FxHashMap<String, MTable>>,
}

/// The Milk virtual machine
///
/// A `MilkVm` is a cheap handle onto a thread plus the interpreter-wide context;
/// host functions receive the handle bound to the thread that called them and
/// talk to their arguments through its stack interface.
#[derive(Clone)]
pub struct MilkVm {
    pub(crate) context: Rc<VmContext>,
    pub(crate) thread: MThread,
}

pub(crate) enum CallOutcome {
    // A script frame was pushed, the interpreter loop continues into it
    ScriptFrame,
    // A host function ran to completion and its results were delivered
    NativeDone,
    // A host function requested a yield, carrying the yielded values
    NativeYield(Vec<MValue>),
}

pub(crate) enum LoopOutcome {
    Done,
    Yield(Vec<MValue>),
}

/// The observable result of resuming a coroutine
pub(crate) enum Resumed {
    Return(Vec<MValue>),
    Yield(Vec<MValue>),
    Error(Error),
}

enum Fetched {
    Run(Instruction, Rc<FunctionProto>, usize),
    ImplicitReturn,
    Finished,
}

impl Default for MilkVm {
    fn default() -> Self {
        Self::new()
    }
}

impl MilkVm {
    /// Initializes a VM with default settings and the core library loaded
    pub fn new() -> Self {
        Self::with_settings(MilkVmSettings::default())
    }

    /// Initializes a VM with the provided settings and the core library loaded
    pub fn with_settings(settings: MilkVmSettings) -> Self {
        let registry = Registry::new(64, settings.registry_size, settings.registry_grow_step);
        let main_thread = MThread::new(None, registry);
        main_thread.set_status(ThreadStatus::Running);

        let context = Rc::new(VmContext {
            settings,
            globals: MTable::new(),
            main_thread: main_thread.clone(),
            current_thread: RefCell::new(main_thread.clone()),
            type_metatables: RefCell::new(FxHashMap::default()),
        });

        let vm = Self {
            context,
            thread: main_thread,
        };
        crate::core_lib::register(&vm);
        vm
    }

    /// The globals table shared by every thread in this runtime
    pub fn globals(&self) -> MTable {
        self.context.globals.clone()
    }

    /// The writer installed for script output
    pub fn stdout(&self) -> Rc<dyn MilkWrite> {
        self.context.settings.stdout.clone()
    }

    /// The writer installed for error reports
    pub fn stderr(&self) -> Rc<dyn MilkWrite> {
        self.context.settings.stderr.clone()
    }

    /// The thread this handle is bound to
    pub fn thread(&self) -> MThread {
        self.thread.clone()
    }

    /// The runtime's main thread
    pub fn main_thread(&self) -> MThread {
        self.context.main_thread.clone()
    }

    /// The thread that's currently executing
    pub fn current_thread(&self) -> MThread {
        self.context.current_thread.borrow().clone()
    }

    /// True if this handle is bound to the main thread
    pub fn is_main_thread(&self) -> bool {
        self.thread.ptr_eq(&self.context.main_thread)
    }

    /// Runs a compiled prototype as the main chunk, returning its results
    pub fn run(&mut self, proto: Rc<FunctionProto>) -> Result<Vec<MValue>> {
        let closure = MFunction::script(proto, Vec::new(), self.globals());
        self.call_value_multi(MValue::Function(closure), &[])
    }

    /// The per-type metatable for the given type tag
    pub fn type_metatable(&self, tag: &str) -> Option<MTable> {
        self.context.type_metatables.borrow().get(tag).cloned()
    }

    /// Installs or clears the per-type metatable for the given type tag
    pub fn set_type_metatable(&self, tag: &str, metatable: Option<MTable>) {
        let mut metatables = self.context.type_metatables.borrow_mut();
        match metatable {
            Some(mt) => {
                metatables.insert(tag.to_string(), mt);
            }
            None => {
                metatables.remove(tag);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Registry and frame access

    pub(crate) fn registry(&self) -> Rc<RefCell<Registry>> {
        self.thread.0.registry.clone()
    }

    pub(crate) fn reg_top(&self) -> usize {
        self.thread.0.registry.borrow().top()
    }

    pub(crate) fn reg_get(&self, index: usize) -> MValue {
        self.thread.0.registry.borrow().get(index)
    }

    pub(crate) fn reg_set(&self, index: usize, value: MValue) -> Result<()> {
        self.thread.0.registry.borrow_mut().set(index, value)
    }

    pub(crate) fn reg_push(&self, value: MValue) -> Result<()> {
        self.thread.0.registry.borrow_mut().push(value)
    }

    pub(crate) fn reg_set_top(&self, top: usize) -> Result<()> {
        self.thread.0.registry.borrow_mut().set_top(top)
    }

    pub(crate) fn exec_mut(&self) -> RefMut<'_, crate::types::thread::ThreadExec> {
        self.thread.0.exec.borrow_mut()
    }

    pub(crate) fn frame_function(&self) -> Option<MFunction> {
        self.exec_mut().frames.last().map(|f| f.function.clone())
    }

    pub(crate) fn frame_local_base(&self) -> usize {
        self.exec_mut().frames.last().map_or(0, |f| f.local_base)
    }

    /// A "source:line: " prefix describing where execution currently is
    pub(crate) fn where_string(&self) -> String {
        let exec = self.thread.0.exec.borrow();
        for frame in exec.frames.iter().rev() {
            if let Some(proto) = frame.proto() {
                let line = proto.line_at(frame.pc.saturating_sub(1));
                return format!("{}:{}: ", proto.source, line);
            }
        }
        String::new()
    }

    // ------------------------------------------------------------------------
    // Upvalue management

    // Finds the open cell for a stack slot, or opens a new one; the per-thread
    // list is kept sorted by descending stack index.
    fn find_or_create_upvalue(&self, index: usize) -> Upvalue {
        let mut exec = self.exec_mut();

        let mut insert_at = exec.open_upvalues.len();
        for (i, cell) in exec.open_upvalues.iter().enumerate() {
            match cell.stack_index() {
                Some(open_index) if open_index == index => return cell.clone(),
                Some(open_index) if open_index < index => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }

        let cell = Upvalue::open(self.thread.0.registry.clone(), index);
        exec.open_upvalues.insert(insert_at, cell.clone());
        cell
    }

    // Closes every open cell at stack index >= from
    pub(crate) fn close_upvalues(&self, from: usize) {
        let mut exec = self.exec_mut();
        while let Some(cell) = exec.open_upvalues.first() {
            match cell.stack_index() {
                Some(index) if index >= from => {
                    let cell = exec.open_upvalues.remove(0);
                    cell.close();
                }
                _ => break,
            }
        }
    }

    // ------------------------------------------------------------------------
    // The call protocol

    // Dispatches a call: the callee sits at `base`, arguments in the following
    // `nargs` slots, and `nret` results are owed at `return_base`.
    pub(crate) fn do_call(
        &mut self,
        base: usize,
        nargs: usize,
        nret: i32,
        return_base: usize,
    ) -> Result<CallOutcome> {
        let mut nargs = nargs;
        for _ in 0..self.context.settings.max_index_chain {
            let callee = self.reg_get(base);
            match callee {
                MValue::Function(f) => {
                    return match f.inner() {
                        FunctionInner::Script(_) => {
                            self.push_script_frame(f.clone(), base, nargs, nret, return_base)?;
                            Ok(CallOutcome::ScriptFrame)
                        }
                        FunctionInner::Native(_) => {
                            self.call_native(f.clone(), base, nargs, nret, return_base)
                        }
                    };
                }
                other => match self.get_metamethod(&other, MetaMethod::Call) {
                    // __call is invoked with the original value as its first argument
                    Some(handler) => {
                        self.registry().borrow_mut().insert(handler, base)?;
                        nargs += 1;
                    }
                    None => {
                        return runtime_error!(
                            "attempt to call a {} value",
                            other.type_name()
                        )
                    }
                },
            }
        }
        runtime_error!("'__call' chain too long; possible loop")
    }

    fn check_call_depth(&self) -> Result<()> {
        if self.exec_mut().frames.len() >= self.context.settings.call_stack_size {
            return Err(Error::from(ErrorKind::StackOverflow));
        }
        Ok(())
    }

    fn push_script_frame(
        &mut self,
        function: MFunction,
        base: usize,
        nargs: usize,
        nret: i32,
        return_base: usize,
    ) -> Result<()> {
        self.check_call_depth()?;
        let proto = function.proto().expect("script frame without a prototype");
        let local_base = base + 1;
        let num_params = proto.num_params as usize;

        let mut varargs = Vec::new();
        {
            let mut registry = self.thread.0.registry.borrow_mut();

            // missing parameters read as nil
            for i in nargs..num_params {
                registry.set(local_base + i, MValue::Nil)?;
            }
            if nargs > num_params {
                if proto.is_vararg {
                    varargs = registry.slice(local_base + num_params, local_base + nargs);
                }
                // extra argument slots become ordinary (nil) locals
                for i in num_params..nargs {
                    registry.set(local_base + i, MValue::Nil)?;
                }
            }
            registry.set_top(local_base + proto.used_registers as usize)?;
        }

        self.exec_mut().frames.push(CallFrame {
            function,
            pc: 0,
            base,
            local_base,
            return_base,
            nargs: nargs.max(num_params),
            nret,
            varargs,
            tail_calls: 0,
        });
        Ok(())
    }

    fn call_native(
        &mut self,
        function: MFunction,
        base: usize,
        nargs: usize,
        nret: i32,
        return_base: usize,
    ) -> Result<CallOutcome> {
        self.check_call_depth()?;
        let local_base = base + 1;
        self.reg_set_top(local_base + nargs)?;

        self.exec_mut().frames.push(CallFrame {
            function: function.clone(),
            pc: 0,
            base,
            local_base,
            return_base,
            nargs,
            nret,
            varargs: Vec::new(),
            tail_calls: 0,
        });

        let result = match function.inner() {
            FunctionInner::Native(native) => (native.callback)(self),
            FunctionInner::Script(_) => unreachable!("call_native with a script function"),
        };

        match result {
            Err(error) => {
                self.exec_mut().frames.pop();
                Err(error)
            }
            Ok(n) if n == YIELD => {
                let (values, pending) = {
                    let exec = self.thread.0.exec.borrow();
                    let frame = exec.frames.last().expect("missing native frame");
                    let registry = self.thread.0.registry.borrow();
                    let values = registry.slice(frame.local_base, registry.top());
                    (
                        values,
                        PendingResume {
                            return_base: frame.return_base,
                            nret: frame.nret,
                        },
                    )
                };
                let mut exec = self.exec_mut();
                exec.frames.pop();
                exec.pending_resume = Some(pending);
                Ok(CallOutcome::NativeYield(values))
            }
            Ok(n) => {
                let n = n.max(0) as usize;
                let src = self.reg_top().saturating_sub(n);
                self.deliver_results(src, n, return_base, nret)?;
                self.exec_mut().frames.pop();
                Ok(CallOutcome::NativeDone)
            }
        }
    }

    // Copies `count` results from `src` to `return_base`, honoring the caller's
    // expected result count and leaving the top marker in the agreed place.
    fn deliver_results(
        &self,
        src: usize,
        count: usize,
        return_base: usize,
        nret: i32,
    ) -> Result<()> {
        let mut registry = self.thread.0.registry.borrow_mut();
        if nret == MULTRET {
            registry.move_range(src, return_base, count)?;
            registry.set_top(return_base + count)
        } else {
            let wanted = nret.max(0) as usize;
            let copied = count.min(wanted);
            registry.move_range(src, return_base, copied)?;
            if wanted > copied {
                registry.fill_nil(return_base + copied, wanted - copied)?;
            }
            registry.set_top(return_base + wanted)
        }
    }

    fn deliver_slice(&self, values: &[MValue], return_base: usize, nret: i32) -> Result<()> {
        let mut registry = self.thread.0.registry.borrow_mut();
        let wanted = if nret == MULTRET {
            values.len()
        } else {
            nret.max(0) as usize
        };
        for i in 0..wanted {
            registry.set(return_base + i, values.get(i).cloned().unwrap_or_default())?;
        }
        registry.set_top(return_base + wanted)
    }

    /// Calls a callable value with the given arguments, returning all results
    pub fn call_value_multi(&mut self, function: MValue, args: &[MValue]) -> Result<Vec<MValue>> {
        let base = self.reg_top();
        self.reg_push(function)?;
        for arg in args {
            self.reg_push(arg.clone())?;
        }

        match self.do_call(base, args.len(), MULTRET, base) {
            Ok(CallOutcome::ScriptFrame) => {
                let depth = self.exec_mut().frames.len();
                match self.run_loop(depth, false)? {
                    LoopOutcome::Done => {}
                    LoopOutcome::Yield(_) => unreachable!("yield through a non-boundary loop"),
                }
            }
            Ok(CallOutcome::NativeDone) => {}
            Ok(CallOutcome::NativeYield(_)) => {
                self.exec_mut().pending_resume = None;
                return runtime_error!("attempt to yield across a host call boundary");
            }
            Err(error) => {
                self.reg_set_top(base)?;
                return Err(error);
            }
        }

        let top = self.reg_top();
        let results = self.thread.0.registry.borrow().slice(base, top);
        self.reg_set_top(base)?;
        Ok(results)
    }

    /// Calls a callable value with the given arguments, returning its first result
    pub fn call_value(&mut self, function: MValue, args: &[MValue]) -> Result<MValue> {
        let results = self.call_value_multi(function, args)?;
        Ok(results.into_iter().next().unwrap_or_default())
    }

    // ------------------------------------------------------------------------
    // The interpreter loop

    pub(crate) fn run_loop(&mut self, min_depth: usize, boundary: bool) -> Result<LoopOutcome> {
        match self.execute_instructions(min_depth, boundary) {
            Ok(outcome) => Ok(outcome),
            Err(error) => Err(self.unwind(error, min_depth)),
        }
    }

    // Pops this loop's frames after an error, recording the traceback and
    // closing upvalues that pointed into the discarded frames.
    fn unwind(&mut self, mut error: Error, min_depth: usize) -> Error {
        let mut close_from = None;
        {
            let mut exec = self.exec_mut();
            while exec.frames.len() >= min_depth.max(1) {
                let frame = match exec.frames.pop() {
                    Some(frame) => frame,
                    None => break,
                };
                if let Some(proto) = frame.proto() {
                    error.extend_trace(proto, frame.pc.saturating_sub(1) as u32);
                }
                close_from = Some(frame.base);
            }
        }
        if let Some(base) = close_from {
            self.close_upvalues(base);
        }
        error
    }

    fn fetch(&self, min_depth: usize) -> Fetched {
        let mut exec = self.exec_mut();
        if exec.frames.len() < min_depth {
            return Fetched::Finished;
        }
        let frame = match exec.frames.last_mut() {
            Some(frame) => frame,
            None => return Fetched::Finished,
        };
        let proto = frame.proto().expect("native frame in the interpreter loop");
        match proto.code.get(frame.pc) {
            Some(instruction) => {
                let instruction = *instruction;
                frame.pc += 1;
                Fetched::Run(instruction, proto, frame.local_base)
            }
            None => Fetched::ImplicitReturn,
        }
    }

    // Returns from the current frame with `count` results starting at `first`.
    // True means this loop's bottom frame has returned.
    fn return_from_frame(&mut self, first: usize, count: usize, min_depth: usize) -> Result<bool> {
        let local_base = self.frame_local_base();
        self.close_upvalues(local_base);

        let frame = self
            .exec_mut()
            .frames
            .pop()
            .expect("return without a frame");
        self.deliver_results(first, count, frame.return_base, frame.nret)?;

        Ok(self.exec_mut().frames.len() < min_depth)
    }

    fn execute_instructions(&mut self, min_depth: usize, boundary: bool) -> Result<LoopOutcome> {
        loop {
            let (instruction, proto, local_base) = match self.fetch(min_depth) {
                Fetched::Finished => return Ok(LoopOutcome::Done),
                Fetched::ImplicitReturn => {
                    let local_base = self.frame_local_base();
                    if self.return_from_frame(local_base, 0, min_depth)? {
                        return Ok(LoopOutcome::Done);
                    }
                    continue;
                }
                Fetched::Run(instruction, proto, local_base) => (instruction, proto, local_base),
            };

            let op = match instruction.op() {
                Some(op) => op,
                None => return runtime_error!("invalid instruction {:#010x}", instruction.0),
            };

            let a = instruction.a() as usize;
            let b = instruction.b();
            let c = instruction.c();

            match op {
                Op::Move => {
                    let value = self.reg_get(local_base + b as usize);
                    self.reg_set(local_base + a, value)?;
                }
                Op::MoveN => {
                    let mut moves: SmallVec<[(usize, usize); 8]> = SmallVec::new();
                    moves.push((a, b as usize));
                    {
                        let mut exec = self.exec_mut();
                        let frame = exec.frames.last_mut().expect("missing frame");
                        for _ in 0..c {
                            let Some(folded) = proto.code.get(frame.pc) else {
                                break;
                            };
                            moves.push((folded.a() as usize, folded.b() as usize));
                            frame.pc += 1;
                        }
                    }
                    for (target, source) in moves {
                        let value = self.reg_get(local_base + source);
                        self.reg_set(local_base + target, value)?;
                    }
                }
                Op::LoadK => {
                    let value = constant_value(&proto, instruction.bx() as usize)?;
                    self.reg_set(local_base + a, value)?;
                }
                Op::LoadBool => {
                    self.reg_set(local_base + a, MValue::Bool(b != 0))?;
                    if c != 0 {
                        self.jump(1);
                    }
                }
                Op::LoadNil => {
                    for i in a..=(b as usize).max(a) {
                        self.reg_set(local_base + i, MValue::Nil)?;
                    }
                }
                Op::GetUpval => {
                    let function = self.frame_function().expect("missing frame");
                    let value = function.get_upvalue(b as usize).unwrap_or_default();
                    self.reg_set(local_base + a, value)?;
                }
                Op::SetUpval => {
                    let function = self.frame_function().expect("missing frame");
                    let value = self.reg_get(local_base + a);
                    function.set_upvalue(b as usize, value);
                }
                Op::GetGlobal => {
                    let env = self.frame_function().expect("missing frame").env();
                    let key = constant_value(&proto, instruction.bx() as usize)?;
                    let value = self.index_value(&MValue::Table(env), &key)?;
                    self.reg_set(local_base + a, value)?;
                }
                Op::SetGlobal => {
                    let env = self.frame_function().expect("missing frame").env();
                    let key = constant_value(&proto, instruction.bx() as usize)?;
                    let value = self.reg_get(local_base + a);
                    self.set_index(&MValue::Table(env), key, value)?;
                }
                Op::GetTable | Op::GetTableKs => {
                    let container = self.reg_get(local_base + b as usize);
                    let key = self.rk(&proto, local_base, c)?;
                    let value = self.index_value(&container, &key)?;
                    self.reg_set(local_base + a, value)?;
                }
                Op::SetTable | Op::SetTableKs => {
                    let container = self.reg_get(local_base + a);
                    let key = self.rk(&proto, local_base, b)?;
                    let value = self.rk(&proto, local_base, c)?;
                    self.set_index(&container, key, value)?;
                }
                Op::NewTable => {
                    let table = MTable::with_capacity(b as usize, c as usize);
                    self.reg_set(local_base + a, MValue::Table(table))?;
                }
                Op::SelfOp => {
                    let object = self.reg_get(local_base + b as usize);
                    let key = self.rk(&proto, local_base, c)?;
                    self.reg_set(local_base + a + 1, object.clone())?;
                    let method = self.index_value(&object, &key)?;
                    self.reg_set(local_base + a, method)?;
                }
                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Pow => {
                    let lhs = self.rk(&proto, local_base, b)?;
                    let rhs = self.rk(&proto, local_base, c)?;
                    let result = self.arith(op, lhs, rhs)?;
                    self.reg_set(local_base + a, result)?;
                }
                Op::Unm => {
                    let operand = self.reg_get(local_base + b as usize);
                    let result = match operand.as_coerced_number() {
                        Some(n) => MValue::Number(-n),
                        None => match self.get_metamethod(&operand, MetaMethod::Unm) {
                            Some(handler) => {
                                self.call_value(handler, &[operand.clone(), operand])?
                            }
                            None => {
                                return runtime_error!(
                                    "attempt to perform arithmetic on a {} value",
                                    operand.type_name()
                                )
                            }
                        },
                    };
                    self.reg_set(local_base + a, result)?;
                }
                Op::Not => {
                    let operand = self.reg_get(local_base + b as usize);
                    self.reg_set(local_base + a, MValue::Bool(!operand.is_truthy()))?;
                }
                Op::Len => {
                    let operand = self.reg_get(local_base + b as usize);
                    let result = self.length_of(&operand)?;
                    self.reg_set(local_base + a, result)?;
                }
                Op::Concat => {
                    let result = self.concat_range(local_base, b as usize, c as usize)?;
                    self.reg_set(local_base + a, result)?;
                }
                Op::Jmp => {
                    self.jump(instruction.sbx());
                }
                Op::Eq | Op::Lt | Op::Le => {
                    let lhs = self.rk(&proto, local_base, b)?;
                    let rhs = self.rk(&proto, local_base, c)?;
                    let result = match op {
                        Op::Eq => self.values_equal(&lhs, &rhs)?,
                        Op::Lt => self.less_than(&lhs, &rhs)?,
                        _ => self.less_equal(&lhs, &rhs)?,
                    };
                    if result != (a != 0) {
                        self.jump(1);
                    }
                }
                Op::Test => {
                    let value = self.reg_get(local_base + a);
                    if value.is_truthy() != (c != 0) {
                        self.jump(1);
                    }
                }
                Op::TestSet => {
                    let value = self.reg_get(local_base + b as usize);
                    if value.is_truthy() == (c != 0) {
                        self.reg_set(local_base + a, value)?;
                    } else {
                        self.jump(1);
                    }
                }
                Op::Call => {
                    let base = local_base + a;
                    let nargs = if b == 0 {
                        self.reg_top().saturating_sub(base + 1)
                    } else {
                        b as usize - 1
                    };
                    let nret = if c == 0 { MULTRET } else { c as i32 - 1 };
                    match self.do_call(base, nargs, nret, base)? {
                        CallOutcome::ScriptFrame | CallOutcome::NativeDone => {}
                        CallOutcome::NativeYield(values) => {
                            return self.yield_from_loop(values, boundary);
                        }
                    }
                }
                Op::TailCall => {
                    let base = local_base + a;
                    let nargs = if b == 0 {
                        self.reg_top().saturating_sub(base + 1)
                    } else {
                        b as usize - 1
                    };
                    let callee = self.reg_get(base);

                    let is_script = matches!(&callee, MValue::Function(f) if !f.is_native());
                    if is_script {
                        let MValue::Function(function) = callee else {
                            unreachable!()
                        };
                        self.close_upvalues(local_base);
                        let (old_base, return_base, nret, tail_calls) = {
                            let mut exec = self.exec_mut();
                            let frame = exec.frames.pop().expect("missing frame");
                            (frame.base, frame.return_base, frame.nret, frame.tail_calls)
                        };
                        {
                            let mut registry = self.thread.0.registry.borrow_mut();
                            registry.move_range(base, old_base, nargs + 1)?;
                            registry.set_top(old_base + nargs + 1)?;
                        }
                        self.push_script_frame(function, old_base, nargs, nret, return_base)?;
                        if let Some(frame) = self.exec_mut().frames.last_mut() {
                            frame.tail_calls = tail_calls + 1;
                        }
                    } else {
                        // host functions and __call targets degrade to a normal call
                        let (return_base, nret) = {
                            let exec = self.thread.0.exec.borrow();
                            let frame = exec.frames.last().expect("missing frame");
                            (frame.return_base, frame.nret)
                        };
                        match self.do_call(base, nargs, nret, return_base)? {
                            CallOutcome::NativeDone => {
                                self.close_upvalues(local_base);
                                self.exec_mut().frames.pop();
                                if self.exec_mut().frames.len() < min_depth {
                                    return Ok(LoopOutcome::Done);
                                }
                            }
                            CallOutcome::NativeYield(values) => {
                                self.close_upvalues(local_base);
                                self.exec_mut().frames.pop();
                                return self.yield_from_loop(values, boundary);
                            }
                            CallOutcome::ScriptFrame => {
                                // a script __call handler replaces the tail-calling frame
                                self.close_upvalues(local_base);
                                let mut exec = self.exec_mut();
                                let index = exec.frames.len() - 2;
                                exec.frames.remove(index);
                            }
                        }
                    }
                }
                Op::Return => {
                    let first = local_base + a;
                    let count = if b == 0 {
                        self.reg_top().saturating_sub(first)
                    } else {
                        b as usize - 1
                    };
                    if self.return_from_frame(first, count, min_depth)? {
                        return Ok(LoopOutcome::Done);
                    }
                }
                Op::ForLoop => {
                    let init = self.for_number(local_base + a, "'for' initial value")?;
                    let limit = self.for_number(local_base + a + 1, "'for' limit")?;
                    let step = self.for_number(local_base + a + 2, "'for' step")?;
                    let next = init + step;
                    self.reg_set(local_base + a, MValue::Number(next))?;
                    if (step > 0.0 && next <= limit) || (step < 0.0 && next >= limit) {
                        self.jump(instruction.sbx());
                        self.reg_set(local_base + a + 3, MValue::Number(next))?;
                    }
                }
                Op::ForPrep => {
                    let init = self.for_number(local_base + a, "'for' initial value")?;
                    let limit = self.for_number(local_base + a + 1, "'for' limit")?;
                    let step = self.for_number(local_base + a + 2, "'for' step")?;
                    if step == 0.0 {
                        return runtime_error!("'for' step is zero");
                    }
                    self.reg_set(local_base + a, MValue::Number(init - step))?;
                    self.reg_set(local_base + a + 1, MValue::Number(limit))?;
                    self.reg_set(local_base + a + 2, MValue::Number(step))?;
                    self.jump(instruction.sbx());
                }
                Op::TForLoop => {
                    let function = self.reg_get(local_base + a);
                    let state = self.reg_get(local_base + a + 1);
                    let control = self.reg_get(local_base + a + 2);
                    let results = self.call_value_multi(function, &[state, control])?;

                    for i in 0..=(c as usize) {
                        self.reg_set(
                            local_base + a + 3 + i,
                            results.get(i).cloned().unwrap_or_default(),
                        )?;
                    }
                    let first = self.reg_get(local_base + a + 3);
                    if first.is_nil() {
                        // the loop is over, skip the jump back to the body
                        self.jump(1);
                    } else {
                        self.reg_set(local_base + a + 2, first)?;
                    }
                }
                Op::SetList => {
                    let c_value = if c == 0 {
                        // an extended C is carried in the following word
                        let mut exec = self.exec_mut();
                        let frame = exec.frames.last_mut().expect("missing frame");
                        let extended = proto
                            .code
                            .get(frame.pc)
                            .map(|word| word.0)
                            .unwrap_or_default();
                        frame.pc += 1;
                        extended as usize
                    } else {
                        c as usize
                    };
                    let count = if b == 0 {
                        self.reg_top().saturating_sub(local_base + a + 1)
                    } else {
                        b as usize
                    };
                    let MValue::Table(table) = self.reg_get(local_base + a) else {
                        return runtime_error!("SETLIST requires a table");
                    };
                    let start = c_value.saturating_sub(1) * FIELDS_PER_FLUSH;
                    for i in 1..=count {
                        let value = self.reg_get(local_base + a + i);
                        table.raw_set_int((start + i) as i64, value);
                    }
                }
                Op::Close => {
                    self.close_upvalues(local_base + a);
                }
                Op::Closure => {
                    let child = match proto.protos.get(instruction.bx() as usize) {
                        Some(child) => child.clone(),
                        None => return runtime_error!("CLOSURE refers to a missing prototype"),
                    };
                    let function = self.frame_function().expect("missing frame");

                    let mut upvalues = Vec::with_capacity(child.num_upvalues as usize);
                    for _ in 0..child.num_upvalues {
                        let pseudo = {
                            let mut exec = self.exec_mut();
                            let frame = exec.frames.last_mut().expect("missing frame");
                            let Some(word) = proto.code.get(frame.pc) else {
                                return runtime_error!("truncated CLOSURE descriptors");
                            };
                            frame.pc += 1;
                            *word
                        };
                        match pseudo.op() {
                            Some(Op::Move) => {
                                let index = local_base + pseudo.b() as usize;
                                upvalues.push(self.find_or_create_upvalue(index));
                            }
                            Some(Op::GetUpval) => {
                                // the cell itself is shared, not the value
                                let cell = match function.inner() {
                                    FunctionInner::Script(f) => {
                                        f.upvalues.get(pseudo.b() as usize).cloned()
                                    }
                                    FunctionInner::Native(_) => None,
                                };
                                match cell {
                                    Some(cell) => upvalues.push(cell),
                                    None => {
                                        return runtime_error!(
                                            "CLOSURE inherits a missing upvalue"
                                        )
                                    }
                                }
                            }
                            _ => return runtime_error!("malformed CLOSURE upvalue descriptor"),
                        }
                    }

                    let closure = MFunction::script(child, upvalues, function.env());
                    self.reg_set(local_base + a, MValue::Function(closure))?;
                }
                Op::Vararg => {
                    let varargs = {
                        let exec = self.thread.0.exec.borrow();
                        exec.frames.last().expect("missing frame").varargs.clone()
                    };
                    if b == 0 {
                        for (i, value) in varargs.iter().enumerate() {
                            self.reg_set(local_base + a + i, value.clone())?;
                        }
                        self.reg_set_top(local_base + a + varargs.len())?;
                    } else {
                        for i in 0..(b as usize - 1) {
                            self.reg_set(
                                local_base + a + i,
                                varargs.get(i).cloned().unwrap_or_default(),
                            )?;
                        }
                    }
                }
                Op::BAnd | Op::BOr | Op::Shl | Op::Shr => {
                    let lhs = self.rk(&proto, local_base, b)?;
                    let rhs = self.rk(&proto, local_base, c)?;
                    let result = self.bitwise(op, lhs, rhs)?;
                    self.reg_set(local_base + a, result)?;
                }
                Op::TypeAssert => {
                    let value = self.reg_get(local_base + b as usize);
                    let tag = match self.rk(&proto, local_base, c)? {
                        MValue::Str(tag) => tag,
                        other => {
                            return runtime_error!(
                                "type assertion tag must be a string, got {}",
                                other.type_name()
                            )
                        }
                    };
                    if value.type_name() == tag.as_str() {
                        self.reg_set(local_base + a, value)?;
                    } else {
                        return Err(Error::from(ErrorKind::TypeAssertion {
                            expected: tag.to_string(),
                            actual: value.type_name().to_string(),
                        }));
                    }
                }
                Op::Nop => {}
            }
        }
    }

    fn yield_from_loop(&mut self, values: Vec<MValue>, boundary: bool) -> Result<LoopOutcome> {
        if self.exec_mut().parent.is_none() {
            self.exec_mut().pending_resume = None;
            return runtime_error!("attempt to yield from outside a coroutine");
        }
        if !boundary {
            self.exec_mut().pending_resume = None;
            return runtime_error!("attempt to yield across a host call boundary");
        }
        Ok(LoopOutcome::Yield(values))
    }

    fn jump(&self, offset: i32) {
        let mut exec = self.exec_mut();
        if let Some(frame) = exec.frames.last_mut() {
            frame.pc = (frame.pc as i64 + offset as i64) as usize;
        }
    }

    fn rk(&self, proto: &FunctionProto, local_base: usize, operand: u32) -> Result<MValue> {
        if Instruction::is_k(operand) {
            constant_value(proto, Instruction::rk_index(operand))
        } else {
            Ok(self.reg_get(local_base + operand as usize))
        }
    }

    fn for_number(&self, index: usize, what: &str) -> Result<f64> {
        match self.reg_get(index).as_coerced_number() {
            Some(n) => Ok(n),
            None => runtime_error!("{} must be a number", what),
        }
    }

    // ------------------------------------------------------------------------
    // Operator semantics

    pub(crate) fn arith(&mut self, op: Op, lhs: MValue, rhs: MValue) -> Result<MValue> {
        if let (Some(a), Some(b)) = (lhs.as_coerced_number(), rhs.as_coerced_number()) {
            let result = match op {
                Op::Add => a + b,
                Op::Sub => a - b,
                Op::Mul => a * b,
                Op::Div => a / b,
                Op::Mod => a - (a / b).floor() * b,
                Op::Pow => a.powf(b),
                _ => unreachable!("arith with a non-arithmetic op"),
            };
            return Ok(MValue::Number(result));
        }

        let method = match op {
            Op::Add => MetaMethod::Add,
            Op::Sub => MetaMethod::Sub,
            Op::Mul => MetaMethod::Mul,
            Op::Div => MetaMethod::Div,
            Op::Mod => MetaMethod::Mod,
            Op::Pow => MetaMethod::Pow,
            _ => unreachable!("arith with a non-arithmetic op"),
        };
        match self.binary_metamethod(&lhs, &rhs, method) {
            Some(handler) => self.call_value(handler, &[lhs, rhs]),
            None => {
                let offender = if lhs.as_coerced_number().is_none() {
                    &lhs
                } else {
                    &rhs
                };
                runtime_error!(
                    "attempt to perform arithmetic on a {} value",
                    offender.type_name()
                )
            }
        }
    }

    pub(crate) fn bitwise(&mut self, op: Op, lhs: MValue, rhs: MValue) -> Result<MValue> {
        if let (Some(a), Some(b)) = (int_operand(&lhs)?, int_operand(&rhs)?) {
            let result = match op {
                Op::BAnd => a & b,
                Op::BOr => a | b,
                Op::Shl => shift_left(a, b),
                Op::Shr => shift_right(a, b),
                _ => unreachable!("bitwise with a non-bitwise op"),
            };
            return Ok(MValue::Number(result as f64));
        }

        let method = match op {
            Op::BAnd => MetaMethod::BAnd,
            Op::BOr => MetaMethod::BOr,
            Op::Shl => MetaMethod::Shl,
            Op::Shr => MetaMethod::Shr,
            _ => unreachable!("bitwise with a non-bitwise op"),
        };
        match self.binary_metamethod(&lhs, &rhs, method) {
            Some(handler) => self.call_value(handler, &[lhs, rhs]),
            None => {
                let offender = if lhs.as_coerced_number().is_none() {
                    &lhs
                } else {
                    &rhs
                };
                runtime_error!(
                    "attempt to perform bitwise operation on a {} value",
                    offender.type_name()
                )
            }
        }
    }

    /// Compares two values the way `==` does, with `__eq` dispatch
    pub fn values_equal(&mut self, lhs: &MValue, rhs: &MValue) -> Result<bool> {
        if lhs == rhs {
            return Ok(true);
        }
        // __eq only applies when both operands share a reference type tag
        let same_tag = matches!(
            (lhs, rhs),
            (MValue::Table(_), MValue::Table(_)) | (MValue::UserData(_), MValue::UserData(_))
        );
        if !same_tag {
            return Ok(false);
        }
        match self.binary_metamethod(lhs, rhs, MetaMethod::Eq) {
            Some(handler) => {
                let result = self.call_value(handler, &[lhs.clone(), rhs.clone()])?;
                Ok(result.is_truthy())
            }
            None => Ok(false),
        }
    }

    /// Compares two values the way `<` does, with `__lt` dispatch
    pub fn less_than(&mut self, lhs: &MValue, rhs: &MValue) -> Result<bool> {
        match (lhs, rhs) {
            (MValue::Number(a), MValue::Number(b)) => Ok(a < b),
            (MValue::Str(a), MValue::Str(b)) => Ok(a < b),
            _ => match self.binary_metamethod(lhs, rhs, MetaMethod::Lt) {
                Some(handler) => {
                    let result = self.call_value(handler, &[lhs.clone(), rhs.clone()])?;
                    Ok(result.is_truthy())
                }
                None => runtime_error!(
                    "attempt to compare {} with {}",
                    lhs.type_name(),
                    rhs.type_name()
                ),
            },
        }
    }

    /// Compares two values the way `<=` does, with `__le`/`__lt` dispatch
    pub fn less_equal(&mut self, lhs: &MValue, rhs: &MValue) -> Result<bool> {
        match (lhs, rhs) {
            (MValue::Number(a), MValue::Number(b)) => Ok(a <= b),
            (MValue::Str(a), MValue::Str(b)) => Ok(a <= b),
            _ => {
                if let Some(handler) = self.binary_metamethod(lhs, rhs, MetaMethod::Le) {
                    let result = self.call_value(handler, &[lhs.clone(), rhs.clone()])?;
                    return Ok(result.is_truthy());
                }
                // a <= b falls back to not (b < a)
                if let Some(handler) = self.binary_metamethod(lhs, rhs, MetaMethod::Lt) {
                    let result = self.call_value(handler, &[rhs.clone(), lhs.clone()])?;
                    return Ok(!result.is_truthy());
                }
                runtime_error!(
                    "attempt to compare {} with {}",
                    lhs.type_name(),
                    rhs.type_name()
                )
            }
        }
    }

    /// Reads `container[key]`, following the `__index` chain
    pub fn index_value(&mut self, container: &MValue, key: &MValue) -> Result<MValue> {
        let mut current = container.clone();
        for _ in 0..self.context.settings.max_index_chain {
            if let MValue::Table(table) = &current {
                let raw = table.raw_get(key);
                if !raw.is_nil() {
                    return Ok(raw);
                }
                match self.get_metamethod(&current, MetaMethod::Index) {
                    None => return Ok(MValue::Nil),
                    Some(MValue::Function(handler)) => {
                        return self
                            .call_value(MValue::Function(handler), &[current, key.clone()]);
                    }
                    Some(next) => current = next,
                }
            } else {
                match self.get_metamethod(&current, MetaMethod::Index) {
                    None => {
                        return runtime_error!(
                            "attempt to index a {} value",
                            current.type_name()
                        )
                    }
                    Some(MValue::Function(handler)) => {
                        return self
                            .call_value(MValue::Function(handler), &[current, key.clone()]);
                    }
                    Some(next) => current = next,
                }
            }
        }
        runtime_error!("'__index' chain too long; possible loop")
    }

    /// Writes `container[key] = value`, following the `__newindex` chain
    pub fn set_index(&mut self, container: &MValue, key: MValue, value: MValue) -> Result<()> {
        let mut current = container.clone();
        for _ in 0..self.context.settings.max_index_chain {
            if let MValue::Table(table) = &current {
                // an existing key bypasses __newindex
                if !table.raw_get(&key).is_nil() {
                    return table.raw_set(key, value);
                }
                match self.get_metamethod(&current, MetaMethod::NewIndex) {
                    None => return table.raw_set(key, value),
                    Some(MValue::Function(handler)) => {
                        self.call_value_multi(
                            MValue::Function(handler),
                            &[current, key, value],
                        )?;
                        return Ok(());
                    }
                    Some(next) => current = next,
                }
            } else {
                match self.get_metamethod(&current, MetaMethod::NewIndex) {
                    None => {
                        return runtime_error!(
                            "attempt to index a {} value",
                            current.type_name()
                        )
                    }
                    Some(MValue::Function(handler)) => {
                        self.call_value_multi(
                            MValue::Function(handler),
                            &[current, key, value],
                        )?;
                        return Ok(());
                    }
                    Some(next) => current = next,
                }
            }
        }
        runtime_error!("'__newindex' chain too long; possible loop")
    }

    /// The length of a value, with `__len` dispatch
    pub fn length_of(&mut self, value: &MValue) -> Result<MValue> {
        match value {
            MValue::Str(s) => Ok(MValue::Number(s.len() as f64)),
            MValue::Table(t) => match self.get_metamethod(value, MetaMethod::Len) {
                Some(handler) => self.call_value(handler, &[value.clone()]),
                None => Ok(MValue::Number(t.len() as f64)),
            },
            other => match self.get_metamethod(other, MetaMethod::Len) {
                Some(handler) => self.call_value(handler, &[other.clone()]),
                None => runtime_error!(
                    "attempt to get length of a {} value",
                    other.type_name()
                ),
            },
        }
    }

    fn concat_range(&mut self, local_base: usize, b: usize, c: usize) -> Result<MValue> {
        if c < b {
            return Ok(MValue::Str("".into()));
        }
        let mut result = self.reg_get(local_base + c);
        let mut i = c;
        while i > b {
            i -= 1;
            let lhs = self.reg_get(local_base + i);
            result = self.concat_two(lhs, result)?;
        }
        Ok(result)
    }

    /// Concatenates two values, with `__concat` dispatch
    pub fn concat_two(&mut self, lhs: MValue, rhs: MValue) -> Result<MValue> {
        if lhs.can_convert_to_string() && rhs.can_convert_to_string() {
            return Ok(MValue::Str(MString::from(format!("{lhs}{rhs}"))));
        }
        match self.binary_metamethod(&lhs, &rhs, MetaMethod::Concat) {
            Some(handler) => self.call_value(handler, &[lhs, rhs]),
            None => {
                let offender = if lhs.can_convert_to_string() { &rhs } else { &lhs };
                runtime_error!(
                    "attempt to concatenate a {} value",
                    offender.type_name()
                )
            }
        }
    }

    // ------------------------------------------------------------------------
    // Coroutine transfer

    /// Makes a suspended thread that will run the given function when resumed
    pub fn new_thread(&self, entry: MFunction) -> MThread {
        let settings = &self.context.settings;
        let registry = Registry::new(64, settings.registry_size, settings.registry_grow_step);
        MThread::new(Some(entry), registry)
    }

    /// Transfers control to a suspended thread
    ///
    /// Returns how the transfer ended: a yield, a normal return, or an error
    /// that killed the thread. Resuming a thread in the wrong state reports an
    /// error without changing the thread's state.
    pub(crate) fn resume_thread(&mut self, target: &MThread, args: &[MValue]) -> Resumed {
        match target.status() {
            ThreadStatus::Running => {
                return Resumed::Error(Error::from("can not resume a running thread"))
            }
            ThreadStatus::Dead => {
                return Resumed::Error(Error::from("can not resume a dead thread"))
            }
            ThreadStatus::Normal => {
                return Resumed::Error(Error::from("can not resume a normal thread"))
            }
            ThreadStatus::Suspended => {}
        }

        let caller = self.thread.clone();
        target.0.exec.borrow_mut().parent = Some(caller.clone());
        target.set_status(ThreadStatus::Running);
        caller.set_status(ThreadStatus::Normal);
        *self.context.current_thread.borrow_mut() = target.clone();

        let mut transfer = MilkVm {
            context: self.context.clone(),
            thread: target.clone(),
        };
        let outcome = transfer.resume_body(args);

        *self.context.current_thread.borrow_mut() = caller.clone();
        caller.set_status(ThreadStatus::Running);
        target.0.exec.borrow_mut().parent = None;

        match outcome {
            Ok(LoopOutcome::Yield(values)) => {
                target.set_status(ThreadStatus::Suspended);
                Resumed::Yield(values)
            }
            Ok(LoopOutcome::Done) => {
                target.set_status(ThreadStatus::Dead);
                let registry = target.0.registry.borrow();
                Resumed::Return(registry.slice(0, registry.top()))
            }
            Err(error) => {
                target.set_status(ThreadStatus::Dead);
                Resumed::Error(error)
            }
        }
    }

    fn resume_body(&mut self, args: &[MValue]) -> Result<LoopOutcome> {
        let first_resume = {
            let mut exec = self.exec_mut();
            let first = !exec.started;
            exec.started = true;
            first
        };

        if first_resume {
            let entry = match self.exec_mut().entry.take() {
                Some(entry) => entry,
                None => return runtime_error!("thread has no entry function"),
            };
            self.reg_set(0, MValue::Function(entry))?;
            for (i, arg) in args.iter().enumerate() {
                self.reg_set(1 + i, arg.clone())?;
            }
            match self.do_call(0, args.len(), MULTRET, 0) {
                Ok(CallOutcome::ScriptFrame) => {}
                Ok(CallOutcome::NativeDone) => return Ok(LoopOutcome::Done),
                Ok(CallOutcome::NativeYield(values)) => return Ok(LoopOutcome::Yield(values)),
                Err(error) => return Err(self.unwind(error, 1)),
            }
        } else {
            let pending = match self.exec_mut().pending_resume.take() {
                Some(pending) => pending,
                None => return runtime_error!("thread is not suspended at a yield"),
            };
            self.deliver_slice(args, pending.return_base, pending.nret)?;
        }

        self.run_loop(1, true)
    }

    /// Moves the top `count` values from this thread's stack to another thread's
    pub fn xmove_to(&mut self, target: &MThread, count: usize) -> Result<()> {
        let mut values = Vec::with_capacity(count);
        {
            let mut registry = self.thread.0.registry.borrow_mut();
            for _ in 0..count {
                values.push(registry.pop());
            }
        }
        let mut target_registry = target.0.registry.borrow_mut();
        for value in values.into_iter().rev() {
            target_registry.push(value)?;
        }
        Ok(())
    }

    /// The status of a thread as reported to scripts
    pub fn status_of(&self, thread: &MThread) -> &'static str {
        if thread.ptr_eq(&self.current_thread()) {
            "running"
        } else {
            thread.status().name()
        }
    }
}

fn constant_value(proto: &FunctionProto, index: usize) -> Result<MValue> {
    match proto.constants.get(index) {
        Some(Constant::Nil) => Ok(MValue::Nil),
        Some(Constant::Bool(b)) => Ok(MValue::Bool(*b)),
        Some(Constant::Number(n)) => Ok(MValue::Number(*n)),
        Some(Constant::Str(s)) => Ok(MValue::Str(MString::from(s.clone()))),
        None => runtime_error!("constant {} out of range", index),
    }
}

// Integer coercion for the bitwise operators: numbers truncate, non-finite
// values have no integer representation, non-numbers fall through to the
// metamethod path.
fn int_operand(value: &MValue) -> Result<Option<i64>> {
    match value.as_coerced_number() {
        Some(n) if n.is_finite() => Ok(Some(n as i64)),
        Some(_) => Err(Error::from("number has no integer representation")),
        None => Ok(None),
    }
}

fn shift_left(a: i64, count: i64) -> i64 {
    if count <= -64 {
        if a < 0 {
            -1
        } else {
            0
        }
    } else if count < 0 {
        a >> (-count) as u32
    } else if count >= 64 {
        0
    } else {
        ((a as u64) << count as u32) as i64
    }
}

fn shift_right(a: i64, count: i64) -> i64 {
    if count <= -64 {
        0
    } else if count < 0 {
        ((a as u64) << (-count) as u32) as i64
    } else if count >= 64 {
        if a < 0 {
            -1
        } else {
            0
        }
    } else {
        a >> count as u32
    }
}
