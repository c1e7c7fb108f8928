use crate::{frame::CallFrame, registry::Registry, MFunction, Upvalue};
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

/// The observable states of a coroutine
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadStatus {
    /// Created but not started, or paused after a yield
    Suspended,
    /// Currently executing instructions
    Running,
    /// Has resumed another coroutine and is waiting for it
    Normal,
    /// The top-level function returned, or an error went uncaught
    Dead,
}

impl ThreadStatus {
    /// The status name reported to scripts
    pub fn name(&self) -> &'static str {
        match self {
            Self::Suspended => "suspended",
            Self::Running => "running",
            Self::Normal => "normal",
            Self::Dead => "dead",
        }
    }
}

// Where the values of the next resume should be delivered: the register window
// that the suspended yield call was expected to fill.
pub(crate) struct PendingResume {
    pub return_base: usize,
    pub nret: i32,
}

pub(crate) struct ThreadExec {
    pub frames: Vec<CallFrame>,
    // Open upvalue cells into this thread's registry, sorted by descending stack index
    pub open_upvalues: Vec<Upvalue>,
    pub parent: Option<MThread>,
    pub started: bool,
    pub entry: Option<MFunction>,
    pub pending_resume: Option<PendingResume>,
}

pub(crate) struct ThreadInner {
    pub status: Cell<ThreadStatus>,
    pub wrapped: Cell<bool>,
    pub registry: Rc<RefCell<Registry>>,
    pub exec: RefCell<ThreadExec>,
}

/// A coroutine: a suspendable line of execution with its own register and frame stacks
///
/// Threads are shared references compared by identity. The status cell is readable
/// at any time, including while the thread itself is executing.
#[derive(Clone)]
pub struct MThread(pub(crate) Rc<ThreadInner>);

impl MThread {
    pub(crate) fn new(entry: Option<MFunction>, registry: Registry) -> Self {
        Self(Rc::new(ThreadInner {
            status: Cell::new(ThreadStatus::Suspended),
            wrapped: Cell::new(false),
            registry: Rc::new(RefCell::new(registry)),
            exec: RefCell::new(ThreadExec {
                frames: Vec::new(),
                open_upvalues: Vec::new(),
                parent: None,
                started: false,
                entry,
                pending_resume: None,
            }),
        }))
    }

    /// The thread's current status
    pub fn status(&self) -> ThreadStatus {
        self.0.status.get()
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        self.0.status.set(status);
    }

    /// True if abnormal termination should re-raise in the resumer
    pub fn is_wrapped(&self) -> bool {
        self.0.wrapped.get()
    }

    pub(crate) fn set_wrapped(&self, wrapped: bool) {
        self.0.wrapped.set(wrapped);
    }

    /// An address that identifies the thread
    pub fn ptr_id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// True if both values alias the same thread
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
