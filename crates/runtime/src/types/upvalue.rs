use crate::{registry::Registry, MValue};
use std::{cell::RefCell, rc::Rc};

enum UpvalueState {
    // Points at a live stack slot of the owning thread
    Open {
        registry: Rc<RefCell<Registry>>,
        index: usize,
    },
    // Holds the value directly once the slot has left scope
    Closed(MValue),
}

/// An indirection cell for a captured variable
///
/// Every closure that captures the same local shares the same cell, so reads
/// and writes always observe each other. The cell starts open, pointing into
/// the owning thread's register stack, and closes (taking a copy of the value)
/// when the slot's scope ends.
#[derive(Clone)]
pub struct Upvalue(Rc<RefCell<UpvalueState>>);

impl Upvalue {
    pub(crate) fn open(registry: Rc<RefCell<Registry>>, index: usize) -> Self {
        Self(Rc::new(RefCell::new(UpvalueState::Open { registry, index })))
    }

    /// Makes an already-closed cell holding the given value
    pub fn closed(value: MValue) -> Self {
        Self(Rc::new(RefCell::new(UpvalueState::Closed(value))))
    }

    /// The captured variable's current value
    pub fn get(&self) -> MValue {
        match &*self.0.borrow() {
            UpvalueState::Open { registry, index } => registry.borrow().get_any(*index),
            UpvalueState::Closed(value) => value.clone(),
        }
    }

    /// Assigns to the captured variable
    pub fn set(&self, value: MValue) {
        match &mut *self.0.borrow_mut() {
            UpvalueState::Open { registry, index } => {
                registry.borrow_mut().set_any(*index, value)
            }
            UpvalueState::Closed(slot) => *slot = value,
        }
    }

    /// Converts an open cell into a closed one holding the slot's current value
    pub(crate) fn close(&self) {
        let closed_value = match &*self.0.borrow() {
            UpvalueState::Open { registry, index } => registry.borrow().get_any(*index),
            UpvalueState::Closed(_) => return,
        };
        *self.0.borrow_mut() = UpvalueState::Closed(closed_value);
    }

    /// The stack index an open cell points at
    pub(crate) fn stack_index(&self) -> Option<usize> {
        match &*self.0.borrow() {
            UpvalueState::Open { index, .. } => Some(*index),
            UpvalueState::Closed(_) => None,
        }
    }

    /// True if both handles refer to the same cell
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_cells_read_and_write_the_stack() {
        let registry = Rc::new(RefCell::new(Registry::new(8, 64, 8)));
        registry.borrow_mut().set(2, MValue::Number(1.0)).unwrap();

        let cell = Upvalue::open(registry.clone(), 2);
        assert_eq!(cell.get(), MValue::Number(1.0));

        cell.set(MValue::Number(5.0));
        assert_eq!(registry.borrow().get(2), MValue::Number(5.0));
    }

    #[test]
    fn closing_detaches_from_the_stack() {
        let registry = Rc::new(RefCell::new(Registry::new(8, 64, 8)));
        registry.borrow_mut().set(0, MValue::Number(7.0)).unwrap();

        let cell = Upvalue::open(registry.clone(), 0);
        cell.close();
        assert_eq!(cell.stack_index(), None);

        registry.borrow_mut().set(0, MValue::Number(9.0)).unwrap();
        assert_eq!(cell.get(), MValue::Number(7.0));

        // closing twice is a no-op
        cell.close();
        assert_eq!(cell.get(), MValue::Number(7.0));
    }

    #[test]
    fn shared_cells_observe_each_other() {
        let a = Upvalue::closed(MValue::Number(1.0));
        let b = a.clone();
        b.set(MValue::Number(2.0));
        assert_eq!(a.get(), MValue::Number(2.0));
        assert!(a.ptr_eq(&b));
    }
}
