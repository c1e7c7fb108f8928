use crate::MTable;
use downcast_rs::{impl_downcast, Downcast};
use std::{
    cell::{Ref, RefCell, RefMut},
    rc::Rc,
};

/// The trait for host payloads stored in userdata values
///
/// Implementations can be downcast back to their concrete type by the host
/// functions that created them.
pub trait MilkUserData: Downcast {
    /// The name shown for the payload's type, "userdata" unless overridden
    fn type_string(&self) -> String {
        "userdata".to_string()
    }
}

impl_downcast!(MilkUserData);

struct UserDataInner {
    data: RefCell<Box<dyn MilkUserData>>,
    metatable: RefCell<Option<MTable>>,
}

/// An opaque host payload with an optional metatable
///
/// Userdata values are shared references compared by identity; the payload is
/// only accessible to host code.
#[derive(Clone)]
pub struct MUserData {
    inner: Rc<UserDataInner>,
}

impl MUserData {
    /// Wraps a host payload as a userdata value
    pub fn new(data: impl MilkUserData) -> Self {
        Self {
            inner: Rc::new(UserDataInner {
                data: RefCell::new(Box::new(data)),
                metatable: RefCell::new(None),
            }),
        }
    }

    /// Borrows the payload
    pub fn data(&self) -> Ref<'_, Box<dyn MilkUserData>> {
        self.inner.data.borrow()
    }

    /// Mutably borrows the payload
    pub fn data_mut(&self) -> RefMut<'_, Box<dyn MilkUserData>> {
        self.inner.data.borrow_mut()
    }

    /// The userdata's metatable
    pub fn metatable(&self) -> Option<MTable> {
        self.inner.metatable.borrow().clone()
    }

    /// Replaces the userdata's metatable
    pub fn set_metatable(&self, metatable: Option<MTable>) {
        *self.inner.metatable.borrow_mut() = metatable;
    }

    /// An address that identifies the userdata
    pub fn ptr_id(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    /// True if both values alias the same userdata
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

/// The payload used by NewUserData when the host doesn't provide one
#[derive(Default)]
pub(crate) struct EmptyUserData;

impl MilkUserData for EmptyUserData {}
