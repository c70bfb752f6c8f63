//! Capability contract and handles for participating objects

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::SnapshotError;
use crate::snapshot::{SnapshotReader, SnapshotWriter};

/// Strong handle to a participating object, as held by the host.
pub type ObjectRef = Arc<ObjectCell<dyn Transactional>>;

/// Back-reference held by change records. Never keeps the object alive.
pub type WeakRef = Weak<ObjectCell<dyn Transactional>>;

/// Capability contract for objects whose state can be captured and replayed.
///
/// `serialize` and `deserialize` must visit fields in the same order.
pub trait Transactional: Send + Sync + 'static {
    /// Write the whole object state.
    fn serialize(&self, writer: &mut SnapshotWriter);

    /// Read back state previously written by [`Transactional::serialize`].
    ///
    /// Reading an object reference restores that object first if it has
    /// pending records in the same replay, unless it is part of a reference
    /// cycle currently being restored (in which case it may be locked; do not
    /// block on it).
    fn deserialize(&mut self, reader: &mut SnapshotReader<'_>) -> Result<(), SnapshotError>;

    /// Called once per replay before any record is restored.
    fn pre_change(&mut self) {}

    /// Called once per replay after every record has been restored.
    fn post_change(&mut self) {}

    /// Expose an array field for array-slice replay.
    fn array_slot_mut(&mut self, _slot: ArraySlot) -> Option<&mut dyn Any> {
        None
    }
}

/// Identity of an array field within its owning object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArraySlot(pub u32);

impl fmt::Display for ArraySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shared cell holding a participating object.
///
/// The transactional flag sits outside the lock so capture can consult it
/// while a mutator holds the write guard.
pub struct ObjectCell<T: ?Sized> {
    transactional: AtomicBool,
    state: RwLock<T>,
}

impl<T> ObjectCell<T> {
    /// Wrap a value in a new transactional cell
    pub fn new(value: T) -> Arc<Self> {
        Arc::new(Self {
            transactional: AtomicBool::new(true),
            state: RwLock::new(value),
        })
    }

    /// Build a cell whose value needs a back-reference to itself
    pub fn new_cyclic<F>(build: F) -> Arc<Self>
    where
        F: FnOnce(&Weak<Self>) -> T,
    {
        Arc::new_cyclic(|weak| Self {
            transactional: AtomicBool::new(true),
            state: RwLock::new(build(weak)),
        })
    }
}

impl<T: ?Sized> ObjectCell<T> {
    /// Lock the state for reading
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.state.read()
    }

    /// Lock the state for writing
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.state.write()
    }

    /// Whether captures of this object are recorded
    pub fn is_transactional(&self) -> bool {
        self.transactional.load(Ordering::Relaxed)
    }

    /// Opt this object in or out of capture
    pub fn set_transactional(&self, transactional: bool) {
        self.transactional.store(transactional, Ordering::Relaxed);
    }
}

impl<T: ?Sized> fmt::Debug for ObjectCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCell")
            .field("address", &(self as *const Self as *const ()))
            .field("transactional", &self.is_transactional())
            .finish()
    }
}

/// Whether two handles name the same object
pub fn same_object(a: &ObjectRef, b: &ObjectRef) -> bool {
    ObjectKey::of(a) == ObjectKey::of(b)
}

/// Address identity of an object, stable across strong and weak handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ObjectKey(usize);

impl ObjectKey {
    pub(crate) fn of(object: &ObjectRef) -> Self {
        Self(Arc::as_ptr(object) as *const () as usize)
    }
}
