//! Capability interface for tensor-like objects

use memlab_env::DeviceId;
use std::fmt;
use std::rc::Rc;

/// Identity of an underlying buffer. Equal ids mean aliased memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u64);

impl BufferId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identity of a live object in the graph, taken from its `Rc` allocation.
///
/// Only meaningful while the object is kept alive, i.e. within one traversal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectId(usize);

impl ObjectId {
    pub fn of<T: ?Sized>(object: &Rc<T>) -> Self {
        Self(Rc::as_ptr(object) as *const () as usize)
    }
}

/// Anything that is a logical view over a device buffer.
pub trait TensorLike {
    /// Identity of the backing buffer, `None` if it cannot be resolved.
    fn buffer_id(&self) -> Option<BufferId>;

    /// Size of the whole backing buffer, not of this view.
    fn byte_size(&self) -> u64;

    fn device(&self) -> DeviceId;

    fn shape(&self) -> Vec<usize> {
        Vec::new()
    }

    /// Gradient attached to this tensor, reported as `<name>.grad`.
    fn grad(&self) -> Option<Rc<dyn TensorLike>> {
        None
    }
}
