use std::fmt;

/// Index of an accelerator device, rendered as `cuda:<index>`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u32);

impl DeviceId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Return the raw index backing this id.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cuda:{}", self.0)
    }
}
