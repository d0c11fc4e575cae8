//! Allocator query contract.
//!
//! Both counters are point-in-time readings. They can be stale the instant
//! they are returned.

use crate::DeviceId;
use std::rc::Rc;
use thiserror::Error;

/// Errors reported by an allocator host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("no accelerator device is available")]
    NoDeviceAvailable,

    #[error("device {device} does not exist ({count} device(s) present)")]
    InvalidDevice { device: DeviceId, count: u32 },

    #[error(
        "out of memory on {device}: tried to reserve {requested} bytes \
         with {reserved} of {capacity} bytes reserved"
    )]
    OutOfMemory {
        device: DeviceId,
        requested: u64,
        reserved: u64,
        capacity: u64,
    },
}

/// One reading of a device's allocator counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryStat {
    /// Bytes handed out to live buffers.
    pub allocated: u64,
    /// Bytes held by the allocator, live or cached.
    pub reserved: u64,
}

/// Read-only view of an allocator's per-device counters.
pub trait DeviceMemory {
    fn allocated_bytes(&self, device: DeviceId) -> Result<u64, DeviceError>;

    fn reserved_bytes(&self, device: DeviceId) -> Result<u64, DeviceError>;

    /// Device that work is currently issued to.
    fn current_device(&self) -> Result<DeviceId, DeviceError>;

    fn stat(&self, device: DeviceId) -> Result<MemoryStat, DeviceError> {
        Ok(MemoryStat {
            allocated: self.allocated_bytes(device)?,
            reserved: self.reserved_bytes(device)?,
        })
    }
}

impl<T: DeviceMemory + ?Sized> DeviceMemory for Rc<T> {
    fn allocated_bytes(&self, device: DeviceId) -> Result<u64, DeviceError> {
        (**self).allocated_bytes(device)
    }

    fn reserved_bytes(&self, device: DeviceId) -> Result<u64, DeviceError> {
        (**self).reserved_bytes(device)
    }

    fn current_device(&self) -> Result<DeviceId, DeviceError> {
        (**self).current_device()
    }
}

impl<T: DeviceMemory + ?Sized> DeviceMemory for &T {
    fn allocated_bytes(&self, device: DeviceId) -> Result<u64, DeviceError> {
        (**self).allocated_bytes(device)
    }

    fn reserved_bytes(&self, device: DeviceId) -> Result<u64, DeviceError> {
        (**self).reserved_bytes(device)
    }

    fn current_device(&self) -> Result<DeviceId, DeviceError> {
        (**self).current_device()
    }
}

/// Query the active device and its counters, degrading to zero on failure.
///
/// Returns the error alongside the zeroed reading so callers can decide
/// whether to log it.
pub fn stat_or_zero(memory: &dyn DeviceMemory) -> (DeviceId, MemoryStat, Option<DeviceError>) {
    let device = match memory.current_device() {
        Ok(device) => device,
        Err(err) => return (DeviceId::default(), MemoryStat::default(), Some(err)),
    };
    match memory.stat(device) {
        Ok(stat) => (device, stat, None),
        Err(err) => (device, MemoryStat::default(), Some(err)),
    }
}

/// Allocator host for machines without an accelerator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDevice;

impl DeviceMemory for NoDevice {
    fn allocated_bytes(&self, _device: DeviceId) -> Result<u64, DeviceError> {
        Err(DeviceError::NoDeviceAvailable)
    }

    fn reserved_bytes(&self, _device: DeviceId) -> Result<u64, DeviceError> {
        Err(DeviceError::NoDeviceAvailable)
    }

    fn current_device(&self) -> Result<DeviceId, DeviceError> {
        Err(DeviceError::NoDeviceAvailable)
    }
}
