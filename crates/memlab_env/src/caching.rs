//! In-process caching allocator host.
//!
//! Models the counters of a framework caching allocator closely enough to
//! drive the profiler and reporter without an accelerator:
//! - requests are rounded up to 512-byte blocks
//! - requests up to 1 MiB are carved out of shared 2 MiB segments
//! - larger requests get their own segment rounded up to 2 MiB
//! - freed blocks stay cached (still reserved) until `empty_cache`
//!
//! Single-threaded: all state lives behind `Cell`/`RefCell`.

use crate::{DeviceError, DeviceId, DeviceMemory};
use std::cell::{Cell, RefCell};

const MIN_BLOCK: u64 = 512;
const SMALL_REQUEST: u64 = 1024 * 1024;
const SMALL_SEGMENT: u64 = 2 * 1024 * 1024;
const LARGE_ROUNDING: u64 = 2 * 1024 * 1024;

fn round_up(bytes: u64, to: u64) -> u64 {
    bytes.div_ceil(to) * to
}

/// A live allocation. Hand it back with `CachingAllocator::free`.
#[derive(Debug)]
pub struct Block {
    id: u64,
    device: DeviceId,
    size: u64,
    segment: usize,
}

impl Block {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Rounded size charged to the allocated counter.
    pub fn size(&self) -> u64 {
        self.size
    }
}

struct Segment {
    size: u64,
    small: bool,
    bump: u64,
    live: u64,
    free: Vec<u64>,
}

#[derive(Default)]
struct DeviceState {
    allocated: u64,
    reserved: u64,
    segments: Vec<Option<Segment>>,
}

impl DeviceState {
    /// Best-fit search over cached blocks, splitting the remainder back into the cache.
    fn take_cached(&mut self, size: u64, small: bool) -> Option<usize> {
        let mut best: Option<(usize, usize, u64)> = None;
        for (si, segment) in self.segments.iter().enumerate() {
            let Some(segment) = segment else { continue };
            if segment.small != small {
                continue;
            }
            for (fi, &cached) in segment.free.iter().enumerate() {
                if cached >= size && best.map_or(true, |(_, _, b)| cached < b) {
                    best = Some((si, fi, cached));
                }
            }
        }

        let (si, fi, cached) = best?;
        let segment = self.segments[si].as_mut()?;
        segment.free.swap_remove(fi);
        if cached > size {
            segment.free.push(cached - size);
        }
        segment.live += size;
        Some(si)
    }

    fn take_bump(&mut self, size: u64, small: bool) -> Option<usize> {
        let (si, segment) = self
            .segments
            .iter_mut()
            .enumerate()
            .filter_map(|(si, s)| s.as_mut().map(|s| (si, s)))
            .find(|(_, s)| s.small == small && s.size - s.bump >= size)?;
        segment.bump += size;
        segment.live += size;
        Some(si)
    }

    fn new_segment(&mut self, segment_size: u64, size: u64, small: bool) -> usize {
        self.reserved += segment_size;
        let segment = Segment {
            size: segment_size,
            small,
            bump: size,
            live: size,
            free: Vec::new(),
        };
        match self.segments.iter().position(Option::is_none) {
            Some(slot) => {
                self.segments[slot] = Some(segment);
                slot
            }
            None => {
                self.segments.push(Some(segment));
                self.segments.len() - 1
            }
        }
    }

    /// Release every segment with no live blocks. Returns bytes released.
    fn release_unused(&mut self) -> u64 {
        let mut released = 0;
        for slot in &mut self.segments {
            if slot.as_ref().is_some_and(|s| s.live == 0) {
                if let Some(segment) = slot.take() {
                    released += segment.size;
                }
            }
        }
        self.reserved -= released;
        released
    }
}

/// Caching allocator over a fixed number of simulated devices.
pub struct CachingAllocator {
    devices: Vec<RefCell<DeviceState>>,
    current: Cell<DeviceId>,
    capacity: Option<u64>,
    next_block: Cell<u64>,
}

impl CachingAllocator {
    /// Create an allocator with `device_count` devices and no capacity limit.
    pub fn new(device_count: u32) -> Self {
        Self {
            devices: (0..device_count).map(|_| RefCell::default()).collect(),
            current: Cell::new(DeviceId::default()),
            capacity: None,
            next_block: Cell::new(1),
        }
    }

    /// Cap the reserved bytes of every device.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn device_count(&self) -> u32 {
        self.devices.len() as u32
    }

    fn state(&self, device: DeviceId) -> Result<&RefCell<DeviceState>, DeviceError> {
        if self.devices.is_empty() {
            return Err(DeviceError::NoDeviceAvailable);
        }
        self.devices
            .get(device.index() as usize)
            .ok_or(DeviceError::InvalidDevice {
                device,
                count: self.device_count(),
            })
    }

    /// Make `device` the target of subsequent work.
    pub fn set_device(&self, device: DeviceId) -> Result<(), DeviceError> {
        self.state(device)?;
        self.current.set(device);
        Ok(())
    }

    /// Allocate `bytes` on `device`, reusing cached blocks first.
    pub fn allocate(&self, device: DeviceId, bytes: u64) -> Result<Block, DeviceError> {
        let mut state = self.state(device)?.borrow_mut();
        let size = round_up(bytes.max(1), MIN_BLOCK);
        let small = size <= SMALL_REQUEST;

        let reused = state
            .take_cached(size, small)
            .or_else(|| state.take_bump(size, small));
        let segment = match reused {
            Some(segment) => segment,
            None => {
                let segment_size = if small {
                    SMALL_SEGMENT
                } else {
                    round_up(size, LARGE_ROUNDING)
                };
                if let Some(capacity) = self.capacity {
                    if state.reserved + segment_size > capacity {
                        let released = state.release_unused();
                        tracing::debug!(
                            %device,
                            released,
                            "released cached segments under memory pressure"
                        );
                    }
                    if state.reserved + segment_size > capacity {
                        return Err(DeviceError::OutOfMemory {
                            device,
                            requested: segment_size,
                            reserved: state.reserved,
                            capacity,
                        });
                    }
                }
                tracing::debug!(%device, segment_size, "reserving new segment");
                state.new_segment(segment_size, size, small)
            }
        };

        state.allocated += size;
        let id = self.next_block.get();
        self.next_block.set(id + 1);
        Ok(Block {
            id,
            device,
            size,
            segment,
        })
    }

    /// Return a block to the cache. Its bytes stay reserved.
    pub fn free(&self, block: Block) {
        let Ok(state) = self.state(block.device) else {
            return;
        };
        let mut state = state.borrow_mut();
        state.allocated -= block.size;
        if let Some(Some(segment)) = state.segments.get_mut(block.segment) {
            segment.live -= block.size;
            if segment.live == 0 {
                segment.free.clear();
                segment.bump = 0;
            } else {
                segment.free.push(block.size);
            }
        }
    }

    /// Release all fully cached segments on every device.
    pub fn empty_cache(&self) -> u64 {
        self.devices
            .iter()
            .map(|state| state.borrow_mut().release_unused())
            .sum()
    }
}

impl DeviceMemory for CachingAllocator {
    fn allocated_bytes(&self, device: DeviceId) -> Result<u64, DeviceError> {
        Ok(self.state(device)?.borrow().allocated)
    }

    fn reserved_bytes(&self, device: DeviceId) -> Result<u64, DeviceError> {
        Ok(self.state(device)?.borrow().reserved)
    }

    fn current_device(&self) -> Result<DeviceId, DeviceError> {
        if self.devices.is_empty() {
            return Err(DeviceError::NoDeviceAvailable);
        }
        Ok(self.current.get())
    }
}
