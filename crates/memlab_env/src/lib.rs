//! Memlab Environment
//!
//! Device-memory query primitives shared by the line profiler and the
//! storage reporter:
//! - `DeviceId` and `MemoryStat` value types
//! - the `DeviceMemory` trait implemented by allocator hosts
//! - human-readable byte formatting (`1.00M`)
//! - `CachingAllocator`, an in-process caching allocator host
//!
//! Neither consumer re-implements an allocator. They only query one
//! through `DeviceMemory`.

pub mod caching;
pub mod device;
pub mod memory;
pub mod size;

pub use caching::{Block, CachingAllocator};
pub use device::DeviceId;
pub use memory::{stat_or_zero, DeviceError, DeviceMemory, MemoryStat, NoDevice};
pub use size::{readable_delta, readable_size, signed_delta};
