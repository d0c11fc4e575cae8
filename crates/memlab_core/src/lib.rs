//! Memlab Core
//!
//! Storage-deduplicating memory reporter:
//! - `TensorLike` / `Composite` / `LiveObjects` capability traits
//! - cycle-safe structural walk with qualified names
//! - `StorageGroup`s keyed by buffer identity, so aliased buffers are
//!   counted once while every alias still counts as a tensor
//! - snapshot rendering and before/after diffs
//!
//! The `host` module is a small reference tensor runtime implementing the
//! capability traits on top of `memlab_env::CachingAllocator`.

pub mod diff;
pub mod graph;
pub mod host;
pub mod render;
mod reporter;
mod snapshot;
mod tensor;

pub use diff::{diff, SnapshotDiff};
pub use graph::{walk, Composite, LiveObjects, NamedTensor, Node};
pub use host::{DType, Module, Storage, Tensor, TensorRegistry};
pub use reporter::{MemReporter, ReporterOptions};
pub use snapshot::{DeviceTotals, GroupMember, ReportSnapshot, StorageGroup};
pub use tensor::{BufferId, ObjectId, TensorLike};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
