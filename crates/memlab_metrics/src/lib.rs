//! Memlab Metrics - line-granularity device memory profiler
//!
//! Attributes allocator deltas to the source lines of a routine across
//! repeated calls:
//! - `LineProfiler` owns sessions; `begin` / `call` / `report` / `end`
//! - `LineProbe` is the step observer the profiled code drives
//! - `ProfiledRoutine` bundles a routine with its own session
//!
//! # Usage
//!
//! ```ignore
//! use memlab_metrics::{routine, step, LineProfiler};
//!
//! let mut profiler = LineProfiler::new(allocator.clone());
//! let handle = profiler.begin(routine!("forward"))?;
//! profiler.call(&handle, |probe| {
//!     step!(probe);
//!     let hidden = layer.forward(&input)?;
//!     step!(probe);
//!     head.forward(&hidden)
//! })?;
//! profiler.end(handle)?;
//! ```
//!
//! Reports show, per line, the largest allocated ("Max usage") and reserved
//! ("Peak usage") readings after the line ran, and the largest growth of
//! each ("diff max", "diff peak").

mod error;
mod observer;
mod profiler;
mod record;
mod routine;
mod session;
mod table;

pub use error::ProfilerError;
pub use observer::{InterruptFlag, StepObserver};
pub use profiler::{
    Granularity, LineProbe, LineProfiler, ProfileMode, ProfiledRoutine, ProfilerConfig,
    ReportSink, SessionHandle,
};
pub use record::{LineRecord, LineSample, LineStats};
pub use routine::{Routine, RoutineId};
pub use session::ProfileSession;

/// Describe the enclosing routine, recording where it is defined.
#[macro_export]
macro_rules! routine {
    ($name:expr) => {
        $crate::Routine::new($name, file!(), line!())
    };
}

/// Report the current source line to a `LineProbe`, propagating interruption.
#[macro_export]
macro_rules! step {
    ($probe:expr) => {
        $probe.line(line!())?
    };
}
