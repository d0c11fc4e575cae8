//! Line-level interception seam between a host runtime and the profiler

use crate::ProfilerError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callbacks a host runtime delivers while a profiled routine executes.
///
/// `on_line` fires immediately before each source line runs. A host that
/// cannot deliver line events should profile with `Granularity::Call`.
pub trait StepObserver {
    /// A frame of the profiled routine was entered.
    fn on_call(&mut self);

    fn on_line(&mut self, line: u32) -> Result<(), ProfilerError>;

    /// The innermost frame returned.
    fn on_return(&mut self);
}

/// Request to interrupt a profiled call at its next line event.
///
/// Cloneable and `Send`, so a signal handler thread can raise it.
#[derive(Clone, Debug, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was raised.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_clears_the_flag() {
        let flag = InterruptFlag::new();
        let remote = flag.clone();
        assert!(!flag.take());

        remote.raise();
        assert!(flag.is_raised());
        assert!(flag.take());
        assert!(!remote.is_raised());
    }
}
