//! State of one profiling run over one routine

use crate::{table, Granularity, LineRecord, LineSample, Routine};
use memlab_env::{stat_or_zero, DeviceId, DeviceMemory, MemoryStat};
use std::collections::BTreeMap;

/// A reading taken at a line boundary.
#[derive(Copy, Clone, Debug)]
struct Mark {
    device: DeviceId,
    stat: MemoryStat,
}

/// One active invocation of the profiled routine.
struct Frame {
    entry: Mark,
    pending: Option<(u32, Mark)>,
}

/// Records, call counter and frame stack for one profiled routine.
///
/// Owned by a `LineProfiler`; mutated only through line-boundary callbacks.
pub struct ProfileSession {
    routine: Routine,
    granularity: Granularity,
    records: BTreeMap<u32, LineRecord>,
    frames: Vec<Frame>,
    calls: u64,
    enabled: bool,
    interrupted: bool,
    degraded: bool,
}

impl ProfileSession {
    pub(crate) fn new(routine: Routine, granularity: Granularity) -> Self {
        Self {
            routine,
            granularity,
            records: BTreeMap::new(),
            frames: Vec::new(),
            calls: 0,
            enabled: true,
            interrupted: false,
            degraded: false,
        }
    }

    pub fn routine(&self) -> &Routine {
        &self.routine
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Completed outermost calls.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Active frames of the routine, 0 between calls.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Records in source order.
    pub fn records(&self) -> impl Iterator<Item = &LineRecord> {
        self.records.values()
    }

    pub fn record(&self, line: u32) -> Option<&LineRecord> {
        self.records.get(&line)
    }

    fn warn_degraded(&mut self, err: Option<memlab_env::DeviceError>) {
        if let Some(err) = err {
            if !self.degraded {
                tracing::warn!(
                    routine = %self.routine.id(),
                    %err,
                    "device memory unavailable, reporting zero"
                );
                self.degraded = true;
            }
        }
    }

    fn read(&mut self, memory: &dyn DeviceMemory) -> Mark {
        let (device, stat, err) = stat_or_zero(memory);
        self.warn_degraded(err);
        Mark { device, stat }
    }

    /// Read `device` specifically, so a line's before/after pair never spans devices.
    fn read_on(&mut self, memory: &dyn DeviceMemory, device: DeviceId) -> MemoryStat {
        match memory.stat(device) {
            Ok(stat) => stat,
            Err(err) => {
                self.warn_degraded(Some(err));
                MemoryStat::default()
            }
        }
    }

    fn close(&mut self, memory: &dyn DeviceMemory, line: u32, before: Mark) {
        let after = self.read_on(memory, before.device);
        self.records
            .entry(line)
            .or_insert_with(|| LineRecord::new(line))
            .push(LineSample {
                before: before.stat,
                after,
                device: before.device,
            });
    }

    fn close_frame(&mut self, memory: &dyn DeviceMemory, frame: Frame) {
        match self.granularity {
            Granularity::Line => {
                if let Some((line, mark)) = frame.pending {
                    self.close(memory, line, mark);
                }
            }
            Granularity::Call => {
                let line = self.routine.first_line();
                self.close(memory, line, frame.entry);
            }
        }
    }

    pub(crate) fn enter(&mut self, memory: &dyn DeviceMemory) {
        let entry = self.read(memory);
        self.frames.push(Frame {
            entry,
            pending: None,
        });
    }

    /// Close the innermost frame's pending line and open `line`.
    pub(crate) fn step(&mut self, memory: &dyn DeviceMemory, line: u32) {
        if self.granularity == Granularity::Call {
            return;
        }
        let Some(pending) = self.frames.last_mut().and_then(|f| f.pending.take()) else {
            let mark = self.read(memory);
            if let Some(frame) = self.frames.last_mut() {
                frame.pending = Some((line, mark));
            }
            return;
        };

        let (previous, mark) = pending;
        self.close(memory, previous, mark);
        let mark = self.read(memory);
        if let Some(frame) = self.frames.last_mut() {
            frame.pending = Some((line, mark));
        }
    }

    /// Pop the innermost frame. Returns true when an outermost call completed.
    pub(crate) fn leave(&mut self, memory: &dyn DeviceMemory) -> bool {
        let Some(frame) = self.frames.pop() else {
            return false;
        };
        self.close_frame(memory, frame);
        if !self.frames.is_empty() {
            return false;
        }

        self.calls += 1;
        for record in self.records.values_mut() {
            record.fold();
        }
        tracing::debug!(routine = %self.routine.id(), calls = self.calls, "profiled call finished");
        true
    }

    /// Close every open frame, keep what was recorded and stop accepting calls.
    pub(crate) fn abort(&mut self, memory: &dyn DeviceMemory) {
        while let Some(frame) = self.frames.pop() {
            self.close_frame(memory, frame);
        }
        for record in self.records.values_mut() {
            record.fold();
        }
        self.enabled = false;
        self.interrupted = true;
        tracing::warn!(routine = %self.routine.id(), calls = self.calls, "profiling interrupted");
    }

    /// Render the current aggregate as a table.
    pub fn render(&self) -> String {
        table::render(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memlab_env::{CachingAllocator, NoDevice};

    const MB: u64 = 1024 * 1024;

    fn routine() -> Routine {
        Routine::from_snippet("f", "a\nb\nc")
    }

    #[test]
    fn lines_are_closed_by_the_next_line_event() {
        let alloc = CachingAllocator::new(1);
        let dev = DeviceId::new(0);
        let mut session = ProfileSession::new(routine(), Granularity::Line);

        session.enter(&alloc);
        session.step(&alloc, 1);
        let _a = alloc.allocate(dev, 4 * MB).unwrap();
        session.step(&alloc, 2);
        assert_eq!(session.record(1).unwrap().samples().len(), 1);
        assert!(session.record(2).is_none());
        assert!(session.leave(&alloc));

        let line1 = session.record(1).unwrap().stats()[&dev];
        assert_eq!(line1.max_allocated_delta, (4 * MB) as i64);
        let line2 = session.record(2).unwrap().stats()[&dev];
        assert_eq!(line2.max_allocated_delta, 0);
        assert_eq!(session.calls(), 1);
    }

    #[test]
    fn nested_frames_only_finish_the_call_at_the_outermost_return() {
        let alloc = CachingAllocator::new(1);
        let mut session = ProfileSession::new(routine(), Granularity::Line);

        session.enter(&alloc);
        session.step(&alloc, 1);
        session.enter(&alloc);
        session.step(&alloc, 1);
        assert_eq!(session.depth(), 2);
        assert!(!session.leave(&alloc));
        assert!(session.leave(&alloc));

        assert_eq!(session.record(1).unwrap().stats()[&DeviceId::new(0)].visits, 2);
    }

    #[test]
    fn call_granularity_records_one_sample_per_call() {
        let alloc = CachingAllocator::new(1);
        let dev = DeviceId::new(0);
        let mut session = ProfileSession::new(routine(), Granularity::Call);

        session.enter(&alloc);
        session.step(&alloc, 2);
        let _a = alloc.allocate(dev, MB).unwrap();
        session.step(&alloc, 3);
        session.leave(&alloc);

        assert!(session.record(2).is_none());
        let stats = session.record(1).unwrap().stats()[&dev];
        assert_eq!(stats.max_allocated, MB);
        assert_eq!(stats.visits, 1);
    }

    #[test]
    fn missing_device_degrades_to_zero() {
        let mut session = ProfileSession::new(routine(), Granularity::Line);
        session.enter(&NoDevice);
        session.step(&NoDevice, 1);
        session.leave(&NoDevice);

        let stats = session.record(1).unwrap().stats()[&DeviceId::default()];
        assert_eq!(stats.max_allocated, 0);
        assert_eq!(stats.max_reserved, 0);
    }

    #[test]
    fn abort_keeps_partial_samples() {
        let alloc = CachingAllocator::new(1);
        let mut session = ProfileSession::new(routine(), Granularity::Line);

        session.enter(&alloc);
        session.step(&alloc, 1);
        session.abort(&alloc);

        assert!(!session.is_enabled());
        assert!(session.was_interrupted());
        assert_eq!(session.depth(), 0);
        assert_eq!(session.calls(), 0);
        assert!(session.record(1).unwrap().is_visited());
    }
}
