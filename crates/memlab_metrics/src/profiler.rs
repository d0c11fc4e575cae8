//! Session registry and call interception

use crate::{InterruptFlag, ProfileSession, ProfilerError, Routine, RoutineId, StepObserver};
use memlab_env::DeviceMemory;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

// Process-wide so handles from one profiler never validate against another.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// When reports are emitted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProfileMode {
    /// Keep the per-line maximum across calls, report at `end`.
    Aggregate,
    /// Also emit a full report after every Nth completed call.
    EveryNth(u64),
}

/// What the host can intercept.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Granularity {
    /// One sample per executed line.
    Line,
    /// One sample per call, keyed to the routine's first line. For hosts
    /// without line events.
    Call,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProfilerConfig {
    pub mode: ProfileMode,
    pub granularity: Granularity,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            mode: ProfileMode::Aggregate,
            granularity: Granularity::Line,
        }
    }
}

impl ProfilerConfig {
    pub fn validate(&self) -> Result<(), ProfilerError> {
        match self.mode {
            ProfileMode::EveryNth(0) => Err(ProfilerError::InvalidInterval),
            _ => Ok(()),
        }
    }
}

/// Where flushed reports go.
pub type ReportSink = Box<dyn FnMut(&str)>;

/// Proof of an active session, returned by `begin` and consumed by `end`.
#[derive(Debug, PartialEq, Eq)]
pub struct SessionHandle {
    routine: RoutineId,
    generation: u64,
}

impl SessionHandle {
    pub fn routine(&self) -> &RoutineId {
        &self.routine
    }
}

struct Slot {
    generation: u64,
    session: ProfileSession,
}

fn lookup_mut<'a>(
    sessions: &'a mut HashMap<RoutineId, Slot>,
    handle: &SessionHandle,
) -> Result<&'a mut ProfileSession, ProfilerError> {
    match sessions.get_mut(&handle.routine) {
        Some(slot) if slot.generation == handle.generation => Ok(&mut slot.session),
        _ => Err(ProfilerError::UnknownSession {
            routine: handle.routine.clone(),
        }),
    }
}

/// Line-granularity device memory profiler.
///
/// Sessions are explicit: `begin` hands out a `SessionHandle`, calls go
/// through `call`, and `end` tears the session down and flushes its report.
///
/// # Example
/// ```ignore
/// let mut profiler = LineProfiler::new(allocator.clone());
/// let handle = profiler.begin(routine!("forward").with_line_count(3))?;
/// profiler.call(&handle, |probe| {
///     step!(probe); let a = allocator.allocate(dev, 1 << 20)?;
///     step!(probe); let b = allocator.allocate(dev, 1 << 20)?;
///     Ok::<_, anyhow::Error>((a, b))
/// })?;
/// let report = profiler.end(handle)?;
/// ```
pub struct LineProfiler {
    memory: Rc<dyn DeviceMemory>,
    config: ProfilerConfig,
    sessions: HashMap<RoutineId, Slot>,
    interrupt: InterruptFlag,
    sink: ReportSink,
}

impl LineProfiler {
    pub fn new(memory: Rc<dyn DeviceMemory>) -> Self {
        Self {
            memory,
            config: ProfilerConfig::default(),
            sessions: HashMap::new(),
            interrupt: InterruptFlag::new(),
            sink: Box::new(|report: &str| println!("{report}")),
        }
    }

    pub fn with_config(mut self, config: ProfilerConfig) -> Result<Self, ProfilerError> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn with_sink(mut self, sink: ReportSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Flag that interrupts the running call at its next line event.
    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    /// Start profiling `routine`.
    ///
    /// Fails if the routine already has an active session; that session is
    /// left untouched. A session torn down by an interruption is replaced.
    pub fn begin(&mut self, routine: Routine) -> Result<SessionHandle, ProfilerError> {
        let id = routine.id().clone();
        if let Some(slot) = self.sessions.get(&id) {
            if slot.session.is_enabled() {
                return Err(ProfilerError::ReentrantProfiling { routine: id });
            }
        }

        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(routine = %id, generation, "profiling session started");
        self.sessions.insert(
            id.clone(),
            Slot {
                generation,
                session: ProfileSession::new(routine, self.config.granularity),
            },
        );
        Ok(SessionHandle {
            routine: id,
            generation,
        })
    }

    /// Stop profiling and flush the final report.
    ///
    /// An interrupted session already flushed its partial report; it is
    /// returned again but not re-sent to the sink.
    pub fn end(&mut self, handle: SessionHandle) -> Result<String, ProfilerError> {
        lookup_mut(&mut self.sessions, &handle)?;
        let Some(slot) = self.sessions.remove(&handle.routine) else {
            return Err(ProfilerError::UnknownSession {
                routine: handle.routine,
            });
        };

        let report = slot.session.render();
        if !slot.session.was_interrupted() {
            (self.sink)(&report);
        }
        tracing::info!(
            routine = %handle.routine,
            calls = slot.session.calls(),
            "profiling session ended"
        );
        Ok(report)
    }

    /// Render the current aggregate without ending the session.
    pub fn report(&self, handle: &SessionHandle) -> Result<String, ProfilerError> {
        Ok(self.session(handle)?.render())
    }

    pub fn session(&self, handle: &SessionHandle) -> Result<&ProfileSession, ProfilerError> {
        match self.sessions.get(&handle.routine) {
            Some(slot) if slot.generation == handle.generation => Ok(&slot.session),
            _ => Err(ProfilerError::UnknownSession {
                routine: handle.routine.clone(),
            }),
        }
    }

    /// Run one invocation of the profiled routine.
    ///
    /// `f` reports line boundaries through the probe (usually with
    /// `step!`). If the interrupt flag is raised, or `f` panics, the partial
    /// report is flushed and the session is torn down before the
    /// interruption propagates.
    pub fn call<R, E, F>(&mut self, handle: &SessionHandle, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut LineProbe<'_>) -> Result<R, E>,
        E: From<ProfilerError>,
    {
        let mode = self.config.mode;
        let Self {
            memory,
            sessions,
            interrupt,
            sink,
            ..
        } = self;
        let session = lookup_mut(sessions, handle)?;
        if !session.is_enabled() {
            return Err(ProfilerError::SessionClosed {
                routine: handle.routine.clone(),
            }
            .into());
        }

        let mut guard = CallGuard {
            probe: LineProbe {
                session,
                memory: &**memory,
                interrupt,
                interrupted: false,
            },
            sink,
            armed: true,
        };
        guard.probe.on_call();
        let result = f(&mut guard.probe);
        guard.armed = false;

        let probe = &mut guard.probe;
        if probe.interrupted {
            probe.session.abort(probe.memory);
            (guard.sink)(&probe.session.render());
            return result;
        }

        let completed = probe.session.leave(probe.memory);
        if let ProfileMode::EveryNth(n) = mode {
            let calls = probe.session.calls();
            if completed && calls % n == 0 {
                (guard.sink)(&probe.session.render());
            }
        }
        result
    }
}

/// Flushes the partial report if the profiled closure unwinds.
struct CallGuard<'a> {
    probe: LineProbe<'a>,
    sink: &'a mut ReportSink,
    armed: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let probe = &mut self.probe;
            probe.session.abort(probe.memory);
            (self.sink)(&probe.session.render());
        }
    }
}

/// Line-event driver handed to the profiled closure.
pub struct LineProbe<'a> {
    session: &'a mut ProfileSession,
    memory: &'a dyn DeviceMemory,
    interrupt: &'a InterruptFlag,
    interrupted: bool,
}

impl LineProbe<'_> {
    /// Report that `line` is about to execute.
    pub fn line(&mut self, line: u32) -> Result<(), ProfilerError> {
        if self.interrupted || self.interrupt.take() {
            self.interrupted = true;
            return Err(ProfilerError::Interrupted {
                routine: self.session.routine().id().clone(),
            });
        }
        self.session.step(self.memory, line);
        Ok(())
    }

    /// Run a recursive invocation of the profiled routine as a nested frame.
    ///
    /// The caller's current line stays open until its next line event, so
    /// it is charged with everything the nested frame leaves allocated.
    pub fn nested<R, E, F>(&mut self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut LineProbe<'_>) -> Result<R, E>,
    {
        self.on_call();
        let result = f(self);
        if !self.interrupted {
            self.on_return();
        }
        result
    }

    /// Active frames of the profiled routine.
    pub fn depth(&self) -> usize {
        self.session.depth()
    }
}

impl StepObserver for LineProbe<'_> {
    fn on_call(&mut self) {
        self.session.enter(self.memory);
    }

    fn on_line(&mut self, line: u32) -> Result<(), ProfilerError> {
        self.line(line)
    }

    fn on_return(&mut self) {
        self.session.leave(self.memory);
    }
}

/// A routine bundled with its own profiler and session.
///
/// Calls are delegated to the wrapped closure; dropping the wrapper ends
/// the session and flushes the final report.
pub struct ProfiledRoutine {
    profiler: LineProfiler,
    routine: RoutineId,
    handle: Option<SessionHandle>,
}

impl ProfiledRoutine {
    pub fn new(mut profiler: LineProfiler, routine: Routine) -> Result<Self, ProfilerError> {
        let id = routine.id().clone();
        let handle = profiler.begin(routine)?;
        Ok(Self {
            profiler,
            routine: id,
            handle: Some(handle),
        })
    }

    fn handle(&self) -> Result<&SessionHandle, ProfilerError> {
        self.handle.as_ref().ok_or_else(|| ProfilerError::UnknownSession {
            routine: self.routine.clone(),
        })
    }

    pub fn call<R, E, F>(&mut self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut LineProbe<'_>) -> Result<R, E>,
        E: From<ProfilerError>,
    {
        let handle = self.handle.as_ref().ok_or_else(|| ProfilerError::UnknownSession {
            routine: self.routine.clone(),
        })?;
        self.profiler.call(handle, f)
    }

    pub fn report(&self) -> Result<String, ProfilerError> {
        self.profiler.report(self.handle()?)
    }

    pub fn session(&self) -> Result<&ProfileSession, ProfilerError> {
        self.profiler.session(self.handle()?)
    }

    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.profiler.interrupt_flag()
    }

    /// End the session and return the final report.
    pub fn finish(mut self) -> Result<String, ProfilerError> {
        let handle = self.handle.take().ok_or_else(|| ProfilerError::UnknownSession {
            routine: self.routine.clone(),
        })?;
        self.profiler.end(handle)
    }
}

impl Drop for ProfiledRoutine {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.profiler.end(handle) {
                tracing::warn!(%err, "failed to flush profiling report");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{step, LineStats};
    use memlab_env::{Block, CachingAllocator, DeviceId, NoDevice};
    use std::cell::RefCell;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    const MB: u64 = 1024 * 1024;
    const DEV: DeviceId = DeviceId::new(0);
    const THREE_LINES: &str = "a = alloc(4M)\nb = alloc(4M)\nc = alloc(4M)";

    fn capture() -> (Rc<RefCell<Vec<String>>>, ReportSink) {
        let reports = Rc::new(RefCell::new(Vec::new()));
        let sink_reports = Rc::clone(&reports);
        let sink: ReportSink =
            Box::new(move |report: &str| sink_reports.borrow_mut().push(report.to_string()));
        (reports, sink)
    }

    fn three_allocations(
        probe: &mut LineProbe<'_>,
        alloc: &CachingAllocator,
        bytes: u64,
    ) -> Result<Vec<Block>, ProfilerError> {
        let mut blocks = Vec::new();
        for line in 1..=3 {
            probe.line(line)?;
            blocks.push(alloc.allocate(DEV, bytes).unwrap());
        }
        Ok(blocks)
    }

    fn stats(profiler: &LineProfiler, handle: &SessionHandle, line: u32) -> LineStats {
        profiler.session(handle).unwrap().record(line).unwrap().stats()[&DEV]
    }

    #[test]
    fn three_line_routine_called_twice() {
        let alloc = Rc::new(CachingAllocator::new(1));
        let (_, sink) = capture();
        let mut profiler = LineProfiler::new(alloc.clone()).with_sink(sink);
        let handle = profiler.begin(Routine::from_snippet("f", THREE_LINES)).unwrap();

        for _ in 0..2 {
            let blocks = profiler
                .call(&handle, |probe| three_allocations(probe, &alloc, 4 * MB))
                .unwrap();
            blocks.into_iter().for_each(|b| alloc.free(b));
        }

        assert_eq!(profiler.session(&handle).unwrap().calls(), 2);
        for line in 1..=3 {
            assert_eq!(stats(&profiler, &handle, line).max_allocated_delta, (4 * MB) as i64);
        }
        assert_eq!(stats(&profiler, &handle, 3).max_allocated, 12 * MB);
        assert_eq!(stats(&profiler, &handle, 1).max_allocated, 4 * MB);

        let report = profiler.end(handle).unwrap();
        assert!(report.contains("12.00M"));
        assert!(report.contains("calls: 2"));
    }

    #[test]
    fn step_macro_records_source_lines() {
        let alloc = Rc::new(CachingAllocator::new(1));
        let (_, sink) = capture();
        let mut profiler = LineProfiler::new(alloc.clone()).with_sink(sink);
        let handle = profiler.begin(crate::routine!("inline")).unwrap();

        let first = line!() + 2;
        let block = profiler.call(&handle, |probe| {
            step!(probe);
            let block = alloc.allocate(DEV, MB).unwrap();
            step!(probe);
            Ok::<_, ProfilerError>(block)
        });
        let block = block.unwrap();

        assert_eq!(stats(&profiler, &handle, first).max_allocated_delta, MB as i64);
        assert_eq!(stats(&profiler, &handle, first + 2).max_allocated_delta, 0);
        alloc.free(block);
    }

    #[test]
    fn max_usage_never_decreases() {
        let alloc = Rc::new(CachingAllocator::new(1));
        let (_, sink) = capture();
        let mut profiler = LineProfiler::new(alloc.clone()).with_sink(sink);
        let handle = profiler.begin(Routine::from_snippet("f", THREE_LINES)).unwrap();

        let mut last = 0;
        for bytes in [4 * MB, MB, 8 * MB, 512] {
            let blocks = profiler
                .call(&handle, |probe| three_allocations(probe, &alloc, bytes))
                .unwrap();
            blocks.into_iter().for_each(|b| alloc.free(b));

            let now = stats(&profiler, &handle, 3).max_allocated;
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 24 * MB);
    }

    #[test]
    fn aggregate_equals_elementwise_max_of_single_calls() {
        fn run(sizes: &[u64]) -> Vec<LineStats> {
            let alloc = Rc::new(CachingAllocator::new(1));
            let mut profiler = LineProfiler::new(alloc.clone()).with_sink(Box::new(|_: &str| {}));
            let handle = profiler.begin(Routine::from_snippet("f", THREE_LINES)).unwrap();
            for &bytes in sizes {
                let blocks = profiler
                    .call(&handle, |probe| three_allocations(probe, &alloc, bytes))
                    .unwrap();
                blocks.into_iter().for_each(|b| alloc.free(b));
                alloc.empty_cache();
            }
            (1..=3).map(|line| stats(&profiler, &handle, line)).collect()
        }

        let first = run(&[3 * MB]);
        let second = run(&[MB / 2]);
        let both = run(&[3 * MB, MB / 2]);

        for line in 0..3 {
            let mut merged = first[line];
            merged.merge(&second[line]);
            assert_eq!(merged, both[line]);
        }
    }

    #[test]
    fn second_begin_is_rejected_and_first_session_survives() {
        let alloc = Rc::new(CachingAllocator::new(1));
        let (_, sink) = capture();
        let mut profiler = LineProfiler::new(alloc.clone()).with_sink(sink);
        let routine = Routine::from_snippet("f", THREE_LINES);

        let handle = profiler.begin(routine.clone()).unwrap();
        profiler.call(&handle, |probe| probe.line(1)).unwrap();

        let err = profiler.begin(routine.clone()).unwrap_err();
        assert_eq!(err, ProfilerError::ReentrantProfiling { routine: routine.id().clone() });
        assert_eq!(profiler.session(&handle).unwrap().calls(), 1);
        assert!(profiler.end(handle).is_ok());
        assert!(profiler.begin(routine).is_ok());
    }

    #[test]
    fn handles_do_not_cross_profilers() {
        let routine = Routine::from_snippet("f", "x");
        let mut one = LineProfiler::new(Rc::new(NoDevice)).with_sink(Box::new(|_: &str| {}));
        let mut two = LineProfiler::new(Rc::new(NoDevice)).with_sink(Box::new(|_: &str| {}));

        let _first = one.begin(routine.clone()).unwrap();
        let second = two.begin(routine).unwrap();
        let Err(ProfilerError::UnknownSession { .. }) = one.report(&second) else {
            panic!("foreign handle accepted");
        };
        assert!(two.end(second).is_ok());
    }

    #[test]
    fn every_nth_call_emits_a_report() {
        let alloc = Rc::new(CachingAllocator::new(1));
        let (reports, sink) = capture();
        let config = ProfilerConfig {
            mode: ProfileMode::EveryNth(2),
            granularity: Granularity::Line,
        };
        let mut profiler = LineProfiler::new(alloc.clone())
            .with_config(config)
            .unwrap()
            .with_sink(sink);
        let handle = profiler.begin(Routine::from_snippet("f", THREE_LINES)).unwrap();

        for _ in 0..5 {
            profiler.call(&handle, |probe| probe.line(1)).unwrap();
        }
        assert_eq!(reports.borrow().len(), 2);
        assert!(reports.borrow()[0].contains("calls: 2"));
        assert!(reports.borrow()[1].contains("calls: 4"));

        profiler.end(handle).unwrap();
        assert_eq!(reports.borrow().len(), 3);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = ProfilerConfig {
            mode: ProfileMode::EveryNth(0),
            granularity: Granularity::Line,
        };
        let Err(err) = LineProfiler::new(Rc::new(NoDevice)).with_config(config) else {
            panic!("interval 0 accepted");
        };
        assert_eq!(err, ProfilerError::InvalidInterval);
    }

    #[test]
    fn interrupt_flushes_partial_report_then_propagates() {
        let alloc = Rc::new(CachingAllocator::new(1));
        let (reports, sink) = capture();
        let mut profiler = LineProfiler::new(alloc.clone()).with_sink(sink);
        let flag = profiler.interrupt_flag();
        let routine = Routine::from_snippet("f", THREE_LINES);
        let handle = profiler.begin(routine.clone()).unwrap();

        let result: Result<(), ProfilerError> = profiler.call(&handle, |probe| {
            probe.line(1)?;
            flag.raise();
            probe.line(2)?;
            unreachable!("line 2 must not run");
        });
        assert_eq!(
            result.unwrap_err(),
            ProfilerError::Interrupted {
                routine: routine.id().clone()
            }
        );
        assert!(!flag.is_raised());
        assert_eq!(reports.borrow().len(), 1);
        assert!(reports.borrow()[0].contains("[interrupted, partial]"));

        let session = profiler.session(&handle).unwrap();
        assert!(!session.is_enabled());
        assert!(session.record(1).unwrap().is_visited());

        let again: Result<(), ProfilerError> = profiler.call(&handle, |_| Ok(()));
        assert!(matches!(again, Err(ProfilerError::SessionClosed { .. })));

        profiler.end(handle).unwrap();
        assert_eq!(reports.borrow().len(), 1);
    }

    #[test]
    fn panic_flushes_partial_report() {
        let alloc = Rc::new(CachingAllocator::new(1));
        let (reports, sink) = capture();
        let mut profiler = LineProfiler::new(alloc.clone()).with_sink(sink);
        let routine = Routine::from_snippet("f", THREE_LINES);
        let handle = profiler.begin(routine.clone()).unwrap();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let _: Result<(), ProfilerError> = profiler.call(&handle, |probe| {
                probe.line(1)?;
                panic!("boom");
            });
        }));
        assert!(outcome.is_err());
        assert_eq!(reports.borrow().len(), 1);
        assert!(!profiler.session(&handle).unwrap().is_enabled());

        // A torn-down session can be replaced
        assert!(profiler.begin(routine).is_ok());
    }

    #[test]
    fn nested_frames_are_recorded_and_charged_to_the_caller() {
        let alloc = Rc::new(CachingAllocator::new(1));
        let (_, sink) = capture();
        let mut profiler = LineProfiler::new(alloc.clone()).with_sink(sink);
        let handle = profiler.begin(Routine::from_snippet("f", THREE_LINES)).unwrap();

        let blocks = profiler
            .call(&handle, |probe| {
                probe.line(1)?;
                let inner = probe.nested(|probe| {
                    assert_eq!(probe.depth(), 2);
                    probe.line(3)?;
                    Ok::<_, ProfilerError>(alloc.allocate(DEV, 2 * MB).unwrap())
                })?;
                probe.line(2)?;
                Ok::<_, ProfilerError>(inner)
            })
            .unwrap();

        assert_eq!(profiler.session(&handle).unwrap().calls(), 1);
        assert_eq!(stats(&profiler, &handle, 1).max_allocated_delta, (2 * MB) as i64);
        assert_eq!(stats(&profiler, &handle, 3).max_allocated_delta, (2 * MB) as i64);
        alloc.free(blocks);
    }

    #[test]
    fn missing_accelerator_reports_zero() {
        let (reports, sink) = capture();
        let mut profiler = LineProfiler::new(Rc::new(NoDevice)).with_sink(sink);
        let handle = profiler.begin(Routine::from_snippet("f", THREE_LINES)).unwrap();

        profiler.call(&handle, |probe| probe.line(1)).unwrap();
        profiler.end(handle).unwrap();
        assert!(reports.borrow()[0].contains("0.00B"));
    }

    #[test]
    fn profiled_routine_flushes_on_drop() {
        let alloc = Rc::new(CachingAllocator::new(1));
        let (reports, sink) = capture();
        let profiler = LineProfiler::new(alloc.clone()).with_sink(sink);

        {
            let mut routine =
                ProfiledRoutine::new(profiler, Routine::from_snippet("f", THREE_LINES)).unwrap();
            routine.call(|probe| probe.line(1)).unwrap();
            assert!(routine.report().unwrap().contains("calls: 1"));
            assert!(reports.borrow().is_empty());
        }
        assert_eq!(reports.borrow().len(), 1);
    }

    #[test]
    fn profiled_routine_finish_returns_report_once() {
        let (reports, sink) = capture();
        let profiler = LineProfiler::new(Rc::new(NoDevice)).with_sink(sink);
        let mut routine = ProfiledRoutine::new(profiler, Routine::from_snippet("f", "x")).unwrap();
        routine.call(|probe| probe.line(1)).unwrap();

        let report = routine.finish().unwrap();
        assert!(report.contains("calls: 1"));
        assert_eq!(reports.borrow().len(), 1);
    }
}
