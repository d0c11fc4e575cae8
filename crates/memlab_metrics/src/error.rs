use crate::RoutineId;
use thiserror::Error;

/// Usage errors and interruptions surfaced by the line profiler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfilerError {
    #[error("routine {routine} is already being profiled")]
    ReentrantProfiling { routine: RoutineId },

    #[error("no active profiling session for routine {routine}")]
    UnknownSession { routine: RoutineId },

    #[error("profiling session for routine {routine} was torn down")]
    SessionClosed { routine: RoutineId },

    #[error("profiling of routine {routine} was interrupted")]
    Interrupted { routine: RoutineId },

    #[error("report interval must be at least 1 call")]
    InvalidInterval,
}
