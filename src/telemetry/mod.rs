//! Phase timing and observability.
//!
//! The resource wrappers do no timing of their own. Callers wrap each phase
//! of the pipeline in [`PhaseRecorder::time`]; durations land in
//! per-phase histograms that the exporters render as a timing table.

#[cfg(feature = "telemetry")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub mod tracing;

#[cfg(feature = "telemetry")]
pub mod export;

#[cfg(feature = "telemetry")]
pub mod recorder;

#[cfg(feature = "telemetry")]
pub use metrics::{Metrics, MetricsSnapshot, PhaseStats};

#[cfg(feature = "telemetry")]
pub use self::tracing::{Span, SpanGuard, SpanId, TracingSystem};

#[cfg(feature = "telemetry")]
pub use export::{ConsoleExporter, JsonExporter, MetricsExporter};

pub use recorder::PhaseRecorder;

/// A timed step of the accelerator pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    ContextCreation,
    BufferAllocation,
    ProgramBuild,
    ArgumentBinding,
    QueueCreation,
    Enqueue,
    Drain,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::ContextCreation,
        Phase::BufferAllocation,
        Phase::ProgramBuild,
        Phase::ArgumentBinding,
        Phase::QueueCreation,
        Phase::Enqueue,
        Phase::Drain,
    ];

    /// Row label in the timing table.
    pub fn label(self) -> &'static str {
        match self {
            Phase::ContextCreation => "init context",
            Phase::BufferAllocation => "load mem",
            Phase::ProgramBuild => "compile",
            Phase::ArgumentBinding => "set args",
            Phase::QueueCreation => "init queue",
            Phase::Enqueue => "enqueue",
            Phase::Drain => "run queue",
        }
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

// Pass-through recorder when telemetry is disabled
#[cfg(not(feature = "telemetry"))]
pub mod recorder {
    use super::Phase;
    use crate::config::Config;
    use crate::error::Result;

    #[derive(Debug, Default)]
    pub struct PhaseRecorder;

    impl PhaseRecorder {
        pub fn new() -> Result<Self> { Ok(Self) }
        pub fn from_config(_: &Config) -> Result<Self> { Ok(Self) }
        pub fn time<T>(&self, _: Phase, f: impl FnOnce() -> Result<T>) -> Result<T> { f() }
        pub fn record_bytes(&self, _: usize) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_indices_follow_all() {
        for (i, phase) in Phase::ALL.iter().enumerate() {
            assert_eq!(phase.index(), i);
        }
        assert_eq!(Phase::Drain.label(), "run queue");
    }
}
