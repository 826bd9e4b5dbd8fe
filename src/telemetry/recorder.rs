//! Closure-based phase timer.

use super::export::MetricsExporter;
use super::metrics::{Metrics, MetricsSnapshot};
use super::tracing::TracingSystem;
use super::Phase;
use crate::config::Config;
use crate::error::Result;
use std::time::Instant;
use ::tracing::debug;

/// Times pipeline phases into [`Metrics`] and a span per run.
///
/// ```ignore
/// let recorder = PhaseRecorder::new()?;
/// let ctx = recorder.time(Phase::ContextCreation, || DeviceContext::create(rt, DeviceKind::Gpu))?;
/// ```
#[derive(Debug)]
pub struct PhaseRecorder {
    metrics: Metrics,
    tracer: TracingSystem,
    enabled: bool,
}

impl PhaseRecorder {
    pub fn new() -> Result<Self> {
        Self::with_enabled(true)
    }

    /// Honors `Config::enable_telemetry`.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_enabled(config.enable_telemetry)
    }

    fn with_enabled(enabled: bool) -> Result<Self> {
        Ok(Self {
            metrics: Metrics::new()?,
            tracer: TracingSystem::new(enabled),
            enabled,
        })
    }

    /// Run `f` as one occurrence of `phase`. Failed runs are timed too and
    /// counted as failures.
    pub fn time<T>(&self, phase: Phase, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if !self.enabled {
            return f();
        }

        let span = self.tracer.enter_span(phase.label());
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();

        self.metrics.record(phase, elapsed);
        if let Err(err) = &result {
            self.metrics.record_failure(phase);
            span.metadata("error", err.to_string());
        }
        debug!(
            phase = phase.label(),
            elapsed_us = elapsed.as_micros() as u64,
            ok = result.is_ok(),
            "phase timed"
        );
        result
    }

    pub fn record_bytes(&self, bytes: usize) {
        if self.enabled {
            self.metrics.record_bytes(bytes);
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn tracer(&self) -> &TracingSystem {
        &self.tracer
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn export(&self, exporter: &dyn MetricsExporter) -> Result<()> {
        exporter.export(&self.snapshot())
    }
}
