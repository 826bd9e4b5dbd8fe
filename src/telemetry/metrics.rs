//! Per-phase duration metrics.

use super::Phase;
use crate::error::{Error, Result};
use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// One hour in nanoseconds; longer samples saturate.
const MAX_TRACKABLE_NS: u64 = 3_600_000_000_000;

#[derive(Debug)]
struct PhaseSlot {
    histogram: RwLock<Histogram<u64>>,
    total_ns: AtomicU64,
    last_ns: AtomicU64,
    failures: AtomicU64,
}

/// Duration histograms and counters for every [`Phase`].
#[derive(Debug)]
pub struct Metrics {
    phases: Vec<PhaseSlot>,
    bytes_transferred: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let phases = Phase::ALL
            .iter()
            .map(|_| {
                // 3 significant figures
                let histogram = Histogram::new_with_max(MAX_TRACKABLE_NS, 3)
                    .map_err(|e| Error::telemetry(format!("histogram creation failed: {}", e)))?;
                Ok(PhaseSlot {
                    histogram: RwLock::new(histogram),
                    total_ns: AtomicU64::new(0),
                    last_ns: AtomicU64::new(0),
                    failures: AtomicU64::new(0),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            phases,
            bytes_transferred: AtomicU64::new(0),
            start_time: Instant::now(),
        })
    }

    /// Record one completed run of `phase`.
    pub fn record(&self, phase: Phase, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX).min(MAX_TRACKABLE_NS);
        let slot = &self.phases[phase.index()];
        slot.histogram.write().saturating_record(ns);
        slot.total_ns.fetch_add(ns, Ordering::Relaxed);
        slot.last_ns.store(ns, Ordering::Relaxed);
    }

    pub fn record_failure(&self, phase: Phase) {
        self.phases[phase.index()].failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record host/device traffic.
    pub fn record_bytes(&self, bytes: usize) {
        self.bytes_transferred.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let phases = Phase::ALL
            .iter()
            .zip(&self.phases)
            .map(|(&phase, slot)| {
                let histogram = slot.histogram.read();
                PhaseStats {
                    phase,
                    count: histogram.len(),
                    failures: slot.failures.load(Ordering::Relaxed),
                    last_ns: slot.last_ns.load(Ordering::Relaxed),
                    total_ns: slot.total_ns.load(Ordering::Relaxed),
                    mean_ns: if histogram.len() > 0 {
                        histogram.mean() as u64
                    } else {
                        0
                    },
                    p50_ns: histogram.value_at_quantile(0.50),
                    p99_ns: histogram.value_at_quantile(0.99),
                    max_ns: histogram.max(),
                }
            })
            .collect();

        MetricsSnapshot {
            timestamp: Instant::now(),
            uptime: self.start_time.elapsed(),
            phases,
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for slot in &self.phases {
            slot.histogram.write().reset();
            slot.total_ns.store(0, Ordering::Relaxed);
            slot.last_ns.store(0, Ordering::Relaxed);
            slot.failures.store(0, Ordering::Relaxed);
        }
        self.bytes_transferred.store(0, Ordering::Relaxed);
    }
}

/// Aggregates for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseStats {
    pub phase: Phase,
    pub count: u64,
    pub failures: u64,
    pub last_ns: u64,
    pub total_ns: u64,
    pub mean_ns: u64,
    pub p50_ns: u64,
    pub p99_ns: u64,
    pub max_ns: u64,
}

/// Metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: Instant,
    pub uptime: Duration,
    /// One entry per phase, in [`Phase::ALL`] order.
    pub phases: Vec<PhaseStats>,
    pub bytes_transferred: u64,
}

impl MetricsSnapshot {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseStats> {
        self.phases.iter().find(|s| s.phase == phase)
    }

    /// Sum of the most recent duration of every phase.
    pub fn last_run_ns(&self) -> u64 {
        self.phases.iter().map(|s| s.last_ns).sum()
    }
}
