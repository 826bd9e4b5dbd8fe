//! Metrics export: a console timing table and JSON files.

use super::metrics::MetricsSnapshot;
use crate::error::{Error, Result};
use std::fmt::Write as _;

/// Trait for exporting metrics to different formats
pub trait MetricsExporter: Send + Sync {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()>;
}

/// Writes a snapshot as pretty-printed JSON.
#[derive(Debug)]
pub struct JsonExporter {
    output_path: std::path::PathBuf,
}

impl JsonExporter {
    pub fn new(output_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }

    pub fn render(snapshot: &MetricsSnapshot) -> Result<String> {
        serde_json::to_string_pretty(&SerializableSnapshot::from(snapshot))
            .map_err(|e| Error::telemetry(format!("JSON serialization failed: {}", e)))
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let json = Self::render(snapshot)?;
        std::fs::write(&self.output_path, json)
            .map_err(|e| Error::telemetry(format!("Failed to write file: {}", e)))
    }
}

#[derive(Debug, Clone, serde::Serialize)]
struct SerializablePhase {
    phase: &'static str,
    count: u64,
    failures: u64,
    last_ms: f64,
    total_ms: f64,
    mean_us: f64,
    p50_us: f64,
    p99_us: f64,
    max_us: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
struct SerializableSnapshot {
    uptime_secs: f64,
    bytes_transferred: u64,
    phases: Vec<SerializablePhase>,
}

impl From<&MetricsSnapshot> for SerializableSnapshot {
    fn from(snapshot: &MetricsSnapshot) -> Self {
        Self {
            uptime_secs: snapshot.uptime.as_secs_f64(),
            bytes_transferred: snapshot.bytes_transferred,
            phases: snapshot
                .phases
                .iter()
                .map(|s| SerializablePhase {
                    phase: s.phase.label(),
                    count: s.count,
                    failures: s.failures,
                    last_ms: s.last_ns as f64 * 1e-6,
                    total_ms: s.total_ns as f64 * 1e-6,
                    mean_us: s.mean_ns as f64 * 1e-3,
                    p50_us: s.p50_ns as f64 * 1e-3,
                    p99_us: s.p99_ns as f64 * 1e-3,
                    max_us: s.max_ns as f64 * 1e-3,
                })
                .collect(),
        }
    }
}

/// Prints the per-phase timing table, in milliseconds, to stdout.
#[derive(Debug)]
pub struct ConsoleExporter {
    verbose: bool,
}

impl ConsoleExporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn render(&self, snapshot: &MetricsSnapshot) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        for stats in &snapshot.phases {
            let label = format!("{}:", stats.phase.label());
            let _ = writeln!(out, "{:<17}{:.3}", label, stats.last_ns as f64 * 1e-6);
        }

        if self.verbose {
            let _ = writeln!(out, "\nruns / failures / mean / p99 / max (us):");
            for stats in snapshot.phases.iter().filter(|s| s.count > 0) {
                let _ = writeln!(
                    out,
                    "  {:<15}{} / {} / {:.2} / {:.2} / {:.2}",
                    stats.phase.label(),
                    stats.count,
                    stats.failures,
                    stats.mean_ns as f64 * 1e-3,
                    stats.p99_ns as f64 * 1e-3,
                    stats.max_ns as f64 * 1e-3,
                );
            }
            let _ = writeln!(
                out,
                "  transferred: {:.2}MB",
                snapshot.bytes_transferred as f64 / (1024.0 * 1024.0)
            );
        }
        out
    }
}

impl MetricsExporter for ConsoleExporter {
    fn export(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        print!("{}", self.render(snapshot));
        Ok(())
    }
}

impl Default for ConsoleExporter {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{Metrics, Phase};
    use std::time::Duration;

    fn sample_snapshot() -> MetricsSnapshot {
        let metrics = Metrics::new().unwrap();
        metrics.record(Phase::ProgramBuild, Duration::from_micros(1500));
        metrics.record(Phase::Drain, Duration::from_micros(250));
        metrics.record_bytes(1024 * 1024);
        metrics.snapshot()
    }

    #[test]
    fn test_console_table_has_a_row_per_phase() {
        let table = ConsoleExporter::default().render(&sample_snapshot());
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), Phase::ALL.len());
        assert_eq!(lines[2], "compile:         1.500");
        assert_eq!(lines[6], "run queue:       0.250");

        let verbose = ConsoleExporter::new(true).render(&sample_snapshot());
        assert!(verbose.contains("transferred: 1.00MB"));
    }

    #[test]
    fn test_json_exporter() {
        let json = JsonExporter::render(&sample_snapshot()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["bytes_transferred"], 1024 * 1024);
        assert_eq!(value["phases"][2]["phase"], "compile");
        assert_eq!(value["phases"][2]["count"], 1);

        let path = std::env::temp_dir().join("veda_cl_metrics_test.json");
        let exporter = JsonExporter::new(&path);
        assert!(exporter.export(&sample_snapshot()).is_ok());
        assert!(path.exists());
        let _ = std::fs::remove_file(&path);
    }
}
