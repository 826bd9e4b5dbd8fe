//! Span collection for phase-level traces.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Unique identifier for a span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

impl SpanId {
    fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone)]
pub struct Span {
    pub id: SpanId,
    pub parent: Option<SpanId>,
    pub name: String,
    pub start: Instant,
    pub end: Option<Instant>,
    pub metadata: HashMap<String, String>,
}

impl Span {
    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end.duration_since(self.start))
    }
}

/// Collects spans; nesting follows the order spans are entered.
#[derive(Debug)]
pub struct TracingSystem {
    spans: RwLock<HashMap<SpanId, Span>>,
    open: Mutex<Vec<SpanId>>,
    enabled: bool,
}

impl TracingSystem {
    pub fn new(enabled: bool) -> Self {
        Self {
            spans: RwLock::new(HashMap::new()),
            open: Mutex::new(Vec::new()),
            enabled,
        }
    }

    pub fn enter_span(&self, name: &str) -> SpanGuard<'_> {
        if !self.enabled {
            return SpanGuard {
                span_id: None,
                system: self,
            };
        }

        let span_id = SpanId::new();
        let parent = {
            let mut open = self.open.lock();
            let parent = open.last().copied();
            open.push(span_id);
            parent
        };
        self.spans.write().insert(
            span_id,
            Span {
                id: span_id,
                parent,
                name: name.to_string(),
                start: Instant::now(),
                end: None,
                metadata: HashMap::new(),
            },
        );

        SpanGuard {
            span_id: Some(span_id),
            system: self,
        }
    }

    pub fn add_metadata(&self, span_id: SpanId, key: String, value: String) {
        if let Some(span) = self.spans.write().get_mut(&span_id) {
            span.metadata.insert(key, value);
        }
    }

    /// All spans, in the order they were entered.
    pub fn spans_snapshot(&self) -> Vec<Span> {
        let mut spans: Vec<Span> = self.spans.read().values().cloned().collect();
        spans.sort_by_key(|s| s.id);
        spans
    }

    pub fn clear(&self) {
        self.spans.write().clear();
    }

    fn close(&self, span_id: SpanId) {
        if let Some(span) = self.spans.write().get_mut(&span_id) {
            span.end = Some(Instant::now());
        }
        let mut open = self.open.lock();
        if let Some(pos) = open.iter().rposition(|id| *id == span_id) {
            open.remove(pos);
        }
    }
}

impl Default for TracingSystem {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Closes its span when dropped.
#[derive(Debug)]
pub struct SpanGuard<'a> {
    span_id: Option<SpanId>,
    system: &'a TracingSystem,
}

impl SpanGuard<'_> {
    pub fn span_id(&self) -> Option<SpanId> {
        self.span_id
    }

    pub fn metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Some(span_id) = self.span_id {
            self.system.add_metadata(span_id, key.into(), value.into());
        }
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        if let Some(span_id) = self.span_id {
            self.system.close(span_id);
        }
    }
}
