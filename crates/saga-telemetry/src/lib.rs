// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Default histogram bucket upper bounds, in the unit of the observed value
/// (milliseconds for all current call sites).
pub const DEFAULT_BUCKETS: &[u64] = &[5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

// ---------------------------------------------------------------------------
// LogRecord
// ---------------------------------------------------------------------------

/// A single structured log event captured by the shim.
///
/// The canonical event name is `<stage>.<event>` (e.g.
/// `planner.request.completed`). Fields use stable names so downstream
/// dashboards can rely on them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    /// Pipeline stage that emitted the event (e.g. `planner`).
    pub stage: String,
    /// Event name within the stage (e.g. `request.completed`).
    pub event: String,
    /// Structured fields attached to the event.
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl LogRecord {
    /// The full `<stage>.<event>` name.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}.{}", self.stage, self.event)
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Inner {
    counters: BTreeMap<String, u64>,
    events: Vec<LogRecord>,
}

/// Thread-safe handle to the in-process metrics store.
///
/// Clones share the same underlying store; pass a clone to each component
/// at construction time rather than reaching for a global.
///
/// # Examples
///
/// ```
/// use saga_telemetry::Metrics;
///
/// let m = Metrics::new();
/// m.inc_counter("events.applied", 1);
/// assert_eq!(m.get_counter("events.applied"), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<Mutex<Inner>>,
}

impl Metrics {
    /// Create a new, empty metrics store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicked holder must not take observability down with it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Increment a named counter by `value`.
    pub fn inc_counter(&self, name: &str, value: u64) {
        let mut inner = self.lock();
        *inner.counters.entry(name.to_string()).or_insert(0) += value;
    }

    /// Current value of a counter, `0` if it was never incremented.
    #[must_use]
    pub fn get_counter(&self, name: &str) -> u64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Record a histogram observation against the default buckets.
    ///
    /// Histograms materialize as synthetic counters:
    /// `histo.<name>.count`, `histo.<name>.sum`, and one
    /// `histo.<name>.gt_<bucket>` per bucket the value exceeds.
    pub fn observe_histogram(&self, name: &str, value: u64) {
        self.observe_histogram_with(name, value, DEFAULT_BUCKETS);
    }

    /// Record a histogram observation against explicit bucket bounds.
    pub fn observe_histogram_with(&self, name: &str, value: u64, buckets: &[u64]) {
        let mut inner = self.lock();
        *inner
            .counters
            .entry(format!("histo.{name}.count"))
            .or_insert(0) += 1;
        *inner
            .counters
            .entry(format!("histo.{name}.sum"))
            .or_insert(0) += value;
        for b in buckets {
            if value > *b {
                *inner
                    .counters
                    .entry(format!("histo.{name}.gt_{b}"))
                    .or_insert(0) += 1;
            }
        }
    }

    /// Capture a structured `<stage>.<event>` log record and emit it via
    /// `tracing` at info level.
    pub fn log_event(
        &self,
        stage: &str,
        event: &str,
        fields: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) {
        let record = LogRecord {
            stage: stage.to_string(),
            event: event.to_string(),
            fields: fields.into_iter().collect(),
        };
        info!(
            target: "saga",
            stage = %record.stage,
            event = %record.event,
            fields = ?record.fields,
            "log_event"
        );
        self.lock().events.push(record);
    }

    /// All captured structured log records, in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<LogRecord> {
        self.lock().events.clone()
    }

    /// Captured records matching a full `<stage>.<event>` name.
    #[must_use]
    pub fn events_named(&self, name: &str) -> Vec<LogRecord> {
        self.lock()
            .events
            .iter()
            .filter(|r| r.name() == name)
            .cloned()
            .collect()
    }

    /// Snapshot of all counters (including histogram synthetics).
    #[must_use]
    pub fn counters(&self) -> BTreeMap<String, u64> {
        self.lock().counters.clone()
    }

    /// Clear all counters and captured events.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.counters.clear();
        inner.events.clear();
    }
}

/// Convenience constructor for `log_event` fields.
///
/// # Examples
///
/// ```
/// use saga_telemetry::{Metrics, field};
///
/// let m = Metrics::new();
/// m.log_event("planner", "request.initiated", [field("user_id", "u1")]);
/// assert_eq!(m.events_named("planner.request.initiated").len(), 1);
/// ```
pub fn field(key: &str, value: impl Into<serde_json::Value>) -> (String, serde_json::Value) {
    (key.to_string(), value.into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
