//! Counters for the Kafka source.
//!
//! Process-wide, monotonically increasing, updated from the poll loop and
//! read by the metrics endpoint. Nothing here feeds back into the loop.

use crate::ErrorKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries in milliseconds for delivery duration.
const DELIVERY_DURATION_BUCKETS_MS: [u64; 7] = [10, 25, 50, 100, 250, 1000, 5000];

/// Source counters with a delivery duration histogram.
pub struct SourceCounter {
    name: String,

    // === COUNTERS ===
    /// Raw records fetched from Kafka
    records_polled: AtomicU64,
    /// Delivery records produced by the transformer
    events_received: AtomicU64,
    /// Delivery records accepted by the sink
    events_accepted: AtomicU64,
    /// Cycles that ended because no record was available
    empty_polls: AtomicU64,
    /// Poll cycles run
    cycles: AtomicU64,
    /// Offset commits issued
    commits: AtomicU64,

    /// Errors by kind
    errors_decode: AtomicU64,
    errors_delivery: AtomicU64,
    errors_fetch: AtomicU64,
    errors_commit: AtomicU64,
    errors_other: AtomicU64,

    // === TIMERS (cumulative milliseconds) ===
    event_get_time_ms: AtomicU64,
    commit_time_ms: AtomicU64,

    // === HISTOGRAM: delivery_duration_seconds ===
    delivery_duration_sum_ms: AtomicU64,
    delivery_duration_count: AtomicU64,
    /// Buckets: [10ms, 25ms, 50ms, 100ms, 250ms, 1s, 5s, +Inf]
    delivery_duration_buckets: [AtomicU64; 8],

    started_at: Mutex<Option<DateTime<Utc>>>,
    stopped_at: Mutex<Option<DateTime<Utc>>>,
}

impl SourceCounter {
    /// Create counters for the named source.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records_polled: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            events_accepted: AtomicU64::new(0),
            empty_polls: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            errors_decode: AtomicU64::new(0),
            errors_delivery: AtomicU64::new(0),
            errors_fetch: AtomicU64::new(0),
            errors_commit: AtomicU64::new(0),
            errors_other: AtomicU64::new(0),
            event_get_time_ms: AtomicU64::new(0),
            commit_time_ms: AtomicU64::new(0),
            delivery_duration_sum_ms: AtomicU64::new(0),
            delivery_duration_count: AtomicU64::new(0),
            delivery_duration_buckets: Default::default(),
            started_at: Mutex::new(None),
            stopped_at: Mutex::new(None),
        }
    }

    /// Source name.
    pub fn name(&self) -> &str {
        &self.name
    }

    // === LIFECYCLE ===

    /// Mark the start of the counted lifetime.
    pub fn start(&self) {
        *self.started_at.lock() = Some(Utc::now());
        *self.stopped_at.lock() = None;
    }

    /// Mark the end of the counted lifetime.
    pub fn stop(&self) {
        *self.stopped_at.lock() = Some(Utc::now());
    }

    // === RECORDING ===

    /// Record one raw record fetched.
    pub fn record_polled(&self) {
        self.records_polled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record delivery records produced in a cycle.
    pub fn add_events_received(&self, count: u64) {
        self.events_received.fetch_add(count, Ordering::Relaxed);
    }

    /// Record delivery records accepted by the sink.
    pub fn add_events_accepted(&self, count: u64) {
        self.events_accepted.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a cycle that found no data.
    pub fn increment_empty_polls(&self) {
        self.empty_polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a poll cycle.
    pub fn increment_cycles(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent fetching and transforming.
    pub fn add_event_get_time(&self, elapsed: Duration) {
        self.event_get_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record an offset commit and its duration.
    pub fn record_commit(&self, elapsed: Duration) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.commit_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a sink delivery duration.
    pub fn record_delivery(&self, elapsed: Duration) {
        let duration_ms = elapsed.as_millis() as u64;
        self.delivery_duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.delivery_duration_count.fetch_add(1, Ordering::Relaxed);

        // Cumulative buckets (le = less than or equal)
        for (i, &bucket_ms) in DELIVERY_DURATION_BUCKETS_MS.iter().enumerate() {
            if duration_ms <= bucket_ms {
                self.delivery_duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.delivery_duration_buckets[7].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cycle failure.
    pub fn record_error(&self, kind: ErrorKind) {
        self.error_counter(kind).fetch_add(1, Ordering::Relaxed);
    }

    fn error_counter(&self, kind: ErrorKind) -> &AtomicU64 {
        match kind {
            ErrorKind::Decode => &self.errors_decode,
            ErrorKind::Delivery => &self.errors_delivery,
            ErrorKind::Fetch => &self.errors_fetch,
            ErrorKind::Commit => &self.errors_commit,
            ErrorKind::Other => &self.errors_other,
        }
    }

    // === GETTERS ===

    /// Raw records fetched.
    pub fn records_polled(&self) -> u64 {
        self.records_polled.load(Ordering::Relaxed)
    }

    /// Delivery records produced.
    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    /// Delivery records accepted by the sink.
    pub fn events_accepted(&self) -> u64 {
        self.events_accepted.load(Ordering::Relaxed)
    }

    /// Cycles that found no data.
    pub fn empty_polls(&self) -> u64 {
        self.empty_polls.load(Ordering::Relaxed)
    }

    /// Cycles run.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Offset commits issued.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Errors of one kind.
    pub fn errors(&self, kind: ErrorKind) -> u64 {
        self.error_counter(kind).load(Ordering::Relaxed)
    }

    /// Errors of every kind.
    pub fn errors_total(&self) -> u64 {
        [
            ErrorKind::Decode,
            ErrorKind::Delivery,
            ErrorKind::Fetch,
            ErrorKind::Commit,
            ErrorKind::Other,
        ]
        .iter()
        .map(|kind| self.errors(*kind))
        .sum()
    }

    /// Read-only copy of the counters.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            name: self.name.clone(),
            records_polled: self.records_polled(),
            events_received: self.events_received(),
            events_accepted: self.events_accepted(),
            empty_polls: self.empty_polls(),
            cycles: self.cycles(),
            commits: self.commits(),
            errors_decode: self.errors(ErrorKind::Decode),
            errors_delivery: self.errors(ErrorKind::Delivery),
            errors_fetch: self.errors(ErrorKind::Fetch),
            errors_commit: self.errors(ErrorKind::Commit),
            errors_other: self.errors(ErrorKind::Other),
            event_get_time_ms: self.event_get_time_ms.load(Ordering::Relaxed),
            commit_time_ms: self.commit_time_ms.load(Ordering::Relaxed),
            delivery_time_ms: self.delivery_duration_sum_ms.load(Ordering::Relaxed),
            started_at: *self.started_at.lock(),
            stopped_at: *self.stopped_at.lock(),
        }
    }

    /// Export all counters in Prometheus text format under `prefix`.
    pub fn export_prometheus_text(&self, prefix: &str) -> String {
        let mut output = String::with_capacity(4096);
        let snapshot = self.snapshot();

        let counters: [(&str, &str, u64); 8] = [
            ("records_polled_total", "Raw records fetched from Kafka", snapshot.records_polled),
            ("events_received_total", "Delivery records produced", snapshot.events_received),
            ("events_accepted_total", "Delivery records accepted by the sink", snapshot.events_accepted),
            ("empty_polls_total", "Poll cycles that found no data", snapshot.empty_polls),
            ("cycles_total", "Poll cycles run", snapshot.cycles),
            ("commits_total", "Offset commits issued", snapshot.commits),
            ("event_get_time_ms_total", "Time spent fetching and transforming", snapshot.event_get_time_ms),
            ("commit_time_ms_total", "Time spent committing offsets", snapshot.commit_time_ms),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {}_{} {}\n", prefix, name, help));
            output.push_str(&format!("# TYPE {}_{} counter\n", prefix, name));
            output.push_str(&format!("{}_{} {}\n\n", prefix, name, value));
        }

        output.push_str(&format!("# HELP {}_errors Cycle errors by kind\n", prefix));
        output.push_str(&format!("# TYPE {}_errors counter\n", prefix));
        for kind in [
            ErrorKind::Decode,
            ErrorKind::Delivery,
            ErrorKind::Fetch,
            ErrorKind::Commit,
            ErrorKind::Other,
        ] {
            output.push_str(&format!(
                "{}_errors{{kind=\"{}\"}} {}\n",
                prefix,
                kind.as_label(),
                self.errors(kind)
            ));
        }
        output.push('\n');

        output.push_str(&format!(
            "# HELP {}_delivery_duration_seconds Duration of sink deliveries\n",
            prefix
        ));
        output.push_str(&format!(
            "# TYPE {}_delivery_duration_seconds histogram\n",
            prefix
        ));
        for (i, &bucket_ms) in DELIVERY_DURATION_BUCKETS_MS.iter().enumerate() {
            output.push_str(&format!(
                "{}_delivery_duration_seconds_bucket{{le=\"{}\"}} {}\n",
                prefix,
                bucket_ms as f64 / 1000.0,
                self.delivery_duration_buckets[i].load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "{}_delivery_duration_seconds_bucket{{le=\"+Inf\"}} {}\n",
            prefix,
            self.delivery_duration_buckets[7].load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "{}_delivery_duration_seconds_sum {}\n",
            prefix,
            snapshot.delivery_time_ms as f64 / 1000.0
        ));
        output.push_str(&format!(
            "{}_delivery_duration_seconds_count {}\n",
            prefix,
            self.delivery_duration_count.load(Ordering::Relaxed)
        ));

        output
    }
}

impl fmt::Display for SourceCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{{polled={}, received={}, accepted={}, empty={}, commits={}, errors={}}}",
            self.name,
            self.records_polled(),
            self.events_received(),
            self.events_accepted(),
            self.empty_polls(),
            self.commits(),
            self.errors_total()
        )
    }
}

/// Point-in-time copy of [`SourceCounter`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CounterSnapshot {
    pub name: String,
    pub records_polled: u64,
    pub events_received: u64,
    pub events_accepted: u64,
    pub empty_polls: u64,
    pub cycles: u64,
    pub commits: u64,
    pub errors_decode: u64,
    pub errors_delivery: u64,
    pub errors_fetch: u64,
    pub errors_commit: u64,
    pub errors_other: u64,
    pub event_get_time_ms: u64,
    pub commit_time_ms: u64,
    pub delivery_time_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}
