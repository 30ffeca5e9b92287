//! In-process counters for remote reads, catalog loads and insert flushes.
//!
//! Counters are lock-free so scan and sink hot paths can update them without
//! contending with each other or with the catalog lock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated bridge counters shared through [`crate::BigQueryConnection`].
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    /// Number of read sessions created.
    read_sessions: AtomicU64,
    /// Number of non-empty batches pulled from read streams.
    stream_batches: AtomicU64,
    /// Number of rows handed to the query engine.
    rows_materialized: AtomicU64,
    /// Number of scans answered without touching the stream (limit zero).
    scans_short_circuited: AtomicU64,
    /// Number of bulk namespace loads (dataset or table listings).
    namespace_loads: AtomicU64,
    /// Number of insert statements sent.
    insert_flushes: AtomicU64,
    /// Number of rows accepted by insert sinks.
    rows_inserted: AtomicU64,
    /// Number of insert statements that failed remotely.
    insert_flush_failures: AtomicU64,
}

/// Immutable snapshot view of [`BridgeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeMetricsSnapshot {
    /// Number of read sessions created.
    pub read_sessions: u64,
    /// Number of non-empty batches pulled from read streams.
    pub stream_batches: u64,
    /// Number of rows handed to the query engine.
    pub rows_materialized: u64,
    /// Number of limit-zero scans.
    pub scans_short_circuited: u64,
    /// Number of bulk namespace loads.
    pub namespace_loads: u64,
    /// Number of insert statements sent.
    pub insert_flushes: u64,
    /// Number of rows accepted by insert sinks.
    pub rows_inserted: u64,
    /// Number of failed insert statements.
    pub insert_flush_failures: u64,
}

impl BridgeMetrics {
    /// Records one read session creation.
    pub fn record_read_session(&self) {
        self.read_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one materialization step that consumed a stream batch.
    pub fn record_stream_batch(&self) {
        self.stream_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Records rows emitted by one materialization step.
    pub fn record_rows_materialized(&self, rows: u64) {
        self.rows_materialized.fetch_add(rows, Ordering::Relaxed);
    }

    /// Records one scan skipped because its limit was zero.
    pub fn record_short_circuit(&self) {
        self.scans_short_circuited.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one bulk catalog load.
    pub fn record_namespace_load(&self) {
        self.namespace_loads.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one insert statement outcome.
    pub fn record_insert_flush(&self, ok: bool) {
        if ok {
            self.insert_flushes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.insert_flush_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records rows accepted by a sink call.
    pub fn record_rows_inserted(&self, rows: u64) {
        self.rows_inserted.fetch_add(rows, Ordering::Relaxed);
    }

    /// Returns a consistent-enough copy of every counter.
    pub fn snapshot(&self) -> BridgeMetricsSnapshot {
        BridgeMetricsSnapshot {
            read_sessions: self.read_sessions.load(Ordering::Relaxed),
            stream_batches: self.stream_batches.load(Ordering::Relaxed),
            rows_materialized: self.rows_materialized.load(Ordering::Relaxed),
            scans_short_circuited: self.scans_short_circuited.load(Ordering::Relaxed),
            namespace_loads: self.namespace_loads.load(Ordering::Relaxed),
            insert_flushes: self.insert_flushes.load(Ordering::Relaxed),
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            insert_flush_failures: self.insert_flush_failures.load(Ordering::Relaxed),
        }
    }
}
