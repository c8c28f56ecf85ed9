//! Export pipeline metrics
//!
//! Uses the `metrics` crate facade for backend-agnostic instrumentation.
//! Recording is compiled out unless the `metrics` feature is enabled, so the
//! helpers can be called unconditionally from hot paths.
//!
//! # Metric Naming Convention
//!
//! All metrics follow the pattern: `spillway_{component}_{name}_{unit}`
//!
//! - `spillway_export_*` - Buffer and delivery metrics
//! - `spillway_coordinator_*` - Mastership metrics (from spillway-cluster)

use std::time::Instant;

/// Buffer and delivery metrics for export sources
pub struct ExportMetrics;

impl ExportMetrics {
    // ---- Counters ----

    /// Blocks accepted from the engine
    pub fn increment_blocks_pushed(rows: u64) {
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("spillway_export_blocks_pushed_total").increment(1);
            metrics::counter!("spillway_export_rows_pushed_total").increment(rows);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = rows;
    }

    /// Blocks handed to a sink
    pub fn increment_blocks_delivered() {
        #[cfg(feature = "metrics")]
        metrics::counter!("spillway_export_blocks_delivered_total").increment(1);
    }

    /// Rows released by acknowledgements
    pub fn increment_rows_released(rows: u64) {
        #[cfg(feature = "metrics")]
        metrics::counter!("spillway_export_rows_released_total").increment(rows);
        #[cfg(not(feature = "metrics"))]
        let _ = rows;
    }

    /// Times a source stalled on a gap it could not cover
    pub fn increment_blocked() {
        #[cfg(feature = "metrics")]
        metrics::counter!("spillway_export_blocked_total").increment(1);
    }

    /// Gaps skipped by an operator release or auto-release
    pub fn increment_gaps_skipped(rows: u64) {
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("spillway_export_gaps_skipped_total").increment(1);
            metrics::counter!("spillway_export_gap_rows_skipped_total").increment(rows);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = rows;
    }

    /// Release messages dropped because they named an older generation
    pub fn increment_stale_acks() {
        #[cfg(feature = "metrics")]
        metrics::counter!("spillway_export_stale_acks_total").increment(1);
    }

    // ---- Gauges ----

    /// Rows currently buffered across all sources
    pub fn add_pending_rows(delta: i64) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("spillway_export_pending_rows").increment(delta as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = delta;
    }

    /// Sources currently acting as export master
    pub fn set_master_sources(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("spillway_export_master_sources").set(count as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }

    // ---- Histograms ----

    /// Time from poll to acknowledgement, in microseconds
    pub fn record_delivery_latency_us(us: u64) {
        #[cfg(feature = "metrics")]
        metrics::histogram!("spillway_export_delivery_latency_seconds")
            .record(us as f64 / 1_000_000.0);
        #[cfg(not(feature = "metrics"))]
        let _ = us;
    }
}

/// Measures elapsed time until dropped or stopped
#[derive(Debug)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
