//! Coordination metrics
//!
//! Lightweight metrics using the `metrics` crate facade. Recording compiles
//! to nothing unless the `metrics-prometheus` feature is enabled.
//!
//! ```rust,ignore
//! use spillway_cluster::observability::CoordinatorMetrics;
//!
//! CoordinatorMetrics::increment_leader_changes();
//! CoordinatorMetrics::record_tracker_round(Duration::from_millis(3));
//! ```

use std::time::Duration;

// ============================================================================
// Coordinator Metrics
// ============================================================================

/// Export mastership coordination metrics
pub struct CoordinatorMetrics;

#[cfg_attr(not(feature = "metrics-prometheus"), allow(unused_variables))]
impl CoordinatorMetrics {
    // ---- Counters ----

    /// Leader proposals resolved
    pub fn increment_leader_changes() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("spillway_coordinator_leader_changes_total").increment(1);
    }

    /// Tracker collection rounds completed with every reply present
    pub fn increment_tracker_rounds() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("spillway_coordinator_tracker_rounds_total").increment(1);
    }

    /// Tracker collection rounds discarded for a missing or garbled reply
    pub fn increment_failed_tracker_rounds() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("spillway_coordinator_failed_tracker_rounds_total").increment(1);
    }

    /// Mastership decisions recomputed from peer trackers
    pub fn increment_recomputations() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("spillway_coordinator_recomputations_total").increment(1);
    }

    /// Membership notifications received
    pub fn increment_membership_changes(added: usize, removed: usize) {
        #[cfg(feature = "metrics-prometheus")]
        {
            metrics::counter!("spillway_coordinator_hosts_added_total").increment(added as u64);
            metrics::counter!("spillway_coordinator_hosts_removed_total")
                .increment(removed as u64);
        }
    }

    // ---- Histograms ----

    /// Time from lock request to a completed tracker round
    pub fn record_tracker_round(duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("spillway_coordinator_tracker_round_seconds")
            .record(duration.as_secs_f64());
    }
}
