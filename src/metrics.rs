//! Prometheus metrics for the bridge relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

lazy_static! {
    // Source chain metrics
    pub static ref EVENTS_DETECTED: CounterVec = register_counter_vec!(
        "relayer_events_detected_total",
        "Total number of lock/burn events detected",
        &["chain"]
    ).unwrap();

    pub static ref CHECKPOINT_BLOCK: GaugeVec = register_gauge_vec!(
        "relayer_checkpoint_block",
        "Last durably checkpointed block",
        &["chain"]
    ).unwrap();

    pub static ref WATCHER_FAILURES: GaugeVec = register_gauge_vec!(
        "relayer_watcher_consecutive_failures",
        "Consecutive failed polls of the source chain",
        &["chain"]
    ).unwrap();

    pub static ref REORGS: CounterVec = register_counter_vec!(
        "relayer_reorgs_detected_total",
        "Reorgs detected below the confirmation depth",
        &["chain"]
    ).unwrap();

    // Destination metrics
    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "relayer_submissions_total",
        "Release submissions by result",
        &["chain", "status"]
    ).unwrap();

    pub static ref TRANSFERS: CounterVec = register_counter_vec!(
        "relayer_transfers_total",
        "Transfers reaching a terminal state",
        &["route", "outcome"]
    ).unwrap();

    pub static ref TRANSFER_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_transfer_latency_seconds",
        "Time from event detection to destination confirmation",
        &["route"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]
    ).unwrap();

    // Pipeline metrics
    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "relayer_queue_depth",
        "Transfers waiting in the work queue",
        &["route"]
    ).unwrap();

    pub static ref IN_FLIGHT: GaugeVec = register_gauge_vec!(
        "relayer_in_flight_confirmations",
        "Submitted transactions awaiting confirmation",
        &["route"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "relayer_errors_total",
        "Total number of errors",
        &["chain", "type"]
    ).unwrap();

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();

    pub static ref STORE_AVAILABLE: Gauge = register_gauge!(
        "relayer_store_available",
        "Whether the checkpoint store is reachable"
    ).unwrap();
}

/// Record events found in one scanned range
pub fn record_events_detected(chain: &str, count: u64) {
    EVENTS_DETECTED
        .with_label_values(&[chain])
        .inc_by(count as f64);
}

pub fn set_checkpoint(chain: &str, block: u64) {
    CHECKPOINT_BLOCK
        .with_label_values(&[chain])
        .set(block as f64);
}

pub fn set_watcher_failures(chain: &str, count: u32) {
    WATCHER_FAILURES
        .with_label_values(&[chain])
        .set(count as f64);
}

pub fn record_reorg(chain: &str) {
    REORGS.with_label_values(&[chain]).inc();
}

/// Record a submission attempt result (`broadcast`, `already_processed`, ...)
pub fn record_submission(chain: &str, status: &str) {
    SUBMISSIONS.with_label_values(&[chain, status]).inc();
}

/// Record a transfer reaching `confirmed` or `failed`
pub fn record_transfer(route: &str, outcome: &str) {
    TRANSFERS.with_label_values(&[route, outcome]).inc();
}

pub fn record_latency(route: &str, seconds: f64) {
    TRANSFER_LATENCY
        .with_label_values(&[route])
        .observe(seconds);
}

pub fn inc_queue_depth(route: &str) {
    QUEUE_DEPTH.with_label_values(&[route]).inc();
}

pub fn dec_queue_depth(route: &str) {
    QUEUE_DEPTH.with_label_values(&[route]).dec();
}

pub fn set_in_flight(route: &str, count: usize) {
    IN_FLIGHT.with_label_values(&[route]).set(count as f64);
}

/// Record an error
pub fn record_error(chain: &str, error_type: &str) {
    ERRORS.with_label_values(&[chain, error_type]).inc();
}

pub fn set_up(up: bool) {
    UP.set(if up { 1.0 } else { 0.0 });
}

pub fn set_store_available(available: bool) {
    STORE_AVAILABLE.set(if available { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_update() {
        record_events_detected("metrics-test", 3);
        assert_eq!(
            EVENTS_DETECTED.with_label_values(&["metrics-test"]).get(),
            3.0
        );

        set_checkpoint("metrics-test", 120);
        assert_eq!(
            CHECKPOINT_BLOCK.with_label_values(&["metrics-test"]).get(),
            120.0
        );

        inc_queue_depth("metrics-test->x");
        inc_queue_depth("metrics-test->x");
        dec_queue_depth("metrics-test->x");
        assert_eq!(QUEUE_DEPTH.with_label_values(&["metrics-test->x"]).get(), 1.0);
    }
}
