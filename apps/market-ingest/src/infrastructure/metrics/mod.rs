//! Prometheus Metrics Module
//!
//! Exposes ingestion metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Bars**: received, duplicate and persisted counts
//! - **Workers**: active/queued gauges, failures, restarts, quarantines
//! - **Store**: write errors and flush latency
//! - **Screening**: passes, rejected symbols, watchlist size, backfill volume
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the control server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::market::Symbol;
use crate::domain::session::SessionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder once and return its handle.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Handle for rendering, if metrics were initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Bars
    describe_counter!(
        "market_ingest_bars_received_total",
        "Live bars received from the market data source"
    );
    describe_counter!(
        "market_ingest_bars_duplicate_total",
        "Live bars dropped by the deduplicator"
    );
    describe_counter!(
        "market_ingest_bars_persisted_total",
        "Bars written to the store"
    );

    // Workers
    describe_gauge!("market_ingest_active_workers", "Running stream workers");
    describe_gauge!(
        "market_ingest_queued_symbols",
        "Symbols waiting for a worker slot"
    );
    describe_counter!(
        "market_ingest_worker_failures_total",
        "Stream worker failures by reason"
    );
    describe_counter!(
        "market_ingest_worker_restarts_total",
        "Stream workers respawned after a failure"
    );
    describe_counter!(
        "market_ingest_quarantined_total",
        "Symbols quarantined after repeated failures"
    );
    describe_counter!(
        "market_ingest_workers_leaked_total",
        "Workers force-aborted after the stop timeout"
    );

    // Store
    describe_counter!(
        "market_ingest_store_errors_total",
        "Failed store write attempts"
    );
    describe_histogram!(
        "market_ingest_flush_duration_seconds",
        "Time to flush one sink batch"
    );

    // Screening
    describe_counter!(
        "market_ingest_screening_passes_total",
        "Completed screening passes by session"
    );
    describe_counter!(
        "market_ingest_symbols_rejected_total",
        "Screener or operator symbols rejected as invalid"
    );
    describe_gauge!("market_ingest_watchlist_size", "Desired watchlist size");
    describe_counter!(
        "market_ingest_backfill_bars_total",
        "Historical bars written by backfill"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why a worker failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Subscription error or drop.
    DataSource,
    /// Sink exhausted its retries.
    Store,
    /// No bars within the staleness threshold.
    Stale,
    /// The source can never serve the request.
    Unsupported,
}

impl FailureReason {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DataSource => "data_source",
            Self::Store => "store",
            Self::Stale => "stale",
            Self::Unsupported => "unsupported",
        }
    }

    /// Whether a fresh worker could succeed where this one failed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::Unsupported)
    }
}

/// Record a live bar received.
pub fn record_bar_received(symbol: &Symbol) {
    counter!("market_ingest_bars_received_total", "symbol" => symbol.to_string()).increment(1);
}

/// Record a live bar dropped as duplicate.
pub fn record_bar_duplicate(symbol: &Symbol) {
    counter!("market_ingest_bars_duplicate_total", "symbol" => symbol.to_string()).increment(1);
}

/// Record a flushed batch.
pub fn record_flush(count: usize, duration: Duration) {
    counter!("market_ingest_bars_persisted_total").increment(count as u64);
    histogram!("market_ingest_flush_duration_seconds").record(duration.as_secs_f64());
}

/// Record a failed store write attempt.
pub fn record_store_error() {
    counter!("market_ingest_store_errors_total").increment(1);
}

/// Update worker gauges.
#[allow(clippy::cast_precision_loss)]
pub fn set_worker_counts(active: usize, queued: usize) {
    gauge!("market_ingest_active_workers").set(active as f64);
    gauge!("market_ingest_queued_symbols").set(queued as f64);
}

/// Record a worker failure.
pub fn record_worker_failure(reason: FailureReason) {
    counter!("market_ingest_worker_failures_total", "reason" => reason.as_str()).increment(1);
}

/// Record a worker respawn.
pub fn record_worker_restart() {
    counter!("market_ingest_worker_restarts_total").increment(1);
}

/// Record a quarantine.
pub fn record_quarantine() {
    counter!("market_ingest_quarantined_total").increment(1);
}

/// Record a worker aborted after the stop timeout.
pub fn record_worker_leaked() {
    counter!("market_ingest_workers_leaked_total").increment(1);
}

/// Record a completed screening pass.
pub fn record_screening_pass(session: SessionState) {
    counter!("market_ingest_screening_passes_total", "session" => session.as_str()).increment(1);
}

/// Record an invalid symbol.
pub fn record_symbol_rejected() {
    counter!("market_ingest_symbols_rejected_total").increment(1);
}

/// Update the watchlist gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_watchlist_size(size: usize) {
    gauge!("market_ingest_watchlist_size").set(size as f64);
}

/// Record backfilled bars.
pub fn record_backfill(count: usize) {
    counter!("market_ingest_backfill_bars_total").increment(count as u64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reason_as_str() {
        assert_eq!(FailureReason::DataSource.as_str(), "data_source");
        assert_eq!(FailureReason::Store.as_str(), "store");
        assert_eq!(FailureReason::Stale.as_str(), "stale");
        assert_eq!(FailureReason::Unsupported.as_str(), "unsupported");
        assert!(FailureReason::Store.is_retryable());
        assert!(!FailureReason::Unsupported.is_retryable());
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_bar_received(&Symbol::parse("AAPL").unwrap());
        record_flush(3, Duration::from_millis(5));
        set_worker_counts(1, 0);
    }
}
