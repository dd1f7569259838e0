//! Persistence Sink
//!
//! Per-worker write buffer in front of the [`BarStore`]. Bars are keyed by
//! `(symbol, resolution, timestamp)`, so a re-delivered bar overwrites its
//! buffered copy and the store upsert overwrites the persisted one.
//!
//! A batch is flushed when it reaches `batch_size` or when its oldest bar
//! has waited `flush_interval`, whichever comes first. The owning worker
//! drives the interval through [`PersistenceSink::flush_deadline`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::backoff::{BackoffConfig, BackoffPolicy};
use crate::application::ports::{BarStore, StoreError};
use crate::domain::market::{Bar, BarKey};
use crate::infrastructure::metrics;

/// Sink tuning.
#[derive(Debug, Clone, Copy)]
pub struct SinkConfig {
    /// Flush once this many distinct bars are buffered.
    pub batch_size: usize,
    /// Flush once the oldest buffered bar is this old.
    pub flush_interval: Duration,
    /// Retries after the first failed upsert of a batch.
    pub max_retries: u32,
    /// Delay between retries.
    pub retry_backoff: BackoffConfig,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            max_retries: 3,
            retry_backoff: BackoffConfig {
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
                ..BackoffConfig::default()
            },
        }
    }
}

/// Sink failure surfaced to the worker.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Every attempt for a batch failed.
    #[error("store write failed after {attempts} attempts ({dropped} bars unpersisted): {source}")]
    PersistentFailure {
        /// Attempts made, including the first.
        attempts: u32,
        /// Bars in the abandoned batch.
        dropped: usize,
        /// Last store error.
        #[source]
        source: StoreError,
    },
}

/// Batching, retrying writer for one stream.
pub struct PersistenceSink {
    store: Arc<dyn BarStore>,
    config: SinkConfig,
    pending: BTreeMap<BarKey, Bar>,
    oldest: Option<Instant>,
}

impl PersistenceSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new(store: Arc<dyn BarStore>, config: SinkConfig) -> Self {
        Self {
            store,
            config,
            pending: BTreeMap::new(),
            oldest: None,
        }
    }

    /// Buffer a bar, flushing if the batch is full.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::PersistentFailure`] if a triggered flush
    /// exhausts its retries.
    pub async fn write(&mut self, bar: Bar) -> Result<(), SinkError> {
        if self.oldest.is_none() {
            self.oldest = Some(Instant::now());
        }
        self.pending.insert(bar.key(), bar);

        if self.pending.len() >= self.config.batch_size.max(1) {
            self.flush().await?;
        }
        Ok(())
    }

    /// When the current batch must be flushed, if anything is buffered.
    #[must_use]
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.oldest.map(|t| t + self.config.flush_interval)
    }

    /// Buffered bar count.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Upsert everything buffered, retrying with backoff.
    ///
    /// On exhaustion the batch is discarded and reported in the error.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::PersistentFailure`] after `max_retries` retries.
    pub async fn flush(&mut self) -> Result<usize, SinkError> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let batch: Vec<Bar> = self.pending.values().cloned().collect();
        let mut backoff =
            BackoffPolicy::new(self.config.retry_backoff.with_max_attempts(self.config.max_retries));
        let started = Instant::now();

        loop {
            match self.store.upsert(&batch).await {
                Ok(()) => {
                    self.pending.clear();
                    self.oldest = None;
                    metrics::record_flush(batch.len(), started.elapsed());
                    debug!(count = batch.len(), "Flushed bar batch");
                    return Ok(batch.len());
                }
                Err(e) => {
                    metrics::record_store_error();
                    let Some(delay) = backoff.next_delay() else {
                        let dropped = self.pending.len();
                        self.pending.clear();
                        self.oldest = None;
                        return Err(SinkError::PersistentFailure {
                            attempts: backoff.attempt_count() + 1,
                            dropped,
                            source: e,
                        });
                    };
                    warn!(
                        error = %e,
                        attempt = backoff.attempt_count(),
                        retry_in_ms = delay.as_millis(),
                        "Store write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{MockBarStore, TimeRange};
    use crate::domain::market::{Resolution, Symbol};
    use crate::infrastructure::persistence::InMemoryBarStore;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    fn bar(minute: i64, close: i64) -> Bar {
        Bar {
            symbol: Symbol::parse("AAPL").unwrap(),
            resolution: Resolution::OneMinute,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 13, 14, 0, 0).unwrap()
                + chrono::Duration::minutes(minute),
            open: Decimal::from(close),
            high: Decimal::from(close),
            low: Decimal::from(close),
            close: Decimal::from(close),
            volume: 1_000,
            trade_count: Some(10),
            vwap: None,
            indicators: None,
        }
    }

    fn config(batch_size: usize, max_retries: u32) -> SinkConfig {
        SinkConfig {
            batch_size,
            flush_interval: Duration::from_secs(1),
            max_retries,
            retry_backoff: BackoffConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                multiplier: 2.0,
                jitter_factor: 0.0,
                max_attempts: 0,
            },
        }
    }

    #[tokio::test]
    async fn identical_bar_twice_stores_one_record() {
        let store = Arc::new(InMemoryBarStore::new());
        let mut sink = PersistenceSink::new(store.clone(), config(10, 0));

        sink.write(bar(0, 10)).await.unwrap();
        sink.write(bar(0, 10)).await.unwrap();
        assert_eq!(sink.pending(), 1);
        sink.flush().await.unwrap();

        sink.write(bar(0, 10)).await.unwrap();
        sink.flush().await.unwrap();

        let all = store
            .query(
                &Symbol::parse("AAPL").unwrap(),
                Resolution::OneMinute,
                TimeRange::new(bar(0, 0).timestamp, bar(1, 0).timestamp),
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn full_batch_flushes_on_write() {
        let store = Arc::new(InMemoryBarStore::new());
        let mut sink = PersistenceSink::new(store.clone(), config(2, 0));

        sink.write(bar(0, 1)).await.unwrap();
        assert!(store.is_empty());
        assert!(sink.flush_deadline().is_some());

        sink.write(bar(1, 2)).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(sink.pending(), 0);
        assert!(sink.flush_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_tracks_oldest_bar() {
        let store = Arc::new(InMemoryBarStore::new());
        let mut sink = PersistenceSink::new(store, config(10, 0));

        let before = Instant::now();
        sink.write(bar(0, 1)).await.unwrap();
        tokio::time::advance(Duration::from_millis(300)).await;
        sink.write(bar(1, 1)).await.unwrap();

        assert_eq!(sink.flush_deadline(), Some(before + Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let mut store = MockBarStore::new();
        let mut calls = 0;
        store.expect_upsert().times(3).returning(move |_| {
            calls += 1;
            if calls < 3 {
                Err(StoreError::Connection {
                    message: "reset".into(),
                })
            } else {
                Ok(())
            }
        });

        let mut sink = PersistenceSink::new(Arc::new(store), config(10, 3));
        sink.write(bar(0, 1)).await.unwrap();
        assert_eq!(sink.flush().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_persistent_failure() {
        let mut store = MockBarStore::new();
        store.expect_upsert().times(3).returning(|_| {
            Err(StoreError::Query {
                message: "disk full".into(),
            })
        });

        let mut sink = PersistenceSink::new(Arc::new(store), config(10, 2));
        sink.write(bar(0, 1)).await.unwrap();
        sink.write(bar(1, 1)).await.unwrap();

        let err = sink.flush().await.unwrap_err();
        let SinkError::PersistentFailure {
            attempts, dropped, ..
        } = err;
        assert_eq!(attempts, 3);
        assert_eq!(dropped, 2);
        assert_eq!(sink.pending(), 0);
    }

    #[tokio::test]
    async fn empty_flush_is_noop() {
        let mut store = MockBarStore::new();
        store.expect_upsert().never();
        let mut sink = PersistenceSink::new(Arc::new(store), config(10, 0));
        assert_eq!(sink.flush().await.unwrap(), 0);
    }
}
