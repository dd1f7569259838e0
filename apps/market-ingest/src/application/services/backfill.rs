//! Historical Backfill
//!
//! [`HistoricalIngestion`] over a [`HistoricalBarSource`] and the
//! [`BarStore`]. Fetched bars are annotated with indicators and upserted in
//! chunks, so repeating a backfill rewrites the same keys.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};
use tracing::{debug, info};

use crate::application::ports::{BarStore, HistoricalBarSource, HistoricalIngestion, IngestionError};
use crate::domain::indicators;
use crate::domain::market::{Resolution, Symbol};
use crate::domain::session::{SessionClock, effective_lookback_days};
use crate::infrastructure::metrics;

/// Fetch-annotate-upsert backfill.
pub struct BarBackfill {
    source: Arc<dyn HistoricalBarSource>,
    store: Arc<dyn BarStore>,
    clock: SessionClock,
    chunk_size: usize,
}

impl BarBackfill {
    /// Create a backfill service writing `chunk_size` bars per upsert.
    #[must_use]
    pub fn new(
        source: Arc<dyn HistoricalBarSource>,
        store: Arc<dyn BarStore>,
        clock: SessionClock,
        chunk_size: usize,
    ) -> Self {
        Self {
            source,
            store,
            clock,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Backfill the window ending at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`IngestionError`] if the fetch or any upsert fails. Chunks
    /// written before the failure stay written.
    pub async fn backfill_at(
        &self,
        symbol: &Symbol,
        lookback_days: u32,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<usize, IngestionError> {
        let days = effective_lookback_days(lookback_days, self.clock.local(now).weekday());
        let start = now - Duration::days(i64::from(days));

        let mut bars = self
            .source
            .fetch_bars(symbol, resolution, start, now)
            .await?;
        bars.retain(|bar| &bar.symbol == symbol && bar.resolution == resolution);
        bars.sort_by_key(|bar| bar.timestamp);
        bars.dedup_by_key(|bar| bar.timestamp);
        indicators::annotate(&mut bars);

        for chunk in bars.chunks(self.chunk_size) {
            self.store.upsert(chunk).await?;
            debug!(%symbol, rows = chunk.len(), "Backfill chunk written");
        }

        metrics::record_backfill(bars.len());
        info!(%symbol, days, bars = bars.len(), "Backfill complete");
        Ok(bars.len())
    }
}

#[async_trait]
impl HistoricalIngestion for BarBackfill {
    async fn backfill(
        &self,
        symbol: &Symbol,
        lookback_days: u32,
        resolution: Resolution,
    ) -> Result<usize, IngestionError> {
        self.backfill_at(symbol, lookback_days, resolution, Utc::now())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{
        MarketDataError, MockBarStore, MockHistoricalBarSource, StoreError,
    };
    use crate::domain::market::Bar;
    use crate::infrastructure::persistence::InMemoryBarStore;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn sym(s: &str) -> Symbol {
        Symbol::parse(s).unwrap()
    }

    fn series(symbol: &str, count: usize, end: DateTime<Utc>) -> Vec<Bar> {
        (0..count)
            .map(|i| {
                let close = Decimal::from(100 + i as i64);
                Bar {
                    symbol: sym(symbol),
                    resolution: Resolution::OneMinute,
                    timestamp: end - Duration::minutes((count - i) as i64),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1_000,
                    trade_count: Some(10),
                    vwap: None,
                    indicators: None,
                }
            })
            .collect()
    }

    // 2024-03-13 14:00 UTC is a Wednesday morning in New York.
    fn wednesday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 13, 14, 0, 0).unwrap()
    }

    // 2024-03-11 14:00 UTC is a Monday morning in New York.
    fn monday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 11, 14, 0, 0).unwrap()
    }

    fn service(
        source: MockHistoricalBarSource,
        store: Arc<dyn BarStore>,
        chunk_size: usize,
    ) -> BarBackfill {
        BarBackfill::new(
            Arc::new(source),
            store,
            SessionClock::default(),
            chunk_size,
        )
    }

    #[tokio::test]
    async fn writes_annotated_bars_and_is_idempotent() {
        let now = wednesday();
        let bars = series("AAPL", 30, now);
        let mut source = MockHistoricalBarSource::new();
        source
            .expect_fetch_bars()
            .times(2)
            .returning(move |_, _, _, _| Ok(bars.clone()));
        let store = Arc::new(InMemoryBarStore::new());
        let backfill = service(source, store.clone(), 7);

        let first = backfill
            .backfill_at(&sym("AAPL"), 1, Resolution::OneMinute, now)
            .await
            .unwrap();
        let second = backfill
            .backfill_at(&sym("AAPL"), 1, Resolution::OneMinute, now)
            .await
            .unwrap();

        assert_eq!((first, second), (30, 30));
        assert_eq!(store.len(), 30);
        let stored = store.bars_for(&sym("AAPL"));
        let last = stored.last().unwrap().indicators.clone().unwrap();
        assert!(last.sma_20.is_some());
        assert!(last.sma_50.is_none());
    }

    #[tokio::test]
    async fn monday_reaches_back_to_friday() {
        let now = monday();
        let mut source = MockHistoricalBarSource::new();
        source
            .expect_fetch_bars()
            .times(1)
            .returning(|_, _, start, end| {
                assert_eq!(end - start, Duration::days(3));
                Ok(Vec::new())
            });
        let backfill = service(source, Arc::new(InMemoryBarStore::new()), 10);

        let written = backfill
            .backfill_at(&sym("AAPL"), 1, Resolution::OneMinute, now)
            .await
            .unwrap();
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn drops_foreign_and_repeated_rows() {
        let now = wednesday();
        let mut rows = series("AAPL", 3, now);
        rows.push(rows[0].clone());
        rows.extend(series("MSFT", 2, now));
        let mut source = MockHistoricalBarSource::new();
        source
            .expect_fetch_bars()
            .returning(move |_, _, _, _| Ok(rows.clone()));
        let store = Arc::new(InMemoryBarStore::new());
        let backfill = service(source, store.clone(), 10);

        let written = backfill
            .backfill_at(&sym("AAPL"), 1, Resolution::OneMinute, now)
            .await
            .unwrap();

        assert_eq!(written, 3);
        assert!(store.bars_for(&sym("MSFT")).is_empty());
    }

    #[tokio::test]
    async fn source_error_is_reported() {
        let mut source = MockHistoricalBarSource::new();
        source.expect_fetch_bars().returning(|_, _, _, _| {
            Err(MarketDataError::Request {
                message: "503".into(),
            })
        });
        let backfill = service(source, Arc::new(InMemoryBarStore::new()), 10);

        let err = backfill
            .backfill_at(&sym("AAPL"), 1, Resolution::OneMinute, wednesday())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Source(_)));
    }

    #[tokio::test]
    async fn store_error_stops_remaining_chunks() {
        let now = wednesday();
        let bars = series("AAPL", 10, now);
        let mut source = MockHistoricalBarSource::new();
        source
            .expect_fetch_bars()
            .returning(move |_, _, _, _| Ok(bars.clone()));
        let mut store = MockBarStore::new();
        store.expect_upsert().times(1).returning(|_| {
            Err(StoreError::Query {
                message: "disk full".into(),
            })
        });
        let backfill = service(source, Arc::new(store), 4);

        let err = backfill
            .backfill_at(&sym("AAPL"), 1, Resolution::OneMinute, now)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Store(_)));
    }
}
