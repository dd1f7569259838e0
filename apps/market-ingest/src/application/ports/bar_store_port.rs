//! Bar Store Port (Driven Port)
//!
//! Time-series persistence with idempotent upserts keyed by
//! `(symbol, resolution, timestamp)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::market::{Bar, Resolution, Symbol};

/// Store failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Could not reach the store.
    #[error("store connection error: {message}")]
    Connection {
        /// Error details.
        message: String,
    },

    /// Statement failed.
    #[error("store query error: {message}")]
    Query {
        /// Error details.
        message: String,
    },
}

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Create a window.
    #[must_use]
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Whether `t` falls inside the window.
    #[must_use]
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

/// Port for the persistent bar store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BarStore: Send + Sync {
    /// Insert or overwrite every bar in `bars` by key.
    async fn upsert(&self, bars: &[Bar]) -> Result<(), StoreError>;

    /// Bars for one symbol and resolution inside `range`, oldest first.
    async fn query(
        &self,
        symbol: &Symbol,
        resolution: Resolution,
        range: TimeRange,
    ) -> Result<Vec<Bar>, StoreError>;

    /// Timestamp of the newest stored bar, if any.
    async fn latest_timestamp(
        &self,
        symbol: &Symbol,
        resolution: Resolution,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}
