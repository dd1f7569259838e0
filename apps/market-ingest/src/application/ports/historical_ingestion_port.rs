//! Historical Ingestion Port (Driven Port)
//!
//! Backfills recent history for a symbol into the store.

use async_trait::async_trait;

use super::{MarketDataError, StoreError};
use crate::domain::market::{Resolution, Symbol};

/// Backfill failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IngestionError {
    /// Fetching history failed.
    #[error("historical fetch failed: {0}")]
    Source(#[from] MarketDataError),

    /// Writing history failed.
    #[error("historical write failed: {0}")]
    Store(#[from] StoreError),
}

/// Port for historical backfill.
///
/// Implementations must be idempotent: repeating a call for the same
/// symbol and window rewrites the same keys.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoricalIngestion: Send + Sync {
    /// Backfill `lookback_days` of bars and return how many were written.
    async fn backfill(
        &self,
        symbol: &Symbol,
        lookback_days: u32,
        resolution: Resolution,
    ) -> Result<usize, IngestionError>;
}
