//! In-memory bar store.
//!
//! Used when no database is configured and by tests. Data lives for the
//! process lifetime only.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::application::ports::{BarStore, StoreError, TimeRange};
use crate::domain::market::{Bar, BarKey, Resolution, Symbol};

/// Ordered in-memory implementation of [`BarStore`].
#[derive(Debug, Default)]
pub struct InMemoryBarStore {
    bars: RwLock<BTreeMap<BarKey, Bar>>,
}

impl InMemoryBarStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored bars.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.read().len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.read().is_empty()
    }

    /// Every stored bar for `symbol`, oldest first.
    #[must_use]
    pub fn bars_for(&self, symbol: &Symbol) -> Vec<Bar> {
        self.bars
            .read()
            .values()
            .filter(|b| &b.symbol == symbol)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BarStore for InMemoryBarStore {
    async fn upsert(&self, bars: &[Bar]) -> Result<(), StoreError> {
        let mut stored = self.bars.write();
        for bar in bars {
            stored.insert(bar.key(), bar.clone());
        }
        Ok(())
    }

    async fn query(
        &self,
        symbol: &Symbol,
        resolution: Resolution,
        range: TimeRange,
    ) -> Result<Vec<Bar>, StoreError> {
        let start = (symbol.clone(), resolution, range.start);
        let end = (symbol.clone(), resolution, range.end);
        Ok(self
            .bars
            .read()
            .range(start..end)
            .map(|(_, bar)| bar.clone())
            .collect())
    }

    async fn latest_timestamp(
        &self,
        symbol: &Symbol,
        resolution: Resolution,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .bars
            .read()
            .keys()
            .filter(|(s, r, _)| s == symbol && *r == resolution)
            .map(|(_, _, ts)| *ts)
            .next_back())
    }
}
