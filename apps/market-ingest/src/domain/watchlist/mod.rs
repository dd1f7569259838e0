//! Desired Watchlist
//!
//! The bounded set of symbols that should be streamed. Screening passes
//! replace it wholesale with the top-scoring results; operator commands add
//! or remove single symbols until the next pass.
//!
//! # Eviction
//!
//! Entries are ranked by score, highest first, with ties broken by symbol.
//! Operator entries carry no score and outrank every screened entry. When
//! the bound is exceeded the lowest-ranked entry is evicted.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::market::Symbol;

// =============================================================================
// Types
// =============================================================================

/// Where an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// Selected by a screening pass.
    Screener,
    /// Added by an operator command.
    Operator,
}

/// One watchlist member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistEntry {
    /// Instrument.
    pub symbol: Symbol,
    /// When the symbol first entered the watchlist.
    pub added_at: DateTime<Utc>,
    /// Screening score; `None` for operator entries.
    pub score: Option<f64>,
    /// Origin.
    pub source: EntrySource,
}

impl WatchlistEntry {
    fn rank_cmp(&self, other: &Self) -> Ordering {
        let key = |e: &Self| e.score.unwrap_or(f64::INFINITY);
        key(other)
            .total_cmp(&key(self))
            .then_with(|| self.symbol.cmp(&other.symbol))
    }
}

/// One row of screener output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenedSymbol {
    /// Instrument.
    pub symbol: Symbol,
    /// Ranking score, higher is better.
    pub score: f64,
}

impl ScreenedSymbol {
    /// Convenience constructor.
    #[must_use]
    pub const fn new(symbol: Symbol, score: f64) -> Self {
        Self { symbol, score }
    }
}

/// Symbols that entered or left the watchlist in one mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchlistChange {
    /// Newly present symbols.
    pub added: BTreeSet<Symbol>,
    /// Symbols no longer present.
    pub removed: BTreeSet<Symbol>,
}

impl WatchlistChange {
    /// True when membership did not change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

// =============================================================================
// Watchlist
// =============================================================================

/// Bounded, score-ranked symbol set.
#[derive(Debug, Clone)]
pub struct Watchlist {
    max_size: usize,
    entries: BTreeMap<Symbol, WatchlistEntry>,
}

impl Watchlist {
    /// Create an empty watchlist holding at most `max_size` symbols.
    #[must_use]
    pub const fn new(max_size: usize) -> Self {
        Self {
            max_size,
            entries: BTreeMap::new(),
        }
    }

    /// Replace the contents with the best `max_size` screening results.
    ///
    /// Non-finite scores are skipped and a symbol listed twice keeps its
    /// highest score. Symbols retained from the previous pass keep their
    /// `added_at`.
    pub fn apply_screening(
        &mut self,
        results: impl IntoIterator<Item = ScreenedSymbol>,
        now: DateTime<Utc>,
    ) -> WatchlistChange {
        let mut best: BTreeMap<Symbol, f64> = BTreeMap::new();
        for result in results.into_iter().filter(|r| r.score.is_finite()) {
            best.entry(result.symbol)
                .and_modify(|score| *score = score.max(result.score))
                .or_insert(result.score);
        }

        let mut ranked: Vec<WatchlistEntry> = best
            .into_iter()
            .map(|(symbol, score)| WatchlistEntry {
                added_at: self.entries.get(&symbol).map_or(now, |e| e.added_at),
                symbol,
                score: Some(score),
                source: EntrySource::Screener,
            })
            .collect();
        ranked.sort_by(WatchlistEntry::rank_cmp);
        ranked.truncate(self.max_size);

        let before = self.symbols();
        self.entries = ranked.into_iter().map(|e| (e.symbol.clone(), e)).collect();
        self.diff_from(&before)
    }

    /// Add an operator entry, evicting the lowest-ranked entry if full.
    ///
    /// Re-adding an existing symbol promotes it to an operator entry.
    pub fn add_manual(&mut self, symbol: Symbol, now: DateTime<Utc>) -> WatchlistChange {
        let before = self.symbols();
        let added_at = self.entries.get(&symbol).map_or(now, |e| e.added_at);
        self.entries.insert(
            symbol.clone(),
            WatchlistEntry {
                symbol,
                added_at,
                score: None,
                source: EntrySource::Operator,
            },
        );
        self.evict_overflow();
        self.diff_from(&before)
    }

    /// Remove a symbol. Returns `true` if it was present.
    pub fn remove(&mut self, symbol: &Symbol) -> bool {
        self.entries.remove(symbol).is_some()
    }

    /// Remove every entry, returning what was removed.
    pub fn clear(&mut self) -> BTreeSet<Symbol> {
        std::mem::take(&mut self.entries).into_keys().collect()
    }

    /// Snapshot of member symbols.
    #[must_use]
    pub fn symbols(&self) -> BTreeSet<Symbol> {
        self.entries.keys().cloned().collect()
    }

    /// Entries in rank order.
    #[must_use]
    pub fn entries(&self) -> Vec<WatchlistEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by(WatchlistEntry::rank_cmp);
        entries
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, symbol: &Symbol) -> bool {
        self.entries.contains_key(symbol)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured bound.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    fn evict_overflow(&mut self) {
        while self.entries.len() > self.max_size {
            let lowest = self
                .entries
                .values()
                .max_by(|a, b| a.rank_cmp(b))
                .map(|e| e.symbol.clone());
            match lowest {
                Some(symbol) => {
                    self.entries.remove(&symbol);
                }
                None => break,
            }
        }
    }

    fn diff_from(&self, before: &BTreeSet<Symbol>) -> WatchlistChange {
        let after = self.symbols();
        WatchlistChange {
            added: after.difference(before).cloned().collect(),
            removed: before.difference(&after).cloned().collect(),
        }
    }
}
