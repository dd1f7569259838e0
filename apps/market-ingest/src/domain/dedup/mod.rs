//! Per-symbol monotonic timestamp filter.
//!
//! Each symbol is fed by exactly one stream worker, so the filter is plain
//! owned state with no locking.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::domain::market::Symbol;

/// Drops bars whose timestamp is not strictly newer than the last accepted one.
#[derive(Debug, Default)]
pub struct Deduplicator {
    last_accepted: HashMap<Symbol, DateTime<Utc>>,
}

impl Deduplicator {
    /// Create an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `timestamp` if strictly greater than the last accepted one.
    ///
    /// Equal timestamps are duplicates.
    pub fn accept(&mut self, symbol: &Symbol, timestamp: DateTime<Utc>) -> bool {
        match self.last_accepted.get_mut(symbol) {
            Some(last) if timestamp <= *last => false,
            Some(last) => {
                *last = timestamp;
                true
            }
            None => {
                self.last_accepted.insert(symbol.clone(), timestamp);
                true
            }
        }
    }

    /// Raise the watermark to `timestamp` (e.g. the latest persisted bar).
    /// Never lowers it.
    pub fn seed(&mut self, symbol: &Symbol, timestamp: DateTime<Utc>) {
        self.last_accepted
            .entry(symbol.clone())
            .and_modify(|last| *last = (*last).max(timestamp))
            .or_insert(timestamp);
    }

    /// Last accepted timestamp.
    #[must_use]
    pub fn last_accepted(&self, symbol: &Symbol) -> Option<DateTime<Utc>> {
        self.last_accepted.get(symbol).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn aapl() -> Symbol {
        Symbol::parse("AAPL").unwrap()
    }

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 13, 14, 0, 0).unwrap() + Duration::minutes(minute)
    }

    #[test]
    fn first_bar_is_accepted() {
        let mut dedup = Deduplicator::new();
        assert!(dedup.accept(&aapl(), t(0)));
        assert_eq!(dedup.last_accepted(&aapl()), Some(t(0)));
    }

    #[test]
    fn equal_timestamp_is_duplicate() {
        let mut dedup = Deduplicator::new();
        assert!(dedup.accept(&aapl(), t(1)));
        assert!(!dedup.accept(&aapl(), t(1)));
    }

    #[test]
    fn older_timestamp_is_rejected_and_watermark_kept() {
        let mut dedup = Deduplicator::new();
        assert!(dedup.accept(&aapl(), t(5)));
        assert!(!dedup.accept(&aapl(), t(3)));
        assert_eq!(dedup.last_accepted(&aapl()), Some(t(5)));
    }

    #[test]
    fn symbols_are_independent() {
        let mut dedup = Deduplicator::new();
        let msft = Symbol::parse("MSFT").unwrap();
        assert!(dedup.accept(&aapl(), t(5)));
        assert!(dedup.accept(&msft, t(1)));
    }

    #[test]
    fn seed_never_lowers_watermark() {
        let mut dedup = Deduplicator::new();
        dedup.seed(&aapl(), t(10));
        dedup.seed(&aapl(), t(2));
        assert!(!dedup.accept(&aapl(), t(10)));
        assert!(dedup.accept(&aapl(), t(11)));
    }

    proptest! {
        #[test]
        fn increasing_sequence_is_fully_accepted(steps in proptest::collection::vec(1i64..120, 1..50)) {
            let mut dedup = Deduplicator::new();
            let mut minute = 0;
            for step in steps {
                minute += step;
                prop_assert!(dedup.accept(&aapl(), t(minute)));
            }
        }

        #[test]
        fn non_increasing_after_accept_is_rejected(start in 0i64..1000, back in 0i64..1000) {
            let mut dedup = Deduplicator::new();
            prop_assert!(dedup.accept(&aapl(), t(start)));
            prop_assert!(!dedup.accept(&aapl(), t(start - back)));
        }
    }
}
