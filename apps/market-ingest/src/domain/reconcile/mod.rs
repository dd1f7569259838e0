//! Watchlist Reconciliation
//!
//! Pure set difference between the desired watchlist and the symbols that
//! currently have a worker. Symbols in both sets are left alone.

use std::collections::BTreeSet;

use crate::domain::market::Symbol;

/// Start/stop actions that move the active set to the desired set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileDelta {
    /// Desired but not active.
    pub to_start: BTreeSet<Symbol>,
    /// Active but no longer desired.
    pub to_stop: BTreeSet<Symbol>,
}

impl ReconcileDelta {
    /// True when nothing needs to change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_start.is_empty() && self.to_stop.is_empty()
    }
}

/// `to_start = desired - active`, `to_stop = active - desired`.
#[must_use]
pub fn reconcile(desired: &BTreeSet<Symbol>, active: &BTreeSet<Symbol>) -> ReconcileDelta {
    ReconcileDelta {
        to_start: desired.difference(active).cloned().collect(),
        to_stop: active.difference(desired).cloned().collect(),
    }
}
