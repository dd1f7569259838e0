//! Domain Layer - Core ingestion types and pure logic.
//!
//! Nothing in this layer performs I/O. Session classification, watchlist
//! ranking, reconciliation and deduplication are plain functions over owned
//! state so they can be tested without a runtime.

/// Symbols, resolutions and bars.
pub mod market;

/// Market session classification.
pub mod session;

/// Bounded, score-ranked desired watchlist.
pub mod watchlist;

/// Desired-vs-active set reconciliation.
pub mod reconcile;

/// Per-symbol timestamp deduplication.
pub mod dedup;

/// Technical indicators for backfilled bars.
pub mod indicators;
