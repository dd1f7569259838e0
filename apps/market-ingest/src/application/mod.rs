//! Application Layer - Use cases and port definitions.
//!
//! Ports describe the external collaborators (market data, store, screener,
//! historical ingestion); services orchestrate the domain over them.

/// Port interfaces for external systems.
pub mod ports;

/// Supervisor, workers, sink, scheduler and backfill.
pub mod services;
