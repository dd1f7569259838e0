//! Application Services
//!
//! - `StreamSupervisor`: owns the worker set and reconciles it
//! - `StreamWorker`: one symbol's subscription, dedup and persistence
//! - `PersistenceSink`: batched, retried store writes
//! - `ScreeningScheduler`: owns the watchlist and drives screening
//! - `BarBackfill`: historical ingestion over a bar source

pub mod backfill;
pub mod backoff;
pub mod scheduler;
pub mod sink;
pub mod supervisor;
pub mod worker;

pub use backfill::BarBackfill;
pub use backoff::{BackoffConfig, BackoffPolicy};
pub use scheduler::{
    SchedulerCommand, SchedulerConfig, SchedulerHandle, ScreeningError, ScreeningReport,
    ScreeningScheduler, WatchlistSnapshot,
};
pub use sink::{PersistenceSink, SinkConfig, SinkError};
pub use supervisor::{
    FailingSymbol, ReconcileSummary, StreamHandle, StreamStatus, StreamSupervisor,
    SupervisorCommand, SupervisorConfig, SupervisorHandle, SupervisorUnavailable,
};
pub use worker::{StreamWorker, WorkerDeps, WorkerState};
