#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Ingest - Watchlist-Driven Live Bar Ingestion
//!
//! Periodically screens for interesting symbols, backfills their recent
//! history, and keeps exactly one supervised live bar stream per desired
//! symbol, persisting every bar to a time-series store.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure ingestion logic and data types
//!   - `market`: Symbols, resolutions and bars
//!   - `session`: Session clock and screening strategy per session
//!   - `watchlist`: Bounded, score-ranked desired set
//!   - `reconcile`: Desired-vs-active set diffing
//!   - `dedup`: Per-symbol timestamp deduplication
//!   - `indicators`: Backfill annotations
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Market data, bar store, screener, historical ingestion
//!   - `services`: Supervisor, workers, sink, scheduler, backfill
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `alpaca`: Shared live bar stream and historical REST client
//!   - `persistence`: `PostgreSQL` and in-memory bar stores
//!   - `screener`: HTTP screening service
//!   - `control`: Probes, metrics and operator commands
//!   - `config`: Environment configuration
//!
//! # Data Flow
//!
//! ```text
//!                 ┌─────────────┐  desired set  ┌──────────────┐
//! Screener ──────►│  Scheduler  │──────────────►│  Supervisor  │
//!                 └──────┬──────┘               └──────┬───────┘
//!                        │ backfill                    │ one per symbol
//!                        ▼                             ▼
//! Historical REST ──► Backfill ──┐          ┌──── Stream Worker ◄── Alpaca WS
//!                                ▼          ▼        (dedup, sink)
//!                             ┌─────────────────┐
//!                             │    Bar Store    │
//!                             └─────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core ingestion types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{Bar, Resolution, Symbol, SymbolError};
pub use domain::session::{ScreeningKind, SessionClock, SessionState};
pub use domain::watchlist::{ScreenedSymbol, Watchlist, WatchlistChange};

// Ports
pub use application::ports::{
    BarStore, HistoricalBarSource, MarketDataError, MarketDataSource, Screener, StoreError,
};

// Services
pub use application::services::{
    BarBackfill, ReconcileSummary, SchedulerHandle, ScreeningScheduler, StreamStatus,
    StreamSupervisor, SupervisorHandle, WorkerDeps,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, Credentials, DataFeed, IngestConfig};

// Adapters
pub use infrastructure::alpaca::{AlpacaBarStream, AlpacaHistoricalClient, ConnectionState};
pub use infrastructure::persistence::{InMemoryBarStore, PostgresBarStore};
pub use infrastructure::screener::HttpScreener;

// Control server
pub use infrastructure::control::{ControlServer, ControlServerError, ControlState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
