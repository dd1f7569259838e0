//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Alpaca live bar stream and historical REST adapters.
pub mod alpaca;

/// Configuration loaded from the environment.
pub mod config;

/// Control HTTP server (probes, metrics, operator commands).
pub mod control;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Bar store adapters (`PostgreSQL` and in-memory).
pub mod persistence;

/// HTTP screening service adapter.
pub mod screener;

/// OpenTelemetry tracing integration.
pub mod telemetry;
