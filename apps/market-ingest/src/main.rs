//! Market Ingest Binary
//!
//! Starts the screening scheduler, the stream supervisor and the control
//! server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-ingest
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `ALPACA_KEY`: Alpaca API key
//! - `ALPACA_SECRET`: Alpaca API secret
//! - `SCREENER_URL`: Screening service base URL
//!
//! ## Optional
//! - `DATABASE_URL`: `PostgreSQL` URL (default: in-memory store)
//! - `ALPACA_FEED`: Market data feed - "sip" | "iex" (default: sip)
//! - `INGEST_HTTP_PORT`: Control server port (default: 8090)
//! - `INGEST_LIVE_DATA_ENABLED`: Stream at startup (default: true)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log filter (default: info,market_ingest=debug)
//!
//! Every other tunable is listed in the configuration module.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use market_ingest::application::ports::{BarStore, HistoricalBarSource, MarketDataSource};
use market_ingest::application::services::{
    BarBackfill, ScreeningScheduler, StreamSupervisor, WorkerDeps,
};
use market_ingest::infrastructure::alpaca::{
    AlpacaBarStream, AlpacaHistoricalClient, BarStreamConfig,
};
use market_ingest::infrastructure::control::{ControlServer, ControlState};
use market_ingest::infrastructure::persistence::{InMemoryBarStore, PostgresBarStore};
use market_ingest::infrastructure::screener::HttpScreener;
use market_ingest::infrastructure::telemetry;
use market_ingest::{IngestConfig, init_metrics};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting market ingest");

    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let config = IngestConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let store = connect_store(&config).await?;
    let clock = config.session_clock();

    // Shared live connection, opened lazily on the first subscription
    let (feed, feed_task) = AlpacaBarStream::spawn(
        BarStreamConfig::from_settings(&config.alpaca),
        shutdown_token.clone(),
    );

    let historical: Arc<dyn HistoricalBarSource> =
        Arc::new(AlpacaHistoricalClient::from_settings(&config.alpaca)?);
    let backfill = Arc::new(BarBackfill::new(
        historical,
        Arc::clone(&store),
        clock,
        config.store.batch_size,
    ));
    let screener = Arc::new(HttpScreener::from_settings(&config.screening)?);

    let source: Arc<dyn MarketDataSource> = Arc::new(feed.clone());
    let deps = WorkerDeps {
        source,
        store,
        sink: config.sink_config(),
        resolution: config.resolution,
    };
    let (supervisor, inbox) = StreamSupervisor::new(config.supervisor_config(), deps);
    let (supervisor_handle, supervisor_task) = supervisor.spawn(inbox, shutdown_token.clone());

    let scheduler = ScreeningScheduler::new(
        config.scheduler_config(),
        clock,
        screener,
        backfill,
        supervisor_handle.clone(),
    );
    let (scheduler_handle, scheduler_task) = scheduler.spawn(shutdown_token.clone());

    let control_state = Arc::new(
        ControlState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            supervisor_handle,
            scheduler_handle,
        )
        .with_feed(feed),
    );
    let control_server = ControlServer::new(config.http_port, control_state, shutdown_token.clone());
    let control_task = tokio::spawn(async move {
        if let Err(e) = control_server.run().await {
            tracing::error!(error = %e, "Control server error");
        }
    });

    tracing::info!("Market ingest ready");

    await_shutdown(shutdown_token).await;

    let tasks = [
        ("scheduler", scheduler_task),
        ("supervisor", supervisor_task),
        ("alpaca feed", feed_task),
        ("control server", control_task),
    ];
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, join_all(tasks))
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out, exiting with tasks still running"
        );
    }

    tracing::info!("Market ingest stopped");
    Ok(())
}

/// Open the configured store, falling back to memory without `DATABASE_URL`.
async fn connect_store(config: &IngestConfig) -> anyhow::Result<Arc<dyn BarStore>> {
    let Some(url) = config.store.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, bars are kept in memory only");
        return Ok(Arc::new(InMemoryBarStore::new()));
    };

    let store = PostgresBarStore::connect(url, config.store.max_connections)
        .await
        .context("failed to connect to bar store")?;
    store
        .ensure_schema()
        .await
        .context("failed to prepare bar store schema")?;
    tracing::info!(
        max_connections = config.store.max_connections,
        "Connected to PostgreSQL bar store"
    );
    Ok(Arc::new(store))
}

async fn join_all<const N: usize>(tasks: [(&'static str, JoinHandle<()>); N]) {
    for (name, task) in tasks {
        if let Err(e) = task.await {
            tracing::error!(task = name, error = %e, "Task ended abnormally");
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &IngestConfig) {
    tracing::info!(
        feed = config.alpaca.feed.as_str(),
        resolution = config.resolution.as_str(),
        http_port = config.http_port,
        live_enabled = config.live.enabled,
        max_concurrent = config.live.max_concurrent,
        max_watchlist_size = config.screening.max_watchlist_size,
        screening_interval_secs = config.screening.interval.as_secs(),
        "Configuration loaded"
    );
    tracing::debug!(
        stream_url = %config.alpaca.stream_url,
        data_url = %config.alpaca.data_url,
        screener_url = %config.screening.screener_url,
        timezone = %config.session.timezone,
        "Endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT), then cancel `shutdown_token`.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
