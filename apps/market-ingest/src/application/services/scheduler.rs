//! Screening Scheduler
//!
//! Owns the desired watchlist. On every tick it reads the session, runs the
//! matching screen, applies the watchlist bound, backfills symbols that just
//! entered and hands a snapshot to the supervisor. Operator commands mutate
//! the same watchlist through the same loop and reconcile immediately.
//!
//! A closed session skips the screen but still reconciles, so the
//! supervisor learns that streaming must stop.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::supervisor::{ReconcileSummary, SupervisorHandle, SupervisorUnavailable};
use crate::application::ports::{HistoricalIngestion, Screener, ScreenerError};
use crate::domain::market::{Resolution, Symbol};
use crate::domain::session::{SessionClock, SessionState};
use crate::domain::watchlist::{Watchlist, WatchlistChange, WatchlistEntry};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Scheduler tuning.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Screening period.
    pub interval: Duration,
    /// Watchlist bound.
    pub max_watchlist_size: usize,
    /// Backfill window in days.
    pub lookback_days: u32,
    /// Resolution for backfill and streaming.
    pub resolution: Resolution,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_watchlist_size: 50,
            lookback_days: 1,
            resolution: Resolution::OneMinute,
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Screening pass failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScreeningError {
    /// The screener failed; the previous watchlist was kept.
    #[error(transparent)]
    Screener(#[from] ScreenerError),

    /// The supervisor is gone.
    #[error(transparent)]
    Supervisor(#[from] SupervisorUnavailable),

    /// The scheduler is gone.
    #[error("screening scheduler is not running")]
    Unavailable,
}

/// Outcome of one tick or forced pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreeningReport {
    /// Session at the time of the pass.
    pub session: SessionState,
    /// Whether the screener was consulted.
    pub screened: bool,
    /// Symbols that entered the watchlist.
    pub added: Vec<Symbol>,
    /// Symbols that left the watchlist.
    pub removed: Vec<Symbol>,
    /// Bars written by backfill.
    pub backfilled_bars: usize,
    /// Symbols whose backfill failed.
    pub backfill_failures: Vec<Symbol>,
    /// What the supervisor did.
    pub reconcile: ReconcileSummary,
}

/// Answer to `watchlist`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchlistSnapshot {
    /// Periodic screening paused.
    pub paused: bool,
    /// Watchlist bound.
    pub max_size: usize,
    /// Entries, best ranked first.
    pub entries: Vec<WatchlistEntry>,
}

// =============================================================================
// Commands
// =============================================================================

/// Requests processed by the scheduler loop.
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Run a pass now.
    Screen(oneshot::Sender<Result<ScreeningReport, ScreeningError>>),
    /// Stop periodic screening.
    Pause(oneshot::Sender<()>),
    /// Restart periodic screening.
    Resume(oneshot::Sender<()>),
    /// Watchlist snapshot.
    Watchlist(oneshot::Sender<WatchlistSnapshot>),
    /// Operator add.
    Add(Symbol, oneshot::Sender<WatchlistChange>),
    /// Operator remove; answers whether the symbol was present.
    Remove(Symbol, oneshot::Sender<bool>),
    /// Operator clear; answers the removed symbols.
    Clear(oneshot::Sender<BTreeSet<Symbol>>),
}

/// Cloneable client of a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Wrap the command sender of a scheduler loop.
    #[must_use]
    pub const fn new(commands: mpsc::Sender<SchedulerCommand>) -> Self {
        Self { commands }
    }

    /// Force a screening pass and wait for its report.
    ///
    /// # Errors
    ///
    /// Returns the pass error, or [`ScreeningError::Unavailable`].
    pub async fn screen(&self) -> Result<ScreeningReport, ScreeningError> {
        self.request(SchedulerCommand::Screen).await?
    }

    /// Pause periodic screening.
    ///
    /// # Errors
    ///
    /// Returns [`ScreeningError::Unavailable`] if the loop has exited.
    pub async fn pause(&self) -> Result<(), ScreeningError> {
        self.request(SchedulerCommand::Pause).await
    }

    /// Resume periodic screening.
    ///
    /// # Errors
    ///
    /// Returns [`ScreeningError::Unavailable`] if the loop has exited.
    pub async fn resume(&self) -> Result<(), ScreeningError> {
        self.request(SchedulerCommand::Resume).await
    }

    /// Current watchlist.
    ///
    /// # Errors
    ///
    /// Returns [`ScreeningError::Unavailable`] if the loop has exited.
    pub async fn watchlist(&self) -> Result<WatchlistSnapshot, ScreeningError> {
        self.request(SchedulerCommand::Watchlist).await
    }

    /// Add a symbol until the next screening pass.
    ///
    /// # Errors
    ///
    /// Returns [`ScreeningError::Unavailable`] if the loop has exited.
    pub async fn add(&self, symbol: Symbol) -> Result<WatchlistChange, ScreeningError> {
        self.request(|tx| SchedulerCommand::Add(symbol, tx)).await
    }

    /// Remove a symbol.
    ///
    /// # Errors
    ///
    /// Returns [`ScreeningError::Unavailable`] if the loop has exited.
    pub async fn remove(&self, symbol: Symbol) -> Result<bool, ScreeningError> {
        self.request(|tx| SchedulerCommand::Remove(symbol, tx)).await
    }

    /// Empty the watchlist.
    ///
    /// # Errors
    ///
    /// Returns [`ScreeningError::Unavailable`] if the loop has exited.
    pub async fn clear(&self) -> Result<BTreeSet<Symbol>, ScreeningError> {
        self.request(SchedulerCommand::Clear).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
    ) -> Result<T, ScreeningError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| ScreeningError::Unavailable)?;
        rx.await.map_err(|_| ScreeningError::Unavailable)
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Watchlist owner and screening loop.
pub struct ScreeningScheduler {
    config: SchedulerConfig,
    clock: SessionClock,
    screener: Arc<dyn Screener>,
    ingestion: Arc<dyn HistoricalIngestion>,
    supervisor: SupervisorHandle,
    watchlist: Watchlist,
    paused: bool,
}

impl ScreeningScheduler {
    /// Create a scheduler with an empty watchlist.
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        clock: SessionClock,
        screener: Arc<dyn Screener>,
        ingestion: Arc<dyn HistoricalIngestion>,
        supervisor: SupervisorHandle,
    ) -> Self {
        Self {
            watchlist: Watchlist::new(config.max_watchlist_size),
            config,
            clock,
            screener,
            ingestion,
            supervisor,
            paused: false,
        }
    }

    /// Spawn the loop and return its handle.
    pub fn spawn(self, cancel: CancellationToken) -> (SchedulerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(self.run(rx, cancel).instrument(info_span!("screening_scheduler")));
        (SchedulerHandle::new(tx), task)
    }

    /// Scheduler loop. The first tick fires immediately.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SchedulerCommand>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_secs = self.config.interval.as_secs(),
            max_watchlist_size = self.config.max_watchlist_size,
            "Screening scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                Some(command) = commands.recv() => self.handle_command(command).await,

                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        warn!(error = %e, "Screening tick failed");
                    }
                }
            }
        }

        info!("Screening scheduler stopped");
    }

    async fn handle_command(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Screen(reply) => {
                let result = self.screen(Utc::now()).await;
                let _ = reply.send(result);
            }
            SchedulerCommand::Pause(reply) => {
                self.paused = true;
                info!("Periodic screening paused");
                let _ = reply.send(());
            }
            SchedulerCommand::Resume(reply) => {
                self.paused = false;
                info!("Periodic screening resumed");
                let _ = reply.send(());
            }
            SchedulerCommand::Watchlist(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SchedulerCommand::Add(symbol, reply) => {
                let change = self.add(symbol, Utc::now()).await;
                let _ = reply.send(change);
            }
            SchedulerCommand::Remove(symbol, reply) => {
                let removed = self.remove(&symbol, Utc::now()).await;
                let _ = reply.send(removed);
            }
            SchedulerCommand::Clear(reply) => {
                let removed = self.clear(Utc::now()).await;
                let _ = reply.send(removed);
            }
        }
    }

    /// Periodic tick. While paused only the session is forwarded.
    ///
    /// # Errors
    ///
    /// See [`ScreeningScheduler::screen`].
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<ScreeningReport, ScreeningError> {
        if self.paused {
            let session = self.clock.state_at(now);
            let reconcile = self.sync(session).await?;
            return Ok(ScreeningReport::unscreened(session, reconcile));
        }
        self.screen(now).await
    }

    /// One screening pass at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`ScreeningError::Screener`] after reconciling the unchanged
    /// watchlist, or [`ScreeningError::Supervisor`] if the supervisor is gone.
    pub async fn screen(&mut self, now: DateTime<Utc>) -> Result<ScreeningReport, ScreeningError> {
        let session = self.clock.state_at(now);
        let Some(kind) = session.screening_kind() else {
            debug!(%session, "Market closed, screening skipped");
            let reconcile = self.sync(session).await?;
            return Ok(ScreeningReport::unscreened(session, reconcile));
        };

        let results = match self.screener.screen(kind).await {
            Ok(results) => results,
            Err(e) => {
                error!(error = %e, screen = kind.as_str(), "Screening failed, keeping watchlist");
                self.sync(session).await?;
                return Err(e.into());
            }
        };
        metrics::record_screening_pass(session);

        let change = self.watchlist.apply_screening(results, now);
        metrics::set_watchlist_size(self.watchlist.len());
        if !change.is_empty() {
            info!(
                added = change.added.len(),
                removed = change.removed.len(),
                size = self.watchlist.len(),
                "Watchlist updated"
            );
        }

        let (backfilled_bars, backfill_failures) = self.backfill(&change.added).await;
        let reconcile = self.sync(session).await?;

        Ok(ScreeningReport {
            session,
            screened: true,
            added: change.added.into_iter().collect(),
            removed: change.removed.into_iter().collect(),
            backfilled_bars,
            backfill_failures,
            reconcile,
        })
    }

    /// Operator add: backfill if new, then reconcile.
    pub async fn add(&mut self, symbol: Symbol, now: DateTime<Utc>) -> WatchlistChange {
        let change = self.watchlist.add_manual(symbol, now);
        info!(added = ?change.added, evicted = ?change.removed, "Operator add");
        self.backfill(&change.added).await;
        self.sync_logged(now).await;
        change
    }

    /// Operator remove.
    pub async fn remove(&mut self, symbol: &Symbol, now: DateTime<Utc>) -> bool {
        let removed = self.watchlist.remove(symbol);
        if removed {
            info!(%symbol, "Operator remove");
            self.sync_logged(now).await;
        }
        removed
    }

    /// Operator clear.
    pub async fn clear(&mut self, now: DateTime<Utc>) -> BTreeSet<Symbol> {
        let removed = self.watchlist.clear();
        info!(count = removed.len(), "Watchlist cleared");
        self.sync_logged(now).await;
        removed
    }

    /// Watchlist snapshot.
    #[must_use]
    pub fn snapshot(&self) -> WatchlistSnapshot {
        WatchlistSnapshot {
            paused: self.paused,
            max_size: self.watchlist.max_size(),
            entries: self.watchlist.entries(),
        }
    }

    async fn backfill(&self, symbols: &BTreeSet<Symbol>) -> (usize, Vec<Symbol>) {
        let results = join_all(symbols.iter().map(|symbol| async move {
            let result = self
                .ingestion
                .backfill(symbol, self.config.lookback_days, self.config.resolution)
                .await;
            (symbol, result)
        }))
        .await;

        let mut written = 0;
        let mut failures = Vec::new();
        for (symbol, result) in results {
            match result {
                Ok(count) => written += count,
                Err(e) => {
                    warn!(%symbol, error = %e, "Backfill failed, streaming anyway");
                    failures.push(symbol.clone());
                }
            }
        }
        (written, failures)
    }

    async fn sync(&self, session: SessionState) -> Result<ReconcileSummary, SupervisorUnavailable> {
        metrics::set_watchlist_size(self.watchlist.len());
        self.supervisor
            .reconcile(self.watchlist.symbols(), session)
            .await
    }

    async fn sync_logged(&self, now: DateTime<Utc>) {
        if let Err(e) = self.sync(self.clock.state_at(now)).await {
            error!(error = %e, "Reconciliation after watchlist change failed");
        }
    }
}

impl ScreeningReport {
    fn unscreened(session: SessionState, reconcile: ReconcileSummary) -> Self {
        Self {
            session,
            screened: false,
            added: Vec::new(),
            removed: Vec::new(),
            backfilled_bars: 0,
            backfill_failures: Vec::new(),
            reconcile,
        }
    }
}
