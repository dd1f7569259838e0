//! Stream Supervisor
//!
//! Sole owner of the active worker set. Every mutation happens inside one
//! control loop: operator/scheduler commands, worker reports, restart timers
//! and health ticks are processed strictly one at a time, so a start and a
//! stop for the same symbol can never race.
//!
//! # Capacity
//!
//! Running workers plus workers waiting out a restart backoff never exceed
//! `max_workers`. Symbols beyond the bound wait in a FIFO queue and are
//! promoted as slots free up.
//!
//! # Failure handling
//!
//! A failed or stale worker is stopped and respawned after an exponential
//! backoff. After `quarantine_threshold` consecutive failures the symbol is
//! quarantined: it stays on the watchlist but is not streamed until the next
//! reconciliation from the scheduler re-admits it.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::backoff::{BackoffConfig, BackoffPolicy};
use super::worker::{StreamWorker, WorkerDeps, WorkerEvent, WorkerId, WorkerReport, WorkerState};
use crate::domain::market::Symbol;
use crate::domain::reconcile::{ReconcileDelta, reconcile};
use crate::domain::session::SessionState;
use crate::infrastructure::metrics::{self, FailureReason};

// =============================================================================
// Configuration
// =============================================================================

/// Supervisor tuning.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Maximum running plus restart-pending workers.
    pub max_workers: usize,
    /// A worker silent for longer than this is failed.
    pub staleness_threshold: Duration,
    /// Consecutive failures that quarantine a symbol.
    pub quarantine_threshold: u32,
    /// Bounded wait for a stopped worker to terminate.
    pub stop_timeout: Duration,
    /// Health check period.
    pub health_check_interval: Duration,
    /// Restart delay policy.
    pub restart_backoff: BackoffConfig,
    /// Stream during pre-market and after-hours.
    pub include_extended_hours: bool,
    /// Streaming switch at startup.
    pub enabled: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_workers: 25,
            staleness_threshold: Duration::from_secs(180),
            quarantine_threshold: 5,
            stop_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(5),
            restart_backoff: BackoffConfig::default(),
            include_extended_hours: true,
            enabled: true,
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Supervisor-owned view of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamHandle {
    /// Streamed symbol.
    pub symbol: Symbol,
    /// Current instance.
    pub worker_id: WorkerId,
    /// Last reported lifecycle state.
    pub state: WorkerState,
    /// Open time of the last accepted bar.
    pub last_received: Option<DateTime<Utc>>,
    /// Failures since the last accepted bar.
    pub consecutive_failures: u32,
    /// When this instance was spawned.
    pub started_at: DateTime<Utc>,
}

/// A symbol waiting out its restart backoff or sitting in quarantine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailingSymbol {
    /// Symbol.
    pub symbol: Symbol,
    /// Consecutive failures so far.
    pub consecutive_failures: u32,
}

/// Answer to `stream-status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStatus {
    /// Streaming switch.
    pub enabled: bool,
    /// Session of the last reconciliation.
    pub session: SessionState,
    /// Number of running workers.
    pub active_count: usize,
    /// Running workers, by symbol.
    pub active: Vec<StreamHandle>,
    /// Symbols waiting for a slot.
    pub queued: Vec<Symbol>,
    /// Symbols waiting to be respawned.
    pub restarting: Vec<FailingSymbol>,
    /// Symbols held back until the next reconciliation.
    pub quarantined: Vec<FailingSymbol>,
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// Workers spawned.
    pub started: Vec<Symbol>,
    /// Workers stopped.
    pub stopped: Vec<Symbol>,
    /// Symbols left waiting for capacity.
    pub queued: Vec<Symbol>,
}

// =============================================================================
// Commands
// =============================================================================

/// Requests processed by the control loop.
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Converge on a desired watchlist snapshot.
    Reconcile {
        /// Desired symbols.
        desired: BTreeSet<Symbol>,
        /// Current session.
        session: SessionState,
        /// Completion signal.
        done: oneshot::Sender<ReconcileSummary>,
    },
    /// `stream-start` / `stream-stop`.
    SetEnabled {
        /// New switch value.
        enabled: bool,
        /// Completion signal.
        done: oneshot::Sender<ReconcileSummary>,
    },
    /// `stream-status`.
    Status(oneshot::Sender<StreamStatus>),
}

/// The control loop is not running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream supervisor is not running")]
pub struct SupervisorUnavailable;

/// Cloneable client of a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    /// Wrap the command sender of a control loop.
    #[must_use]
    pub const fn new(commands: mpsc::Sender<SupervisorCommand>) -> Self {
        Self { commands }
    }

    /// Reconcile against `desired` and wait for the cycle to finish.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorUnavailable`] if the loop has exited.
    pub async fn reconcile(
        &self,
        desired: BTreeSet<Symbol>,
        session: SessionState,
    ) -> Result<ReconcileSummary, SupervisorUnavailable> {
        let (done, rx) = oneshot::channel();
        self.send(SupervisorCommand::Reconcile {
            desired,
            session,
            done,
        })
        .await?;
        rx.await.map_err(|_| SupervisorUnavailable)
    }

    /// Turn streaming on or off.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorUnavailable`] if the loop has exited.
    pub async fn set_enabled(&self, enabled: bool) -> Result<ReconcileSummary, SupervisorUnavailable> {
        let (done, rx) = oneshot::channel();
        self.send(SupervisorCommand::SetEnabled { enabled, done })
            .await?;
        rx.await.map_err(|_| SupervisorUnavailable)
    }

    /// Current status snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorUnavailable`] if the loop has exited.
    pub async fn status(&self) -> Result<StreamStatus, SupervisorUnavailable> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::Status(tx)).await?;
        rx.await.map_err(|_| SupervisorUnavailable)
    }

    async fn send(&self, command: SupervisorCommand) -> Result<(), SupervisorUnavailable> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SupervisorUnavailable)
    }
}

/// Restart timer expiry.
#[derive(Debug)]
pub struct RestartDue {
    symbol: Symbol,
    ticket: u64,
}

/// Receiving ends of the supervisor's internal channels.
pub struct SupervisorInbox {
    /// Worker reports.
    pub reports: mpsc::UnboundedReceiver<WorkerReport>,
    /// Restart timers.
    pub timers: mpsc::UnboundedReceiver<RestartDue>,
}

// =============================================================================
// Supervisor
// =============================================================================

struct ActiveWorker {
    handle: StreamHandle,
    cancel: CancellationToken,
    join: JoinHandle<()>,
    last_activity: Instant,
}

/// Worker set owner and control loop state.
pub struct StreamSupervisor {
    config: SupervisorConfig,
    deps: WorkerDeps,
    workers: HashMap<Symbol, ActiveWorker>,
    queue: VecDeque<Symbol>,
    restarting: HashMap<Symbol, u64>,
    failures: HashMap<Symbol, u32>,
    backoffs: HashMap<Symbol, BackoffPolicy>,
    quarantined: BTreeMap<Symbol, u32>,
    desired: BTreeSet<Symbol>,
    session: SessionState,
    enabled: bool,
    next_worker_id: WorkerId,
    next_ticket: u64,
    reports_tx: mpsc::UnboundedSender<WorkerReport>,
    timers_tx: mpsc::UnboundedSender<RestartDue>,
}

impl StreamSupervisor {
    /// Create an idle supervisor and the inbox its loop must drain.
    #[must_use]
    pub fn new(config: SupervisorConfig, deps: WorkerDeps) -> (Self, SupervisorInbox) {
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let (timers_tx, timers) = mpsc::unbounded_channel();
        let supervisor = Self {
            enabled: config.enabled,
            config,
            deps,
            workers: HashMap::new(),
            queue: VecDeque::new(),
            restarting: HashMap::new(),
            failures: HashMap::new(),
            backoffs: HashMap::new(),
            quarantined: BTreeMap::new(),
            desired: BTreeSet::new(),
            session: SessionState::Closed,
            next_worker_id: 1,
            next_ticket: 1,
            reports_tx,
            timers_tx,
        };
        (supervisor, SupervisorInbox { reports, timers })
    }

    /// Spawn the control loop and return its handle.
    pub fn spawn(self, inbox: SupervisorInbox, cancel: CancellationToken) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(self.run(inbox, rx, cancel).instrument(info_span!("stream_supervisor")));
        (SupervisorHandle::new(tx), task)
    }

    /// Control loop. Stops every worker before returning.
    pub async fn run(
        mut self,
        mut inbox: SupervisorInbox,
        mut commands: mpsc::Receiver<SupervisorCommand>,
        cancel: CancellationToken,
    ) {
        let mut health = tokio::time::interval(self.config.health_check_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(max_workers = self.config.max_workers, "Stream supervisor started");

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                Some(command) = commands.recv() => self.handle_command(command).await,

                Some(report) = inbox.reports.recv() => self.handle_report(report).await,

                Some(due) = inbox.timers.recv() => self.handle_restart_due(due),

                _ = health.tick() => self.health_check().await,
            }
        }

        self.shutdown().await;
        info!("Stream supervisor stopped");
    }

    async fn handle_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Reconcile {
                desired,
                session,
                done,
            } => {
                let summary = self.reconcile(desired, session).await;
                let _ = done.send(summary);
            }
            SupervisorCommand::SetEnabled { enabled, done } => {
                let summary = self.set_enabled(enabled).await;
                let _ = done.send(summary);
            }
            SupervisorCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    /// Full reconciliation cycle: adopt the snapshot, re-admit quarantined
    /// symbols and converge.
    pub async fn reconcile(
        &mut self,
        desired: BTreeSet<Symbol>,
        session: SessionState,
    ) -> ReconcileSummary {
        if session != self.session {
            info!(from = %self.session, to = %session, "Session changed");
        }
        self.desired = desired;
        self.session = session;

        for symbol in std::mem::take(&mut self.quarantined).into_keys() {
            debug!(%symbol, "Re-admitting quarantined symbol");
            self.failures.remove(&symbol);
            self.backoffs.remove(&symbol);
        }

        self.converge().await
    }

    /// Flip the streaming switch and converge.
    pub async fn set_enabled(&mut self, enabled: bool) -> ReconcileSummary {
        if enabled != self.enabled {
            info!(enabled, "Live streaming switched");
        }
        self.enabled = enabled;
        self.converge().await
    }

    async fn converge(&mut self) -> ReconcileSummary {
        let target = self.streamable();
        let active: BTreeSet<Symbol> = self
            .workers
            .keys()
            .chain(self.restarting.keys())
            .cloned()
            .collect();
        self.apply_delta(reconcile(&target, &active)).await
    }

    /// Symbols that should have a worker right now.
    fn streamable(&self) -> BTreeSet<Symbol> {
        if !self.enabled || !self.session.allows_streaming(self.config.include_extended_hours) {
            return BTreeSet::new();
        }
        self.desired
            .iter()
            .filter(|s| !self.quarantined.contains_key(*s))
            .cloned()
            .collect()
    }

    /// Stop everything in `to_stop` (awaiting termination), then start
    /// `to_start` up to capacity and queue the rest.
    pub async fn apply_delta(&mut self, delta: ReconcileDelta) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        for symbol in delta.to_stop {
            if self.restarting.remove(&symbol).is_none() {
                self.stop_worker(&symbol).await;
            }
            self.failures.remove(&symbol);
            self.backoffs.remove(&symbol);
            summary.stopped.push(symbol);
        }

        self.queue.clear();
        for symbol in delta.to_start {
            if self.has_capacity() {
                self.spawn_worker(symbol.clone());
                summary.started.push(symbol);
            } else {
                self.queue.push_back(symbol);
            }
        }
        summary.queued = self.queue.iter().cloned().collect();

        if !summary.queued.is_empty() {
            warn!(
                queued = summary.queued.len(),
                max_workers = self.config.max_workers,
                "Worker limit reached, symbols queued"
            );
        }
        self.publish_gauges();
        summary
    }

    /// Fail workers that exited unexpectedly or went silent.
    pub async fn health_check(&mut self) {
        let now = Instant::now();
        let mut failed = Vec::new();

        for (symbol, worker) in &self.workers {
            if worker.join.is_finished() {
                failed.push((
                    symbol.clone(),
                    FailureReason::DataSource,
                    "worker exited without reporting".to_string(),
                ));
            } else if now.duration_since(worker.last_activity) > self.config.staleness_threshold {
                failed.push((
                    symbol.clone(),
                    FailureReason::Stale,
                    format!(
                        "no bars for {}s",
                        now.duration_since(worker.last_activity).as_secs()
                    ),
                ));
            }
        }

        for (symbol, reason, message) in failed {
            warn!(%symbol, reason = reason.as_str(), %message, "Health check failed worker");
            self.restart(symbol, reason).await;
        }
        self.publish_gauges();
    }

    /// Apply one worker report.
    pub async fn handle_report(&mut self, report: WorkerReport) {
        let Some(worker) = self.workers.get_mut(&report.symbol) else {
            return;
        };
        if worker.handle.worker_id != report.worker_id {
            return;
        }

        match report.event {
            WorkerEvent::State(state) => {
                worker.handle.state = state;
                worker.last_activity = Instant::now();
            }
            WorkerEvent::BarAccepted { timestamp } => {
                worker.handle.last_received = Some(timestamp);
                worker.last_activity = Instant::now();
                if worker.handle.consecutive_failures > 0 {
                    worker.handle.consecutive_failures = 0;
                    self.failures.remove(&report.symbol);
                    self.backoffs.remove(&report.symbol);
                }
            }
            WorkerEvent::Failed { reason, message } => {
                worker.handle.state = WorkerState::Failed;
                debug!(symbol = %report.symbol, %message, "Worker reported failure");
                self.restart(report.symbol, reason).await;
            }
        }
    }

    /// Replace a failed worker after backoff, or quarantine it.
    pub async fn restart(&mut self, symbol: Symbol, reason: FailureReason) {
        metrics::record_worker_failure(reason);
        self.stop_worker(&symbol).await;

        let failures = {
            let count = self.failures.entry(symbol.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if failures >= self.config.quarantine_threshold || !reason.is_retryable() {
            error!(
                %symbol,
                failures,
                reason = reason.as_str(),
                "Symbol quarantined until next reconciliation"
            );
            metrics::record_quarantine();
            self.backoffs.remove(&symbol);
            self.quarantined.insert(symbol, failures);
            self.promote_queued();
            return;
        }

        let config = self.config.restart_backoff;
        let delay = self
            .backoffs
            .entry(symbol.clone())
            .or_insert_with(|| BackoffPolicy::new(config))
            .next_delay()
            .unwrap_or(config.max_delay);

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.restarting.insert(symbol.clone(), ticket);
        info!(
            %symbol,
            failures,
            delay_ms = delay.as_millis(),
            "Scheduling worker restart"
        );

        let timers = self.timers_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(RestartDue { symbol, ticket });
        });
        self.publish_gauges();
    }

    /// Respawn a symbol whose backoff elapsed, unless it was dropped since.
    pub fn handle_restart_due(&mut self, due: RestartDue) {
        if self.restarting.get(&due.symbol) != Some(&due.ticket) {
            return;
        }
        self.restarting.remove(&due.symbol);

        if self.streamable().contains(&due.symbol) {
            metrics::record_worker_restart();
            self.spawn_worker(due.symbol);
        } else {
            self.promote_queued();
        }
        self.publish_gauges();
    }

    /// Snapshot for `stream-status`.
    #[must_use]
    pub fn status(&self) -> StreamStatus {
        let mut active: Vec<StreamHandle> =
            self.workers.values().map(|w| w.handle.clone()).collect();
        active.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let mut restarting: Vec<FailingSymbol> = self
            .restarting
            .keys()
            .map(|symbol| FailingSymbol {
                symbol: symbol.clone(),
                consecutive_failures: self.failures.get(symbol).copied().unwrap_or(0),
            })
            .collect();
        restarting.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        StreamStatus {
            enabled: self.enabled,
            session: self.session,
            active_count: active.len(),
            active,
            queued: self.queue.iter().cloned().collect(),
            restarting,
            quarantined: self
                .quarantined
                .iter()
                .map(|(symbol, failures)| FailingSymbol {
                    symbol: symbol.clone(),
                    consecutive_failures: *failures,
                })
                .collect(),
        }
    }

    /// Stop every worker and drop pending restarts.
    pub async fn shutdown(&mut self) {
        self.restarting.clear();
        self.queue.clear();
        let symbols: Vec<Symbol> = self.workers.keys().cloned().collect();
        for symbol in symbols {
            self.stop_worker(&symbol).await;
        }
        self.publish_gauges();
    }

    fn has_capacity(&self) -> bool {
        self.workers.len() + self.restarting.len() < self.config.max_workers
    }

    fn promote_queued(&mut self) {
        while self.has_capacity() {
            let Some(symbol) = self.queue.pop_front() else {
                break;
            };
            debug!(%symbol, "Promoting queued symbol");
            self.spawn_worker(symbol);
        }
    }

    fn spawn_worker(&mut self, symbol: Symbol) {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;

        let cancel = CancellationToken::new();
        let worker = StreamWorker::new(
            worker_id,
            symbol.clone(),
            self.deps.clone(),
            self.reports_tx.clone(),
        );
        let span = info_span!("stream_worker", symbol = %symbol, worker_id);
        let join = tokio::spawn(worker.run(cancel.clone()).instrument(span));

        info!(%symbol, worker_id, "Stream worker spawned");
        let handle = StreamHandle {
            symbol: symbol.clone(),
            worker_id,
            state: WorkerState::Starting,
            last_received: None,
            consecutive_failures: self.failures.get(&symbol).copied().unwrap_or(0),
            started_at: Utc::now(),
        };
        self.workers.insert(
            symbol,
            ActiveWorker {
                handle,
                cancel,
                join,
                last_activity: Instant::now(),
            },
        );
    }

    /// Cancel a worker and wait (bounded) for it to terminate.
    async fn stop_worker(&mut self, symbol: &Symbol) {
        let Some(mut worker) = self.workers.remove(symbol) else {
            return;
        };
        worker.cancel.cancel();

        match tokio::time::timeout(self.config.stop_timeout, &mut worker.join).await {
            Ok(Ok(())) => debug!(%symbol, worker_id = worker.handle.worker_id, "Stream worker stopped"),
            Ok(Err(e)) => warn!(%symbol, error = %e, "Stream worker ended abnormally"),
            Err(_) => {
                worker.join.abort();
                metrics::record_worker_leaked();
                error!(
                    %symbol,
                    worker_id = worker.handle.worker_id,
                    timeout_ms = self.config.stop_timeout.as_millis(),
                    "Stream worker did not stop in time; aborted, resources may be leaked"
                );
            }
        }
    }

    fn publish_gauges(&self) {
        metrics::set_worker_counts(self.workers.len(), self.queue.len());
    }
}
