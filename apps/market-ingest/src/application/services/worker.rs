//! Stream Worker
//!
//! One task per streamed symbol. The worker owns its subscription,
//! deduplicator and sink, and talks to the supervisor only through
//! [`WorkerReport`] messages.
//!
//! # Lifecycle
//!
//! ```text
//! Starting -> Subscribing -> Streaming -> Stopping -> Terminated
//!                  |             |
//!                  +-> Failed <--+-> Terminated
//! ```
//!
//! A worker never retries on its own. Subscription errors, stream drops and
//! exhausted store retries end the instance with `Failed`; the supervisor
//! decides whether to replace it.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sink::{PersistenceSink, SinkConfig};
use crate::application::ports::{BarStore, BarSubscription, MarketDataError, MarketDataSource};
use crate::domain::dedup::Deduplicator;
use crate::domain::market::{Bar, Resolution, Symbol};
use crate::infrastructure::metrics::{self, FailureReason};

// =============================================================================
// Types
// =============================================================================

/// Identity of one worker instance; restarts get a new id.
pub type WorkerId = u64;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Acquiring resources.
    Starting,
    /// Opening the live subscription.
    Subscribing,
    /// Receiving bars.
    Streaming,
    /// Closing the subscription and flushing.
    Stopping,
    /// Ended by an error.
    Failed,
    /// Finished.
    Terminated,
}

/// Something a worker tells its supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Lifecycle transition (never `Failed`; see [`WorkerEvent::Failed`]).
    State(WorkerState),
    /// A bar passed deduplication and went to the sink.
    BarAccepted {
        /// Bar open time.
        timestamp: DateTime<Utc>,
    },
    /// The worker failed and is shutting down.
    Failed {
        /// Failure class.
        reason: FailureReason,
        /// Human-readable cause.
        message: String,
    },
}

/// Event tagged with its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    /// Streamed symbol.
    pub symbol: Symbol,
    /// Reporting instance.
    pub worker_id: WorkerId,
    /// What happened.
    pub event: WorkerEvent,
}

/// Collaborators every worker needs.
#[derive(Clone)]
pub struct WorkerDeps {
    /// Live bar source.
    pub source: Arc<dyn MarketDataSource>,
    /// Bar store (for the sink and dedup seeding).
    pub store: Arc<dyn BarStore>,
    /// Sink tuning.
    pub sink: SinkConfig,
    /// Streamed resolution.
    pub resolution: Resolution,
}

enum StreamExit {
    Stopped,
    Failed(FailureReason, String),
}

// =============================================================================
// Worker
// =============================================================================

/// A single-symbol streaming task.
pub struct StreamWorker {
    id: WorkerId,
    symbol: Symbol,
    deps: WorkerDeps,
    reports: mpsc::UnboundedSender<WorkerReport>,
}

impl StreamWorker {
    /// Create a worker; nothing happens until [`StreamWorker::run`].
    #[must_use]
    pub const fn new(
        id: WorkerId,
        symbol: Symbol,
        deps: WorkerDeps,
        reports: mpsc::UnboundedSender<WorkerReport>,
    ) -> Self {
        Self {
            id,
            symbol,
            deps,
            reports,
        }
    }

    /// Run to completion. Returns once `Terminated` has been reported.
    pub async fn run(self, cancel: CancellationToken) {
        self.report(WorkerEvent::State(WorkerState::Starting));

        let mut dedup = Deduplicator::new();
        let latest = self
            .deps
            .store
            .latest_timestamp(&self.symbol, self.deps.resolution);
        match or_cancelled(&cancel, latest).await {
            None => return self.terminate(),
            Some(Ok(Some(timestamp))) => {
                debug!(%timestamp, "Seeded deduplicator from store");
                dedup.seed(&self.symbol, timestamp);
            }
            Some(Ok(None)) => {}
            Some(Err(e)) => return self.fail(FailureReason::Store, e.to_string()),
        }

        self.report(WorkerEvent::State(WorkerState::Subscribing));
        let subscribe = self.deps.source.subscribe(&self.symbol, self.deps.resolution);
        let mut subscription = match or_cancelled(&cancel, subscribe).await {
            None => return self.terminate(),
            Some(Ok(subscription)) => subscription,
            Some(Err(e @ MarketDataError::Unsupported { .. })) => {
                return self.fail(FailureReason::Unsupported, e.to_string());
            }
            Some(Err(e)) => return self.fail(FailureReason::DataSource, e.to_string()),
        };

        info!(subscription = %subscription.id(), "Streaming");
        self.report(WorkerEvent::State(WorkerState::Streaming));

        let mut sink = PersistenceSink::new(self.deps.store.clone(), self.deps.sink);
        let exit = self
            .stream(&mut subscription, &mut sink, &mut dedup, &cancel)
            .await;

        if matches!(exit, StreamExit::Stopped) {
            self.report(WorkerEvent::State(WorkerState::Stopping));
        }
        if let Err(e) = self.deps.source.unsubscribe(subscription).await {
            warn!(error = %e, "Unsubscribe failed");
        }

        match exit {
            StreamExit::Stopped => {
                if let Err(e) = sink.flush().await {
                    warn!(error = %e, "Final flush failed");
                }
                self.terminate();
            }
            StreamExit::Failed(reason, message) => {
                if reason != FailureReason::Store {
                    if let Err(e) = sink.flush().await {
                        warn!(error = %e, "Flush after failure failed");
                    }
                }
                self.fail(reason, message);
            }
        }
    }

    async fn stream(
        &self,
        subscription: &mut BarSubscription,
        sink: &mut PersistenceSink,
        dedup: &mut Deduplicator,
        cancel: &CancellationToken,
    ) -> StreamExit {
        loop {
            let deadline = sink.flush_deadline();
            tokio::select! {
                biased;

                () = cancel.cancelled() => return StreamExit::Stopped,

                next = subscription.next() => match next {
                    Some(Ok(bar)) => {
                        if let Err(e) = self.handle_bar(bar, sink, dedup).await {
                            return StreamExit::Failed(FailureReason::Store, e.to_string());
                        }
                    }
                    Some(Err(e)) => return StreamExit::Failed(FailureReason::DataSource, e.to_string()),
                    None => {
                        return StreamExit::Failed(
                            FailureReason::DataSource,
                            "subscription closed by source".to_string(),
                        );
                    }
                },

                () = flush_timer(deadline) => {
                    if let Err(e) = sink.flush().await {
                        return StreamExit::Failed(FailureReason::Store, e.to_string());
                    }
                }
            }
        }
    }

    async fn handle_bar(
        &self,
        bar: Bar,
        sink: &mut PersistenceSink,
        dedup: &mut Deduplicator,
    ) -> Result<(), super::sink::SinkError> {
        if bar.symbol != self.symbol {
            debug!(other = %bar.symbol, "Ignoring bar for another symbol");
            return Ok(());
        }

        metrics::record_bar_received(&self.symbol);
        if !dedup.accept(&bar.symbol, bar.timestamp) {
            metrics::record_bar_duplicate(&self.symbol);
            debug!(timestamp = %bar.timestamp, "Dropped duplicate bar");
            return Ok(());
        }

        let timestamp = bar.timestamp;
        sink.write(bar).await?;
        self.report(WorkerEvent::BarAccepted { timestamp });
        Ok(())
    }

    fn fail(&self, reason: FailureReason, message: String) {
        warn!(reason = reason.as_str(), %message, "Stream worker failed");
        self.report(WorkerEvent::Failed { reason, message });
        self.report(WorkerEvent::State(WorkerState::Terminated));
    }

    fn terminate(&self) {
        debug!("Stream worker terminated");
        self.report(WorkerEvent::State(WorkerState::Terminated));
    }

    fn report(&self, event: WorkerEvent) {
        // The supervisor may already be gone during shutdown.
        let _ = self.reports.send(WorkerReport {
            symbol: self.symbol.clone(),
            worker_id: self.id,
            event,
        });
    }
}

/// Await `fut` unless `cancel` fires first; cancellation wins ties.
async fn or_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

async fn flush_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{
        BarSender, MarketDataError, MockBarStore, StoreError, bar_channel,
    };
    use crate::application::services::backoff::BackoffConfig;
    use crate::infrastructure::persistence::InMemoryBarStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Source whose single subscription is fed by the test.
    #[derive(Default)]
    struct ScriptedSource {
        sender: Mutex<Option<BarSender>>,
        fail_subscribe: bool,
        unsupported: bool,
        subscribes: AtomicUsize,
        unsubscribes: AtomicUsize,
    }

    impl ScriptedSource {
        fn failing() -> Self {
            Self {
                fail_subscribe: true,
                ..Self::default()
            }
        }

        fn unsupported() -> Self {
            Self {
                unsupported: true,
                ..Self::default()
            }
        }

        fn push(&self, bar: Bar) {
            let sender = self.sender.lock();
            sender.as_ref().unwrap().try_send(Ok(bar)).unwrap();
        }

        fn close(&self) {
            self.sender.lock().take();
        }
    }

    #[async_trait]
    impl MarketDataSource for ScriptedSource {
        async fn subscribe(
            &self,
            symbol: &Symbol,
            resolution: Resolution,
        ) -> Result<BarSubscription, MarketDataError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            if self.unsupported {
                return Err(MarketDataError::Unsupported {
                    message: format!("no live {resolution} bars"),
                });
            }
            if self.fail_subscribe {
                return Err(MarketDataError::SubscriptionRejected {
                    symbol: symbol.clone(),
                    message: "not entitled".into(),
                });
            }
            let (tx, subscription) = bar_channel(symbol.clone(), resolution, 16);
            *self.sender.lock() = Some(tx);
            Ok(subscription)
        }

        async fn unsubscribe(&self, _subscription: BarSubscription) -> Result<(), MarketDataError> {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn aapl() -> Symbol {
        Symbol::parse("AAPL").unwrap()
    }

    fn bar(minute: i64) -> Bar {
        Bar {
            symbol: aapl(),
            resolution: Resolution::OneMinute,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 13, 14, 0, 0).unwrap()
                + chrono::Duration::minutes(minute),
            open: Decimal::ONE,
            high: Decimal::ONE,
            low: Decimal::ONE,
            close: Decimal::ONE,
            volume: 10,
            trade_count: None,
            vwap: None,
            indicators: None,
        }
    }

    fn deps(source: Arc<dyn MarketDataSource>, store: Arc<dyn BarStore>) -> WorkerDeps {
        WorkerDeps {
            source,
            store,
            sink: SinkConfig {
                batch_size: 100,
                flush_interval: Duration::from_secs(60),
                max_retries: 1,
                retry_backoff: BackoffConfig {
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                    multiplier: 1.0,
                    jitter_factor: 0.0,
                    max_attempts: 0,
                },
            },
            resolution: Resolution::OneMinute,
        }
    }

    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<WorkerReport>,
        mut pred: impl FnMut(&WorkerEvent) -> bool,
    ) -> Vec<WorkerEvent> {
        let mut seen = Vec::new();
        while let Some(report) = rx.recv().await {
            let hit = pred(&report.event);
            seen.push(report.event);
            if hit {
                break;
            }
        }
        seen
    }

    fn is_state(state: WorkerState) -> impl FnMut(&WorkerEvent) -> bool {
        move |e| *e == WorkerEvent::State(state)
    }

    #[tokio::test]
    async fn streams_dedups_and_flushes_on_stop() {
        let source = Arc::new(ScriptedSource::default());
        let store = Arc::new(InMemoryBarStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = StreamWorker::new(1, aapl(), deps(source.clone(), store.clone()), tx);
        let handle = tokio::spawn(worker.run(cancel.clone()));

        wait_for(&mut rx, is_state(WorkerState::Streaming)).await;
        source.push(bar(0));
        source.push(bar(0));
        source.push(bar(1));

        let mut accepted = 0;
        while accepted < 2 {
            if let Some(WorkerReport {
                event: WorkerEvent::BarAccepted { .. },
                ..
            }) = rx.recv().await
            {
                accepted += 1;
            }
        }

        cancel.cancel();
        let tail = wait_for(&mut rx, is_state(WorkerState::Terminated)).await;
        handle.await.unwrap();

        assert_eq!(
            tail,
            vec![
                WorkerEvent::State(WorkerState::Stopping),
                WorkerEvent::State(WorkerState::Terminated)
            ]
        );
        assert_eq!(store.len(), 2);
        assert_eq!(source.unsubscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribe_error_fails_without_retry() {
        let source = Arc::new(ScriptedSource::failing());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let worker = StreamWorker::new(7, aapl(), deps(source.clone(), Arc::new(InMemoryBarStore::new())), tx);
        worker.run(CancellationToken::new()).await;

        let events = wait_for(&mut rx, is_state(WorkerState::Terminated)).await;
        assert!(events.iter().any(|e| matches!(
            e,
            WorkerEvent::Failed { reason: FailureReason::DataSource, .. }
        )));
        assert_eq!(source.subscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsupported_subscription_is_not_retryable() {
        let source = Arc::new(ScriptedSource::unsupported());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let worker = StreamWorker::new(7, aapl(), deps(source.clone(), Arc::new(InMemoryBarStore::new())), tx);
        worker.run(CancellationToken::new()).await;

        let events = wait_for(&mut rx, is_state(WorkerState::Terminated)).await;
        let reason = events.iter().find_map(|e| match e {
            WorkerEvent::Failed { reason, .. } => Some(*reason),
            _ => None,
        });
        assert_eq!(reason, Some(FailureReason::Unsupported));
        assert!(!FailureReason::Unsupported.is_retryable());
    }

    #[tokio::test]
    async fn stop_signal_wins_over_ready_bar() {
        let source = Arc::new(ScriptedSource::default());
        let store = Arc::new(InMemoryBarStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = StreamWorker::new(1, aapl(), deps(source.clone(), store.clone()), tx);
        let handle = tokio::spawn(worker.run(cancel.clone()));
        wait_for(&mut rx, is_state(WorkerState::Streaming)).await;

        source.push(bar(0));
        cancel.cancel();
        let events = wait_for(&mut rx, is_state(WorkerState::Terminated)).await;
        handle.await.unwrap();

        assert!(!events.iter().any(|e| matches!(e, WorkerEvent::BarAccepted { .. })));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn source_drop_is_data_source_failure() {
        let source = Arc::new(ScriptedSource::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let worker = StreamWorker::new(1, aapl(), deps(source.clone(), Arc::new(InMemoryBarStore::new())), tx);
        let handle = tokio::spawn(worker.run(CancellationToken::new()));
        wait_for(&mut rx, is_state(WorkerState::Streaming)).await;

        source.close();
        let events = wait_for(&mut rx, is_state(WorkerState::Terminated)).await;
        handle.await.unwrap();
        assert!(matches!(
            events[0],
            WorkerEvent::Failed { reason: FailureReason::DataSource, .. }
        ));
    }

    #[tokio::test]
    async fn seeds_from_latest_persisted_bar() {
        let source = Arc::new(ScriptedSource::default());
        let store = Arc::new(InMemoryBarStore::new());
        store.upsert(&[bar(5)]).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = StreamWorker::new(1, aapl(), deps(source.clone(), store.clone()), tx);
        let handle = tokio::spawn(worker.run(cancel.clone()));
        wait_for(&mut rx, is_state(WorkerState::Streaming)).await;

        source.push(bar(5));
        source.push(bar(6));
        let events = wait_for(&mut rx, |e| matches!(e, WorkerEvent::BarAccepted { .. })).await;
        assert_eq!(
            events.last(),
            Some(&WorkerEvent::BarAccepted { timestamp: bar(6).timestamp })
        );

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn exhausted_store_retries_fail_worker() {
        let source = Arc::new(ScriptedSource::default());
        let mut store = MockBarStore::new();
        store.expect_latest_timestamp().returning(|_, _| Ok(None));
        store.expect_upsert().returning(|_| {
            Err(StoreError::Connection {
                message: "down".into(),
            })
        });
        let mut deps = deps(source.clone(), Arc::new(store));
        deps.sink.batch_size = 1;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(StreamWorker::new(1, aapl(), deps, tx).run(CancellationToken::new()));
        wait_for(&mut rx, is_state(WorkerState::Streaming)).await;
        source.push(bar(0));

        let events = wait_for(&mut rx, is_state(WorkerState::Terminated)).await;
        handle.await.unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            WorkerEvent::Failed { reason: FailureReason::Store, .. }
        )));
    }
}
