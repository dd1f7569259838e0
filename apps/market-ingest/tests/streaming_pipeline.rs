//! Streaming Pipeline Integration Tests
//!
//! Drives a real supervisor, real workers and the in-memory store against a
//! scripted market data source.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use market_ingest::application::ports::{BarSender, BarSubscription, bar_channel};
use market_ingest::application::services::{BackoffConfig, SinkConfig, SupervisorConfig};
use market_ingest::{
    Bar, InMemoryBarStore, MarketDataError, MarketDataSource, Resolution, SessionState,
    StreamSupervisor, SupervisorHandle, Symbol, WorkerDeps,
};

#[derive(Default)]
struct ScriptedSource {
    senders: Mutex<HashMap<Symbol, BarSender>>,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
}

impl ScriptedSource {
    fn subscribed(&self, symbol: &str) -> bool {
        self.senders.lock().contains_key(&sym(symbol))
    }

    fn push(&self, symbol: &str, minute: i64) {
        let sender = self.senders.lock().get(&sym(symbol)).cloned().unwrap();
        sender.try_send(Ok(make_bar(symbol, minute))).unwrap();
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
        let (tx, subscription) = bar_channel(symbol.clone(), resolution, 16);
        self.senders.lock().insert(symbol.clone(), tx);
        Ok(subscription)
    }

    async fn unsubscribe(&self, subscription: BarSubscription) -> Result<(), MarketDataError> {
        self.senders.lock().remove(subscription.symbol());
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn sym(raw: &str) -> Symbol {
    Symbol::parse(raw).unwrap()
}

fn set(symbols: &[&str]) -> BTreeSet<Symbol> {
    symbols.iter().map(|s| sym(s)).collect()
}

fn make_bar(symbol: &str, minute: i64) -> Bar {
    let price = Decimal::new(18_525, 2);
    Bar {
        symbol: sym(symbol),
        resolution: Resolution::OneMinute,
        timestamp: DateTime::from_timestamp(1_710_338_400 + minute * 60, 0).unwrap(),
        open: price,
        high: price,
        low: price,
        close: price,
        volume: 1_000,
        trade_count: Some(10),
        vwap: None,
        indicators: None,
    }
}

fn supervisor_config(max_workers: usize) -> SupervisorConfig {
    SupervisorConfig {
        max_workers,
        staleness_threshold: Duration::from_secs(300),
        quarantine_threshold: 3,
        stop_timeout: Duration::from_secs(2),
        health_check_interval: Duration::from_secs(60),
        restart_backoff: BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..BackoffConfig::default()
        },
        include_extended_hours: true,
        enabled: true,
    }
}

struct Harness {
    source: Arc<ScriptedSource>,
    store: Arc<InMemoryBarStore>,
    supervisor: SupervisorHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(max_workers: usize) -> Self {
        let source = Arc::new(ScriptedSource::default());
        let store = Arc::new(InMemoryBarStore::new());
        let deps = WorkerDeps {
            source: source.clone(),
            store: store.clone(),
            sink: SinkConfig {
                batch_size: 1,
                flush_interval: Duration::from_millis(20),
                ..SinkConfig::default()
            },
            resolution: Resolution::OneMinute,
        };

        let cancel = CancellationToken::new();
        let (supervisor, inbox) = StreamSupervisor::new(supervisor_config(max_workers), deps);
        let (handle, task) = supervisor.spawn(inbox, cancel.clone());

        Self {
            source,
            store,
            supervisor: handle,
            cancel,
            task,
        }
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("supervisor did not stop")
            .unwrap();
    }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_duplicate_bars_are_persisted_once() {
    let harness = Harness::start(10);

    let summary = harness
        .supervisor
        .reconcile(set(&["AAPL", "MSFT"]), SessionState::Regular)
        .await
        .unwrap();
    assert_eq!(summary.started, vec![sym("AAPL"), sym("MSFT")]);

    let source = harness.source.clone();
    eventually("both subscriptions", || {
        source.subscribed("AAPL") && source.subscribed("MSFT")
    })
    .await;

    harness.source.push("AAPL", 0);
    harness.source.push("AAPL", 0);
    harness.source.push("AAPL", 1);
    harness.source.push("MSFT", 0);

    let store = harness.store.clone();
    eventually("three persisted bars", || store.len() == 3).await;

    let aapl: Vec<i64> = harness
        .store
        .bars_for(&sym("AAPL"))
        .iter()
        .map(|b| b.timestamp.timestamp())
        .collect();
    assert_eq!(aapl, vec![1_710_338_400, 1_710_338_460]);

    let status = harness.supervisor.status().await.unwrap();
    assert_eq!(status.active_count, 2);
    assert!(status.queued.is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_reconcile_to_empty_stops_and_unsubscribes() {
    let harness = Harness::start(10);

    harness
        .supervisor
        .reconcile(set(&["AAPL", "MSFT"]), SessionState::Regular)
        .await
        .unwrap();
    let source = harness.source.clone();
    eventually("both subscriptions", || {
        source.subscribed("AAPL") && source.subscribed("MSFT")
    })
    .await;

    let summary = harness
        .supervisor
        .reconcile(BTreeSet::new(), SessionState::Regular)
        .await
        .unwrap();

    assert_eq!(summary.stopped.len(), 2);
    assert_eq!(harness.source.unsubscribes.load(Ordering::SeqCst), 2);
    assert_eq!(harness.supervisor.status().await.unwrap().active_count, 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_closed_session_streams_nothing() {
    let harness = Harness::start(10);

    let summary = harness
        .supervisor
        .reconcile(set(&["AAPL"]), SessionState::Closed)
        .await
        .unwrap();

    assert!(summary.started.is_empty());
    let status = harness.supervisor.status().await.unwrap();
    assert_eq!(status.session, SessionState::Closed);
    assert_eq!(status.active_count, 0);
    assert_eq!(harness.source.subscribes.load(Ordering::SeqCst), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_capacity_queues_then_promotes_on_reconcile() {
    let harness = Harness::start(1);

    let summary = harness
        .supervisor
        .reconcile(set(&["AAPL", "MSFT"]), SessionState::Regular)
        .await
        .unwrap();
    assert_eq!(summary.started, vec![sym("AAPL")]);
    assert_eq!(summary.queued, vec![sym("MSFT")]);

    let summary = harness
        .supervisor
        .reconcile(set(&["MSFT"]), SessionState::Regular)
        .await
        .unwrap();
    assert_eq!(summary.stopped, vec![sym("AAPL")]);
    assert_eq!(summary.started, vec![sym("MSFT")]);

    let status = harness.supervisor.status().await.unwrap();
    assert_eq!(status.active.len(), 1);
    assert_eq!(status.active[0].symbol, sym("MSFT"));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_disable_then_enable_restores_streams() {
    let harness = Harness::start(10);

    harness
        .supervisor
        .reconcile(set(&["AAPL"]), SessionState::Regular)
        .await
        .unwrap();

    let stopped = harness.supervisor.set_enabled(false).await.unwrap();
    assert_eq!(stopped.stopped, vec![sym("AAPL")]);
    assert!(!harness.supervisor.status().await.unwrap().enabled);

    let started = harness.supervisor.set_enabled(true).await.unwrap();
    assert_eq!(started.started, vec![sym("AAPL")]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_every_worker() {
    let harness = Harness::start(10);

    harness
        .supervisor
        .reconcile(set(&["AAPL", "MSFT", "TSLA"]), SessionState::Regular)
        .await
        .unwrap();
    let source = harness.source.clone();
    eventually("three subscriptions", || source.senders.lock().len() == 3).await;

    let source = harness.source.clone();
    harness.shutdown().await;

    assert_eq!(source.unsubscribes.load(Ordering::SeqCst), 3);
}
