//! Alpaca Live Bar Stream
//!
//! One shared WebSocket connection to the stock stream, multiplexing every
//! live bar subscription in the process.
//!
//! # Stream URL
//!
//! - SIP: `wss://stream.data.alpaca.markets/v2/sip`
//! - IEX: `wss://stream.data.alpaca.markets/v2/iex`
//!
//! # Lifecycle
//!
//! The connection task stays idle until the first subscription arrives.
//! Upstream bar subscriptions are reference counted per ticker: the first
//! subscriber sends `subscribe`, the last one to leave sends `unsubscribe`.
//! After a reconnect the full set is restored in one request. Rejected
//! credentials are fatal: every open subscription receives an
//! authentication error and is dropped.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use super::auth::{AUTH_TIMEOUT, AuthError, AuthHandler, AuthStep};
use super::codec::{CodecError, JsonCodec};
use super::heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
use super::messages::{AlpacaMessage, ErrorMessage, StockBarMessage, SubscriptionRequest};
use crate::application::ports::{
    BarSender, BarSubscription, MarketDataError, MarketDataSource, SubscriptionId, bar_channel,
};
use crate::application::services::{BackoffConfig, BackoffPolicy};
use crate::domain::market::{Resolution, Symbol};
use crate::infrastructure::config::{AlpacaSettings, Credentials};

/// Default per-subscription buffer.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 1024;

/// The only bar resolution the stock stream publishes.
pub const LIVE_RESOLUTION: Resolution = Resolution::OneMinute;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the shared bar stream.
#[derive(Debug, Clone)]
pub struct BarStreamConfig {
    /// WebSocket URL.
    pub url: String,
    /// API credentials.
    pub credentials: Credentials,
    /// Heartbeat tuning.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect delays.
    pub reconnect: BackoffConfig,
    /// Bars buffered per subscription before new bars are dropped.
    pub subscription_buffer: usize,
}

impl BarStreamConfig {
    /// Build from the Alpaca settings.
    #[must_use]
    pub fn from_settings(settings: &AlpacaSettings) -> Self {
        Self {
            url: settings.stream_url.clone(),
            credentials: settings.credentials.clone(),
            heartbeat: HeartbeatConfig::from_settings(settings),
            reconnect: settings.reconnect,
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
        }
    }
}

/// Upstream connection state, exposed for readiness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No subscriptions, no connection.
    Idle,
    /// Connecting or authenticating.
    Connecting,
    /// Authenticated and delivering bars.
    Streaming,
    /// Waiting out a reconnect delay.
    Reconnecting,
    /// Credentials were rejected.
    Failed,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
enum StreamError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    #[error("connection closed by server")]
    Closed,
}

// =============================================================================
// Subscription Registry
// =============================================================================

#[derive(Debug)]
enum StreamCommand {
    Subscribe {
        symbol: Symbol,
        id: SubscriptionId,
        sender: BarSender,
    },
    Unsubscribe {
        symbol: Symbol,
        id: SubscriptionId,
    },
}

#[derive(Debug)]
struct Route {
    id: SubscriptionId,
    symbol: Symbol,
    sender: BarSender,
}

/// Subscribers grouped by vendor ticker.
#[derive(Debug, Default)]
struct SubscriptionRegistry {
    routes: HashMap<String, Vec<Route>>,
    confirmed: BTreeSet<String>,
}

impl SubscriptionRegistry {
    /// Apply a command; returns the upstream request it requires, if any.
    fn apply(&mut self, command: StreamCommand) -> Option<SubscriptionRequest> {
        match command {
            StreamCommand::Subscribe { symbol, id, sender } => {
                let ticker = symbol.ticker().to_string();
                let routes = self.routes.entry(ticker.clone()).or_default();
                let first = routes.is_empty();
                routes.push(Route { id, symbol, sender });
                first.then(|| SubscriptionRequest::subscribe(vec![ticker]))
            }
            StreamCommand::Unsubscribe { symbol, id } => {
                let ticker = symbol.ticker();
                let routes = self.routes.get_mut(ticker)?;
                routes.retain(|route| route.id != id);
                if routes.is_empty() {
                    self.routes.remove(ticker);
                    self.confirmed.remove(ticker);
                    Some(SubscriptionRequest::unsubscribe(vec![ticker.to_string()]))
                } else {
                    None
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    /// Every ticker with at least one subscriber, sorted.
    fn tickers(&self) -> Vec<String> {
        let mut tickers: Vec<String> = self.routes.keys().cloned().collect();
        tickers.sort();
        tickers
    }

    /// Replace the confirmed set with the server's view.
    fn confirm(&mut self, bars: &[String]) {
        self.confirmed = bars.iter().cloned().collect();
    }

    /// Deliver a bar to every subscriber of its ticker. Returns tickers
    /// whose subscribers all went away, which need an upstream unsubscribe.
    fn route(&mut self, message: &StockBarMessage) -> Vec<String> {
        let Some(routes) = self.routes.get_mut(&message.symbol) else {
            trace!(ticker = %message.symbol, "Bar for unsubscribed ticker");
            return Vec::new();
        };

        routes.retain(|route| {
            let bar = message.bar.to_bar(route.symbol.clone(), LIVE_RESOLUTION);
            match route.sender.try_send(Ok(bar)) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(symbol = %route.symbol, "Subscriber lagging; dropping bar");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        if routes.is_empty() {
            self.routes.remove(&message.symbol);
            self.confirmed.remove(&message.symbol);
            vec![message.symbol.clone()]
        } else {
            Vec::new()
        }
    }

    /// Fail and drop every subscription the server has not confirmed.
    fn reject_unconfirmed(&mut self, error: &ErrorMessage) -> Vec<String> {
        let rejected: Vec<String> = self
            .routes
            .keys()
            .filter(|ticker| !self.confirmed.contains(*ticker))
            .cloned()
            .collect();

        for ticker in &rejected {
            if let Some(routes) = self.routes.remove(ticker) {
                for route in routes {
                    let _ = route.sender.try_send(Err(MarketDataError::SubscriptionRejected {
                        symbol: route.symbol.clone(),
                        message: format!("{} ({})", error.msg, error.code),
                    }));
                }
            }
        }

        rejected
    }

    /// Deliver `error` to every subscriber and forget them all.
    fn fail_all(&mut self, error: &MarketDataError) {
        for (_, routes) in self.routes.drain() {
            for route in routes {
                let _ = route.sender.try_send(Err(error.clone()));
            }
        }
        self.confirmed.clear();
    }
}

// =============================================================================
// Public Adapter
// =============================================================================

/// Shared live bar stream implementing [`MarketDataSource`].
#[derive(Debug, Clone)]
pub struct AlpacaBarStream {
    commands: mpsc::UnboundedSender<StreamCommand>,
    state: watch::Receiver<ConnectionState>,
    buffer: usize,
}

impl AlpacaBarStream {
    /// Spawn the connection task.
    #[must_use]
    pub fn spawn(config: BarStreamConfig, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let buffer = config.subscription_buffer;

        let task = ConnectionTask {
            codec: JsonCodec::new(),
            registry: SubscriptionRegistry::default(),
            state: state_tx,
            config,
            cancel,
        };
        let handle = tokio::spawn(
            task.run(commands_rx)
                .instrument(info_span!("alpaca_bar_stream")),
        );

        (
            Self {
                commands: commands_tx,
                state: state_rx,
                buffer,
            },
            handle,
        )
    }

    /// Current upstream state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

#[async_trait]
impl MarketDataSource for AlpacaBarStream {
    async fn subscribe(
        &self,
        symbol: &Symbol,
        resolution: Resolution,
    ) -> Result<BarSubscription, MarketDataError> {
        if resolution != LIVE_RESOLUTION {
            return Err(MarketDataError::Unsupported {
                message: format!("live stream only serves {LIVE_RESOLUTION} bars, not {resolution}"),
            });
        }

        let (sender, subscription) = bar_channel(symbol.clone(), resolution, self.buffer);
        self.commands
            .send(StreamCommand::Subscribe {
                symbol: symbol.clone(),
                id: subscription.id(),
                sender,
            })
            .map_err(|_| MarketDataError::Connection {
                message: "bar stream task has stopped".to_string(),
            })?;

        Ok(subscription)
    }

    async fn unsubscribe(&self, subscription: BarSubscription) -> Result<(), MarketDataError> {
        // A stopped task holds no subscriptions.
        let _ = self.commands.send(StreamCommand::Unsubscribe {
            symbol: subscription.symbol().clone(),
            id: subscription.id(),
        });
        Ok(())
    }
}

// =============================================================================
// Connection Task
// =============================================================================

struct ConnectionTask {
    config: BarStreamConfig,
    codec: JsonCodec,
    registry: SubscriptionRegistry,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl ConnectionTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<StreamCommand>) {
        let mut backoff = BackoffPolicy::new(self.config.reconnect);
        let cancel = self.cancel.clone();

        loop {
            if self.registry.is_empty() {
                if *self.state.borrow() != ConnectionState::Failed {
                    self.set_state(ConnectionState::Idle);
                }
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    command = commands.recv() => {
                        let Some(command) = command else { return };
                        let _ = self.registry.apply(command);
                        continue;
                    }
                }
            }

            self.set_state(ConnectionState::Connecting);
            let error = match self.connect_and_run(&mut commands, &mut backoff).await {
                Ok(()) => {
                    info!("Bar stream stopped");
                    return;
                }
                Err(error) => error,
            };

            if let StreamError::Auth(auth) = &error
                && auth.is_fatal()
            {
                error!(error = %auth, subscriptions = self.registry.len(), "Bar stream credentials rejected");
                self.set_state(ConnectionState::Failed);
                self.registry.fail_all(&MarketDataError::Authentication {
                    message: auth.to_string(),
                });
                backoff.reset();
                continue;
            }

            warn!(error = %error, "Bar stream connection lost");
            let Some(delay) = backoff.next_delay() else {
                error!(attempts = backoff.attempt_count(), "Bar stream reconnect attempts exhausted");
                self.registry.fail_all(&MarketDataError::Connection {
                    message: error.to_string(),
                });
                backoff.reset();
                continue;
            };

            info!(
                attempt = backoff.attempt_count(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to bar stream"
            );
            self.set_state(ConnectionState::Reconnecting);

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    () = &mut sleep => break,
                    command = commands.recv() => {
                        let Some(command) = command else { return };
                        let _ = self.registry.apply(command);
                    }
                }
            }
        }
    }

    async fn connect_and_run(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<StreamCommand>,
        backoff: &mut BackoffPolicy,
    ) -> Result<(), StreamError> {
        debug!(url = %self.config.url, "Connecting to bar stream");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.config.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let cancel = self.cancel.clone();
        let mut auth = AuthHandler::new(self.config.credentials.clone());
        let mut heartbeat = Heartbeat::new(self.config.heartbeat, Instant::now());
        let mut ticker = heartbeat.ticker();
        let auth_deadline = tokio::time::sleep(AUTH_TIMEOUT);
        tokio::pin!(auth_deadline);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                () = &mut auth_deadline, if !auth.is_authenticated() => {
                    return Err(AuthError::Timeout.into());
                }
                _ = ticker.tick() => match heartbeat.on_tick(Instant::now()) {
                    HeartbeatEvent::SendPing => write.send(Message::Ping(Vec::new().into())).await?,
                    HeartbeatEvent::Timeout => return Err(StreamError::HeartbeatTimeout),
                },
                command = commands.recv() => {
                    let Some(command) = command else {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    };
                    let request = self.registry.apply(command);
                    if let Some(request) = request
                        && auth.is_authenticated()
                    {
                        self.send(&mut write, &request).await?;
                    }
                }
                frame = read.next() => {
                    heartbeat.record_activity(Instant::now());
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(&text, &mut auth, &mut write, backoff).await?;
                        }
                        Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "Server sent close frame");
                            return Err(StreamError::Closed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(StreamError::Closed),
                    }
                }
            }
        }
    }

    async fn handle_text<W>(
        &mut self,
        text: &str,
        auth: &mut AuthHandler,
        write: &mut W,
        backoff: &mut BackoffPolicy,
    ) -> Result<(), StreamError>
    where
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        for message in self.codec.decode(text)? {
            match message {
                AlpacaMessage::Success(success) => match auth.on_success(&success) {
                    AuthStep::Send(request) => self.send(write, &request).await?,
                    AuthStep::Authenticated => {
                        let tickers = self.registry.tickers();
                        info!(tickers = tickers.len(), "Bar stream authenticated");
                        backoff.reset();
                        self.set_state(ConnectionState::Streaming);
                        if !tickers.is_empty() {
                            self.send(write, &SubscriptionRequest::subscribe(tickers)).await?;
                        }
                    }
                    AuthStep::Idle => {}
                },
                AlpacaMessage::Error(error) if !auth.is_authenticated() => {
                    return Err(auth.on_error(&error).into());
                }
                AlpacaMessage::Error(error) => {
                    warn!(code = error.code, msg = %error.msg, "Bar stream error");
                    if error.code == 405 || error.is_subscription_error() {
                        let rejected = self.registry.reject_unconfirmed(&error);
                        if !rejected.is_empty() {
                            warn!(tickers = ?rejected, "Subscriptions rejected");
                        }
                    }
                }
                AlpacaMessage::Subscription(subscription) => {
                    debug!(bars = ?subscription.bars, "Subscription confirmed");
                    self.registry.confirm(&subscription.bars);
                }
                AlpacaMessage::Bar(bar) if bar.msg_type == "b" => {
                    let orphaned = self.registry.route(&bar);
                    if !orphaned.is_empty() {
                        self.send(write, &SubscriptionRequest::unsubscribe(orphaned)).await?;
                    }
                }
                AlpacaMessage::Bar(bar) => {
                    trace!(kind = %bar.msg_type, ticker = %bar.symbol, "Ignoring non-minute bar");
                }
                AlpacaMessage::Ignored(kind) => trace!(%kind, "Ignoring message"),
            }
        }
        Ok(())
    }

    async fn send<W, T>(&self, write: &mut W, request: &T) -> Result<(), StreamError>
    where
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
        T: Serialize + Sync,
    {
        let json = self.codec.encode(request)?;
        write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}
