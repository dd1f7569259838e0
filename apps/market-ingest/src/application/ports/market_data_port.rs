//! Market Data Port (Driven Port)
//!
//! Live bar subscriptions and historical bar fetches.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::market::{Bar, Resolution, Symbol};

/// Market data failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MarketDataError {
    /// The upstream connection dropped or could not be established.
    #[error("market data connection error: {message}")]
    Connection {
        /// Error details.
        message: String,
    },

    /// Credentials were rejected.
    #[error("market data authentication failed: {message}")]
    Authentication {
        /// Error details.
        message: String,
    },

    /// The source refused the subscription.
    #[error("subscription to {symbol} rejected: {message}")]
    SubscriptionRejected {
        /// Symbol.
        symbol: Symbol,
        /// Error details.
        message: String,
    },

    /// The source cannot serve this request.
    #[error("unsupported request: {message}")]
    Unsupported {
        /// Error details.
        message: String,
    },

    /// The stream ended.
    #[error("subscription for {symbol} closed")]
    Closed {
        /// Symbol.
        symbol: Symbol,
    },

    /// Request failed.
    #[error("market data request failed: {message}")]
    Request {
        /// Error details.
        message: String,
    },

    /// Payload could not be decoded.
    #[error("market data decode error: {message}")]
    Decode {
        /// Error details.
        message: String,
    },
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Identity of one live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Producer half of a subscription, held by the adapter.
pub type BarSender = mpsc::Sender<Result<Bar, MarketDataError>>;

/// Consumer half of a live subscription.
///
/// Yields bars in arrival order. `None` means the adapter dropped the
/// subscription.
#[derive(Debug)]
pub struct BarSubscription {
    id: SubscriptionId,
    symbol: Symbol,
    resolution: Resolution,
    bars: mpsc::Receiver<Result<Bar, MarketDataError>>,
}

impl BarSubscription {
    /// Next bar or error; `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<Result<Bar, MarketDataError>> {
        self.bars.recv().await
    }

    /// Subscription id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Subscribed symbol.
    #[must_use]
    pub const fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Subscribed resolution.
    #[must_use]
    pub const fn resolution(&self) -> Resolution {
        self.resolution
    }
}

/// Create a subscription pair with a bounded buffer.
#[must_use]
pub fn bar_channel(
    symbol: Symbol,
    resolution: Resolution,
    capacity: usize,
) -> (BarSender, BarSubscription) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let subscription = BarSubscription {
        id: SubscriptionId::new(),
        symbol,
        resolution,
        bars: rx,
    };
    (tx, subscription)
}

/// Port for live bar subscriptions.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Open a live subscription.
    async fn subscribe(
        &self,
        symbol: &Symbol,
        resolution: Resolution,
    ) -> Result<BarSubscription, MarketDataError>;

    /// Close a subscription. Must tolerate subscriptions the adapter has
    /// already dropped.
    async fn unsubscribe(&self, subscription: BarSubscription) -> Result<(), MarketDataError>;
}

/// Port for historical bar fetches.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoricalBarSource: Send + Sync {
    /// Bars in `[start, end)`, oldest first.
    async fn fetch_bars(
        &self,
        symbol: &Symbol,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, MarketDataError>;
}
