//! Alpaca Market Data Message Types
//!
//! Wire format types for the stock bar stream and the historical bars REST
//! endpoint.
//!
//! # Stream Messages
//!
//! - `Success`: connection and authentication acknowledgments
//! - `Error`: error response with code and message
//! - `Subscription`: current subscription set after every change
//! - `Bar`: minute bars (`b`), daily bars (`d`) and corrections (`u`)
//!
//! # References
//!
//! - [Stock Streaming](https://docs.alpaca.markets/docs/real-time-stock-pricing-data)
//! - [Historical Bars](https://docs.alpaca.markets/reference/stockbars)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market::{Bar, Resolution, Symbol, SymbolError};

// =============================================================================
// Control Messages
// =============================================================================

/// Success message indicating connection or authentication succeeded.
///
/// # Wire Format (JSON)
/// ```json
/// {"T": "success", "msg": "connected"}
/// {"T": "success", "msg": "authenticated"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessMessage {
    /// Message type (always "success")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// "connected" or "authenticated"
    pub msg: SuccessKind,
}

/// Kind of success message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuccessKind {
    /// Initial connection established
    Connected,
    /// Authentication successful
    Authenticated,
}

/// Error message with code and description.
///
/// # Error Codes
/// - 400: Invalid syntax
/// - 401: Not authenticated
/// - 402: Auth failed
/// - 403: Already authenticated
/// - 404: Auth timeout
/// - 405: Symbol limit exceeded
/// - 406: Connection limit exceeded
/// - 407: Slow client
/// - 408: Insufficient subscription
/// - 409: Not allowed (internal)
/// - 500: Internal error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Message type (always "error")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Error code
    pub code: i32,

    /// Error message
    pub msg: String,
}

impl ErrorMessage {
    /// Authentication failure (401-404).
    #[must_use]
    pub const fn is_auth_error(&self) -> bool {
        matches!(self.code, 401..=404)
    }

    /// Connection or symbol limits (405-407).
    #[must_use]
    pub const fn is_rate_limit_error(&self) -> bool {
        matches!(self.code, 405..=407)
    }

    /// Account lacks access to the requested data (408).
    #[must_use]
    pub const fn is_subscription_error(&self) -> bool {
        self.code == 408
    }
}

/// Subscription confirmation. Lists the full bar subscription set after
/// each subscribe or unsubscribe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionMessage {
    /// Message type (always "subscription")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Subscribed bar symbols
    #[serde(default)]
    pub bars: Vec<String>,
}

// =============================================================================
// Bars
// =============================================================================

/// Stock bar from the live stream.
///
/// # Wire Format (JSON)
/// ```json
/// {
///   "T": "b",
///   "S": "SPY",
///   "o": 388.985,
///   "h": 389.13,
///   "l": 388.975,
///   "c": 389.12,
///   "v": 49378,
///   "n": 461,
///   "vw": 389.062639,
///   "t": "2021-02-22T19:15:00Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBarMessage {
    /// Message type: "b" (minute), "d" (daily), "u" (updated)
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Ticker symbol
    #[serde(rename = "S")]
    pub symbol: String,

    /// OHLCV payload
    #[serde(flatten)]
    pub bar: BarFields,
}

impl StockBarMessage {
    /// Convert into a domain bar.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError`] when the vendor symbol does not parse.
    pub fn to_bar(&self, resolution: Resolution) -> Result<Bar, SymbolError> {
        let symbol = Symbol::parse(&self.symbol)?;
        Ok(self.bar.to_bar(symbol, resolution))
    }
}

/// OHLCV fields shared by the stream and REST bar payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarFields {
    /// Open price
    #[serde(rename = "o")]
    pub open: Decimal,

    /// High price
    #[serde(rename = "h")]
    pub high: Decimal,

    /// Low price
    #[serde(rename = "l")]
    pub low: Decimal,

    /// Close price
    #[serde(rename = "c")]
    pub close: Decimal,

    /// Volume (shares)
    #[serde(rename = "v")]
    pub volume: u64,

    /// Number of trades in bar
    #[serde(rename = "n", default)]
    pub trade_count: Option<u64>,

    /// Volume-weighted average price
    #[serde(rename = "vw", default)]
    pub vwap: Option<Decimal>,

    /// Bar start time
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
}

impl BarFields {
    /// Attach identity and build a domain bar.
    #[must_use]
    pub fn to_bar(&self, symbol: Symbol, resolution: Resolution) -> Bar {
        Bar {
            symbol,
            resolution,
            timestamp: self.timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            trade_count: self.trade_count,
            vwap: self.vwap,
            indicators: None,
        }
    }
}

/// One page of `GET /v2/stocks/{symbol}/bars`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BarsPage {
    /// Bars, oldest first. `null` when the window is empty.
    #[serde(default)]
    pub bars: Option<Vec<BarFields>>,

    /// Ticker echoed back by the API
    #[serde(default)]
    pub symbol: Option<String>,

    /// Cursor for the next page, absent on the last page
    #[serde(default)]
    pub next_page_token: Option<String>,
}

// =============================================================================
// Unified Incoming Message
// =============================================================================

/// Any message the bar stream can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlpacaMessage {
    /// Connection/authentication success
    Success(SuccessMessage),
    /// Error message
    Error(ErrorMessage),
    /// Subscription confirmation
    Subscription(SubscriptionMessage),
    /// Stock bar
    Bar(StockBarMessage),
    /// Recognized type this client does not consume (quotes, trades, ...)
    Ignored(String),
}

// =============================================================================
// Outbound Messages (Client -> Server)
// =============================================================================

/// Authentication request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthRequest {
    /// Action: "auth"
    pub action: &'static str,

    /// API key
    pub key: String,

    /// API secret
    pub secret: String,
}

impl AuthRequest {
    /// Create a new authentication request.
    #[must_use]
    pub const fn new(key: String, secret: String) -> Self {
        Self {
            action: "auth",
            key,
            secret,
        }
    }
}

/// Bar subscription change.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest {
    /// Action: "subscribe" or "unsubscribe"
    pub action: &'static str,

    /// Bar symbols
    pub bars: Vec<String>,
}

impl SubscriptionRequest {
    /// Subscribe to minute bars for `symbols`.
    #[must_use]
    pub const fn subscribe(symbols: Vec<String>) -> Self {
        Self {
            action: "subscribe",
            bars: symbols,
        }
    }

    /// Unsubscribe from minute bars for `symbols`.
    #[must_use]
    pub const fn unsubscribe(symbols: Vec<String>) -> Self {
        Self {
            action: "unsubscribe",
            bars: symbols,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_success_authenticated() {
        let json = r#"{"T":"success","msg":"authenticated"}"#;
        let msg: SuccessMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.msg, SuccessKind::Authenticated);
    }

    #[test]
    fn test_deserialize_error() {
        let json = r#"{"T":"error","code":402,"msg":"auth failed"}"#;
        let msg: ErrorMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.code, 402);
        assert!(msg.is_auth_error());
        assert!(!msg.is_rate_limit_error());
    }

    #[test]
    fn test_stock_bar_to_domain() {
        let json = r#"{
            "T": "b",
            "S": "SPY",
            "o": 388.985,
            "h": 389.13,
            "l": 388.975,
            "c": 389.12,
            "v": 49378,
            "n": 461,
            "vw": 389.062639,
            "t": "2021-02-22T19:15:00Z"
        }"#;
        let msg: StockBarMessage = serde_json::from_str(json).unwrap();
        let bar = msg.to_bar(Resolution::OneMinute).unwrap();

        assert_eq!(bar.symbol.as_str(), "SPY");
        assert_eq!(bar.resolution, Resolution::OneMinute);
        assert_eq!(bar.volume, 49378);
        assert_eq!(bar.trade_count, Some(461));
        assert_eq!(bar.close, Decimal::new(38912, 2));
        assert_eq!(bar.timestamp.to_rfc3339(), "2021-02-22T19:15:00+00:00");
        assert!(bar.indicators.is_none());
    }

    #[test]
    fn test_stock_bar_without_optional_fields() {
        let json = r#"{"T":"b","S":"AAPL","o":1,"h":2,"l":0.5,"c":1.5,"v":10,"t":"2024-01-02T14:30:00Z"}"#;
        let msg: StockBarMessage = serde_json::from_str(json).unwrap();
        let bar = msg.to_bar(Resolution::OneMinute).unwrap();
        assert_eq!(bar.trade_count, None);
        assert_eq!(bar.vwap, None);
    }

    #[test]
    fn test_bars_page_with_null_bars() {
        let page: BarsPage =
            serde_json::from_str(r#"{"bars":null,"symbol":"AAPL","next_page_token":null}"#)
                .unwrap();
        assert!(page.bars.is_none());
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn test_serialize_auth_request() {
        let req = AuthRequest::new("key123".to_string(), "secret456".to_string());
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""action":"auth""#));
        assert!(json.contains(r#""key":"key123""#));
    }

    #[test]
    fn test_serialize_subscription_request() {
        let req = SubscriptionRequest::unsubscribe(vec!["AAPL".to_string(), "MSFT".to_string()]);
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"action":"unsubscribe","bars":["AAPL","MSFT"]}"#);
    }
}
