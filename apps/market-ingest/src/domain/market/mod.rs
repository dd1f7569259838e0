//! Market Data Types
//!
//! Value objects shared by every layer: the [`Symbol`] identifier, the bar
//! [`Resolution`] and the [`Bar`] record itself.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Symbol
// =============================================================================

/// Maximum length of a ticker or exchange qualifier.
const MAX_PART_LEN: usize = 10;

/// Errors raised when a raw string is not a usable symbol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    /// Nothing left after trimming.
    #[error("symbol is empty")]
    Empty,
    /// Ticker part violates the allowed format.
    #[error("invalid ticker '{0}'")]
    InvalidTicker(String),
    /// Exchange qualifier violates the allowed format.
    #[error("invalid exchange qualifier '{0}'")]
    InvalidExchange(String),
}

/// An instrument identifier, `TICKER` or `EXCHANGE:TICKER`.
///
/// Input is trimmed and uppercased, so comparisons are case-normalized.
///
/// ```rust
/// use market_ingest::Symbol;
///
/// let symbol = Symbol::parse(" nasdaq:aapl ").unwrap();
/// assert_eq!(symbol.as_str(), "NASDAQ:AAPL");
/// assert_eq!(symbol.ticker(), "AAPL");
/// assert_eq!(symbol.exchange(), Some("NASDAQ"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Parse and normalize a raw symbol.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError`] when the input is empty or either part
    /// contains characters outside the allowed set.
    pub fn parse(raw: &str) -> Result<Self, SymbolError> {
        let normalized = raw.trim().to_uppercase();
        if normalized.is_empty() {
            return Err(SymbolError::Empty);
        }

        let (exchange, ticker) = match normalized.split_once(':') {
            Some((exchange, ticker)) => (Some(exchange), ticker),
            None => (None, normalized.as_str()),
        };

        if let Some(exchange) = exchange.filter(|e| !is_valid_exchange(e)) {
            return Err(SymbolError::InvalidExchange(exchange.to_string()));
        }
        if !is_valid_ticker(ticker) {
            return Err(SymbolError::InvalidTicker(ticker.to_string()));
        }

        Ok(Self(normalized))
    }

    /// Full normalized form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ticker without the exchange qualifier, as vendors expect it.
    #[must_use]
    pub fn ticker(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(_, t)| t)
    }

    /// Exchange qualifier, if one was given.
    #[must_use]
    pub fn exchange(&self) -> Option<&str> {
        self.0.split_once(':').map(|(e, _)| e)
    }
}

fn is_valid_ticker(ticker: &str) -> bool {
    let mut chars = ticker.chars();
    let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_uppercase());
    starts_with_letter
        && ticker.len() <= MAX_PART_LEN
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.' || c == '-')
}

fn is_valid_exchange(exchange: &str) -> bool {
    !exchange.is_empty()
        && exchange.len() <= MAX_PART_LEN
        && exchange.chars().all(|c| c.is_ascii_uppercase())
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Symbol {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Symbol {
    type Error = SymbolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.0
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Fixed bar interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// One minute.
    #[serde(rename = "1m")]
    OneMinute,
    /// Five minutes.
    #[serde(rename = "5m")]
    FiveMinutes,
    /// Fifteen minutes.
    #[serde(rename = "15m")]
    FifteenMinutes,
    /// One hour.
    #[serde(rename = "1h")]
    OneHour,
    /// One trading day.
    #[serde(rename = "1d")]
    OneDay,
}

impl Resolution {
    /// Short configuration/storage label (`1m`, `1h`, ...).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::OneDay => "1d",
        }
    }

    /// Vendor timeframe string used by the bars REST API.
    #[must_use]
    pub const fn timeframe(self) -> &'static str {
        match self {
            Self::OneMinute => "1Min",
            Self::FiveMinutes => "5Min",
            Self::FifteenMinutes => "15Min",
            Self::OneHour => "1Hour",
            Self::OneDay => "1Day",
        }
    }

    /// Nominal bar length.
    #[must_use]
    pub const fn duration(self) -> Duration {
        match self {
            Self::OneMinute => Duration::from_secs(60),
            Self::FiveMinutes => Duration::from_secs(5 * 60),
            Self::FifteenMinutes => Duration::from_secs(15 * 60),
            Self::OneHour => Duration::from_secs(60 * 60),
            Self::OneDay => Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown resolution label.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported resolution '{0}' (expected 1m, 5m, 15m, 1h or 1d)")]
pub struct ParseResolutionError(pub String);

impl FromStr for Resolution {
    type Err = ParseResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1m" => Ok(Self::OneMinute),
            "5m" => Ok(Self::FiveMinutes),
            "15m" => Ok(Self::FifteenMinutes),
            "1h" => Ok(Self::OneHour),
            "1d" => Ok(Self::OneDay),
            other => Err(ParseResolutionError(other.to_string())),
        }
    }
}

// =============================================================================
// Bar
// =============================================================================

/// Technical indicators derived from a bar series.
///
/// A field stays `None` until the series is long enough to compute it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Indicators {
    /// 20-period simple moving average.
    pub sma_20: Option<f64>,
    /// 50-period simple moving average.
    pub sma_50: Option<f64>,
    /// 12-period exponential moving average.
    pub ema_12: Option<f64>,
    /// 26-period exponential moving average.
    pub ema_26: Option<f64>,
    /// 14-period relative strength index.
    pub rsi_14: Option<f64>,
    /// MACD line (EMA12 - EMA26).
    pub macd: Option<f64>,
    /// 9-period EMA of the MACD line.
    pub macd_signal: Option<f64>,
    /// MACD minus signal.
    pub macd_histogram: Option<f64>,
    /// Upper Bollinger band (20, 2σ).
    pub bb_upper: Option<f64>,
    /// Middle Bollinger band.
    pub bb_middle: Option<f64>,
    /// Lower Bollinger band.
    pub bb_lower: Option<f64>,
}

/// One OHLCV record, identified by `(symbol, resolution, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Instrument.
    pub symbol: Symbol,
    /// Bar interval.
    pub resolution: Resolution,
    /// Bar open time.
    pub timestamp: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Traded volume.
    pub volume: u64,
    /// Number of trades, when the source reports it.
    pub trade_count: Option<u64>,
    /// Volume-weighted average price, when the source reports it.
    pub vwap: Option<Decimal>,
    /// Derived indicators (backfill only).
    pub indicators: Option<Indicators>,
}

/// Upsert key of a bar.
pub type BarKey = (Symbol, Resolution, DateTime<Utc>);

impl Bar {
    /// The idempotency key.
    #[must_use]
    pub fn key(&self) -> BarKey {
        (self.symbol.clone(), self.resolution, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("aapl", "AAPL" ; "lowercase ticker")]
    #[test_case("  msft ", "MSFT" ; "surrounding whitespace")]
    #[test_case("nasdaq:tsla", "NASDAQ:TSLA" ; "exchange qualified")]
    #[test_case("BRK.B", "BRK.B" ; "class share")]
    fn parse_normalizes(raw: &str, expected: &str) {
        assert_eq!(Symbol::parse(raw).unwrap().as_str(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("   " ; "blank")]
    #[test_case("1ABC" ; "leading digit")]
    #[test_case("AA PL" ; "inner space")]
    #[test_case("TOOLONGTICKER" ; "too long")]
    #[test_case(":AAPL" ; "empty exchange")]
    #[test_case("NASDAQ:" ; "empty ticker")]
    #[test_case("NAS1:AAPL" ; "digit in exchange")]
    fn parse_rejects(raw: &str) {
        assert!(Symbol::parse(raw).is_err());
    }

    #[test]
    fn comparison_is_case_normalized() {
        assert_eq!(Symbol::parse("aapl").unwrap(), Symbol::parse("AAPL").unwrap());
    }

    #[test]
    fn ticker_strips_exchange() {
        let symbol = Symbol::parse("NYSE:IBM").unwrap();
        assert_eq!(symbol.ticker(), "IBM");
        assert_eq!(symbol.exchange(), Some("NYSE"));
        assert_eq!(Symbol::parse("IBM").unwrap().exchange(), None);
    }

    #[test]
    fn symbol_serde_validates() {
        let ok: Symbol = serde_json::from_str("\"spy\"").unwrap();
        assert_eq!(ok.as_str(), "SPY");
        assert!(serde_json::from_str::<Symbol>("\"not a symbol\"").is_err());
    }

    #[test_case("1m", Resolution::OneMinute)]
    #[test_case("5M", Resolution::FiveMinutes)]
    #[test_case("15m", Resolution::FifteenMinutes)]
    #[test_case("1h", Resolution::OneHour)]
    #[test_case("1d", Resolution::OneDay)]
    fn resolution_parses(raw: &str, expected: Resolution) {
        assert_eq!(raw.parse::<Resolution>().unwrap(), expected);
    }

    #[test]
    fn resolution_rejects_unknown() {
        assert!("2m".parse::<Resolution>().is_err());
    }

    #[test]
    fn resolution_timeframe() {
        assert_eq!(Resolution::OneMinute.timeframe(), "1Min");
        assert_eq!(Resolution::OneDay.duration(), Duration::from_secs(86_400));
    }
}
