//! HTTP Screener Adapter
//!
//! Calls the external screening service:
//!
//! ```text
//! GET {base_url}/screen?session=premarket|regular&min_volume=N
//! -> [{"symbol": "AAPL", "score": 3.2}, ...]
//! ```
//!
//! Rows with an unparseable symbol or a non-finite score are dropped and
//! counted; the rest are returned in service order.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::application::ports::{Screener, ScreenerError};
use crate::domain::market::Symbol;
use crate::domain::session::ScreeningKind;
use crate::domain::watchlist::ScreenedSymbol;
use crate::infrastructure::config::ScreeningSettings;
use crate::infrastructure::metrics;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ScreenRow {
    symbol: String,
    score: f64,
}

/// Screener backed by an HTTP service.
#[derive(Debug, Clone)]
pub struct HttpScreener {
    http: reqwest::Client,
    base_url: String,
    min_volume: u64,
}

impl HttpScreener {
    /// Create a screener against `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ScreenerError::Request`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, min_volume: u64) -> Result<Self, ScreenerError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ScreenerError::Request {
                message: e.to_string(),
            })?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            min_volume,
        })
    }

    /// Create a screener from the screening settings.
    ///
    /// # Errors
    ///
    /// Returns [`ScreenerError::Request`] if the HTTP client cannot be built.
    pub fn from_settings(settings: &ScreeningSettings) -> Result<Self, ScreenerError> {
        Self::new(settings.screener_url.clone(), settings.min_volume)
    }
}

fn parse_rows(rows: Vec<ScreenRow>) -> Vec<ScreenedSymbol> {
    rows.into_iter()
        .filter_map(|row| {
            if !row.score.is_finite() {
                warn!(symbol = %row.symbol, "Dropping screener row with non-finite score");
                metrics::record_symbol_rejected();
                return None;
            }
            match Symbol::parse(&row.symbol) {
                Ok(symbol) => Some(ScreenedSymbol::new(symbol, row.score)),
                Err(e) => {
                    warn!(symbol = %row.symbol, error = %e, "Dropping invalid screener symbol");
                    metrics::record_symbol_rejected();
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl Screener for HttpScreener {
    async fn screen(&self, kind: ScreeningKind) -> Result<Vec<ScreenedSymbol>, ScreenerError> {
        let url = format!("{}/screen", self.base_url);
        let min_volume = self.min_volume.to_string();

        let response = self
            .http
            .get(&url)
            .query(&[("session", kind.as_str()), ("min_volume", min_volume.as_str())])
            .send()
            .await
            .map_err(|e| ScreenerError::Request {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScreenerError::Request {
                message: format!("screener returned {status}"),
            });
        }

        let rows: Vec<ScreenRow> =
            response
                .json()
                .await
                .map_err(|e| ScreenerError::InvalidResponse {
                    message: e.to_string(),
                })?;

        let total = rows.len();
        let results = parse_rows(rows);
        debug!(session = kind.as_str(), total, accepted = results.len(), "Screener responded");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn passes_session_and_volume_and_drops_invalid_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/screen"))
            .and(query_param("session", "premarket"))
            .and(query_param("min_volume", "500000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"symbol": "aapl", "score": 4.5},
                {"symbol": "NOT A SYMBOL", "score": 3.0},
                {"symbol": "NASDAQ:MSFT", "score": 2.0}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let screener = HttpScreener::new(server.uri(), 500_000).unwrap();
        let results = screener.screen(ScreeningKind::PreMarket).await.unwrap();

        let symbols: Vec<&str> = results.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AAPL", "NASDAQ:MSFT"]);
        assert!((results[0].score - 4.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn non_success_status_is_request_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let screener = HttpScreener::new(server.uri(), 0).unwrap();
        let result = screener.screen(ScreeningKind::Regular).await;

        assert!(matches!(result, Err(ScreenerError::Request { .. })));
    }

    #[tokio::test]
    async fn wrong_shape_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
            .mount(&server)
            .await;

        let screener = HttpScreener::new(server.uri(), 0).unwrap();
        let result = screener.screen(ScreeningKind::Regular).await;

        assert!(matches!(result, Err(ScreenerError::InvalidResponse { .. })));
    }

    #[test]
    fn parse_rows_drops_non_finite_scores() {
        let rows = vec![
            ScreenRow {
                symbol: "AAPL".to_string(),
                score: f64::NAN,
            },
            ScreenRow {
                symbol: "TSLA".to_string(),
                score: 1.0,
            },
        ];

        let parsed = parse_rows(rows);

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].symbol.as_str(), "TSLA");
    }
}
