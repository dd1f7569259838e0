//! Alpaca Historical Bars
//!
//! REST client for `GET /v2/stocks/{symbol}/bars`, following
//! `next_page_token` until the window is exhausted.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use tracing::debug;

use super::messages::BarsPage;
use crate::application::ports::{HistoricalBarSource, MarketDataError};
use crate::domain::market::{Bar, Resolution, Symbol};
use crate::infrastructure::config::{AlpacaSettings, Credentials, DataFeed};

/// Largest page the API serves.
const PAGE_LIMIT: u32 = 10_000;

/// Upper bound on pages per request, against a server that never stops paging.
const MAX_PAGES: usize = 1_000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Historical bar client.
#[derive(Debug, Clone)]
pub struct AlpacaHistoricalClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    feed: DataFeed,
}

impl AlpacaHistoricalClient {
    /// Create a client against `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`MarketDataError::Request`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        credentials: Credentials,
        feed: DataFeed,
    ) -> Result<Self, MarketDataError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MarketDataError::Request {
                message: e.to_string(),
            })?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            feed,
        })
    }

    /// Create a client from the Alpaca settings.
    ///
    /// # Errors
    ///
    /// Returns [`MarketDataError::Request`] if the HTTP client cannot be built.
    pub fn from_settings(settings: &AlpacaSettings) -> Result<Self, MarketDataError> {
        Self::new(
            settings.data_url.clone(),
            settings.credentials.clone(),
            settings.feed,
        )
    }

    async fn fetch_page(
        &self,
        symbol: &Symbol,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<BarsPage, MarketDataError> {
        let url = format!("{}/v2/stocks/{}/bars", self.base_url, symbol.ticker());
        let start = start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = end.to_rfc3339_opts(SecondsFormat::Secs, true);
        let limit = PAGE_LIMIT.to_string();

        let mut query = vec![
            ("timeframe", resolution.timeframe()),
            ("start", start.as_str()),
            ("end", end.as_str()),
            ("limit", limit.as_str()),
            ("feed", self.feed.as_str()),
            ("adjustment", "raw"),
        ];
        if let Some(token) = page_token {
            query.push(("page_token", token));
        }

        let response = self
            .http
            .get(&url)
            .header("APCA-API-KEY-ID", self.credentials.api_key())
            .header("APCA-API-SECRET-KEY", self.credentials.api_secret())
            .query(&query)
            .send()
            .await
            .map_err(|e| MarketDataError::Request {
                message: e.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(MarketDataError::Authentication {
                message: format!("historical bars returned {status}"),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MarketDataError::Request {
                message: format!("historical bars returned {status}: {body}"),
            });
        }

        response
            .json::<BarsPage>()
            .await
            .map_err(|e| MarketDataError::Decode {
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl HistoricalBarSource for AlpacaHistoricalClient {
    async fn fetch_bars(
        &self,
        symbol: &Symbol,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, MarketDataError> {
        let mut bars = Vec::new();
        let mut page_token: Option<String> = None;

        for page_number in 1..=MAX_PAGES {
            let page = self
                .fetch_page(symbol, resolution, start, end, page_token.as_deref())
                .await?;

            let fields = page.bars.unwrap_or_default();
            debug!(%symbol, page = page_number, bars = fields.len(), "Fetched historical page");
            bars.extend(
                fields
                    .iter()
                    .filter(|f| f.timestamp >= start && f.timestamp < end)
                    .map(|f| f.to_bar(symbol.clone(), resolution)),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(bars),
            }
        }

        Err(MarketDataError::Request {
            message: format!("historical bars for {symbol} exceeded {MAX_PAGES} pages"),
        })
    }
}
