//! Ingest Configuration Settings
//!
//! Configuration types for the ingest service, loaded from environment
//! variables. Every value is validated once; a malformed value is an error,
//! never a silent fallback to the default.

use std::time::Duration;

use chrono_tz::Tz;

use crate::application::services::{BackoffConfig, SchedulerConfig, SinkConfig, SupervisorConfig};
use crate::domain::market::Resolution;
use crate::domain::session::{SessionBoundaries, SessionClock, SessionConfigError};
use crate::infrastructure::alpaca::LIVE_RESOLUTION;

/// Market data feed type for Alpaca streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFeed {
    /// SIP (Securities Information Processor) - Full market data.
    #[default]
    Sip,
    /// IEX (Investors Exchange) - Free tier with limited data.
    Iex,
}

impl DataFeed {
    /// Parse a feed name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for anything but `sip` or `iex`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "sip" => Ok(Self::Sip),
            "iex" => Ok(Self::Iex),
            _ => Err(ConfigError::invalid("ALPACA_FEED", s, "expected sip or iex")),
        }
    }

    /// Get the feed name for WebSocket URLs and REST queries.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sip => "sip",
            Self::Iex => "iex",
        }
    }
}

/// Alpaca API credentials.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key,
            api_secret,
        }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the API secret.
    #[must_use]
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// Alpaca endpoints and shared-connection tuning.
#[derive(Debug, Clone)]
pub struct AlpacaSettings {
    /// Market data feed.
    pub feed: DataFeed,
    /// API credentials.
    pub credentials: Credentials,
    /// Live bar stream URL.
    pub stream_url: String,
    /// Historical REST base URL.
    pub data_url: String,
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout before considering the connection dead.
    pub heartbeat_timeout: Duration,
    /// Reconnect delay policy.
    pub reconnect: BackoffConfig,
}

/// Screening and watchlist settings.
#[derive(Debug, Clone)]
pub struct ScreeningSettings {
    /// Screening service base URL.
    pub screener_url: String,
    /// Screening period.
    pub interval: Duration,
    /// Watchlist bound.
    pub max_watchlist_size: usize,
    /// Minimum daily volume forwarded to the screener.
    pub min_volume: u64,
    /// Backfill window in days.
    pub lookback_days: u32,
}

/// Session clock settings.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Exchange timezone.
    pub timezone: Tz,
    /// Session boundaries in exchange-local time.
    pub boundaries: SessionBoundaries,
    /// Stream during pre-market and after-hours.
    pub include_extended_hours: bool,
}

/// Live streaming settings.
#[derive(Debug, Clone, Copy)]
pub struct LiveSettings {
    /// Streaming switch at startup.
    pub enabled: bool,
    /// Supervisor health-check period.
    pub update_interval: Duration,
    /// Maximum concurrent live symbols.
    pub max_concurrent: usize,
    /// Silent-worker threshold.
    pub staleness_threshold: Duration,
    /// Consecutive failures before quarantine.
    pub quarantine_threshold: u32,
    /// Bounded wait for worker termination.
    pub stop_timeout: Duration,
    /// Restart backoff base.
    pub restart_base_delay: Duration,
    /// Restart backoff cap.
    pub restart_max_delay: Duration,
}

/// Persistence settings.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// `PostgreSQL` URL; `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Pool size.
    pub max_connections: u32,
    /// Sink batch bound.
    pub batch_size: usize,
    /// Sink flush deadline.
    pub flush_interval: Duration,
    /// Store retries per batch.
    pub max_retries: u32,
}

/// Complete ingest configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Bar resolution for backfill and streaming.
    pub resolution: Resolution,
    /// Control server port.
    pub http_port: u16,
    /// Alpaca settings.
    pub alpaca: AlpacaSettings,
    /// Screening settings.
    pub screening: ScreeningSettings,
    /// Session settings.
    pub session: SessionSettings,
    /// Live streaming settings.
    pub live: LiveSettings,
    /// Persistence settings.
    pub store: StoreSettings,
}

impl IngestConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or any value is
    /// malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or any value is
    /// malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let feed = env
            .optional("ALPACA_FEED")
            .map_or(Ok(DataFeed::default()), |s| DataFeed::parse(&s))?;
        let alpaca = AlpacaSettings {
            feed,
            credentials: Credentials::new(env.required("ALPACA_KEY")?, env.required("ALPACA_SECRET")?),
            stream_url: env.optional("ALPACA_STREAM_URL").unwrap_or_else(|| {
                format!("wss://stream.data.alpaca.markets/v2/{}", feed.as_str())
            }),
            data_url: env
                .optional("ALPACA_DATA_URL")
                .unwrap_or_else(|| "https://data.alpaca.markets".to_string()),
            heartbeat_interval: env.secs("INGEST_WS_HEARTBEAT_INTERVAL_SECS", 30)?,
            heartbeat_timeout: env.secs("INGEST_WS_HEARTBEAT_TIMEOUT_SECS", 60)?,
            reconnect: BackoffConfig {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                ..BackoffConfig::default()
            },
        };

        let screening = ScreeningSettings {
            screener_url: env.required("SCREENER_URL")?,
            interval: Duration::from_secs(60 * env.positive::<u64>("INGEST_SCREENING_INTERVAL_MINUTES", 1)?),
            max_watchlist_size: env.positive("INGEST_MAX_WATCHLIST_SIZE", 50)?,
            min_volume: env.parse("INGEST_MIN_VOLUME_THRESHOLD", 1_000_000)?,
            lookback_days: env.positive("INGEST_HISTORICAL_LOOKBACK_DAYS", 1)?,
        };

        let time = |key: &str, default: &str| -> Result<_, ConfigError> {
            let raw = env.optional(key).unwrap_or_else(|| default.to_string());
            SessionBoundaries::parse_time(&raw).map_err(|e| ConfigError::invalid(key, &raw, e))
        };
        let timezone_name = env
            .optional("INGEST_SESSION_TIMEZONE")
            .unwrap_or_else(|| "America/New_York".to_string());
        let session = SessionSettings {
            timezone: SessionClock::parse_timezone(&timezone_name)?,
            boundaries: SessionBoundaries::new(
                time("INGEST_PREMARKET_START", "04:00")?,
                time("INGEST_PREMARKET_END", "09:30")?,
                time("INGEST_MARKET_OPEN", "09:30")?,
                time("INGEST_MARKET_CLOSE", "16:00")?,
                time("INGEST_AFTERHOURS_END", "20:00")?,
            )?,
            include_extended_hours: env.bool("INGEST_INCLUDE_EXTENDED_HOURS", true)?,
        };

        let live = LiveSettings {
            enabled: env.bool("INGEST_LIVE_DATA_ENABLED", true)?,
            update_interval: Duration::from_secs(env.positive("INGEST_LIVE_UPDATE_INTERVAL_SECS", 5)?),
            max_concurrent: env.positive("INGEST_LIVE_DATA_BATCH_SIZE", 25)?,
            staleness_threshold: Duration::from_secs(env.positive("INGEST_STALENESS_THRESHOLD_SECS", 180)?),
            quarantine_threshold: env.positive("INGEST_QUARANTINE_THRESHOLD", 5)?,
            stop_timeout: Duration::from_secs(env.positive("INGEST_STOP_TIMEOUT_SECS", 10)?),
            restart_base_delay: Duration::from_millis(env.positive("INGEST_RESTART_BASE_DELAY_MS", 1_000)?),
            restart_max_delay: Duration::from_millis(env.positive("INGEST_RESTART_MAX_DELAY_MS", 60_000)?),
        };
        if live.restart_base_delay > live.restart_max_delay {
            return Err(ConfigError::invalid(
                "INGEST_RESTART_BASE_DELAY_MS",
                &live.restart_base_delay.as_millis().to_string(),
                format!(
                    "must not exceed INGEST_RESTART_MAX_DELAY_MS ({})",
                    live.restart_max_delay.as_millis()
                ),
            ));
        }

        let store = StoreSettings {
            database_url: env.optional("DATABASE_URL"),
            max_connections: env.positive("INGEST_DB_MAX_CONNECTIONS", 10)?,
            batch_size: env.positive("INGEST_SINK_BATCH_SIZE", 100)?,
            flush_interval: Duration::from_millis(env.positive("INGEST_SINK_FLUSH_INTERVAL_MS", 1_000)?),
            max_retries: env.parse("INGEST_SINK_MAX_RETRIES", 3)?,
        };

        let resolution = match env.optional("INGEST_DATA_RESOLUTION") {
            Some(raw) => raw
                .parse()
                .map_err(|e| ConfigError::invalid("INGEST_DATA_RESOLUTION", &raw, e))?,
            None => Resolution::OneMinute,
        };
        if live.enabled && resolution != LIVE_RESOLUTION {
            return Err(ConfigError::invalid(
                "INGEST_DATA_RESOLUTION",
                resolution.as_str(),
                format!(
                    "live streaming only serves {LIVE_RESOLUTION} bars; \
                     set INGEST_LIVE_DATA_ENABLED=false to ingest other resolutions"
                ),
            ));
        }

        Ok(Self {
            resolution,
            http_port: env.parse("INGEST_HTTP_PORT", 8090)?,
            alpaca,
            screening,
            session,
            live,
            store,
        })
    }

    /// Session clock for the configured timezone and boundaries.
    #[must_use]
    pub const fn session_clock(&self) -> SessionClock {
        SessionClock::new(self.session.boundaries, self.session.timezone)
    }

    /// Supervisor tuning.
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_workers: self.live.max_concurrent,
            staleness_threshold: self.live.staleness_threshold,
            quarantine_threshold: self.live.quarantine_threshold,
            stop_timeout: self.live.stop_timeout,
            health_check_interval: self.live.update_interval,
            restart_backoff: BackoffConfig {
                initial_delay: self.live.restart_base_delay,
                max_delay: self.live.restart_max_delay,
                ..BackoffConfig::default()
            },
            include_extended_hours: self.session.include_extended_hours,
            enabled: self.live.enabled,
        }
    }

    /// Scheduler tuning.
    #[must_use]
    pub const fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.screening.interval,
            max_watchlist_size: self.screening.max_watchlist_size,
            lookback_days: self.screening.lookback_days,
            resolution: self.resolution,
        }
    }

    /// Sink tuning.
    #[must_use]
    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            batch_size: self.store.batch_size,
            flush_interval: self.store.flush_interval,
            max_retries: self.store.max_retries,
            ..SinkConfig::default()
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable is malformed.
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// What is wrong with it.
        reason: String,
    },
    /// Session boundaries or timezone are unusable.
    #[error(transparent)]
    Session(#[from] SessionConfigError),
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl std::fmt::Display) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        match (self.lookup)(key) {
            None => Err(ConfigError::MissingEnvVar(key.to_string())),
            Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(v) => Ok(v.trim().to_string()),
        }
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(key).map_or(Ok(default), |raw| {
            raw.parse().map_err(|e| ConfigError::invalid(key, &raw, e))
        })
    }

    fn positive<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr + Default + PartialEq + std::fmt::Display,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(key, default)?;
        if value == T::default() {
            return Err(ConfigError::invalid(key, &value.to_string(), "must be greater than zero"));
        }
        Ok(value)
    }

    fn secs(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.positive(key, default).map(Duration::from_secs)
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        self.optional(key).map_or(Ok(default), |raw| {
            match raw.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(key, &raw, "expected a boolean")),
            }
        })
    }
}
