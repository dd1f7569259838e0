//! Market Session Clock
//!
//! Maps a wall-clock instant to the current [`SessionState`] using configured
//! boundary times in the exchange timezone. Every interval is half-open
//! (`start <= t < end`) so an instant exactly on a boundary belongs to the
//! session that starts there. Saturdays and Sundays are always closed.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// Current market phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Before the regular open.
    PreMarket,
    /// Regular trading hours.
    Regular,
    /// After the regular close.
    AfterHours,
    /// No trading.
    Closed,
}

/// Which screening strategy a session calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreeningKind {
    /// Pre-market gappers/movers.
    PreMarket,
    /// Regular-hours screen, also used after hours.
    Regular,
}

impl ScreeningKind {
    /// Query/label form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreMarket => "premarket",
            Self::Regular => "regular",
        }
    }
}

impl SessionState {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreMarket => "pre_market",
            Self::Regular => "regular",
            Self::AfterHours => "after_hours",
            Self::Closed => "closed",
        }
    }

    /// Screening strategy for this session; `None` means do not screen.
    #[must_use]
    pub const fn screening_kind(self) -> Option<ScreeningKind> {
        match self {
            Self::PreMarket => Some(ScreeningKind::PreMarket),
            Self::Regular | Self::AfterHours => Some(ScreeningKind::Regular),
            Self::Closed => None,
        }
    }

    /// Whether live workers may run in this session.
    #[must_use]
    pub const fn allows_streaming(self, include_extended_hours: bool) -> bool {
        match self {
            Self::Regular => true,
            Self::PreMarket | Self::AfterHours => include_extended_hours,
            Self::Closed => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Boundaries
// =============================================================================

/// Invalid session boundary configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionConfigError {
    /// Boundaries are not in chronological order.
    #[error(
        "session boundaries out of order: require premarket_start <= premarket_end <= market_open < market_close <= afterhours_end"
    )]
    Unordered,
    /// A boundary string is not `HH:MM`.
    #[error("invalid time '{0}' (expected HH:MM)")]
    InvalidTime(String),
    /// Unknown IANA timezone.
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}

/// Exchange-local boundary times of one trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBoundaries {
    premarket_start: NaiveTime,
    premarket_end: NaiveTime,
    market_open: NaiveTime,
    market_close: NaiveTime,
    afterhours_end: NaiveTime,
}

impl SessionBoundaries {
    /// Build validated boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`SessionConfigError::Unordered`] unless
    /// `premarket_start <= premarket_end <= market_open < market_close <= afterhours_end`.
    pub fn new(
        premarket_start: NaiveTime,
        premarket_end: NaiveTime,
        market_open: NaiveTime,
        market_close: NaiveTime,
        afterhours_end: NaiveTime,
    ) -> Result<Self, SessionConfigError> {
        let ordered = premarket_start <= premarket_end
            && premarket_end <= market_open
            && market_open < market_close
            && market_close <= afterhours_end;
        if !ordered {
            return Err(SessionConfigError::Unordered);
        }
        Ok(Self {
            premarket_start,
            premarket_end,
            market_open,
            market_close,
            afterhours_end,
        })
    }

    /// Parse an `HH:MM` boundary.
    ///
    /// # Errors
    ///
    /// Returns [`SessionConfigError::InvalidTime`] for anything else.
    pub fn parse_time(raw: &str) -> Result<NaiveTime, SessionConfigError> {
        NaiveTime::parse_from_str(raw.trim(), "%H:%M")
            .map_err(|_| SessionConfigError::InvalidTime(raw.to_string()))
    }

    /// Pre-market start.
    #[must_use]
    pub const fn premarket_start(&self) -> NaiveTime {
        self.premarket_start
    }

    /// Regular open.
    #[must_use]
    pub const fn market_open(&self) -> NaiveTime {
        self.market_open
    }

    /// Regular close.
    #[must_use]
    pub const fn market_close(&self) -> NaiveTime {
        self.market_close
    }
}

impl Default for SessionBoundaries {
    /// US equities: 04:00 / 09:30 / 09:30 / 16:00 / 20:00.
    fn default() -> Self {
        let hm = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN);
        Self {
            premarket_start: hm(4, 0),
            premarket_end: hm(9, 30),
            market_open: hm(9, 30),
            market_close: hm(16, 0),
            afterhours_end: hm(20, 0),
        }
    }
}

/// Session at an exchange-local instant. Pure and total.
#[must_use]
pub fn state(local: NaiveDateTime, boundaries: &SessionBoundaries) -> SessionState {
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return SessionState::Closed;
    }

    let t = local.time();
    let within = |start: NaiveTime, end: NaiveTime| start <= t && t < end;

    if within(boundaries.premarket_start, boundaries.premarket_end) {
        SessionState::PreMarket
    } else if within(boundaries.market_open, boundaries.market_close) {
        SessionState::Regular
    } else if within(boundaries.market_close, boundaries.afterhours_end) {
        SessionState::AfterHours
    } else {
        SessionState::Closed
    }
}

/// Backfill lookback for a given exchange-local weekday. Mondays reach back
/// at least three days so the previous Friday is covered.
#[must_use]
pub fn effective_lookback_days(requested: u32, today: Weekday) -> u32 {
    if today == Weekday::Mon {
        requested.max(3)
    } else {
        requested
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Session boundaries bound to an exchange timezone.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    boundaries: SessionBoundaries,
    timezone: Tz,
}

impl SessionClock {
    /// Create a clock.
    #[must_use]
    pub const fn new(boundaries: SessionBoundaries, timezone: Tz) -> Self {
        Self {
            boundaries,
            timezone,
        }
    }

    /// Parse an IANA timezone name.
    ///
    /// # Errors
    ///
    /// Returns [`SessionConfigError::UnknownTimezone`] if the name is unknown.
    pub fn parse_timezone(name: &str) -> Result<Tz, SessionConfigError> {
        name.trim()
            .parse::<Tz>()
            .map_err(|_| SessionConfigError::UnknownTimezone(name.to_string()))
    }

    /// Session at a UTC instant.
    #[must_use]
    pub fn state_at(&self, now: DateTime<Utc>) -> SessionState {
        state(self.local(now), &self.boundaries)
    }

    /// Exchange-local wall-clock time of a UTC instant.
    #[must_use]
    pub fn local(&self, now: DateTime<Utc>) -> NaiveDateTime {
        now.with_timezone(&self.timezone).naive_local()
    }

    /// Configured boundaries.
    #[must_use]
    pub const fn boundaries(&self) -> &SessionBoundaries {
        &self.boundaries
    }

    /// Exchange timezone.
    #[must_use]
    pub const fn timezone(&self) -> Tz {
        self.timezone
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new(SessionBoundaries::default(), chrono_tz::America::New_York)
    }
}
