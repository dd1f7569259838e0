//! PostgreSQL / TimescaleDB bar store.
//!
//! Bars live in `ohlcv_bars`, keyed by `(symbol, timeframe, ts)`. Writes are
//! bulk `INSERT ... ON CONFLICT DO UPDATE`, so a repeated bar overwrites the
//! stored row instead of duplicating it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info, warn};

use crate::application::ports::{BarStore, StoreError, TimeRange};
use crate::domain::market::{Bar, Indicators, Resolution, Symbol};

const COLUMNS: &str = "symbol, timeframe, ts, open, high, low, close, volume, trade_count, vwap, \
     sma_20, sma_50, ema_12, ema_26, rsi_14, macd, macd_signal, macd_histogram, \
     bb_upper, bb_middle, bb_lower";

const CREATE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS ohlcv_bars (
    symbol          TEXT             NOT NULL,
    timeframe       TEXT             NOT NULL,
    ts              TIMESTAMPTZ      NOT NULL,
    open            NUMERIC          NOT NULL,
    high            NUMERIC          NOT NULL,
    low             NUMERIC          NOT NULL,
    close           NUMERIC          NOT NULL,
    volume          BIGINT           NOT NULL,
    trade_count     BIGINT,
    vwap            NUMERIC,
    sma_20          DOUBLE PRECISION,
    sma_50          DOUBLE PRECISION,
    ema_12          DOUBLE PRECISION,
    ema_26          DOUBLE PRECISION,
    rsi_14          DOUBLE PRECISION,
    macd            DOUBLE PRECISION,
    macd_signal     DOUBLE PRECISION,
    macd_histogram  DOUBLE PRECISION,
    bb_upper        DOUBLE PRECISION,
    bb_middle       DOUBLE PRECISION,
    bb_lower        DOUBLE PRECISION,
    PRIMARY KEY (symbol, timeframe, ts)
)";

const CREATE_HYPERTABLE: &str =
    "SELECT create_hypertable('ohlcv_bars', 'ts', if_not_exists => TRUE, migrate_data => TRUE)";

/// Indicator columns overwritten on conflict only when the new row has them,
/// so a live bar never erases indicators written by backfill.
const INDICATOR_COLUMNS: [&str; 11] = [
    "sma_20",
    "sma_50",
    "ema_12",
    "ema_26",
    "rsi_14",
    "macd",
    "macd_signal",
    "macd_histogram",
    "bb_upper",
    "bb_middle",
    "bb_lower",
];

/// `sqlx` implementation of [`BarStore`].
#[derive(Debug, Clone)]
pub struct PostgresBarStore {
    pool: PgPool,
}

impl PostgresBarStore {
    /// Connect a pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the database is unreachable.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|e| StoreError::Connection {
                message: e.to_string(),
            })?;
        info!(max_connections, "Connected to bar store");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create `ohlcv_bars` if missing and, when TimescaleDB is installed,
    /// turn it into a hypertable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the table cannot be created.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(query_error)?;

        match sqlx::query(CREATE_HYPERTABLE).execute(&self.pool).await {
            Ok(_) => debug!("ohlcv_bars is a hypertable"),
            Err(e) => warn!(error = %e, "TimescaleDB unavailable, using a plain table"),
        }
        Ok(())
    }
}

fn query_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_) => {
            StoreError::Connection {
                message: e.to_string(),
            }
        }
        other => StoreError::Query {
            message: other.to_string(),
        },
    }
}

/// Bind parameters per upserted row.
const BINDS_PER_ROW: usize = 10 + INDICATOR_COLUMNS.len();

/// Rows per statement under the protocol's 65535 bind parameter limit.
const MAX_ROWS_PER_STATEMENT: usize = 65_535 / BINDS_PER_ROW;

fn upsert_chunks(bars: &[Bar]) -> std::slice::Chunks<'_, Bar> {
    bars.chunks(MAX_ROWS_PER_STATEMENT)
}

fn upsert_query(bars: &[Bar]) -> QueryBuilder<'_, Postgres> {
    let mut builder = QueryBuilder::new(format!("INSERT INTO ohlcv_bars ({COLUMNS}) "));
    builder.push_values(bars, |mut row, bar| {
        let ind = bar.indicators.unwrap_or_default();
        row.push_bind(bar.symbol.as_str())
            .push_bind(bar.resolution.as_str())
            .push_bind(bar.timestamp)
            .push_bind(bar.open)
            .push_bind(bar.high)
            .push_bind(bar.low)
            .push_bind(bar.close)
            .push_bind(i64::try_from(bar.volume).unwrap_or(i64::MAX))
            .push_bind(bar.trade_count.map(|n| i64::try_from(n).unwrap_or(i64::MAX)))
            .push_bind(bar.vwap)
            .push_bind(ind.sma_20)
            .push_bind(ind.sma_50)
            .push_bind(ind.ema_12)
            .push_bind(ind.ema_26)
            .push_bind(ind.rsi_14)
            .push_bind(ind.macd)
            .push_bind(ind.macd_signal)
            .push_bind(ind.macd_histogram)
            .push_bind(ind.bb_upper)
            .push_bind(ind.bb_middle)
            .push_bind(ind.bb_lower);
    });
    builder.push(
        " ON CONFLICT (symbol, timeframe, ts) DO UPDATE SET \
         open = EXCLUDED.open, high = EXCLUDED.high, low = EXCLUDED.low, \
         close = EXCLUDED.close, volume = EXCLUDED.volume, \
         trade_count = EXCLUDED.trade_count, vwap = EXCLUDED.vwap",
    );
    for column in INDICATOR_COLUMNS {
        builder.push(format!(
            ", {column} = COALESCE(EXCLUDED.{column}, ohlcv_bars.{column})"
        ));
    }
    builder
}

fn decode_row(row: &PgRow) -> Result<Bar, sqlx::Error> {
    let decode = |column: &str, message: String| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: message.into(),
    };

    let symbol: String = row.try_get("symbol")?;
    let timeframe: String = row.try_get("timeframe")?;
    let volume: i64 = row.try_get("volume")?;
    let trade_count: Option<i64> = row.try_get("trade_count")?;

    let indicators = Indicators {
        sma_20: row.try_get("sma_20")?,
        sma_50: row.try_get("sma_50")?,
        ema_12: row.try_get("ema_12")?,
        ema_26: row.try_get("ema_26")?,
        rsi_14: row.try_get("rsi_14")?,
        macd: row.try_get("macd")?,
        macd_signal: row.try_get("macd_signal")?,
        macd_histogram: row.try_get("macd_histogram")?,
        bb_upper: row.try_get("bb_upper")?,
        bb_middle: row.try_get("bb_middle")?,
        bb_lower: row.try_get("bb_lower")?,
    };

    Ok(Bar {
        symbol: Symbol::parse(&symbol).map_err(|e| decode("symbol", e.to_string()))?,
        resolution: timeframe
            .parse::<Resolution>()
            .map_err(|e| decode("timeframe", e.to_string()))?,
        timestamp: row.try_get("ts")?,
        open: row.try_get::<Decimal, _>("open")?,
        high: row.try_get("high")?,
        low: row.try_get("low")?,
        close: row.try_get("close")?,
        volume: u64::try_from(volume).map_err(|e| decode("volume", e.to_string()))?,
        trade_count: trade_count
            .map(u64::try_from)
            .transpose()
            .map_err(|e| decode("trade_count", e.to_string()))?,
        vwap: row.try_get("vwap")?,
        indicators: (indicators != Indicators::default()).then_some(indicators),
    })
}

#[async_trait]
impl BarStore for PostgresBarStore {
    async fn upsert(&self, bars: &[Bar]) -> Result<(), StoreError> {
        if bars.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(query_error)?;
        for chunk in upsert_chunks(bars) {
            upsert_query(chunk)
                .build()
                .execute(&mut *tx)
                .await
                .map_err(query_error)?;
        }
        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn query(
        &self,
        symbol: &Symbol,
        resolution: Resolution,
        range: TimeRange,
    ) -> Result<Vec<Bar>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM ohlcv_bars \
             WHERE symbol = $1 AND timeframe = $2 AND ts >= $3 AND ts < $4 \
             ORDER BY ts"
        ))
        .bind(symbol.as_str())
        .bind(resolution.as_str())
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(decode_row)
            .collect::<Result<_, _>>()
            .map_err(query_error)
    }

    async fn latest_timestamp(
        &self,
        symbol: &Symbol,
        resolution: Resolution,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT max(ts) FROM ohlcv_bars WHERE symbol = $1 AND timeframe = $2",
        )
        .bind(symbol.as_str())
        .bind(resolution.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(query_error)
    }
}
