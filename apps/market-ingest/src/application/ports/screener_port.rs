//! Screener Port (Driven Port)
//!
//! Produces a ranked symbol list for a market session.

use async_trait::async_trait;

use crate::domain::session::ScreeningKind;
use crate::domain::watchlist::ScreenedSymbol;

/// Screening failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScreenerError {
    /// Transport failure or non-success status.
    #[error("screener request failed: {message}")]
    Request {
        /// Error details.
        message: String,
    },

    /// Response body could not be interpreted.
    #[error("screener returned an invalid response: {message}")]
    InvalidResponse {
        /// Error details.
        message: String,
    },
}

/// Port for the external screening service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Screener: Send + Sync {
    /// Ranked results, best first. Symbols are already parsed; rows the
    /// adapter could not parse are dropped before this returns.
    async fn screen(&self, kind: ScreeningKind) -> Result<Vec<ScreenedSymbol>, ScreenerError>;
}
