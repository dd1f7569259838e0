//! Application Ports (Driven)
//!
//! Narrow interfaces to the external collaborators. Infrastructure adapters
//! implement these; services only ever see the traits.

mod bar_store_port;
mod historical_ingestion_port;
mod market_data_port;
mod screener_port;

pub use bar_store_port::{BarStore, StoreError, TimeRange};
pub use historical_ingestion_port::{HistoricalIngestion, IngestionError};
pub use market_data_port::{
    BarSender, BarSubscription, HistoricalBarSource, MarketDataError, MarketDataSource,
    SubscriptionId, bar_channel,
};
pub use screener_port::{Screener, ScreenerError};

#[cfg(test)]
pub use bar_store_port::MockBarStore;
#[cfg(test)]
pub use historical_ingestion_port::MockHistoricalIngestion;
#[cfg(test)]
pub use market_data_port::MockHistoricalBarSource;
#[cfg(test)]
pub use screener_port::MockScreener;
