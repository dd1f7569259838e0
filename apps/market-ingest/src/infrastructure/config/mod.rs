//! Configuration Module
//!
//! Environment-driven configuration for the ingest service.

mod settings;

pub use settings::{
    AlpacaSettings, ConfigError, Credentials, DataFeed, IngestConfig, LiveSettings,
    ScreeningSettings, SessionSettings, StoreSettings,
};
