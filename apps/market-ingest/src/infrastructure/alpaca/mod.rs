//! Alpaca Market Data Adapters
//!
//! - **Live bars**: one shared WebSocket connection to the stock stream
//!   (JSON codec), implementing the live market-data port
//! - **Historical bars**: REST client for the bars endpoint, implementing
//!   the historical-bar port

pub mod auth;
pub mod codec;
pub mod heartbeat;
pub mod historical;
pub mod messages;
pub mod stream;

pub use auth::{AuthError, AuthHandler, AuthState, AuthStep};
pub use codec::{CodecError, JsonCodec};
pub use heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
pub use historical::AlpacaHistoricalClient;
pub use stream::{AlpacaBarStream, BarStreamConfig, ConnectionState, LIVE_RESOLUTION};
