// Shared infrastructure
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Realtime core
pub mod clock;
pub mod connection_manager;
pub mod events;
pub mod websocket;

// Supporting modules
pub mod shutdown;

pub use clock::ClockOffsetEstimator;
pub use connection_manager::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use error::{RealtimeError, Result};
pub use events::{AuctionClosedEvent, BidUpdateEvent, ItemId};
