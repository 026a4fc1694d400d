//! Hub connection lifecycle and interest tracking

mod manager;
mod stats;
mod types;

pub use manager::ConnectionManager;
pub use stats::ConnectionStats;
pub use types::{ConnectionEvent, ConnectionState, InterestSet};
