//! Connection statistics

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ConnectionState;

/// Point-in-time view of the hub connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub interest_count: usize,
    /// Successful transport-level reconnections since creation
    pub reconnections: u64,
    pub resync_failures: u64,
    /// When the current connection first reached `Connected`
    pub connected_since: Option<DateTime<Utc>>,
}
