//! Connection state, connection events and the tracked interest set

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::events::ItemId;

/// Lifecycle state of the hub connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    /// Numeric code exported through the connection state gauge
    pub fn as_code(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
        }
    }

    /// Whether listeners hear about transitions into this state
    pub fn is_observable(&self) -> bool {
        !matches!(self, ConnectionState::Connecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivered to `on_state_change` listeners
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    StateChanged {
        state: ConnectionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Replaying the interest set after a reconnection failed. The
    /// connection itself stays up.
    ResyncFailed { item_ids: Vec<ItemId>, error: String },
}

impl ConnectionEvent {
    pub fn state(&self) -> Option<ConnectionState> {
        match self {
            ConnectionEvent::StateChanged { state, .. } => Some(*state),
            ConnectionEvent::ResyncFailed { .. } => None,
        }
    }
}

/// Item ids the client currently watches.
///
/// Ordered so that replays are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterestSet {
    items: BTreeSet<ItemId>,
}

impl InterestSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the id was not tracked before
    pub fn subscribe(&mut self, item_id: ItemId) -> bool {
        self.items.insert(item_id)
    }

    /// Returns `true` if the id was tracked
    pub fn unsubscribe(&mut self, item_id: ItemId) -> bool {
        self.items.remove(&item_id)
    }

    pub fn replace_all<I>(&mut self, item_ids: I)
    where
        I: IntoIterator<Item = ItemId>,
    {
        self.items = item_ids.into_iter().collect();
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn contains(&self, item_id: ItemId) -> bool {
        self.items.contains(&item_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_vec(&self) -> Vec<ItemId> {
        self.items.iter().copied().collect()
    }
}

impl FromIterator<ItemId> for InterestSet {
    fn from_iter<I: IntoIterator<Item = ItemId>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}
