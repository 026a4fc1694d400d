//! Inbound auction events and their listener registries
//!
//! This module provides:
//! - Wire types for the hub's server-to-client methods
//! - A token-keyed, individually revocable handler registry
//! - The dispatcher shared by the connection manager and its consumers

mod dispatcher;
mod types;

pub use dispatcher::{EventDispatcher, HandlerRegistry, Registration};
pub use types::{AuctionClosedEvent, AuctionStatus, BidUpdateEvent, ItemId};
