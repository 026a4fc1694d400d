//! Push transport: the JSON hub protocol over WebSocket

mod backoff;
mod client;
mod message;
mod transport;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use client::{TransportOptions, WebSocketConnector, WebSocketLink};
pub use message::{
    encode_handshake, parse_frames, split_handshake, HandshakeResponse, HubCommand, HubMessage,
    RECEIVE_AUCTION_CLOSED, RECEIVE_BID_UPDATE, RECORD_SEPARATOR,
};
pub use transport::{HubConnector, HubLink, LinkEvent, LinkHandle};
