use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::clock::parse_server_timestamp;

/// Auction item identifier as used by the REST API and the hub
pub type ItemId = i64;

/// One accepted bid, pushed by the hub as `ReceiveBidUpdate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidUpdateEvent {
    #[serde(rename = "auctionItemId")]
    pub item_id: ItemId,
    pub current_price: f64,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub end_time: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub bid_time: DateTime<Utc>,
    pub bid_id: i64,
    #[serde(rename = "currentHighestBidUserId")]
    pub highest_bidder_id: i64,
    #[serde(rename = "currentHighestBidUserName")]
    pub highest_bidder_name: String,
}

/// Terminal event for an item, pushed by the hub as `ReceiveAuctionClosed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionClosedEvent {
    #[serde(alias = "auctionItemId")]
    pub item_id: ItemId,
    pub final_price: f64,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub end_time: DateTime<Utc>,
    pub status: AuctionStatus,
    #[serde(default)]
    pub winner_id: Option<i64>,
}

/// Auction lifecycle status. Sent as a numeric code by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "StatusRepr", into = "i64")]
pub enum AuctionStatus {
    Preparing,
    Active,
    Ended,
}

impl AuctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionStatus::Preparing => "preparing",
            AuctionStatus::Active => "active",
            AuctionStatus::Ended => "ended",
        }
    }
}

impl From<AuctionStatus> for i64 {
    fn from(status: AuctionStatus) -> Self {
        match status {
            AuctionStatus::Preparing => 0,
            AuctionStatus::Active => 1,
            AuctionStatus::Ended => 2,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StatusRepr {
    Code(i64),
    Name(String),
}

impl TryFrom<StatusRepr> for AuctionStatus {
    type Error = String;

    fn try_from(repr: StatusRepr) -> Result<Self, Self::Error> {
        match repr {
            StatusRepr::Code(0) => Ok(AuctionStatus::Preparing),
            StatusRepr::Code(1) => Ok(AuctionStatus::Active),
            StatusRepr::Code(2) => Ok(AuctionStatus::Ended),
            StatusRepr::Code(other) => Err(format!("unknown auction status code {}", other)),
            StatusRepr::Name(name) => match name.to_ascii_lowercase().as_str() {
                "preparing" => Ok(AuctionStatus::Preparing),
                "active" => Ok(AuctionStatus::Active),
                "ended" => Ok(AuctionStatus::Ended),
                _ => Err(format!("unknown auction status '{}'", name)),
            },
        }
    }
}

/// Hub timestamps may come without an offset; those are UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_server_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw)))
}
