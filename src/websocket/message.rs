//! JSON hub protocol framing.
//!
//! Every message is a JSON object terminated by the record separator
//! (`0x1E`). A single WebSocket text frame may carry several records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RealtimeError, Result};
use crate::events::ItemId;

pub const RECORD_SEPARATOR: char = '\u{1e}';

const PROTOCOL_NAME: &str = "json";
const PROTOCOL_VERSION: u32 = 1;

// Message type codes
const TYPE_INVOCATION: u8 = 1;
const TYPE_COMPLETION: u8 = 3;
const TYPE_PING: u8 = 6;
const TYPE_CLOSE: u8 = 7;

/// Server-to-client hub methods
pub const RECEIVE_BID_UPDATE: &str = "ReceiveBidUpdate";
pub const RECEIVE_AUCTION_CLOSED: &str = "ReceiveAuctionClosed";

#[derive(Debug, Serialize)]
struct HandshakeRequest<'a> {
    protocol: &'a str,
    version: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
}

/// Handshake record the client sends right after the socket opens
pub fn encode_handshake() -> String {
    let request = HandshakeRequest {
        protocol: PROTOCOL_NAME,
        version: PROTOCOL_VERSION,
    };
    // Serializing two plain fields cannot fail
    let mut frame = serde_json::to_string(&request).unwrap_or_default();
    frame.push(RECORD_SEPARATOR);
    frame
}

/// Split the handshake response off the front of `buffer`.
///
/// Returns `Ok(None)` while the record is incomplete, otherwise the parsed
/// response and whatever followed it in the same buffer.
pub fn split_handshake(buffer: &str) -> Result<Option<(HandshakeResponse, &str)>> {
    let Some(end) = buffer.find(RECORD_SEPARATOR) else {
        return Ok(None);
    };

    let response: HandshakeResponse = serde_json::from_str(&buffer[..end])
        .map_err(|e| RealtimeError::handshake(format!("invalid handshake response: {}", e)))?;
    let rest = &buffer[end + RECORD_SEPARATOR.len_utf8()..];

    Ok(Some((response, rest)))
}

/// Commands the client invokes on the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubCommand {
    SubscribeItem(ItemId),
    UnsubscribeItem(ItemId),
    SetVisibleItems(Vec<ItemId>),
}

impl HubCommand {
    /// Hub method name
    pub fn target(&self) -> &'static str {
        match self {
            HubCommand::SubscribeItem(_) => "SubscribeItem",
            HubCommand::UnsubscribeItem(_) => "UnsubscribeItem",
            HubCommand::SetVisibleItems(_) => "SetVisibleItems",
        }
    }

    pub fn arguments(&self) -> Vec<Value> {
        match self {
            HubCommand::SubscribeItem(id) | HubCommand::UnsubscribeItem(id) => {
                vec![Value::from(*id)]
            }
            HubCommand::SetVisibleItems(ids) => {
                vec![Value::Array(ids.iter().map(|id| Value::from(*id)).collect())]
            }
        }
    }
}

/// Messages exchanged after the handshake
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Stream messages and anything newer than this client understands
    Other(u8),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHubMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

impl HubMessage {
    /// Invocation of `command` that expects a completion for `invocation_id`
    pub fn invocation(invocation_id: impl Into<String>, command: &HubCommand) -> Self {
        HubMessage::Invocation {
            invocation_id: Some(invocation_id.into()),
            target: command.target().to_string(),
            arguments: command.arguments(),
        }
    }

    /// Serialize into a single record, separator included
    pub fn to_frame(&self) -> Result<String> {
        let raw = match self {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => RawHubMessage {
                kind: TYPE_INVOCATION,
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..Default::default()
            },
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => RawHubMessage {
                kind: TYPE_COMPLETION,
                invocation_id: Some(invocation_id.clone()),
                result: result.clone(),
                error: error.clone(),
                ..Default::default()
            },
            HubMessage::Ping => RawHubMessage {
                kind: TYPE_PING,
                ..Default::default()
            },
            HubMessage::Close {
                error,
                allow_reconnect,
            } => RawHubMessage {
                kind: TYPE_CLOSE,
                error: error.clone(),
                allow_reconnect: Some(*allow_reconnect),
                ..Default::default()
            },
            HubMessage::Other(kind) => {
                return Err(RealtimeError::Protocol(format!(
                    "cannot encode message type {}",
                    kind
                )))
            }
        };

        let mut frame = serde_json::to_string(&raw)?;
        frame.push(RECORD_SEPARATOR);
        Ok(frame)
    }

    fn from_raw(raw: RawHubMessage) -> Result<Self> {
        match raw.kind {
            TYPE_INVOCATION => {
                let target = raw.target.ok_or_else(|| {
                    RealtimeError::Protocol("invocation without target".to_string())
                })?;
                Ok(HubMessage::Invocation {
                    invocation_id: raw.invocation_id,
                    target,
                    arguments: raw.arguments.unwrap_or_default(),
                })
            }
            TYPE_COMPLETION => {
                let invocation_id = raw.invocation_id.ok_or_else(|| {
                    RealtimeError::Protocol("completion without invocationId".to_string())
                })?;
                Ok(HubMessage::Completion {
                    invocation_id,
                    result: raw.result,
                    error: raw.error,
                })
            }
            TYPE_PING => Ok(HubMessage::Ping),
            TYPE_CLOSE => Ok(HubMessage::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(false),
            }),
            other => Ok(HubMessage::Other(other)),
        }
    }

    pub fn parse(record: &str) -> Result<Self> {
        let raw: RawHubMessage = serde_json::from_str(record)?;
        Self::from_raw(raw)
    }
}

/// Parse every record in a text frame. Empty records are skipped.
pub fn parse_frames(text: &str) -> Vec<Result<HubMessage>> {
    text.split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
        .map(HubMessage::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handshake_encoding() {
        let frame = encode_handshake();
        assert!(frame.ends_with(RECORD_SEPARATOR));
        let body: Value = serde_json::from_str(frame.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(body, json!({"protocol": "json", "version": 1}));
    }

    #[test]
    fn test_split_handshake_with_trailing_records() {
        let buffer = "{}\u{1e}{\"type\":6}\u{1e}";
        let (response, rest) = split_handshake(buffer).unwrap().unwrap();
        assert!(response.error.is_none());
        assert_eq!(rest, "{\"type\":6}\u{1e}");
    }

    #[test]
    fn test_split_handshake_incomplete_and_error() {
        assert!(split_handshake("{").unwrap().is_none());

        let (response, _) = split_handshake("{\"error\":\"unsupported protocol\"}\u{1e}")
            .unwrap()
            .unwrap();
        assert_eq!(response.error.as_deref(), Some("unsupported protocol"));

        assert!(split_handshake("nope\u{1e}").is_err());
    }

    #[test]
    fn test_command_arguments() {
        assert_eq!(HubCommand::SubscribeItem(42).arguments(), vec![json!(42)]);
        assert_eq!(
            HubCommand::SetVisibleItems(vec![1, 2, 3]).arguments(),
            vec![json!([1, 2, 3])]
        );
        assert_eq!(HubCommand::UnsubscribeItem(7).target(), "UnsubscribeItem");
    }

    #[test]
    fn test_invocation_frame_layout() {
        let frame = HubMessage::invocation("5", &HubCommand::SubscribeItem(42))
            .to_frame()
            .unwrap();
        let body: Value = serde_json::from_str(frame.trim_end_matches(RECORD_SEPARATOR)).unwrap();

        assert_eq!(
            body,
            json!({
                "type": 1,
                "invocationId": "5",
                "target": "SubscribeItem",
                "arguments": [42]
            })
        );
    }

    #[test]
    fn test_ping_frame_is_minimal() {
        assert_eq!(HubMessage::Ping.to_frame().unwrap(), "{\"type\":6}\u{1e}");
    }

    #[test]
    fn test_parse_multiple_records() {
        let text = concat!(
            "{\"type\":1,\"target\":\"ReceiveBidUpdate\",\"arguments\":[{\"auctionItemId\":1}]}\u{1e}",
            "{\"type\":3,\"invocationId\":\"2\",\"error\":\"Item not found\"}\u{1e}",
            "{\"type\":6}\u{1e}",
            "{\"type\":7,\"error\":\"shutting down\",\"allowReconnect\":true}\u{1e}",
            "{\"type\":2,\"invocationId\":\"9\",\"item\":1}\u{1e}"
        );

        let messages: Vec<HubMessage> = parse_frames(text)
            .into_iter()
            .map(|m| m.unwrap())
            .collect();

        assert_eq!(messages.len(), 5);
        assert!(matches!(
            &messages[0],
            HubMessage::Invocation { invocation_id: None, target, .. } if target == "ReceiveBidUpdate"
        ));
        assert_eq!(
            messages[1],
            HubMessage::Completion {
                invocation_id: "2".to_string(),
                result: None,
                error: Some("Item not found".to_string()),
            }
        );
        assert_eq!(messages[2], HubMessage::Ping);
        assert_eq!(
            messages[3],
            HubMessage::Close {
                error: Some("shutting down".to_string()),
                allow_reconnect: true,
            }
        );
        assert_eq!(messages[4], HubMessage::Other(2));
    }

    #[test]
    fn test_parse_rejects_malformed_records() {
        let results = parse_frames("{\"type\":1}\u{1e}not json\u{1e}{\"type\":3}\u{1e}");
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_err()));
    }
}
