//! JSON text framing used by the WebSocket adapter.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ack::AckResponse;

/// Client → server frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    /// Present when the client wants an acknowledgment.
    #[serde(default)]
    pub ack_id: Option<u64>,
}

/// Server → client frame.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundFrame<'a> {
    Event {
        event: &'a str,
        data: &'a Value,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        ack_id: u64,
        data: &'a AckResponse,
    },
    Error {
        message: &'a str,
    },
}

impl OutboundFrame<'_> {
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize outbound frame");
                None
            }
        }
    }
}

pub fn parse_inbound(text: &str) -> Result<InboundFrame, serde_json::Error> {
    serde_json::from_str(text)
}
