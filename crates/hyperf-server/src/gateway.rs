//! Outbound delivery: targeted sends, acknowledgments and fan-out broadcasts.

use std::sync::Arc;

use hyperf_core::ConnectionId;
use serde_json::Value;
use tracing::{debug, warn};

use crate::ack::AckResponse;
use crate::connection::ConnectionRegistry;
use crate::protocol::OutboundFrame;

/// Cheap-to-clone handle for pushing frames to connections.
///
/// Every operation is best-effort: a connection that is gone or backed up
/// is skipped and logged, never reported as an error to the caller.
#[derive(Clone)]
pub struct Gateway {
    connections: Arc<ConnectionRegistry>,
}

impl Gateway {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self { connections }
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Send one event to one connection.
    pub fn send(&self, connection_id: &ConnectionId, event: &str, payload: &Value) -> bool {
        let Some(json) = (OutboundFrame::Event { event, data: payload }).to_json() else {
            return false;
        };
        let delivered = self.connections.send_to(connection_id, json);
        if !delivered {
            debug!(connection_id = %connection_id, event, "event not delivered");
        }
        delivered
    }

    /// Deliver an acknowledgment frame for `ack_id`.
    pub fn send_ack(&self, connection_id: &ConnectionId, ack_id: u64, response: &AckResponse) -> bool {
        let Some(json) = (OutboundFrame::Ack { ack_id, data: response }).to_json() else {
            return false;
        };
        self.connections.send_to(connection_id, json)
    }

    pub fn send_error(&self, connection_id: &ConnectionId, message: &str) -> bool {
        let Some(json) = (OutboundFrame::Error { message }).to_json() else {
            return false;
        };
        self.connections.send_to(connection_id, json)
    }

    /// Send `event` to every live connection except `exclude`.
    ///
    /// Returns how many connections accepted the frame.
    pub fn broadcast(&self, event: &str, payload: &Value, exclude: Option<&ConnectionId>) -> usize {
        let Some(json) = (OutboundFrame::Event { event, data: payload }).to_json() else {
            return 0;
        };

        let mut delivered = 0;
        let mut recipients = 0;
        for connection in self.connections.connections() {
            if exclude == Some(&connection.id) {
                continue;
            }
            recipients += 1;
            if self.connections.send_to(&connection.id, json.clone()) {
                delivered += 1;
            } else {
                warn!(connection_id = %connection.id, event, "failed to deliver broadcast");
            }
        }
        debug!(event, recipients, delivered, "broadcast event");
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.connections.count()
    }
}
