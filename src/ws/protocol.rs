//! Client protocol carried inside named packets
//! These are the payload types for client-server communication

use serde::{Deserialize, Serialize};

use crate::net::pool::ConnectionId;
use crate::net::{Packet, TransportError};
use crate::replication::RecordId;

/// Server -> client message names
pub const WELCOME: &str = "welcome";
pub const SNAPSHOT: &str = "snapshot";
pub const EVENT: &str = "event";
pub const PONG: &str = "pong";
pub const ERROR: &str = "error";

/// Client -> server message names
pub const ACK: &str = "ack";
pub const INPUT_BUFFER: &str = "input_buffer";
pub const PING: &str = "ping";

/// Request type clients use to report a prediction correction
pub const REPORT_CORRECTION: &str = "report_correction";

/// Welcome message after connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub connection_id: ConnectionId,
    pub server_time: u64,
    pub tick_rate: u32,
}

/// Error message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub code: String,
    pub message: String,
}

impl ErrorMsg {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Pong response
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    /// Echo back client timestamp
    pub t: u64,
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    /// Client has applied the snapshot for `tick`; it becomes the delta base
    Ack { tick: u64 },
    /// Inputs the client is holding for reconciliation
    InputBuffer { depth: usize },
    /// Ping for latency measurement
    Ping { t: u64 },
}

#[derive(Deserialize)]
struct AckBody {
    tick: u64,
}

#[derive(Deserialize)]
struct InputBufferBody {
    depth: usize,
}

#[derive(Deserialize)]
struct PingBody {
    t: u64,
}

impl ClientMsg {
    /// Interpret a named packet. `Ok(None)` for names this protocol does not use.
    pub fn from_packet(packet: &Packet) -> Result<Option<Self>, TransportError> {
        let msg = match packet.name() {
            Some(ACK) => {
                let body: AckBody = packet.decode_data()?;
                Self::Ack { tick: body.tick }
            }
            Some(INPUT_BUFFER) => {
                let body: InputBufferBody = packet.decode_data()?;
                Self::InputBuffer { depth: body.depth }
            }
            Some(PING) => {
                let body: PingBody = packet.decode_data()?;
                Self::Ping { t: body.t }
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

/// Payload of a `report_correction` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionReport {
    pub player_id: RecordId,
    pub predicted: Vec<f64>,
    pub actual: Vec<f64>,
    pub magnitude: f64,
}

/// Answer to a `report_correction` request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectionAck {
    pub server_tick: u64,
    pub accepted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_parse_by_name() {
        let ack = Packet::message(ACK, &json!({ "tick": 12 })).unwrap();
        assert_eq!(
            ClientMsg::from_packet(&ack).unwrap(),
            Some(ClientMsg::Ack { tick: 12 })
        );

        let depth = Packet::message(INPUT_BUFFER, &json!({ "depth": 3 })).unwrap();
        assert_eq!(
            ClientMsg::from_packet(&depth).unwrap(),
            Some(ClientMsg::InputBuffer { depth: 3 })
        );

        let other = Packet::message("chat", &json!("hi")).unwrap();
        assert_eq!(ClientMsg::from_packet(&other).unwrap(), None);
    }

    #[test]
    fn malformed_body_is_an_error() {
        let bad = Packet::message(PING, &json!({ "t": "soon" })).unwrap();
        assert!(ClientMsg::from_packet(&bad).is_err());
    }
}
