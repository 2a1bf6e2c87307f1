//! Protocol message definitions
//!
//! Defines the JSON messages exchanged over a bridge connection. Close frames
//! themselves are WebSocket control frames; the `close` message only asks the
//! server to start a close handshake with a given status.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::close::{CloseStatus, StatusError};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid close status: {0}")]
    InvalidCloseStatus(#[from] StatusError),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Connection keepalive ping
    Ping {
        /// Sequence number for tracking round-trip time
        seq: u64,
    },

    /// Ask the server to close the connection
    Close {
        /// Close code to send (default: 1000)
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        /// Close reason to send
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ClientMessage {
    /// Parse and validate a client message from JSON
    pub fn parse(json: &str) -> ProtocolResult<Self> {
        let message: Self = serde_json::from_str(json)?;
        message.validate()?;
        Ok(message)
    }

    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::Ping { .. } => Ok(()),
            ClientMessage::Close { .. } => self.close_status().map(|_| ()),
        }
    }

    /// Close status requested by a `close` message, `None` for other messages
    pub fn close_status(&self) -> ProtocolResult<Option<CloseStatus>> {
        match self {
            ClientMessage::Close { code, reason } => {
                let status = CloseStatus::new(
                    code.unwrap_or(CloseStatus::NORMAL),
                    reason.clone().unwrap_or_default(),
                )?;
                Ok(Some(status))
            }
            _ => Ok(None),
        }
    }

    /// Create a Ping message
    pub fn ping(seq: u64) -> Self {
        ClientMessage::Ping { seq }
    }

    /// Create a Close message
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        ClientMessage::Close {
            code: Some(code),
            reason: Some(reason.into()),
        }
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Welcome message sent on connection
    Welcome {
        /// Server protocol version
        version: u32,
        /// Identifier the registry assigned to this connection
        connection_id: Uuid,
        /// Closing timeout in milliseconds (-1 disabled, 0 immediate)
        closing_timeout_ms: i64,
    },

    /// Response to Ping
    Pong {
        /// Echo back the sequence number
        seq: u64,
    },

    /// Error response
    Error {
        /// Error message
        message: String,
        /// Error code for programmatic handling
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid message format
    InvalidMessage,
    /// Close code or reason cannot be sent
    InvalidCloseStatus,
    /// Internal server error
    InternalError,
}

impl ServerMessage {
    /// Create a Welcome message
    pub fn welcome(connection_id: Uuid, closing_timeout_ms: i64) -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            connection_id,
            closing_timeout_ms,
        }
    }

    /// Create a Pong message
    pub fn pong(seq: u64) -> Self {
        ServerMessage::Pong { seq }
    }

    /// Create an Error message with code
    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a server message from JSON (primarily for testing)
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::SerializationError(_) => ErrorCode::InvalidMessage,
            ProtocolError::InvalidCloseStatus(_) => ErrorCode::InvalidCloseStatus,
        };
        ServerMessage::error_with_code(err.to_string(), code)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // Client Message Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_ping_serialization() {
        let msg = ClientMessage::ping(42);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"ping\""));
        assert!(json.contains("\"seq\":42"));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_close_serialization() {
        let msg = ClientMessage::close(4000, "done");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"close\""));
        assert!(json.contains("\"code\":4000"));
        assert!(json.contains("\"reason\":\"done\""));
    }

    #[test]
    fn test_parse_minimal_close() {
        let msg = ClientMessage::parse(r#"{"type": "close"}"#).unwrap();
        let status = msg.close_status().unwrap().unwrap();
        assert_eq!(status, CloseStatus::normal());
    }

    #[test]
    fn test_parse_close_with_reserved_code() {
        let result = ClientMessage::parse(r#"{"type": "close", "code": 1005}"#);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidCloseStatus(StatusError::InvalidCode(1005)))
        ));
    }

    #[test]
    fn test_parse_unknown_type() {
        let result = ClientMessage::parse(r#"{"type": "spawn"}"#);
        assert!(matches!(result, Err(ProtocolError::SerializationError(_))));
    }

    #[test]
    fn test_ping_has_no_close_status() {
        assert_eq!(ClientMessage::ping(1).close_status().unwrap(), None);
    }

    // -------------------------------------------------------------------------
    // Server Message Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_welcome_serialization() {
        let id = Uuid::new_v4();
        let msg = ServerMessage::welcome(id, 10_000);
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"welcome\""));
        assert!(json.contains(&format!("\"version\":{}", PROTOCOL_VERSION)));
        assert!(json.contains("\"closing_timeout_ms\":10000"));

        assert_eq!(ServerMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_pong_serialization() {
        let json = ServerMessage::pong(7).to_json().unwrap();
        assert_eq!(json, r#"{"type":"pong","seq":7}"#);
    }

    // -------------------------------------------------------------------------
    // Error Conversion Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_protocol_error_to_server_message() {
        let err = ProtocolError::InvalidCloseStatus(StatusError::InvalidCode(1006));
        let msg: ServerMessage = err.into();

        match msg {
            ServerMessage::Error { message, code } => {
                assert!(message.contains("1006"));
                assert_eq!(code, Some(ErrorCode::InvalidCloseStatus));
            }
            _ => panic!("Expected Error message"),
        }
    }
}
