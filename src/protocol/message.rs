//! Wire envelope exchanged between agents and the orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConductorError, Result};

/// Receiver id that addresses every connected peer
pub const BROADCAST: &str = "broadcast";

/// Message types understood by the protocol layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    StatusUpdate,
    Coordination,
    Heartbeat,
    Error,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::TaskRequest => "task_request",
            Self::TaskResponse => "task_response",
            Self::StatusUpdate => "status_update",
            Self::Coordination => "coordination",
            Self::Heartbeat => "heartbeat",
            Self::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Typed envelope carried over a channel.
///
/// Responses set `correlation_id` to the `message_id` of the request
/// they answer; everything else leaves it unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub message_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl AgentMessage {
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            message_type,
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Build a response correlated to `request`
    pub fn response_to(
        request: &AgentMessage,
        sender_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let mut msg = Self::new(
            sender_id,
            request.sender_id.clone(),
            MessageType::TaskResponse,
            payload,
        );
        msg.correlation_id = Some(request.message_id.clone());
        msg
    }

    /// Synthetic error message, e.g. delivered to reply callbacks on
    /// request timeout
    pub fn error_for(
        request_id: &str,
        receiver_id: impl Into<String>,
        kind: &str,
        detail: &str,
    ) -> Self {
        let mut msg = Self::new(
            "system",
            receiver_id,
            MessageType::Error,
            serde_json::json!({ "kind": kind, "detail": detail }),
        );
        msg.correlation_id = Some(request_id.to_string());
        msg
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver_id == BROADCAST
    }

    /// Serialize to a single newline-terminated frame
    pub fn to_frame(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one frame; the trailing newline may be present or not
    pub fn from_frame(frame: &str) -> Result<Self> {
        serde_json::from_str(frame.trim_end()).map_err(|e| {
            ConductorError::protocol(format!("ill-formed frame: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_frame_round_trip() {
        let msg = AgentMessage::new(
            "agent_000",
            "orchestrator",
            MessageType::StatusUpdate,
            serde_json::json!({"state": "idle"}),
        );

        let frame = msg.to_frame().unwrap();
        assert!(frame.ends_with('\n'));

        let parsed = AgentMessage::from_frame(&frame).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_response_correlation() {
        let request = AgentMessage::new(
            "lead",
            "agent_001",
            MessageType::TaskRequest,
            serde_json::json!({"task_id": "t1"}),
        );
        let response =
            AgentMessage::response_to(&request, "agent_001", serde_json::json!({"status": "success"}));

        assert_eq!(response.receiver_id, "lead");
        assert_eq!(response.correlation_id.as_deref(), Some(request.message_id.as_str()));
        assert_eq!(response.message_type, MessageType::TaskResponse);
    }

    #[test]
    fn test_ill_formed_frame_is_protocol_error() {
        let err = AgentMessage::from_frame("{not json").unwrap_err();
        assert!(matches!(err, ConductorError::Protocol { .. }));
    }

    #[test]
    fn test_message_type_wire_names() {
        let json = serde_json::to_string(&MessageType::TaskRequest).unwrap();
        assert_eq!(json, "\"task_request\"");
        let parsed: MessageType = serde_json::from_str("\"heartbeat\"").unwrap();
        assert_eq!(parsed, MessageType::Heartbeat);
    }
}
