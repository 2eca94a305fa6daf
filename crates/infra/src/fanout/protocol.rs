//! Subscription channel wire messages (JSON, tagged by `type`).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use scribe_core::{JobId, JobStatus};
use scribe_events::JobUpdate;

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { job_id: JobId },
    Unsubscribe { job_id: JobId },
    Ping,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    JobUpdate {
        job_id: JobId,
        status: JobStatus,
        result: Option<JsonValue>,
    },
    Subscribed {
        job_id: JobId,
    },
    Unsubscribed {
        job_id: JobId,
    },
    Pong,
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<&JobUpdate> for ServerMessage {
    fn from(update: &JobUpdate) -> Self {
        Self::JobUpdate {
            job_id: update.job_id,
            status: update.status,
            result: update.result.clone(),
        }
    }
}

/// Error code for frames that are valid JSON but not a valid message.
pub const INVALID_MESSAGE: &str = "invalid_message";

/// A frame that could not be parsed at all; the connection is closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("protocol violation: {0}")]
pub struct ProtocolViolation(pub String);

/// Parse one inbound text frame.
///
/// - `Err(ProtocolViolation)`: not JSON (close the connection)
/// - `Ok(Err(reply))`: JSON but not a known, well-formed message (reply, keep open)
pub fn parse_client_frame(frame: &str) -> Result<Result<ClientMessage, ServerMessage>, ProtocolViolation> {
    let value: JsonValue = serde_json::from_str(frame).map_err(|e| ProtocolViolation(format!("invalid JSON: {e}")))?;

    let message_type = match value.get("type") {
        Some(JsonValue::String(t)) => t.clone(),
        _ => return Ok(Err(ServerMessage::error(INVALID_MESSAGE, "message has no type"))),
    };
    if !matches!(message_type.as_str(), "subscribe" | "unsubscribe" | "ping") {
        return Ok(Err(ServerMessage::error(
            INVALID_MESSAGE,
            format!("Unknown message type: {message_type}"),
        )));
    }

    Ok(serde_json::from_value(value)
        .map_err(|e| ServerMessage::error(INVALID_MESSAGE, format!("invalid {message_type} message: {e}"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_messages() {
        let id = JobId::new();
        let frame = json!({"type": "subscribe", "job_id": id.to_string()}).to_string();
        assert_eq!(
            parse_client_frame(&frame).unwrap(),
            Ok(ClientMessage::Subscribe { job_id: id })
        );
        assert_eq!(
            parse_client_frame(r#"{"type":"ping"}"#).unwrap(),
            Ok(ClientMessage::Ping)
        );
    }

    #[test]
    fn malformed_messages_get_error_replies() {
        let unknown = parse_client_frame(r#"{"type":"dance"}"#).unwrap().unwrap_err();
        assert!(matches!(unknown, ServerMessage::Error { ref message, .. } if message.contains("dance")));

        let bad_id = parse_client_frame(r#"{"type":"subscribe","job_id":"nope"}"#)
            .unwrap()
            .unwrap_err();
        assert!(matches!(bad_id, ServerMessage::Error { .. }));

        assert!(parse_client_frame(r#"[1,2]"#).unwrap().is_err());
    }

    #[test]
    fn unparseable_frame_is_a_protocol_violation() {
        assert!(parse_client_frame("{not json").is_err());
    }

    #[test]
    fn server_messages_use_snake_case_tags() {
        let id = JobId::new();
        let value = serde_json::to_value(ServerMessage::JobUpdate {
            job_id: id,
            status: JobStatus::Completed,
            result: Some(json!({"path": "out.json"})),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "job_update", "job_id": id.to_string(), "status": "completed", "result": {"path": "out.json"}})
        );
        assert_eq!(serde_json::to_value(ServerMessage::Pong).unwrap(), json!({"type": "pong"}));
    }
}
