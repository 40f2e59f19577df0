//! Frames exchanged with WebSocket clients.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use screenflow_core::events::WorkflowEvent;
use screenflow_core::ids::SessionId;

/// Server → client event: `{type, session_id, timestamp, data}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub timestamp: String,
    pub data: Value,
}

impl WireEvent {
    pub fn new(event_type: impl Into<String>, session_id: Option<SessionId>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            session_id,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(
            "error",
            None,
            serde_json::json!({ "code": code, "message": message.into() }),
        )
    }

    /// Serialized once and shared by every recipient.
    pub fn to_frame(&self) -> Option<Arc<String>> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Arc::new(json)),
            Err(e) => {
                tracing::warn!(event_type = %self.event_type, error = %e, "failed to serialize event");
                None
            }
        }
    }
}

impl From<&WorkflowEvent> for WireEvent {
    fn from(event: &WorkflowEvent) -> Self {
        Self::new(
            event.event_type(),
            Some(event.session_id().clone()),
            event.data(),
        )
    }
}

/// Client → server frame. Anything else is rejected.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    JoinRoom { session_id: SessionId },
    LeaveRoom { session_id: SessionId },
    Ping,
}
