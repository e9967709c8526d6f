//! Frames written to the generation event stream.
//!
//! Every frame is a JSON object tagged by `type` and sent as one
//! `data: <json>\n\n` server-sent event.

use axum::response::sse::Event;
use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamFrame {
    Message {
        content: String,
        timestamp: String,
    },
    Keepalive {
        timestamp: String,
    },
    Completion {
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(rename = "messageCount")]
        message_count: u64,
        #[serde(rename = "tokensUsed")]
        tokens_used: u64,
        #[serde(rename = "filesChanged")]
        files_changed: Vec<String>,
        #[serde(rename = "previewUrl", default, skip_serializing_if = "Option::is_none")]
        preview_url: Option<String>,
        timestamp: String,
    },
    Error {
        error: String,
        details: ErrorFrameDetails,
        timestamp: String,
    },
}

/// Diagnostic context attached to an in-stream error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrameDetails {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub message_count: u64,
    pub elapsed_ms: u64,
}

impl StreamFrame {
    pub fn message(content: impl Into<String>) -> Self {
        Self::Message {
            content: content.into(),
            timestamp: now_timestamp(),
        }
    }

    pub fn keepalive() -> Self {
        Self::Keepalive {
            timestamp: now_timestamp(),
        }
    }

    pub fn error(error: impl Into<String>, details: ErrorFrameDetails) -> Self {
        Self::Error {
            error: error.into(),
            details,
            timestamp: now_timestamp(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Keepalive { .. } => "keepalive",
            Self::Completion { .. } => "completion",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completion { .. } | Self::Error { .. })
    }

    pub fn to_sse_event(&self) -> Event {
        Event::default()
            .json_data(self)
            .unwrap_or_else(|_| Event::default().data("{}"))
    }
}

pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn message_frame_is_tagged() {
        let value = serde_json::to_value(StreamFrame::message("hello")).expect("serialize");
        assert_eq!(value["type"], "message");
        assert_eq!(value["content"], "hello");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn completion_uses_camel_case_fields() {
        let frame = StreamFrame::Completion {
            session_id: Some("sess_1".to_string()),
            result: None,
            message_count: 3,
            tokens_used: 120,
            files_changed: vec!["app/index.tsx".to_string()],
            preview_url: None,
            timestamp: "2026-01-01T00:00:00.000Z".to_string(),
        };
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(
            value,
            json!({
                "type": "completion",
                "sessionId": "sess_1",
                "messageCount": 3,
                "tokensUsed": 120,
                "filesChanged": ["app/index.tsx"],
                "timestamp": "2026-01-01T00:00:00.000Z"
            })
        );
        assert!(frame.is_terminal());
    }

    #[test]
    fn error_frame_round_trips_details() {
        let frame = StreamFrame::error(
            "boom",
            ErrorFrameDetails {
                project_id: "proj_1".to_string(),
                sandbox_id: Some("sbx_1".to_string()),
                message_id: None,
                message_count: 2,
                elapsed_ms: 10,
            },
        );
        let text = serde_json::to_string(&frame).expect("serialize");
        let value: Value = serde_json::from_str(&text).expect("parse");
        assert_eq!(value["details"]["projectId"], "proj_1");
        assert_eq!(value["details"]["sandboxId"], "sbx_1");
        let parsed: StreamFrame = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(parsed, frame);
    }

    #[test]
    fn keepalive_is_not_terminal() {
        assert!(!StreamFrame::keepalive().is_terminal());
        assert_eq!(StreamFrame::keepalive().kind(), "keepalive");
    }
}
