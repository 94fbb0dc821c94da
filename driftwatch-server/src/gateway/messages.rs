use anyhow::Result;
use axum::extract::ws::{Message, Utf8Bytes};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A gateway frame: JSON text with a `type` and optional topic, payload,
/// and epoch-ms timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Frame {
    pub fn heartbeat() -> Self {
        Self {
            kind: "heartbeat".to_string(),
            topic: None,
            payload: None,
            timestamp: Some(Utc::now().timestamp_millis()),
        }
    }

    pub fn event(topic: &str, event_type: &str, payload: Value) -> Self {
        Self {
            kind: event_type.to_string(),
            topic: Some(topic.to_string()),
            payload: Some(payload),
            timestamp: Some(Utc::now().timestamp_millis()),
        }
    }

    /// Acknowledge a subscription change by echoing the status.
    pub fn ack(status: &str, topic: &str) -> Self {
        Self {
            kind: status.to_string(),
            topic: Some(topic.to_string()),
            payload: None,
            timestamp: Some(Utc::now().timestamp_millis()),
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            kind: "error".to_string(),
            topic: None,
            payload: Some(serde_json::json!({ "message": message })),
            timestamp: Some(Utc::now().timestamp_millis()),
        }
    }
}

/// Serialize a frame into a text WebSocket message.
pub fn frame_to_ws(frame: &Frame) -> Result<Message> {
    let json = serde_json::to_string(frame)?;
    Ok(Message::Text(Utf8Bytes::from(json)))
}

/// Parse an incoming WebSocket message into a frame.
pub fn ws_to_frame(msg: &Message) -> Result<Frame> {
    match msg {
        Message::Text(text) => Ok(serde_json::from_str(text.as_str())?),
        Message::Binary(bin) => Ok(serde_json::from_slice(bin.as_ref())?),
        _ => Err(anyhow::anyhow!("unsupported message type")),
    }
}

/// Topic syntax: a small closed set of exact strings plus per-detector
/// channels. No wildcards.
pub fn valid_topic(topic: &str) -> bool {
    if matches!(topic, "detectors" | "anomalies" | "anomalies.critical") {
        return true;
    }
    if let Some(rest) = topic.strip_prefix("detector.")
        && let Some((id, channel)) = rest.rsplit_once('.')
    {
        return !id.is_empty() && matches!(channel, "status" | "metrics" | "health");
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_validated_exactly() {
        for topic in [
            "detectors",
            "anomalies",
            "anomalies.critical",
            "detector.abc-123.status",
            "detector.abc-123.metrics",
            "detector.abc-123.health",
        ] {
            assert!(valid_topic(topic), "{topic} should be valid");
        }
        for topic in [
            "",
            "anomalies.warning",
            "detector..status",
            "detector.abc-123.logs",
            "detector.*.status",
            "detectors.all",
        ] {
            assert!(!valid_topic(topic), "{topic} should be invalid");
        }
    }

    #[test]
    fn frames_round_trip_as_text() {
        let frame = Frame::event("anomalies", "anomaly", serde_json::json!({"value": 3}));
        let msg = frame_to_ws(&frame).unwrap();
        let parsed = ws_to_frame(&msg).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn heartbeat_frame_has_the_expected_type() {
        let frame = Frame::heartbeat();
        assert_eq!(frame.kind, "heartbeat");
        assert!(frame.timestamp.is_some());
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json.get("type").unwrap(), "heartbeat");
        assert!(json.get("topic").is_none());
    }
}
