use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Addressing block carried by every caller-facing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub message_id: String,
    pub conversation_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Meta {
    pub fn new(
        message_id: impl Into<String>,
        conversation_id: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            conversation_id: conversation_id.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundPayload {
    pub action: String,
    #[serde(default)]
    pub params: Value,
    /// Anything else the caller put next to `action` / `params`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundPayload {
    /// Look a field up in `params` first, then among the top-level extras.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.params
            .as_object()
            .and_then(|params| params.get(key))
            .or_else(|| self.extra.get(key))
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub meta: Meta,
    pub payload: InboundPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub action: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub meta: Meta,
    pub payload: OutboundPayload,
}

impl OutboundEnvelope {
    pub fn is_success(&self) -> bool {
        self.payload.status == Status::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_keeps_extra_payload_fields() {
        let raw = json!({
            "meta": { "messageId": "m-1", "conversationId": "c-1", "timestamp": 1700000000000i64 },
            "payload": { "action": "operate", "params": { "device": "web" }, "command": "click login" }
        });
        let envelope: InboundEnvelope = serde_json::from_value(raw).expect("valid envelope");
        assert_eq!(envelope.meta.message_id, "m-1");
        assert_eq!(envelope.payload.action, "operate");
        assert_eq!(envelope.payload.str_field("device"), Some("web"));
        assert_eq!(envelope.payload.str_field("command"), Some("click login"));
        assert_eq!(envelope.payload.str_field("missing"), None);
    }

    #[test]
    fn outbound_omits_absent_result_and_error() {
        let envelope = OutboundEnvelope {
            meta: Meta::new("m-1", "c-1", 1),
            payload: OutboundPayload {
                action: "operate".into(),
                status: Status::Failed,
                result: None,
                error: Some("device busy".into()),
            },
        };
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["payload"]["status"], "failed");
        assert_eq!(value["payload"]["error"], "device busy");
        assert!(value["payload"].get("result").is_none());
        assert_eq!(value["meta"]["conversationId"], "c-1");
    }
}
