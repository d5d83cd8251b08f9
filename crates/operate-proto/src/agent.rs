use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action name of the first request an agent sends after connecting.
pub const REGISTER_ACTION: &str = "register";

/// Frames exchanged between the gateway and a remote execution agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Request(RequestFrame),
    Response(ResponseFrame),
    /// Fire-and-forget notification; never answered.
    Event(EventFrame),
    Ping,
    Pong,
}

impl AgentFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    pub id: String,
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FrameError>,
}

impl ResponseFrame {
    pub fn ok(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            id: crate::generate_id(),
            request_id: request_id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(
        request_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: crate::generate_id(),
            request_id: request_id.into(),
            success: false,
            data: None,
            error: Some(FrameError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterParams {
    pub machine_name: String,
    pub os: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAck {
    pub client_id: String,
    /// Server clock in milliseconds since the Unix epoch.
    pub server_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_agent_response_with_error() {
        let raw = br#"{"type":"response","id":"r-9","requestId":"q-1","success":false,
            "error":{"code":"ELEMENT_NOT_FOUND","message":"no button labelled Login"}}"#;
        let frame = AgentFrame::from_slice(raw).expect("parse response");
        let AgentFrame::Response(response) = frame else {
            panic!("expected response frame");
        };
        assert_eq!(response.request_id, "q-1");
        assert!(!response.success);
        assert_eq!(response.error.expect("error").code, "ELEMENT_NOT_FOUND");
    }

    #[test]
    fn parses_registration_request() {
        let raw = json!({
            "type": "request",
            "id": "reg-1",
            "action": "register",
            "params": { "machineName": "DESK-01", "os": "windows", "capabilities": ["mouse", "keyboard"] }
        });
        let frame: AgentFrame = serde_json::from_value(raw).expect("parse request");
        let AgentFrame::Request(request) = frame else {
            panic!("expected request frame");
        };
        assert_eq!(request.action, REGISTER_ACTION);
        let params: RegisterParams = serde_json::from_value(request.params).expect("params");
        assert_eq!(params.machine_name, "DESK-01");
        assert!(params.capabilities.contains("keyboard"));
    }

    #[test]
    fn heartbeat_frames_are_bare_tags() {
        assert_eq!(
            serde_json::to_value(AgentFrame::Ping).expect("ping"),
            json!({ "type": "ping" })
        );
        let pong: AgentFrame = serde_json::from_str(r#"{"type":"pong"}"#).expect("pong");
        assert_eq!(pong, AgentFrame::Pong);
    }
}
