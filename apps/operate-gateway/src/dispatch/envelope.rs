//! Builders for caller-facing envelopes.

use operate_proto::{generate_id, Meta, OutboundEnvelope, OutboundPayload, Status};
use serde_json::{json, Value};

use super::parse::MessageParseError;
use crate::now_millis;

pub const SYSTEM_CONVERSATION: &str = "system";
pub const BROADCAST_CONVERSATION: &str = "broadcast";
pub const COMMAND_ACTION: &str = "command";

/// Reply meta: same ids as the request, fresh timestamp.
fn reply_meta(request: &Meta) -> Meta {
    Meta::new(
        request.message_id.clone(),
        request.conversation_id.clone(),
        now_millis(),
    )
}

fn synthesized_meta(conversation_id: &str) -> Meta {
    Meta::new(generate_id(), conversation_id, now_millis())
}

fn build(meta: Meta, action: &str, status: Status, result: Option<Value>, error: Option<String>) -> OutboundEnvelope {
    OutboundEnvelope {
        meta,
        payload: OutboundPayload {
            action: action.to_string(),
            status,
            result,
            error,
        },
    }
}

pub fn success(request: &Meta, action: &str, result: Value) -> OutboundEnvelope {
    build(reply_meta(request), action, Status::Success, Some(result), None)
}

/// Failure reply. `message` must already be fit for the caller to read.
pub fn error(request: &Meta, action: &str, message: impl Into<String>) -> OutboundEnvelope {
    build(reply_meta(request), action, Status::Failed, None, Some(message.into()))
}

pub fn unknown_action(request: &Meta, action: &str) -> OutboundEnvelope {
    error(request, action, format!("Unknown action: {action}"))
}

pub fn processing_error(request: &Meta, action: &str, message: &str) -> OutboundEnvelope {
    error(request, action, format!("Failed to process {action}: {message}"))
}

pub fn parse_error(err: &MessageParseError) -> OutboundEnvelope {
    build(
        synthesized_meta(SYSTEM_CONVERSATION),
        "error",
        Status::Failed,
        None,
        Some(format!("Could not parse message: {}", err.reason)),
    )
}

pub fn system(action: &str, result: Value) -> OutboundEnvelope {
    build(synthesized_meta(SYSTEM_CONVERSATION), action, Status::Success, Some(result), None)
}

pub fn welcome(connection_id: &str, actions: &[&str]) -> OutboundEnvelope {
    system(
        "welcome",
        json!({
            "connectionId": connection_id,
            "serverTime": now_millis(),
            "actions": actions,
        }),
    )
}

pub fn broadcast(action: &str, result: Value) -> OutboundEnvelope {
    build(
        synthesized_meta(BROADCAST_CONVERSATION),
        action,
        Status::Success,
        Some(result),
        None,
    )
}

/// Client-side instruction (overlay toggles, progress tips) tied to the
/// conversation of the request that caused it.
pub fn command(request: &Meta, name: &str, data: Value) -> OutboundEnvelope {
    build(
        reply_meta(request),
        COMMAND_ACTION,
        Status::Success,
        Some(json!({ "command": name, "data": data })),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Meta {
        Meta::new("msg-7", "conv-3", 1)
    }

    #[test_timeout::timeout]
    fn replies_echo_request_ids() {
        let reply = success(&request(), "operate", json!({ "ok": true }));
        assert_eq!(reply.meta.message_id, "msg-7");
        assert_eq!(reply.meta.conversation_id, "conv-3");
        assert!(reply.meta.timestamp >= 1);
        assert!(reply.is_success());

        let failed = unknown_action(&request(), "teleport");
        assert_eq!(failed.payload.action, "teleport");
        assert_eq!(failed.payload.error.as_deref(), Some("Unknown action: teleport"));
    }

    #[test_timeout::timeout]
    fn system_messages_get_their_own_ids() {
        let err = MessageParseError {
            reason: "invalid JSON".into(),
            preview: "{".into(),
        };
        let reply = parse_error(&err);
        assert_eq!(reply.meta.conversation_id, SYSTEM_CONVERSATION);
        assert_ne!(reply.meta.message_id, "msg-7");
        assert!(!reply.is_success());

        let hello = welcome("conn-1", &["operate", "status"]);
        assert_eq!(hello.payload.result.expect("result")["actions"][1], "status");
    }

    #[test_timeout::timeout]
    fn commands_carry_name_and_data() {
        let cmd = command(&request(), "showLoading", json!({ "device": "web" }));
        assert_eq!(cmd.payload.action, COMMAND_ACTION);
        assert_eq!(cmd.meta.message_id, "msg-7");
        let result = cmd.payload.result.expect("result");
        assert_eq!(result["command"], "showLoading");
        assert_eq!(result["data"]["device"], "web");
    }
}
