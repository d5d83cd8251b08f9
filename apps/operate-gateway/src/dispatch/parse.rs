//! Lenient decoding of caller frames.
//!
//! Callers are frequently scripts or LLM tool output, so frames with single
//! quotes, bare keys or trailing commas are repaired before giving up.

use operate_proto::{InboundEnvelope, InboundPayload, Meta};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Longest slice of a rejected frame kept for logs and replies.
pub const PREVIEW_LIMIT: usize = 200;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason} (received: {preview})")]
pub struct MessageParseError {
    pub reason: String,
    pub preview: String,
}

impl MessageParseError {
    fn new(reason: impl Into<String>, raw: &str) -> Self {
        Self {
            reason: reason.into(),
            preview: preview(raw),
        }
    }
}

pub fn preview(raw: &str) -> String {
    let mut chars = raw.chars();
    let head: String = chars.by_ref().take(PREVIEW_LIMIT).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

pub fn parse_envelope(raw: &str) -> Result<InboundEnvelope, MessageParseError> {
    let value = parse_lenient(raw).map_err(|reason| MessageParseError::new(reason, raw))?;
    into_envelope(value).map_err(|reason| MessageParseError::new(reason, raw))
}

fn parse_lenient(raw: &str) -> Result<Value, String> {
    let strict_err = match serde_json::from_str::<Value>(raw) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    let repaired = repair(raw);
    if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
        debug!("accepted caller frame after textual repair");
        return Ok(value);
    }

    // Last chance: whatever object sits inside surrounding noise.
    if let Some(object) = outer_object(&repaired) {
        if let Ok(value) = serde_json::from_str::<Value>(object) {
            debug!("accepted caller frame after trimming surrounding text");
            return Ok(value);
        }
    }
    Err(format!("invalid JSON: {strict_err}"))
}

fn into_envelope(value: Value) -> Result<InboundEnvelope, String> {
    let Value::Object(mut root) = value else {
        return Err("message is not a JSON object".into());
    };
    let meta = root
        .get("meta")
        .and_then(Value::as_object)
        .ok_or("missing meta object")?;
    let message_id = meta
        .get("messageId")
        .and_then(Value::as_str)
        .ok_or("missing meta.messageId")?;
    let conversation_id = meta
        .get("conversationId")
        .and_then(Value::as_str)
        .ok_or("missing meta.conversationId")?;
    let timestamp = meta
        .get("timestamp")
        .and_then(|ts| ts.as_i64().or_else(|| ts.as_f64().map(|f| f as i64)))
        .ok_or("meta.timestamp must be a number")?;
    let meta = Meta::new(message_id, conversation_id, timestamp);

    let payload = root.remove("payload").ok_or("missing payload object")?;
    if !payload.is_object() {
        return Err("payload must be an object".into());
    }
    if !payload.get("action").is_some_and(Value::is_string) {
        return Err("payload.action must be a string".into());
    }
    let payload: InboundPayload =
        serde_json::from_value(payload).map_err(|err| format!("invalid payload: {err}"))?;

    Ok(InboundEnvelope { meta, payload })
}

fn repair(raw: &str) -> String {
    let normalized = normalize_quotes(raw.trim());
    let keyed = quote_bare_keys(&normalized);
    strip_trailing_commas(&keyed)
}

/// Rewrite single-quoted strings as double-quoted ones.
fn normalize_quotes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_double = false;
    let mut in_single = false;
    let mut escaped = false;
    for c in input.chars() {
        if escaped {
            escaped = false;
            if in_single && c == '\'' {
                out.pop();
            }
            out.push(c);
            continue;
        }
        match c {
            '\\' if in_double || in_single => {
                out.push(c);
                escaped = true;
            }
            '"' if in_single => out.push_str("\\\""),
            '"' => {
                in_double = !in_double;
                out.push(c);
            }
            '\'' if in_double => out.push(c),
            '\'' => {
                in_single = !in_single;
                out.push('"');
            }
            _ => out.push(c),
        }
    }
    out
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '-'
}

/// Quote identifiers that sit in key position (`{key:` or `, key:`).
fn quote_bare_keys(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut in_string = false;
    let mut escaped = false;
    let mut last_significant: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                last_significant = Some('"');
            }
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }
        if is_ident_start(c) && matches!(last_significant, Some('{') | Some(',')) {
            let start = i;
            while i < chars.len() && is_ident_continue(chars[i]) {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            let mut lookahead = i;
            while lookahead < chars.len() && chars[lookahead].is_whitespace() {
                lookahead += 1;
            }
            if chars.get(lookahead) == Some(&':') {
                out.push('"');
                out.push_str(&ident);
                out.push('"');
            } else {
                out.push_str(&ident);
            }
            last_significant = ident.chars().last();
            continue;
        }
        out.push(c);
        if !c.is_whitespace() {
            last_significant = Some(c);
        }
        i += 1;
    }
    out
}

fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|next| !next.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn outer_object(input: &str) -> Option<&str> {
    let start = input.find('{')?;
    let end = input.rfind('}')?;
    (start < end).then(|| &input[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn strict_envelope_parses() {
        let raw = r#"{"meta":{"messageId":"m-1","conversationId":"c-1","timestamp":1700000000000},
            "payload":{"action":"operate","params":{"device":"web","command":"click Login"}}}"#;
        let envelope = parse_envelope(raw).expect("valid");
        assert_eq!(envelope.meta.message_id, "m-1");
        assert_eq!(envelope.payload.action, "operate");
        assert_eq!(envelope.payload.str_field("command"), Some("click Login"));
    }

    #[test_timeout::timeout]
    fn repairs_script_style_frames() {
        let raw = "{meta: {messageId: 'm-2', conversationId: 'c-1', timestamp: 1700000000000,}, \
                   payload: {action: 'operate', params: {device: 'windows', command: \"say 'hi'\",},},}";
        let envelope = parse_envelope(raw).expect("repaired");
        assert_eq!(envelope.meta.message_id, "m-2");
        assert_eq!(envelope.payload.str_field("device"), Some("windows"));
        assert_eq!(envelope.payload.str_field("command"), Some("say 'hi'"));
    }

    #[test_timeout::timeout]
    fn single_quoted_values_keep_embedded_double_quotes() {
        assert_eq!(normalize_quotes(r#"{'a': 'say "hi"'}"#), r#"{"a": "say \"hi\""}"#);
        assert_eq!(normalize_quotes(r"{'a': 'it\'s'}"), r#"{"a": "it's"}"#);
    }

    #[test_timeout::timeout]
    fn bare_words_in_value_position_are_untouched() {
        assert_eq!(quote_bare_keys("{ok: true, list: [1, null]}"), r#"{"ok": true, "list": [1, null]}"#);
    }

    #[test_timeout::timeout]
    fn trims_noise_around_the_object() {
        let raw = r#"data: {"meta":{"messageId":"m","conversationId":"c","timestamp":1},"payload":{"action":"status"}} <eof>"#;
        assert_eq!(parse_envelope(raw).expect("trimmed").payload.action, "status");
    }

    #[test_timeout::timeout]
    fn malformed_frame_is_rejected_with_preview() {
        let err = parse_envelope("{not: valid").expect_err("malformed");
        assert!(err.reason.starts_with("invalid JSON"));
        assert_eq!(err.preview, "{not: valid");
    }

    #[test_timeout::timeout]
    fn preview_is_bounded() {
        let raw = format!("{{\"junk\": \"{}\"", "x".repeat(1_000));
        let err = parse_envelope(&raw).expect_err("unterminated");
        assert_eq!(err.preview.chars().count(), PREVIEW_LIMIT + 1);
        assert!(err.preview.ends_with('…'));
    }

    #[test_timeout::timeout]
    fn envelope_shape_is_enforced() {
        let missing_action = r#"{"meta":{"messageId":"m","conversationId":"c","timestamp":1},"payload":{}}"#;
        assert_eq!(
            parse_envelope(missing_action).expect_err("no action").reason,
            "payload.action must be a string"
        );

        let string_timestamp =
            r#"{"meta":{"messageId":"m","conversationId":"c","timestamp":"now"},"payload":{"action":"x"}}"#;
        assert_eq!(
            parse_envelope(string_timestamp).expect_err("bad ts").reason,
            "meta.timestamp must be a number"
        );

        assert_eq!(
            parse_envelope("[1,2]").expect_err("array").reason,
            "message is not a JSON object"
        );
    }
}
