/// Message fragments that mean the link to the agent broke, as opposed to the
/// agent reporting a logical failure.
const CONNECTION_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "not connected",
    "connection closed",
    "connection reset",
    "connection refused",
    "socket closed",
    "socket hang up",
    "transport closed",
    "websocket is not open",
    "debugger is not attached",
    "detached",
    "target closed",
    "broken pipe",
    "econnreset",
    "econnrefused",
];

pub fn is_connection_failure(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    CONNECTION_SIGNATURES
        .iter()
        .any(|signature| lowered.contains(signature))
}
