//! Wire-compatibility rewrites applied at the serialization boundary.
//!
//! Internally a conversation reference names the agent side `agent`; older
//! relay consumers expect `bot`. Only `relatesTo` is touched; every other
//! field passes through unchanged.

use serde_json::Value;

const RELATES_TO: &str = "relatesTo";
const INTERNAL_AGENT: &str = "agent";
const WIRE_AGENT: &str = "bot";

/// Rewrites `relatesTo.agent` to `relatesTo.bot` before a payload leaves the process.
pub fn normalize_outgoing(mut payload: Value) -> Value {
    rename_relates_to_field(&mut payload, INTERNAL_AGENT, WIRE_AGENT);
    payload
}

/// Rewrites `relatesTo.bot` to `relatesTo.agent` after a payload is received.
pub fn normalize_incoming(mut payload: Value) -> Value {
    rename_relates_to_field(&mut payload, WIRE_AGENT, INTERNAL_AGENT);
    payload
}

fn rename_relates_to_field(payload: &mut Value, from: &str, to: &str) {
    let Some(relates_to) = payload
        .get_mut(RELATES_TO)
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    // Both keys present: leave the payload as sent.
    if relates_to.contains_key(to) {
        return;
    }
    if let Some(value) = relates_to.remove(from) {
        relates_to.insert(to.to_string(), value);
    }
}
