//! Wire formats: the outbound envelope, the heartbeat frame, and inbound
//! frame inspection.
//!
//! Outbound payloads are serialized as-is with one addition: a `timestamp`
//! field (epoch milliseconds) injected into object payloads, used by the
//! receiving side to measure latency. Inbound frames carrying a `timestamp`
//! feed the same measurement locally.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};

use crate::error::Result;

/// Return the current time as epoch milliseconds.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Serialize an outbound payload, stamping object payloads with the
/// latency-measurement timestamp. Non-object payloads pass through
/// unchanged.
pub fn encode_envelope(payload: &Value, timestamp_ms: u64) -> Result<Vec<u8>> {
    let envelope = match payload {
        Value::Object(fields) => {
            let mut fields: Map<String, Value> = fields.clone();
            fields.insert("timestamp".to_string(), Value::from(timestamp_ms));
            Value::Object(fields)
        }
        other => other.clone(),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Heartbeat probe sent to connections that have gone quiet.
pub fn ping_frame(timestamp_ms: u64) -> Vec<u8> {
    serde_json::to_vec(&json!({ "type": "ping", "timestamp": timestamp_ms })).unwrap_or_default()
}

/// Extract the peer-stamped timestamp from an inbound frame, if present.
pub(crate) fn frame_timestamp(frame: &[u8]) -> Option<u64> {
    let value: Value = serde_json::from_slice(frame).ok()?;
    value.get("timestamp")?.as_u64()
}

/// Decode an inbound frame into a JSON payload. Returns `None` for frames
/// that are not valid JSON; those still count toward activity and byte
/// metrics but produce no message event.
pub(crate) fn decode_frame(frame: &[u8]) -> Option<Value> {
    serde_json::from_slice(frame).ok()
}
