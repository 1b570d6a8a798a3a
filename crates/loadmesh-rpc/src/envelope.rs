//! Wire envelopes and the undefined-field codec.
//!
//! Envelopes are JSON. Requests carry the caller id so the callee
//! knows which result channel to respond on; responses carry only the
//! correlation id plus either a payload or an error string.
//!
//! Some peer runtimes cannot express "key present but undefined" in
//! JSON and substitute the sentinel string `"__RLB_undefined"` on the
//! wire. [`decode_payload`] restores those to plain absence (object
//! keys are dropped, array slots become `null`) so payloads round-trip
//! losslessly against such peers. Encoding needs no counterpart here:
//! absent keys are already absent in serialized JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire stand-in for a field that is present but undefined.
pub const UNDEFINED_SENTINEL: &str = "__RLB_undefined";

/// A request envelope published on the callee's request channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, unique per caller while the call is in flight.
    pub id: String,
    /// Node id of the caller; names the result channel.
    pub caller: String,
    pub payload: Value,
}

/// A response envelope published on the caller's result channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id echoed from the request.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Set when the remote handler failed; mutually exclusive with
    /// `payload`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: String, payload: Value) -> Self {
        Self {
            id,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: String, error: String) -> Self {
        Self {
            id,
            payload: None,
            error: Some(error),
        }
    }
}

/// Recursively strip undefined sentinels from a decoded payload.
///
/// Object entries whose value is the sentinel are removed; array
/// elements become `null` (arrays cannot have holes). Everything else
/// passes through untouched.
pub fn decode_payload(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| v.as_str() != Some(UNDEFINED_SENTINEL))
                .map(|(k, v)| (k, decode_payload(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| {
                    if v.as_str() == Some(UNDEFINED_SENTINEL) {
                        Value::Null
                    } else {
                        decode_payload(v)
                    }
                })
                .collect(),
        ),
        other => other,
    }
}
