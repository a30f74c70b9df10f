pub mod model;
pub mod protocol;

pub use model::*;
pub use protocol::{
    decode_event, AgentCompleted, AgentEscalated, AgentStarted, AgentStep, ApiCall, ChatText,
    CommandFrame, ConfigUpdated, ErrorReport, EventEnvelope, InboundEvent, KillSwitch, MemoryData,
    MemorySaved, ProtocolError, StatusChange, TaskCompleted, TaskReceived, ThinkingDelta,
    ThinkingStart, ToolCalled, ToolResult, TunnelStatus,
};

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Truncate to at most `max` characters, never splitting a code point.
pub fn truncate_chars(input: &str, max: usize) -> String {
    match input.char_indices().nth(max) {
        Some((cut, _)) => input[..cut].to_string(),
        None => input.to_string(),
    }
}

/// Deserialize a counter that may arrive as an integer, a float or null.
pub(crate) fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(0),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Ok(u)
            } else if let Some(f) = n.as_f64() {
                Ok(if f.is_finite() && f > 0.0 { f as u64 } else { 0 })
            } else {
                Ok(0)
            }
        }
        _ => Err(serde::de::Error::custom("expected number for counter")),
    }
}

/// Deserialize a float that may be null.
pub(crate) fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(0.0),
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        _ => Err(serde::de::Error::custom("expected number")),
    }
}

/// Deserialize display text. Scalars are stringified, null becomes empty and
/// structured values are rendered as compact JSON.
pub(crate) fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    Ok(match val {
        Value::Null => String::new(),
        Value::String(s) => s,
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    })
}
