use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::StatsSnapshot;
use crate::{lenient_string, lenient_u64};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("frame has no event type")]
    MissingType,
    #[error("invalid {event_type} payload: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {command} command: {source}")]
    Encode {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// One inbound frame as it arrives from the agent, before interpretation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_unix: Option<f64>,
    #[serde(default)]
    pub data: Value,
}

/// Parse a text frame into an envelope. Anything that is not a JSON object
/// with a non-empty string `type` is rejected.
pub fn decode_event(text: &str) -> Result<EventEnvelope, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let Some(object) = value.as_object() else {
        return Err(ProtocolError::NotAnObject);
    };
    match object.get("type").and_then(Value::as_str) {
        Some(kind) if !kind.trim().is_empty() => {}
        _ => return Err(ProtocolError::MissingType),
    }
    let mut envelope: EventEnvelope = serde_json::from_value(value)?;
    if envelope.data.is_null() {
        envelope.data = Value::Object(Map::new());
    }
    Ok(envelope)
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TaskReceived {
    #[serde(deserialize_with = "lenient_string")]
    pub task: String,
    #[serde(deserialize_with = "lenient_string")]
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TaskCompleted {
    #[serde(deserialize_with = "lenient_string")]
    pub response: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ThinkingStart {
    #[serde(deserialize_with = "lenient_string")]
    pub model: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ThinkingDelta {
    #[serde(deserialize_with = "lenient_string")]
    pub text: String,
    #[serde(deserialize_with = "lenient_string")]
    pub model: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ToolCalled {
    #[serde(deserialize_with = "lenient_string")]
    pub tool_name: String,
    pub tool_input: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ToolResult {
    #[serde(deserialize_with = "lenient_string")]
    pub tool_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub content: String,
    pub success: Option<bool>,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChatText {
    #[serde(deserialize_with = "lenient_string")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ApiCall {
    #[serde(deserialize_with = "lenient_string")]
    pub model: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub tokens_in: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub tokens_out: u64,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StatusChange {
    pub status: Option<String>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ErrorReport {
    #[serde(deserialize_with = "lenient_string")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MemoryData {
    #[serde(deserialize_with = "lenient_string")]
    pub context: String,
    #[serde(deserialize_with = "lenient_string")]
    pub preferences: String,
    pub active_project: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct KillSwitch {
    #[serde(deserialize_with = "lenient_string")]
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TunnelStatus {
    pub connected: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MemorySaved {
    #[serde(deserialize_with = "lenient_string")]
    pub field: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigUpdated {
    #[serde(deserialize_with = "lenient_string")]
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentStarted {
    #[serde(deserialize_with = "lenient_string")]
    pub agent: String,
    #[serde(deserialize_with = "lenient_string")]
    pub task: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub attempt: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentStep {
    #[serde(deserialize_with = "lenient_string")]
    pub agent: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub step: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentCompleted {
    #[serde(deserialize_with = "lenient_string")]
    pub agent: String,
    pub success: bool,
    #[serde(deserialize_with = "lenient_u64")]
    pub steps: u64,
    pub stuck: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentEscalated {
    #[serde(deserialize_with = "lenient_string")]
    pub agent: String,
    #[serde(deserialize_with = "lenient_string")]
    pub strategy: String,
    #[serde(deserialize_with = "lenient_string")]
    pub message: String,
}

/// Closed set of events the router understands. Anything else is `Unknown`.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    TaskReceived(TaskReceived),
    TaskCompleted(TaskCompleted),
    ThinkingStart(ThinkingStart),
    Thinking(ThinkingDelta),
    ToolCalled(ToolCalled),
    ToolResult(ToolResult),
    ImessageSent(ChatText),
    ImessageReceived(ChatText),
    ApiCall(ApiCall),
    StatusChange(StatusChange),
    Error(ErrorReport),
    Stats(StatsSnapshot),
    MemoryData(MemoryData),
    KillSwitch(KillSwitch),
    TunnelStatus(TunnelStatus),
    MemorySaved(MemorySaved),
    ConfigUpdated(ConfigUpdated),
    AgentStarted(AgentStarted),
    AgentStep(AgentStep),
    AgentCompleted(AgentCompleted),
    AgentEscalated(AgentEscalated),
    Unknown(String),
}

impl InboundEvent {
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, ProtocolError> {
        let event = match envelope.event_type.as_str() {
            "task_received" => InboundEvent::TaskReceived(payload(envelope)?),
            "task_completed" => InboundEvent::TaskCompleted(payload(envelope)?),
            "thinking_start" => InboundEvent::ThinkingStart(payload(envelope)?),
            "thinking" => InboundEvent::Thinking(payload(envelope)?),
            "tool_called" => InboundEvent::ToolCalled(payload(envelope)?),
            "tool_result" => InboundEvent::ToolResult(payload(envelope)?),
            "imessage_sent" => InboundEvent::ImessageSent(payload(envelope)?),
            "imessage_received" => InboundEvent::ImessageReceived(payload(envelope)?),
            "api_call" => InboundEvent::ApiCall(payload(envelope)?),
            "status_change" => InboundEvent::StatusChange(payload(envelope)?),
            "error" => InboundEvent::Error(payload(envelope)?),
            "stats" => InboundEvent::Stats(payload(envelope)?),
            "memory_data" => InboundEvent::MemoryData(payload(envelope)?),
            "kill_switch" => InboundEvent::KillSwitch(payload(envelope)?),
            "tunnel_status" => InboundEvent::TunnelStatus(payload(envelope)?),
            "memory_saved" => InboundEvent::MemorySaved(payload(envelope)?),
            "config_updated" => InboundEvent::ConfigUpdated(payload(envelope)?),
            "agent_started" => InboundEvent::AgentStarted(payload(envelope)?),
            "agent_step" => InboundEvent::AgentStep(payload(envelope)?),
            "agent_completed" => InboundEvent::AgentCompleted(payload(envelope)?),
            "agent_escalated" => InboundEvent::AgentEscalated(payload(envelope)?),
            other => InboundEvent::Unknown(other.to_string()),
        };
        Ok(event)
    }
}

fn payload<T: DeserializeOwned>(envelope: &EventEnvelope) -> Result<T, ProtocolError> {
    let data = if envelope.data.is_null() {
        Value::Object(Map::new())
    } else {
        envelope.data.clone()
    };
    serde_json::from_value(data).map_err(|source| ProtocolError::Payload {
        event_type: envelope.event_type.clone(),
        source,
    })
}

/// Outbound command frames understood by the agent's dashboard socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandFrame {
    SendTask { task: String },
    GetStats,
    Kill,
    UpdateConfig { key: String, value: Value },
    SaveMemory { field: String, content: String },
    GetMemory,
}

impl CommandFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            CommandFrame::SendTask { .. } => "send_task",
            CommandFrame::GetStats => "get_stats",
            CommandFrame::Kill => "kill",
            CommandFrame::UpdateConfig { .. } => "update_config",
            CommandFrame::SaveMemory { .. } => "save_memory",
            CommandFrame::GetMemory => "get_memory",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|source| ProtocolError::Encode {
            command: self.kind(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_fills_missing_data_and_timestamp() {
        let envelope = decode_event(r#"{"type":"kill_switch"}"#).expect("decode");
        assert_eq!(envelope.event_type, "kill_switch");
        assert_eq!(envelope.timestamp, "");
        assert_eq!(envelope.data, json!({}));

        let event = InboundEvent::from_envelope(&envelope).expect("interpret");
        assert_eq!(
            event,
            InboundEvent::KillSwitch(KillSwitch {
                source: String::new()
            })
        );
    }

    #[test]
    fn decode_rejects_non_objects_and_missing_type() {
        assert!(matches!(decode_event("[1,2]"), Err(ProtocolError::NotAnObject)));
        assert!(matches!(
            decode_event(r#"{"data":{}}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            decode_event(r#"{"type":"  "}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(decode_event("pong"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let envelope = decode_event(
            r#"{"type":"self_reflection","timestamp":"2026-02-07T21:00:00","data":{"x":1}}"#,
        )
        .expect("decode");
        let event = InboundEvent::from_envelope(&envelope).expect("interpret");
        assert_eq!(event, InboundEvent::Unknown("self_reflection".to_string()));
    }

    #[test]
    fn api_call_defaults_missing_counters_to_zero() {
        let envelope = decode_event(r#"{"type":"api_call","data":{"model":"claude-haiku"}}"#)
            .expect("decode");
        match InboundEvent::from_envelope(&envelope).expect("interpret") {
            InboundEvent::ApiCall(call) => {
                assert_eq!(call.model, "claude-haiku");
                assert_eq!(call.tokens_in, 0);
                assert_eq!(call.tokens_out, 0);
                assert_eq!(call.duration, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn wrong_payload_type_is_reported_with_event_name() {
        let envelope = decode_event(r#"{"type":"api_call","data":{"tokens_in":"lots"}}"#)
            .expect("decode");
        match InboundEvent::from_envelope(&envelope) {
            Err(ProtocolError::Payload { event_type, .. }) => assert_eq!(event_type, "api_call"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn tool_result_content_tolerates_structured_values() {
        let envelope = decode_event(
            r#"{"type":"tool_result","data":{"tool_name":"run_command","content":{"ok":true},"success":false,"duration":1.5}}"#,
        )
        .expect("decode");
        match InboundEvent::from_envelope(&envelope).expect("interpret") {
            InboundEvent::ToolResult(result) => {
                assert_eq!(result.tool_name, "run_command");
                assert_eq!(result.content, r#"{"ok":true}"#);
                assert_eq!(result.success, Some(false));
                assert_eq!(result.duration, Some(1.5));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn command_frames_use_flat_type_tag() {
        let task = CommandFrame::SendTask {
            task: "book a table".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&task).expect("serialize"),
            json!({"type": "send_task", "task": "book a table"})
        );
        assert_eq!(
            serde_json::to_value(CommandFrame::Kill).expect("serialize"),
            json!({"type": "kill"})
        );
        assert_eq!(
            serde_json::to_value(CommandFrame::UpdateConfig {
                key: "agent.max_steps".to_string(),
                value: json!(40),
            })
            .expect("serialize"),
            json!({"type": "update_config", "key": "agent.max_steps", "value": 40})
        );
        assert_eq!(
            CommandFrame::GetMemory.encode().expect("encode"),
            r#"{"type":"get_memory"}"#
        );
    }
}
