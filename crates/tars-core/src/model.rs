use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::{lenient_f64, lenient_u64};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse link indicator shown next to the other subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Connected => "connected",
            LinkStatus::Reconnecting => "reconnecting",
            LinkStatus::Disconnected => "disconnected",
        }
    }
}

impl From<ConnectionState> for LinkStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => LinkStatus::Connected,
            ConnectionState::Connecting | ConnectionState::Reconnecting => LinkStatus::Reconnecting,
            ConnectionState::Disconnected => LinkStatus::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Working,
    Idle,
    Killed,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Working => "working",
            AgentStatus::Idle => "idle",
            AgentStatus::Killed => "killed",
            AgentStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "online" | "ready" => Ok(AgentStatus::Online),
            "working" | "busy" => Ok(AgentStatus::Working),
            "idle" => Ok(AgentStatus::Idle),
            "killed" => Ok(AgentStatus::Killed),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(format!("Unknown agent status: {other}")),
        }
    }
}

/// Reachability of the machine the agent runs on, independent of our socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Unknown,
    Reachable,
    Unreachable,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Unknown => "unknown",
            HostStatus::Reachable => "reachable",
            HostStatus::Unreachable => "unreachable",
        }
    }
}

/// Activity of the remote reasoning engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineActivity {
    Active,
    Idle,
    Error,
}

impl EngineActivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineActivity::Active => "active",
            EngineActivity::Idle => "idle",
            EngineActivity::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemStatus {
    pub websocket: LinkStatus,
    pub agent: AgentStatus,
    pub mac: HostStatus,
    pub claude: EngineActivity,
}

impl Default for SubsystemStatus {
    fn default() -> Self {
        Self {
            websocket: LinkStatus::Disconnected,
            agent: AgentStatus::Offline,
            mac: HostStatus::Unknown,
            claude: EngineActivity::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Completed,
    Failed,
    Queued,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Queued => "queued",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: u64,
    pub text: String,
    /// Envelope timestamp as sent by the agent; empty when absent.
    #[serde(default)]
    pub time: String,
    pub source: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingBlock {
    pub id: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: BlockKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockKind {
    Thinking {
        model: String,
        text: String,
    },
    ToolCall {
        tool_name: String,
        input: Value,
    },
    ToolResult {
        tool_name: String,
        content: String,
        success: bool,
        duration: Option<f64>,
    },
    Error {
        message: String,
    },
}

impl ThinkingBlock {
    /// Reasoning text, only for the `thinking` variant.
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            BlockKind::Thinking { text, .. } => Some(text.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatSender {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub text: String,
    pub sender: ChatSender,
    pub time: DateTime<Utc>,
    /// Envelope timestamp as sent by the agent; empty for local messages.
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub id: u64,
    pub tool_name: String,
    pub detail: String,
    pub success: bool,
    pub duration: Option<f64>,
    pub time: DateTime<Utc>,
}

/// Server-side running totals. Replaced wholesale by every `stats` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSnapshot {
    #[serde(deserialize_with = "lenient_u64")]
    pub total_events: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub total_tokens_in: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub total_tokens_out: u64,
    #[serde(deserialize_with = "lenient_f64")]
    pub total_cost: f64,
    #[serde(deserialize_with = "lenient_u64")]
    pub actions_success: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub actions_failed: u64,
    #[serde(deserialize_with = "lenient_f64")]
    pub start_time: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub uptime_seconds: f64,
    pub tool_usage: BTreeMap<String, u64>,
    pub model_usage: BTreeMap<String, u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryState {
    pub context: String,
    pub preferences: String,
    pub active_project: Option<String>,
    pub last_saved: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentPhase {
    Running,
    Completed,
    Failed,
    Escalated,
}

impl SubAgentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubAgentPhase::Running => "running",
            SubAgentPhase::Completed => "completed",
            SubAgentPhase::Failed => "failed",
            SubAgentPhase::Escalated => "escalated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentActivity {
    pub agent: String,
    pub phase: SubAgentPhase,
    pub task: String,
    pub attempt: u64,
    pub steps: u64,
    pub note: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Every slice the operator view reads, as of the last applied event.
///
/// History slices sit behind `Arc` so a published snapshot shares every
/// slice the next event leaves untouched; writers go through
/// `Arc::make_mut`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardState {
    pub status: SubsystemStatus,
    /// Newest first.
    pub tasks: Arc<Vec<TaskItem>>,
    pub thinking: Arc<Vec<ThinkingBlock>>,
    /// Index into `thinking` that `thinking` deltas append to.
    pub current_thinking: Option<usize>,
    pub chat: Arc<Vec<ChatMessage>>,
    pub actions: Arc<Vec<ActionLogEntry>>,
    pub stats: StatsSnapshot,
    pub current_model: String,
    pub memory: MemoryState,
    pub config_overrides: BTreeMap<String, Value>,
    pub sub_agents: BTreeMap<String, SubAgentActivity>,
}

impl Default for DashboardState {
    fn default() -> Self {
        Self {
            status: SubsystemStatus::default(),
            tasks: Arc::default(),
            thinking: Arc::default(),
            current_thinking: None,
            chat: Arc::default(),
            actions: Arc::default(),
            stats: StatsSnapshot::default(),
            current_model: String::new(),
            memory: MemoryState::default(),
            config_overrides: BTreeMap::new(),
            sub_agents: BTreeMap::new(),
        }
    }
}

impl DashboardState {
    pub fn active_task(&self) -> Option<&TaskItem> {
        self.tasks
            .iter()
            .find(|task| task.status == TaskStatus::Active)
    }

    pub fn current_block(&self) -> Option<&ThinkingBlock> {
        self.current_thinking
            .and_then(|index| self.thinking.get(index))
    }
}
