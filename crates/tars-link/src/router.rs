use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tars_core::{
    truncate_chars, ActionLogEntry, AgentStatus, BlockKind, ChatMessage, ChatSender,
    ConnectionState, DashboardState, EngineActivity, EventEnvelope, HostStatus, InboundEvent,
    LinkStatus, SubAgentActivity, SubAgentPhase, TaskItem, TaskStatus, ThinkingBlock,
};
use tracing::{debug, warn};

use crate::config::HistoryLimits;
use crate::notify::Notification;

/// Longest tool output kept in an action log entry.
pub const ACTION_DETAIL_MAX_CHARS: usize = 200;
const NOTIFY_BODY_MAX_CHARS: usize = 100;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub changed: bool,
    pub notification: Option<Notification>,
}

impl RouteOutcome {
    fn unchanged() -> Self {
        Self::default()
    }

    fn changed() -> Self {
        Self {
            changed: true,
            notification: None,
        }
    }

    fn notify(notification: Notification) -> Self {
        Self {
            changed: true,
            notification: Some(notification),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct IdSeries {
    tasks: u64,
    chat: u64,
    actions: u64,
    blocks: u64,
}

fn next_id(counter: &mut u64) -> u64 {
    *counter = counter.saturating_add(1);
    *counter
}

/// Folds inbound events into the dashboard state, one at a time.
#[derive(Debug, Default, Clone)]
pub struct Router {
    state: DashboardState,
    ids: IdSeries,
    limits: HistoryLimits,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: HistoryLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn state(&self) -> &DashboardState {
        &self.state
    }

    pub fn handle(&mut self, envelope: &EventEnvelope) -> RouteOutcome {
        self.handle_at(envelope, Utc::now())
    }

    pub fn handle_at(&mut self, envelope: &EventEnvelope, now: DateTime<Utc>) -> RouteOutcome {
        let event = match InboundEvent::from_envelope(envelope) {
            Ok(event) => event,
            Err(err) => {
                warn!(event = "event_discarded", kind = %envelope.event_type, error = %err);
                return RouteOutcome::unchanged();
            }
        };
        self.apply(event, &envelope.timestamp, now)
    }

    fn apply(&mut self, event: InboundEvent, timestamp: &str, now: DateTime<Utc>) -> RouteOutcome {
        match event {
            InboundEvent::TaskReceived(payload) => {
                self.complete_active_task(now);
                let item = TaskItem {
                    id: next_id(&mut self.ids.tasks),
                    text: payload.task.clone(),
                    time: timestamp.to_string(),
                    source: if payload.source.is_empty() {
                        "agent".to_string()
                    } else {
                        payload.source
                    },
                    status: TaskStatus::Active,
                    started_at: now,
                    completed_at: None,
                };
                let tasks = Arc::make_mut(&mut self.state.tasks);
                tasks.insert(0, item);
                tasks.truncate(self.limits.tasks.max(1));
                self.state.status.agent = AgentStatus::Working;
                RouteOutcome::notify(Notification::new(
                    "New task",
                    truncate_chars(&payload.task, NOTIFY_BODY_MAX_CHARS),
                ))
            }
            InboundEvent::TaskCompleted(payload) => {
                self.complete_active_task(now);
                self.state.status.agent = AgentStatus::Online;
                let body = if payload.response.is_empty() {
                    "Task finished".to_string()
                } else {
                    truncate_chars(&payload.response, NOTIFY_BODY_MAX_CHARS)
                };
                RouteOutcome::notify(Notification::new("Task completed", body))
            }
            InboundEvent::ThinkingStart(payload) => {
                let model = payload.model;
                self.push_block(
                    BlockKind::Thinking {
                        model: model.clone(),
                        text: String::new(),
                    },
                    now,
                );
                self.state.current_thinking = Some(self.state.thinking.len() - 1);
                self.state.current_model = model;
                self.state.status.claude = EngineActivity::Active;
                RouteOutcome::changed()
            }
            InboundEvent::Thinking(delta) => {
                let Some(index) = self.state.current_thinking else {
                    debug!(event = "thinking_delta_dropped", chars = delta.text.len());
                    return RouteOutcome::unchanged();
                };
                let block = Arc::make_mut(&mut self.state.thinking).get_mut(index);
                match block.map(|block| &mut block.kind) {
                    Some(BlockKind::Thinking { text, .. }) => {
                        text.push_str(&delta.text);
                        RouteOutcome::changed()
                    }
                    _ => {
                        self.state.current_thinking = None;
                        RouteOutcome::changed()
                    }
                }
            }
            InboundEvent::ToolCalled(payload) => {
                self.state.current_thinking = None;
                self.push_block(
                    BlockKind::ToolCall {
                        tool_name: payload.tool_name,
                        input: payload.tool_input,
                    },
                    now,
                );
                RouteOutcome::changed()
            }
            InboundEvent::ToolResult(payload) => {
                let success = payload.success.unwrap_or(true);
                let entry = ActionLogEntry {
                    id: next_id(&mut self.ids.actions),
                    tool_name: payload.tool_name.clone(),
                    detail: truncate_chars(&payload.content, ACTION_DETAIL_MAX_CHARS),
                    success,
                    duration: payload.duration,
                    time: now,
                };
                self.push_block(
                    BlockKind::ToolResult {
                        tool_name: payload.tool_name,
                        content: payload.content,
                        success,
                        duration: payload.duration,
                    },
                    now,
                );
                let actions = Arc::make_mut(&mut self.state.actions);
                actions.push(entry);
                trim_front(actions, self.limits.actions);
                self.state.status.claude = EngineActivity::Idle;
                RouteOutcome::changed()
            }
            InboundEvent::ImessageSent(payload) => {
                self.push_chat(payload.message, ChatSender::Agent, timestamp, now);
                RouteOutcome::changed()
            }
            InboundEvent::ImessageReceived(payload) => {
                let body = truncate_chars(&payload.message, NOTIFY_BODY_MAX_CHARS);
                self.push_chat(payload.message, ChatSender::User, timestamp, now);
                RouteOutcome::notify(Notification::new("iMessage received", body))
            }
            InboundEvent::ApiCall(payload) => {
                if !payload.model.is_empty() {
                    self.state.current_model = payload.model;
                }
                let stats = &mut self.state.stats;
                stats.total_tokens_in = stats.total_tokens_in.saturating_add(payload.tokens_in);
                stats.total_tokens_out = stats.total_tokens_out.saturating_add(payload.tokens_out);
                RouteOutcome::changed()
            }
            InboundEvent::StatusChange(payload) => {
                self.state.status.agent = match payload.status.as_deref() {
                    None => AgentStatus::Online,
                    Some(label) => label.parse().unwrap_or_else(|err: String| {
                        debug!(event = "agent_status_unrecognized", error = %err);
                        AgentStatus::Online
                    }),
                };
                RouteOutcome::changed()
            }
            InboundEvent::Error(payload) => {
                self.push_block(
                    BlockKind::Error {
                        message: payload.message,
                    },
                    now,
                );
                self.state.status.claude = EngineActivity::Error;
                RouteOutcome::changed()
            }
            InboundEvent::Stats(snapshot) => {
                self.state.stats = snapshot;
                RouteOutcome::changed()
            }
            InboundEvent::MemoryData(payload) => {
                let memory = &mut self.state.memory;
                memory.context = payload.context;
                memory.preferences = payload.preferences;
                memory.active_project = match payload.active_project {
                    Value::Null => None,
                    Value::String(name) => Some(name),
                    other => Some(other.to_string()),
                };
                RouteOutcome::changed()
            }
            InboundEvent::KillSwitch(payload) => {
                self.state.status.agent = AgentStatus::Killed;
                let body = if payload.source.is_empty() {
                    "Agent stopped".to_string()
                } else {
                    format!("Agent stopped from {}", payload.source)
                };
                RouteOutcome::notify(Notification::new("Kill switch activated", body))
            }
            InboundEvent::TunnelStatus(payload) => {
                self.state.status.mac = if payload.connected {
                    HostStatus::Reachable
                } else {
                    HostStatus::Unreachable
                };
                RouteOutcome::changed()
            }
            InboundEvent::MemorySaved(payload) => {
                self.state.memory.last_saved = Some(payload.field);
                RouteOutcome::changed()
            }
            InboundEvent::ConfigUpdated(payload) => {
                if payload.key.is_empty() {
                    return RouteOutcome::unchanged();
                }
                self.state
                    .config_overrides
                    .insert(payload.key, payload.value);
                RouteOutcome::changed()
            }
            InboundEvent::AgentStarted(payload) => {
                let agent = sub_agent_key(&payload.agent);
                self.state.sub_agents.insert(
                    agent.clone(),
                    SubAgentActivity {
                        agent,
                        phase: SubAgentPhase::Running,
                        task: payload.task,
                        attempt: payload.attempt,
                        steps: 0,
                        note: None,
                        updated_at: now,
                    },
                );
                RouteOutcome::changed()
            }
            InboundEvent::AgentStep(payload) => {
                // Progress only; a step for an agent not running is stale.
                let key = sub_agent_key(&payload.agent);
                match self.state.sub_agents.get_mut(&key) {
                    Some(entry)
                        if entry.phase == SubAgentPhase::Running
                            && entry.steps != payload.step =>
                    {
                        entry.steps = payload.step;
                        entry.updated_at = now;
                        RouteOutcome::changed()
                    }
                    _ => RouteOutcome::unchanged(),
                }
            }
            InboundEvent::AgentCompleted(payload) => {
                let entry = self.sub_agent_entry(&payload.agent, now);
                entry.phase = if payload.success {
                    SubAgentPhase::Completed
                } else {
                    SubAgentPhase::Failed
                };
                entry.steps = payload.steps;
                entry.note = payload.stuck.then(|| "stuck".to_string());
                entry.updated_at = now;
                RouteOutcome::changed()
            }
            InboundEvent::AgentEscalated(payload) => {
                let entry = self.sub_agent_entry(&payload.agent, now);
                entry.phase = SubAgentPhase::Escalated;
                entry.note = Some(if payload.message.is_empty() {
                    payload.strategy
                } else {
                    format!("{}: {}", payload.strategy, payload.message)
                });
                entry.updated_at = now;
                RouteOutcome::changed()
            }
            InboundEvent::Unknown(kind) => {
                debug!(event = "event_ignored", kind = %kind);
                RouteOutcome::unchanged()
            }
        }
    }

    /// Mirror the connection state into the `websocket` indicator.
    pub fn set_link_state(&mut self, state: ConnectionState) -> bool {
        let next = LinkStatus::from(state);
        if self.state.status.websocket == next {
            return false;
        }
        self.state.status.websocket = next;
        true
    }

    /// Optimistic entry for a message the operator just sent.
    pub fn push_local_chat(&mut self, text: &str, now: DateTime<Utc>) -> u64 {
        self.push_chat(text.to_string(), ChatSender::User, "", now)
    }

    /// Optimistic kill, applied before the agent confirms.
    pub fn mark_killed(&mut self) {
        self.state.status.agent = AgentStatus::Killed;
    }

    fn complete_active_task(&mut self, now: DateTime<Utc>) {
        if self.state.active_task().is_none() {
            return;
        }
        for task in Arc::make_mut(&mut self.state.tasks)
            .iter_mut()
            .filter(|task| task.status == TaskStatus::Active)
        {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(now);
        }
    }

    fn push_block(&mut self, kind: BlockKind, now: DateTime<Utc>) {
        let blocks = Arc::make_mut(&mut self.state.thinking);
        blocks.push(ThinkingBlock {
            id: next_id(&mut self.ids.blocks),
            at: now,
            kind,
        });
        let dropped = trim_front(blocks, self.limits.thinking);
        if dropped > 0 {
            self.state.current_thinking = self
                .state
                .current_thinking
                .and_then(|index| index.checked_sub(dropped));
        }
    }

    fn push_chat(
        &mut self,
        text: String,
        sender: ChatSender,
        timestamp: &str,
        now: DateTime<Utc>,
    ) -> u64 {
        let id = next_id(&mut self.ids.chat);
        let chat = Arc::make_mut(&mut self.state.chat);
        chat.push(ChatMessage {
            id,
            text,
            sender,
            time: now,
            timestamp: timestamp.to_string(),
        });
        trim_front(chat, self.limits.chat);
        id
    }

    fn sub_agent_entry(&mut self, agent: &str, now: DateTime<Utc>) -> &mut SubAgentActivity {
        let agent = sub_agent_key(agent);
        self.state
            .sub_agents
            .entry(agent.clone())
            .or_insert_with(|| SubAgentActivity {
                agent,
                phase: SubAgentPhase::Running,
                task: String::new(),
                attempt: 0,
                steps: 0,
                note: None,
                updated_at: now,
            })
    }
}

/// Drop the oldest entries beyond `limit`; returns how many went.
fn trim_front<T>(items: &mut Vec<T>, limit: usize) -> usize {
    let excess = items.len().saturating_sub(limit.max(1));
    if excess > 0 {
        items.drain(..excess);
    }
    excess
}

fn sub_agent_key(agent: &str) -> String {
    let trimmed = agent.trim();
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}
