use std::collections::BTreeMap;
use std::io::{self, Write};
use tars_core::{
    truncate_chars, BlockKind, ChatSender, DashboardState, SubAgentPhase, SubsystemStatus,
    TaskStatus,
};
use tars_link::{Notifier, NotifyError};

const PREVIEW_CHARS: usize = 120;

/// Turns successive state snapshots into one printable line per change.
#[derive(Debug, Default)]
pub struct ChangePrinter {
    status: Option<SubsystemStatus>,
    task_status: BTreeMap<u64, TaskStatus>,
    last_chat: u64,
    last_block: u64,
    total_events: u64,
    memory_seen: Option<(String, String)>,
    last_saved: Option<String>,
    sub_agents: BTreeMap<String, SubAgentPhase>,
}

impl ChangePrinter {
    pub fn diff(&mut self, state: &DashboardState) -> Vec<String> {
        let mut lines = Vec::new();

        if self.status != Some(state.status) {
            let status = state.status;
            lines.push(format!(
                "[status] link={} agent={} mac={} claude={}",
                status.websocket.as_str(),
                status.agent.as_str(),
                status.mac.as_str(),
                status.claude.as_str()
            ));
            self.status = Some(status);
        }

        for task in state.tasks.iter().rev() {
            if self.task_status.get(&task.id) == Some(&task.status) {
                continue;
            }
            let text = truncate_chars(&task.text, PREVIEW_CHARS);
            lines.push(format!(
                "[task #{}] {} ({}): {}",
                task.id,
                task.status.as_str(),
                task.source,
                text
            ));
            self.task_status.insert(task.id, task.status);
        }

        // Blocks are printed once complete; the open thinking block is still
        // accumulating deltas.
        let settled = state.current_thinking.unwrap_or(state.thinking.len());
        for block in state.thinking.iter().take(settled) {
            if block.id <= self.last_block {
                continue;
            }
            self.last_block = block.id;
            lines.push(match &block.kind {
                BlockKind::Thinking { model, text } => format!(
                    "[think {}] {}",
                    if model.is_empty() { "?" } else { model.as_str() },
                    truncate_chars(text.trim(), PREVIEW_CHARS)
                ),
                BlockKind::ToolCall { tool_name, input } => format!(
                    "[tool] {} {}",
                    tool_name,
                    truncate_chars(&input.to_string(), PREVIEW_CHARS)
                ),
                BlockKind::ToolResult {
                    tool_name,
                    success,
                    duration,
                    ..
                } => format!(
                    "[result] {} {}{}",
                    tool_name,
                    if *success { "ok" } else { "failed" },
                    duration
                        .map(|secs| format!(" {secs:.1}s"))
                        .unwrap_or_default()
                ),
                BlockKind::Error { message } => format!("[error] {message}"),
            });
        }

        for message in state.chat.iter() {
            if message.id <= self.last_chat {
                continue;
            }
            let who = match message.sender {
                ChatSender::User => "you",
                ChatSender::Agent => "tars",
            };
            lines.push(format!("[chat] {who}: {}", message.text));
            self.last_chat = message.id;
        }

        let stats = &state.stats;
        if stats.total_events != self.total_events {
            lines.push(format!(
                "[stats] events={} tokens={}/{} cost=${:.4} actions={}ok/{}failed",
                stats.total_events,
                stats.total_tokens_in,
                stats.total_tokens_out,
                stats.total_cost,
                stats.actions_success,
                stats.actions_failed
            ));
            self.total_events = stats.total_events;
        }

        let memory = (state.memory.context.clone(), state.memory.preferences.clone());
        if !memory.0.is_empty() || !memory.1.is_empty() {
            if self.memory_seen.as_ref() != Some(&memory) {
                lines.push(format!(
                    "[memory] context {} chars, preferences {} chars, project {}",
                    memory.0.chars().count(),
                    memory.1.chars().count(),
                    state.memory.active_project.as_deref().unwrap_or("-")
                ));
                self.memory_seen = Some(memory);
            }
        }
        if state.memory.last_saved != self.last_saved {
            if let Some(field) = &state.memory.last_saved {
                lines.push(format!("[memory] saved {field}"));
            }
            self.last_saved = state.memory.last_saved.clone();
        }

        for (name, entry) in &state.sub_agents {
            if self.sub_agents.get(name) == Some(&entry.phase) {
                continue;
            }
            let note = entry
                .note
                .as_deref()
                .map(|note| format!(" ({note})"))
                .unwrap_or_default();
            lines.push(format!("[agent {name}] {}{note}", entry.phase.as_str()));
            self.sub_agents.insert(name.clone(), entry.phase);
        }

        lines
    }
}

/// Prints notifications inline with the rest of the output.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutNotifier;

impl Notifier for StdoutNotifier {
    fn notify(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        write_notification(&mut io::stdout().lock(), title, body)
    }
}

fn write_notification(out: &mut impl Write, title: &str, body: &str) -> Result<(), NotifyError> {
    writeln!(out, "[notify] {title}: {body}")
        .and_then(|_| out.flush())
        .map_err(|err| NotifyError::Unavailable(err.to_string()))
}
