use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tars_core::{decode_event, CommandFrame, ConnectionState, DashboardState, EventEnvelope};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::LinkConfig;
use crate::connection::{ConnectionManager, Dialer, LinkEvent};
use crate::heartbeat::HeartbeatPoller;
use crate::notify::{Notification, Notifier};
use crate::router::Router;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    SendTask(String),
    SendMessage(String),
    Kill,
    UpdateConfig { key: String, value: Value },
    SaveMemory { field: String, content: String },
    RequestMemory,
    RequestStats,
    SetUrl(Url),
    SetToken(Option<String>),
    Connect,
    Disconnect,
    Shutdown,
}

impl EngineCommand {
    fn kind(&self) -> &'static str {
        match self {
            EngineCommand::SendTask(_) => "send_task",
            EngineCommand::SendMessage(_) => "send_message",
            EngineCommand::Kill => "kill",
            EngineCommand::UpdateConfig { .. } => "update_config",
            EngineCommand::SaveMemory { .. } => "save_memory",
            EngineCommand::RequestMemory => "request_memory",
            EngineCommand::RequestStats => "request_stats",
            EngineCommand::SetUrl(_) => "set_url",
            EngineCommand::SetToken(_) => "set_token",
            EngineCommand::Connect => "connect",
            EngineCommand::Disconnect => "disconnect",
            EngineCommand::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("engine has stopped")]
pub struct EngineStopped;

/// Owns every piece of mutable state. All transitions go through `&mut self`,
/// one at a time.
pub struct Engine {
    connection: ConnectionManager,
    router: Router,
    heartbeat: HeartbeatPoller,
    notifier: Arc<dyn Notifier>,
    notifications: bool,
    auto_connect: bool,
    state_tx: watch::Sender<Arc<DashboardState>>,
    events_tx: broadcast::Sender<EventEnvelope>,
    stopped: bool,
}

impl Engine {
    pub fn new(
        config: LinkConfig,
        dialer: Box<dyn Dialer>,
        notifier: Arc<dyn Notifier>,
        link_events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let connection = ConnectionManager::new(
            dialer,
            link_events,
            config.url,
            config.token,
            config.backoff,
        );
        let router = Router::with_limits(config.history);
        let (state_tx, _) = watch::channel(Arc::new(router.state().clone()));
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            connection,
            router,
            heartbeat: HeartbeatPoller::new(config.heartbeat_interval),
            notifier,
            notifications: config.notifications,
            auto_connect: config.auto_connect,
            state_tx,
            events_tx,
            stopped: false,
        }
    }

    /// Start the engine loop on the current runtime.
    pub fn spawn<D: Dialer>(
        config: LinkConfig,
        dialer: D,
        notifier: Arc<dyn Notifier>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let engine = Engine::new(config, Box::new(dialer), notifier, link_tx);
        let handle = EngineHandle {
            commands: command_tx,
            connection: engine.connection.subscribe(),
            state: engine.state_tx.subscribe(),
            events: engine.events_tx.clone(),
        };
        let task = tokio::spawn(engine.run(command_rx, link_rx));
        (handle, task)
    }

    pub fn state(&self) -> &DashboardState {
        self.router.state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<EngineCommand>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        info!(event = "engine_started", url = %self.connection.url());
        if self.auto_connect {
            self.apply(EngineCommand::Connect);
        }
        loop {
            let retry_at = self.connection.retry_deadline();
            let heartbeat_at = self.heartbeat.deadline();
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(EngineCommand::Shutdown) | None => break,
                        Some(command) => self.apply(command),
                    }
                }
                Some(event) = link_events.recv() => self.on_link_event(event),
                _ = sleep_until_opt(retry_at) => self.on_retry_due(Instant::now()),
                _ = sleep_until_opt(heartbeat_at) => self.on_heartbeat_tick(Instant::now()),
            }
        }
        self.shutdown();
    }

    pub fn apply(&mut self, command: EngineCommand) {
        if self.stopped {
            debug!(event = "command_after_shutdown", command = command.kind());
            return;
        }
        let changed = match command {
            EngineCommand::SendTask(text) => {
                if text.trim().is_empty() {
                    debug!(event = "command_rejected", command = "send_task", reason = "blank");
                    return;
                }
                self.connection.send(&CommandFrame::SendTask { task: text });
                false
            }
            EngineCommand::SendMessage(text) => {
                if text.trim().is_empty() || !self.connection.state().is_connected() {
                    debug!(
                        event = "command_rejected",
                        command = "send_message",
                        state = %self.connection.state()
                    );
                    return;
                }
                let sent = self.connection.send(&CommandFrame::SendTask { task: text.clone() });
                if sent {
                    self.router.push_local_chat(&text, Utc::now());
                }
                sent
            }
            EngineCommand::Kill => {
                self.connection.send(&CommandFrame::Kill);
                self.router.mark_killed();
                true
            }
            EngineCommand::UpdateConfig { key, value } => {
                self.connection.send(&CommandFrame::UpdateConfig { key, value });
                false
            }
            EngineCommand::SaveMemory { field, content } => {
                self.connection
                    .send(&CommandFrame::SaveMemory { field, content });
                false
            }
            EngineCommand::RequestMemory => {
                self.connection.send(&CommandFrame::GetMemory);
                false
            }
            EngineCommand::RequestStats => {
                self.connection.send(&CommandFrame::GetStats);
                false
            }
            EngineCommand::SetUrl(url) => {
                self.connection.update_url(url);
                false
            }
            EngineCommand::SetToken(token) => {
                self.connection.update_token(token);
                false
            }
            EngineCommand::Connect => {
                self.connection.connect();
                false
            }
            EngineCommand::Disconnect => {
                self.connection.disconnect();
                false
            }
            EngineCommand::Shutdown => {
                self.shutdown();
                return;
            }
        };
        self.settle(changed);
    }

    pub fn on_link_event(&mut self, event: LinkEvent) {
        if self.stopped {
            return;
        }
        let changed = match self.connection.on_link_event(event) {
            Some(text) => self.on_frame(&text),
            None => false,
        };
        self.settle(changed);
    }

    pub fn on_retry_due(&mut self, now: Instant) {
        if self.stopped {
            return;
        }
        if self.connection.on_retry_due(now) {
            self.settle(false);
        }
    }

    pub fn on_heartbeat_tick(&mut self, now: Instant) {
        if self.stopped {
            return;
        }
        if self.heartbeat.fire(now) {
            self.connection.send(&CommandFrame::GetStats);
        }
    }

    /// Cancel the retry timer, stop the heartbeat, then close the transport.
    /// Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.connection.cancel_retry();
        self.heartbeat.stop();
        self.connection.disconnect();
        if self.router.set_link_state(self.connection.state()) {
            self.publish();
        }
        info!(event = "engine_stopped");
    }

    fn on_frame(&mut self, text: &str) -> bool {
        let envelope = match decode_event(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = "frame_discarded", error = %err, bytes = text.len());
                return false;
            }
        };
        let outcome = self.router.handle(&envelope);
        if let Some(notification) = outcome.notification {
            self.deliver(notification);
        }
        // No subscribers is not an error.
        let _ = self.events_tx.send(envelope);
        outcome.changed
    }

    fn deliver(&self, notification: Notification) {
        if !self.notifications {
            return;
        }
        if let Err(err) = self.notifier.notify(&notification.title, &notification.body) {
            warn!(event = "notify_failed", title = %notification.title, error = %err);
        }
    }

    fn settle(&mut self, mut changed: bool) {
        let state = self.connection.state();
        self.heartbeat.sync(state, Instant::now());
        changed |= self.router.set_link_state(state);
        if changed {
            self.publish();
        }
    }

    /// Snapshot clones only bump the history `Arc`s.
    fn publish(&self) {
        self.state_tx
            .send_replace(Arc::new(self.router.state().clone()));
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Command surface and subscription port of a running engine. Cheap to clone;
/// the engine stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    connection: watch::Receiver<ConnectionState>,
    state: watch::Receiver<Arc<DashboardState>>,
    events: broadcast::Sender<EventEnvelope>,
}

impl EngineHandle {
    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn state(&self) -> watch::Receiver<Arc<DashboardState>> {
        self.state.clone()
    }

    /// Every well-formed inbound envelope, after it has been applied to state.
    pub fn events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn send_task(&self, text: impl Into<String>) -> Result<(), EngineStopped> {
        self.submit(EngineCommand::SendTask(text.into()))
    }

    pub fn send_message(&self, text: impl Into<String>) -> Result<(), EngineStopped> {
        self.submit(EngineCommand::SendMessage(text.into()))
    }

    pub fn kill_agent(&self) -> Result<(), EngineStopped> {
        self.submit(EngineCommand::Kill)
    }

    pub fn update_config(&self, key: impl Into<String>, value: Value) -> Result<(), EngineStopped> {
        self.submit(EngineCommand::UpdateConfig {
            key: key.into(),
            value,
        })
    }

    pub fn save_memory(
        &self,
        field: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), EngineStopped> {
        self.submit(EngineCommand::SaveMemory {
            field: field.into(),
            content: content.into(),
        })
    }

    pub fn request_memory(&self) -> Result<(), EngineStopped> {
        self.submit(EngineCommand::RequestMemory)
    }

    pub fn request_stats(&self) -> Result<(), EngineStopped> {
        self.submit(EngineCommand::RequestStats)
    }

    /// Takes effect on the next connection attempt.
    pub fn set_ws_url(&self, url: Url) -> Result<(), EngineStopped> {
        self.submit(EngineCommand::SetUrl(url))
    }

    pub fn set_auth_token(&self, token: Option<String>) -> Result<(), EngineStopped> {
        self.submit(EngineCommand::SetToken(token))
    }

    pub fn connect(&self) -> Result<(), EngineStopped> {
        self.submit(EngineCommand::Connect)
    }

    pub fn disconnect(&self) -> Result<(), EngineStopped> {
        self.submit(EngineCommand::Disconnect)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn submit(&self, command: EngineCommand) -> Result<(), EngineStopped> {
        self.commands.send(command).map_err(|_| EngineStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffPolicy, HistoryLimits};
    use crate::connection::testing::ScriptedDialer;
    use crate::notify::NotifyError;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tars_core::{AgentStatus, ChatSender, LinkStatus};

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<Notification>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, title: &str, body: &str) -> Result<(), NotifyError> {
            self.seen
                .lock()
                .unwrap()
                .push(Notification::new(title, body));
            Ok(())
        }
    }

    struct DeniedNotifier;

    impl Notifier for DeniedNotifier {
        fn notify(&self, _title: &str, _body: &str) -> Result<(), NotifyError> {
            Err(NotifyError::NotPermitted)
        }
    }

    fn config() -> LinkConfig {
        LinkConfig {
            backoff: BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(30))
                .expect("backoff"),
            ..LinkConfig::default()
        }
    }

    fn engine_with(
        config: LinkConfig,
        dialer: &ScriptedDialer,
        notifier: Arc<dyn Notifier>,
    ) -> Engine {
        let (link_tx, _link_rx) = mpsc::unbounded_channel();
        Engine::new(config, Box::new(dialer.clone()), notifier, link_tx)
    }

    fn connected_engine(dialer: &ScriptedDialer) -> Engine {
        let mut engine = engine_with(config(), dialer, Arc::new(RecordingNotifier::default()));
        engine.apply(EngineCommand::Connect);
        let generation = engine.connection.generation();
        engine.on_link_event(LinkEvent::opened(generation));
        engine
    }

    fn frame(engine: &mut Engine, value: serde_json::Value) {
        let generation = engine.connection.generation();
        engine.on_link_event(LinkEvent::frame(generation, value.to_string()));
    }

    #[tokio::test]
    async fn send_message_requires_connection() {
        let dialer = ScriptedDialer::default();
        let mut engine = engine_with(config(), &dialer, Arc::new(RecordingNotifier::default()));
        engine.apply(EngineCommand::SendMessage("hello".to_string()));
        assert!(engine.state().chat.is_empty());

        engine.apply(EngineCommand::Connect);
        engine.on_link_event(LinkEvent::opened(engine.connection.generation()));
        engine.apply(EngineCommand::SendMessage("   ".to_string()));
        engine.apply(EngineCommand::SendMessage("hello".to_string()));

        let chat = &engine.state().chat;
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].sender, ChatSender::User);
        assert_eq!(
            dialer.sent(),
            vec![r#"{"type":"send_task","task":"hello"}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn optimistic_chat_is_not_deduplicated_against_echo() {
        let dialer = ScriptedDialer::default();
        let mut engine = connected_engine(&dialer);
        engine.apply(EngineCommand::SendMessage("ping me".to_string()));
        frame(
            &mut engine,
            json!({"type": "imessage_sent", "data": {"message": "ping me"}}),
        );
        assert_eq!(engine.state().chat.len(), 2);
    }

    #[tokio::test]
    async fn blank_task_is_rejected() {
        let dialer = ScriptedDialer::default();
        let mut engine = connected_engine(&dialer);
        engine.apply(EngineCommand::SendTask("\n".to_string()));
        engine.apply(EngineCommand::SendTask("book a table".to_string()));
        assert_eq!(
            dialer.sent(),
            vec![r#"{"type":"send_task","task":"book a table"}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn kill_is_applied_optimistically() {
        let dialer = ScriptedDialer::default();
        let mut engine = connected_engine(&dialer);
        let state_rx = engine.state_tx.subscribe();
        engine.apply(EngineCommand::Kill);
        assert_eq!(engine.state().status.agent, AgentStatus::Killed);
        assert_eq!(state_rx.borrow().status.agent, AgentStatus::Killed);
        assert_eq!(dialer.sent(), vec![r#"{"type":"kill"}"#.to_string()]);
    }

    #[tokio::test]
    async fn pass_through_commands_leave_state_alone() {
        let dialer = ScriptedDialer::default();
        let mut engine = connected_engine(&dialer);
        let before = engine.state().clone();
        engine.apply(EngineCommand::UpdateConfig {
            key: "agent.max_steps".to_string(),
            value: json!(30),
        });
        engine.apply(EngineCommand::SaveMemory {
            field: "context".to_string(),
            content: "notes".to_string(),
        });
        engine.apply(EngineCommand::RequestMemory);
        engine.apply(EngineCommand::RequestStats);
        assert_eq!(engine.state(), &before);
        assert_eq!(
            dialer.sent(),
            vec![
                r#"{"type":"update_config","key":"agent.max_steps","value":30}"#.to_string(),
                r#"{"type":"save_memory","field":"context","content":"notes"}"#.to_string(),
                r#"{"type":"get_memory"}"#.to_string(),
                r#"{"type":"get_stats"}"#.to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_polls_stats_only_while_connected() {
        let dialer = ScriptedDialer::default();
        let mut engine = connected_engine(&dialer);
        tokio::time::advance(Duration::from_secs(5)).await;
        engine.on_heartbeat_tick(Instant::now());
        assert_eq!(dialer.sent(), vec![r#"{"type":"get_stats"}"#.to_string()]);

        engine.on_link_event(LinkEvent::closed(engine.connection.generation(), None));
        assert_eq!(engine.connection_state(), ConnectionState::Reconnecting);
        tokio::time::advance(Duration::from_secs(5)).await;
        engine.on_heartbeat_tick(Instant::now());
        assert!(dialer.sent().is_empty());
    }

    #[tokio::test]
    async fn malformed_frames_do_not_block_later_events() {
        let dialer = ScriptedDialer::default();
        let mut engine = connected_engine(&dialer);
        let mut events = engine.events_tx.subscribe();
        let generation = engine.connection.generation();
        engine.on_link_event(LinkEvent::frame(generation, "{not json"));
        engine.on_link_event(LinkEvent::frame(generation, r#"{"data":{}}"#));
        frame(
            &mut engine,
            json!({"type": "task_received", "data": {"task": "tidy inbox"}}),
        );
        assert_eq!(engine.state().tasks.len(), 1);
        let envelope = events.try_recv().expect("broadcast");
        assert_eq!(envelope.event_type, "task_received");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn notifier_failures_are_absorbed() {
        let dialer = ScriptedDialer::default();
        let mut engine = engine_with(config(), &dialer, Arc::new(DeniedNotifier));
        engine.apply(EngineCommand::Connect);
        engine.on_link_event(LinkEvent::opened(engine.connection.generation()));
        frame(&mut engine, json!({"type": "kill_switch", "data": {}}));
        frame(
            &mut engine,
            json!({"type": "imessage_received", "data": {"message": "you there?"}}),
        );
        assert_eq!(engine.state().status.agent, AgentStatus::Killed);
        assert_eq!(engine.state().chat.len(), 1);
    }

    #[tokio::test]
    async fn notifications_can_be_disabled() {
        let dialer = ScriptedDialer::default();
        let notifier = Arc::new(RecordingNotifier::default());
        let mut cfg = config();
        cfg.notifications = false;
        let mut engine = engine_with(cfg, &dialer, notifier.clone());
        engine.apply(EngineCommand::Connect);
        engine.on_link_event(LinkEvent::opened(engine.connection.generation()));
        frame(&mut engine, json!({"type": "task_received", "data": {"task": "x"}}));
        assert!(notifier.seen.lock().unwrap().is_empty());

        let notifier = Arc::new(RecordingNotifier::default());
        let mut engine = engine_with(config(), &dialer, notifier.clone());
        engine.apply(EngineCommand::Connect);
        engine.on_link_event(LinkEvent::opened(engine.connection.generation()));
        frame(&mut engine, json!({"type": "task_received", "data": {"task": "x"}}));
        assert_eq!(
            notifier.seen.lock().unwrap().as_slice(),
            &[Notification::new("New task", "x")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent_and_cancels_timers() {
        let dialer = ScriptedDialer::default();
        let mut engine = connected_engine(&dialer);
        engine.on_link_event(LinkEvent::closed(engine.connection.generation(), None));
        assert!(engine.connection.retry_deadline().is_some());

        engine.shutdown();
        engine.shutdown();
        assert!(engine.is_stopped());
        assert!(engine.connection.retry_deadline().is_none());
        assert!(engine.heartbeat.deadline().is_none());
        assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
        assert_eq!(engine.state().status.websocket, LinkStatus::Disconnected);

        tokio::time::advance(Duration::from_secs(60)).await;
        engine.on_retry_due(Instant::now());
        engine.apply(EngineCommand::Connect);
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn websocket_indicator_tracks_connection() {
        let dialer = ScriptedDialer::default();
        let mut engine = engine_with(config(), &dialer, Arc::new(RecordingNotifier::default()));
        engine.apply(EngineCommand::Connect);
        assert_eq!(engine.state().status.websocket, LinkStatus::Reconnecting);
        engine.on_link_event(LinkEvent::opened(engine.connection.generation()));
        assert_eq!(engine.state().status.websocket, LinkStatus::Connected);
        engine.apply(EngineCommand::Disconnect);
        assert_eq!(engine.state().status.websocket, LinkStatus::Disconnected);
    }

    #[tokio::test]
    async fn snapshots_share_untouched_history() {
        let dialer = ScriptedDialer::default();
        let mut engine = connected_engine(&dialer);
        let state = engine.state_tx.subscribe();
        frame(&mut engine, json!({"type": "task_received", "data": {"task": "a"}}));
        frame(&mut engine, json!({"type": "imessage_sent", "data": {"message": "hi"}}));
        frame(&mut engine, json!({"type": "tool_result", "data": {"tool_name": "t", "content": "ok"}}));
        frame(&mut engine, json!({"type": "thinking_start", "data": {"model": "m"}}));
        let before = state.borrow().clone();

        frame(&mut engine, json!({"type": "thinking", "data": {"text": "token"}}));
        let after = state.borrow().clone();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(Arc::ptr_eq(&before.tasks, &after.tasks));
        assert!(Arc::ptr_eq(&before.chat, &after.chat));
        assert!(Arc::ptr_eq(&before.actions, &after.actions));
        assert!(!Arc::ptr_eq(&before.thinking, &after.thinking));
        assert_eq!(before.current_block().and_then(|block| block.text()), Some(""));
        assert_eq!(after.current_block().and_then(|block| block.text()), Some("token"));
    }

    #[tokio::test]
    async fn history_limits_come_from_config() {
        let dialer = ScriptedDialer::default();
        let mut engine = engine_with(
            LinkConfig {
                history: HistoryLimits {
                    chat: 3,
                    ..HistoryLimits::default()
                },
                ..config()
            },
            &dialer,
            Arc::new(RecordingNotifier::default()),
        );
        engine.apply(EngineCommand::Connect);
        engine.on_link_event(LinkEvent::opened(engine.connection.generation()));
        for n in 0..10 {
            frame(&mut engine, json!({"type": "imessage_sent", "data": {"message": n.to_string()}}));
        }
        let texts: Vec<&str> = engine.state().chat.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["7", "8", "9"]);
    }

    #[tokio::test]
    async fn independent_engines_do_not_share_state() {
        let dialer = ScriptedDialer::default();
        let mut first = connected_engine(&dialer);
        let second = connected_engine(&dialer);
        frame(&mut first, json!({"type": "task_received", "data": {"task": "a"}}));
        assert_eq!(first.state().tasks.len(), 1);
        assert!(second.state().tasks.is_empty());
    }
}
