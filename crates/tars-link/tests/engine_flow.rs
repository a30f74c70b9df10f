use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tars_core::{AgentStatus, ConnectionState, LinkStatus};
use tars_link::{
    parse_endpoint, DialTarget, Dialer, Engine, EngineHandle, LinkConfig, LinkEvent, LinkHandle,
    TracingNotifier,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(120);

struct Dialed {
    target: DialTarget,
    events: mpsc::UnboundedSender<LinkEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl Dialed {
    fn open(&self) {
        self.events
            .send(LinkEvent::opened(self.target.generation))
            .expect("engine alive");
    }

    fn push(&self, value: serde_json::Value) {
        self.events
            .send(LinkEvent::frame(self.target.generation, value.to_string()))
            .expect("engine alive");
    }

    fn drop_link(&self, reason: &str) {
        self.events
            .send(LinkEvent::closed(
                self.target.generation,
                Some(reason.to_string()),
            ))
            .expect("engine alive");
    }

    async fn next_frame_of(&mut self, kind: &str) -> serde_json::Value {
        loop {
            let text = timeout(WAIT, self.outbound.recv())
                .await
                .expect("frame in time")
                .expect("link open");
            let value: serde_json::Value = serde_json::from_str(&text).expect("json frame");
            if value["type"] == kind {
                return value;
            }
        }
    }
}

/// Hands every dial to the test instead of opening a socket.
struct ChannelDialer {
    dials: mpsc::UnboundedSender<Dialed>,
}

impl Dialer for ChannelDialer {
    fn dial(&mut self, target: DialTarget, events: mpsc::UnboundedSender<LinkEvent>) -> LinkHandle {
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let _ = self.dials.send(Dialed {
            target,
            events,
            outbound,
        });
        LinkHandle::new(outbound_tx, None)
    }
}

fn start(config: LinkConfig) -> (EngineHandle, JoinHandle<()>, mpsc::UnboundedReceiver<Dialed>) {
    let (dials_tx, dials) = mpsc::unbounded_channel();
    let (handle, task) = Engine::spawn(
        config,
        ChannelDialer { dials: dials_tx },
        Arc::new(TracingNotifier),
    );
    (handle, task, dials)
}

async fn next_dial(dials: &mut mpsc::UnboundedReceiver<Dialed>) -> Dialed {
    timeout(WAIT, dials.recv())
        .await
        .expect("dial in time")
        .expect("dialer alive")
}

async fn wait_connection(handle: &EngineHandle, want: ConnectionState) {
    let mut rx = handle.connection();
    timeout(WAIT, rx.wait_for(|state| *state == want))
        .await
        .expect("state in time")
        .expect("engine alive");
}

fn config() -> LinkConfig {
    let mut config =
        LinkConfig::with_url(parse_endpoint("ws://127.0.0.1:8421/").expect("endpoint"));
    config.token = Some("s3cret".to_string());
    config
}

#[tokio::test(start_paused = true)]
async fn engine_survives_drop_and_stops_on_disconnect() {
    let (handle, task, mut dials) = start(config());

    let mut first = next_dial(&mut dials).await;
    assert_eq!(
        first.target.url.as_str(),
        "ws://127.0.0.1:8421/?token=s3cret"
    );
    first.open();
    wait_connection(&handle, ConnectionState::Connected).await;

    first.push(json!({"type": "task_received", "data": {"task": "summarize inbox", "source": "imessage"}}));
    first.push(json!({"type": "thinking_start", "data": {"model": "claude-sonnet"}}));
    first.push(json!({"type": "thinking", "data": {"text": "Reading "}}));
    first.push(json!({"type": "thinking", "data": {"text": "mail"}}));
    let mut state = handle.state();
    timeout(WAIT, state.wait_for(|s| s.thinking.first().and_then(|b| b.text()) == Some("Reading mail")))
        .await
        .expect("thinking in time")
        .expect("engine alive");

    handle.send_message("any news?").expect("engine alive");
    let frame = first.next_frame_of("send_task").await;
    assert_eq!(frame, json!({"type": "send_task", "task": "any news?"}));

    first.drop_link("connection reset");
    let second = next_dial(&mut dials).await;
    assert!(second.target.generation > first.target.generation);

    // Reports from the dead link are ignored.
    first.open();
    second.open();
    wait_connection(&handle, ConnectionState::Connected).await;
    {
        let snapshot = handle.state().borrow().clone();
        assert_eq!(snapshot.status.websocket, LinkStatus::Connected);
        assert_eq!(snapshot.tasks.len(), 1);
        assert_eq!(snapshot.chat.len(), 1);
    }

    handle.disconnect().expect("engine alive");
    wait_connection(&handle, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert!(dials.try_recv().is_err());

    handle.shutdown();
    handle.shutdown();
    timeout(WAIT, task).await.expect("stop in time").expect("clean exit");
    assert!(handle.is_closed());
    assert!(handle.request_stats().is_err());
}

#[tokio::test(start_paused = true)]
async fn failed_dials_back_off_until_one_opens() {
    let (handle, task, mut dials) = start(config());

    let mut generations = Vec::new();
    let started = tokio::time::Instant::now();
    for _ in 0..3 {
        let dialed = next_dial(&mut dials).await;
        generations.push(dialed.target.generation);
        dialed.drop_link("refused");
    }
    // Retries after 1s and 2s.
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(generations.windows(2).all(|pair| pair[0] < pair[1]));

    let mut live = next_dial(&mut dials).await;
    live.open();
    wait_connection(&handle, ConnectionState::Connected).await;

    tokio::time::sleep(Duration::from_secs(6)).await;
    let poll = live.next_frame_of("get_stats").await;
    assert_eq!(poll, json!({"type": "get_stats"}));

    drop(handle);
    timeout(WAIT, task).await.expect("stop in time").expect("clean exit");
}

#[tokio::test(start_paused = true)]
async fn observers_see_events_and_optimistic_kill() {
    let (handle, task, mut dials) = start(config());
    let mut events = handle.events();

    let mut link = next_dial(&mut dials).await;
    link.open();
    wait_connection(&handle, ConnectionState::Connected).await;

    link.push(json!({"type": "self_reflection", "data": {"insight": "slow down"}}));
    link.push(json!({"type": "status_change", "data": {"status": "working"}}));
    let first = timeout(WAIT, events.recv()).await.expect("event").expect("open");
    let second = timeout(WAIT, events.recv()).await.expect("event").expect("open");
    assert_eq!(first.event_type, "self_reflection");
    assert_eq!(second.event_type, "status_change");
    assert_eq!(handle.state().borrow().status.agent, AgentStatus::Working);

    handle.kill_agent().expect("engine alive");
    assert_eq!(link.next_frame_of("kill").await, json!({"type": "kill"}));
    assert_eq!(handle.state().borrow().status.agent, AgentStatus::Killed);

    handle.shutdown();
    timeout(WAIT, task).await.expect("stop in time").expect("clean exit");
}
