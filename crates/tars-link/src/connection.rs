use tars_core::{CommandFrame, ConnectionState};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{authorized_endpoint, BackoffPolicy};

/// Where and for which attempt a transport should be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub url: Url,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEventKind {
    Opened,
    Frame(String),
    Closed { reason: Option<String> },
}

/// Transport report, tagged with the attempt that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub generation: u64,
    pub kind: LinkEventKind,
}

impl LinkEvent {
    pub fn opened(generation: u64) -> Self {
        Self {
            generation,
            kind: LinkEventKind::Opened,
        }
    }

    pub fn frame(generation: u64, text: impl Into<String>) -> Self {
        Self {
            generation,
            kind: LinkEventKind::Frame(text.into()),
        }
    }

    pub fn closed(generation: u64, reason: Option<String>) -> Self {
        Self {
            generation,
            kind: LinkEventKind::Closed { reason },
        }
    }
}

/// Owning side of one open (or opening) transport.
#[derive(Debug)]
pub struct LinkHandle {
    outbound: mpsc::UnboundedSender<String>,
    task: Option<JoinHandle<()>>,
}

impl LinkHandle {
    pub fn new(outbound: mpsc::UnboundedSender<String>, task: Option<JoinHandle<()>>) -> Self {
        Self { outbound, task }
    }

    fn send(&self, text: String) -> bool {
        self.outbound.send(text).is_ok()
    }

    /// Dropping the outbound sender asks the transport task to close the
    /// socket and exit quietly.
    fn close(self) {
        drop(self.outbound);
        drop(self.task);
    }
}

/// Opens transports. Implementations report back through `events` and must
/// stop emitting once the returned handle's outbound channel is closed.
pub trait Dialer: Send + 'static {
    fn dial(&mut self, target: DialTarget, events: mpsc::UnboundedSender<LinkEvent>) -> LinkHandle;
}

/// Owns the single transport, the connection state and the retry schedule.
pub struct ConnectionManager {
    dialer: Box<dyn Dialer>,
    events: mpsc::UnboundedSender<LinkEvent>,
    url: Url,
    token: Option<String>,
    backoff: BackoffPolicy,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    link: Option<LinkHandle>,
    generation: u64,
    failures: u32,
    retry_at: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(
        dialer: Box<dyn Dialer>,
        events: mpsc::UnboundedSender<LinkEvent>,
        url: Url,
        token: Option<String>,
        backoff: BackoffPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            dialer,
            events,
            url,
            token,
            backoff,
            state: ConnectionState::Disconnected,
            state_tx,
            link: None,
            generation: 0,
            failures: 0,
            retry_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn connect(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!(event = "connect_skipped", state = %self.state);
            return;
        }
        self.retry_at = None;
        self.open();
    }

    pub fn disconnect(&mut self) {
        self.cancel_retry();
        self.close_transport();
        self.failures = 0;
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn cancel_retry(&mut self) {
        if self.retry_at.take().is_some() {
            debug!(event = "retry_cancelled", generation = self.generation);
        }
    }

    /// Close the transport and retire its generation so late reports from it
    /// are ignored.
    pub fn close_transport(&mut self) {
        if let Some(link) = self.link.take() {
            info!(event = "link_closing", generation = self.generation);
            link.close();
        }
        self.generation += 1;
    }

    /// Transmit a command frame. Returns false, and drops the frame, unless
    /// the link is currently connected.
    pub fn send(&self, frame: &CommandFrame) -> bool {
        if self.state != ConnectionState::Connected {
            debug!(event = "frame_dropped", command = frame.kind(), state = %self.state);
            return false;
        }
        let Some(link) = self.link.as_ref() else {
            return false;
        };
        let text = match frame.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "frame_encode_error", command = frame.kind(), error = %err);
                return false;
            }
        };
        link.send(text)
    }

    pub fn update_url(&mut self, url: Url) {
        info!(event = "endpoint_updated", url = %url);
        self.url = url;
    }

    pub fn update_token(&mut self, token: Option<String>) {
        info!(event = "credential_updated", present = token.is_some());
        self.token = token;
    }

    /// Apply a transport report. Returns the frame text for inbound frames
    /// that belong to the live connection.
    pub fn on_link_event(&mut self, event: LinkEvent) -> Option<String> {
        if event.generation != self.generation || self.link.is_none() {
            debug!(
                event = "stale_link_event",
                generation = event.generation,
                current = self.generation
            );
            return None;
        }
        match event.kind {
            LinkEventKind::Opened => {
                if self.state == ConnectionState::Connecting {
                    self.failures = 0;
                    self.set_state(ConnectionState::Connected);
                }
                None
            }
            LinkEventKind::Frame(text) => {
                if self.state == ConnectionState::Connected {
                    Some(text)
                } else {
                    None
                }
            }
            LinkEventKind::Closed { reason } => {
                warn!(
                    event = "link_closed",
                    generation = event.generation,
                    reason = reason.as_deref().unwrap_or("closed")
                );
                self.link = None;
                self.generation += 1;
                self.schedule_retry();
                None
            }
        }
    }

    /// Fire the pending retry if its deadline has passed.
    pub fn on_retry_due(&mut self, now: Instant) -> bool {
        match self.retry_at {
            Some(deadline) if deadline <= now && self.state == ConnectionState::Reconnecting => {
                self.retry_at = None;
                self.open();
                true
            }
            _ => false,
        }
    }

    fn schedule_retry(&mut self) {
        self.failures = self.failures.saturating_add(1);
        let delay = self.backoff.delay_for(self.failures);
        self.retry_at = Some(Instant::now() + delay);
        info!(
            event = "retry_scheduled",
            attempt = self.failures,
            delay_ms = delay.as_millis() as u64
        );
        self.set_state(ConnectionState::Reconnecting);
    }

    fn open(&mut self) {
        if let Some(stale) = self.link.take() {
            stale.close();
        }
        self.generation += 1;
        let target = DialTarget {
            url: authorized_endpoint(&self.url, self.token.as_deref()),
            generation: self.generation,
        };
        info!(event = "link_dialing", url = %self.url, generation = self.generation);
        self.set_state(ConnectionState::Connecting);
        self.link = Some(self.dialer.dial(target, self.events.clone()));
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        info!(event = "connection_state", from = %self.state, to = %next);
        self.state = next;
        self.state_tx.send_replace(next);
    }
}
