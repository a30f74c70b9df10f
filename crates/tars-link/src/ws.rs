use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::config::is_relay_endpoint;
use crate::connection::{DialTarget, Dialer, LinkEvent, LinkHandle};

const KEEPALIVE_PING: &str = "ping";
const KEEPALIVE_PONG: &str = "pong";

/// WebSocket transport. One spawned task per connection attempt.
///
/// The text keepalive is only armed for relay endpoints; decided per dial so
/// a URL change between attempts takes effect.
#[derive(Debug, Clone, Default)]
pub struct WsDialer {
    keepalive: Option<Duration>,
}

impl WsDialer {
    pub fn new(keepalive: Option<Duration>) -> Self {
        Self { keepalive }
    }
}

impl Dialer for WsDialer {
    fn dial(&mut self, target: DialTarget, events: mpsc::UnboundedSender<LinkEvent>) -> LinkHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let keepalive = self.keepalive.filter(|_| is_relay_endpoint(&target.url));
        if self.keepalive.is_some() && keepalive.is_none() {
            debug!(event = "keepalive_skipped", generation = target.generation);
        }
        let task = tokio::spawn(async move {
            run_link(target, events, outbound_rx, keepalive).await;
        });
        LinkHandle::new(outbound_tx, Some(task))
    }
}

async fn run_link(
    target: DialTarget,
    events: mpsc::UnboundedSender<LinkEvent>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    keepalive: Option<Duration>,
) {
    let generation = target.generation;
    let connect = tokio::select! {
        result = connect_async(target.url.as_str()) => result,
        None = outbound.recv() => {
            debug!(event = "link_dial_abandoned", generation);
            return;
        }
    };
    let (mut ws, _) = match connect {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "link_connect_error", generation, error = %err);
            let _ = events.send(LinkEvent::closed(generation, Some(err.to_string())));
            return;
        }
    };
    if events.send(LinkEvent::opened(generation)).is_err() {
        let _ = ws.close(None).await;
        return;
    }

    let mut ticker = keepalive.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    let reason = loop {
        tokio::select! {
            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text == KEEPALIVE_PONG {
                            continue;
                        }
                        if events.send(LinkEvent::frame(generation, text)).is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break Some(
                            frame
                                .map(|frame| format!("{} {}", frame.code, frame.reason))
                                .unwrap_or_else(|| "close frame".to_string()),
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Some(err.to_string()),
                    None => break Some("stream ended".to_string()),
                }
            }
            out = outbound.recv() => {
                match out {
                    Some(text) => {
                        if let Err(err) = ws.send(Message::Text(text)).await {
                            break Some(err.to_string());
                        }
                    }
                    None => {
                        debug!(event = "link_released", generation);
                        let _ = ws.close(None).await;
                        return;
                    }
                }
            }
            _ = keepalive_tick(&mut ticker) => {
                if let Err(err) = ws.send(Message::Text(KEEPALIVE_PING.to_string())).await {
                    break Some(err.to_string());
                }
            }
        }
    };
    let _ = ws.close(None).await;
    let _ = events.send(LinkEvent::closed(generation, reason));
}

async fn keepalive_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
