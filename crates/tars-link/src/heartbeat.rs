use std::time::Duration;
use tars_core::ConnectionState;
use tokio::time::Instant;

/// Periodic `get_stats` schedule. Armed only while connected; a missed tick
/// is never replayed, the next one is simply one interval after the last.
#[derive(Debug, Clone)]
pub struct HeartbeatPoller {
    interval: Duration,
    next_due: Option<Instant>,
}

impl HeartbeatPoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.next_due
    }

    pub fn is_armed(&self) -> bool {
        self.next_due.is_some()
    }

    /// Follow the connection state: arm on entering `connected`, disarm on
    /// anything else.
    pub fn sync(&mut self, state: ConnectionState, now: Instant) {
        match (state.is_connected(), self.next_due) {
            (true, None) => self.next_due = Some(now + self.interval),
            (false, Some(_)) => self.next_due = None,
            _ => {}
        }
    }

    pub fn stop(&mut self) {
        self.next_due = None;
    }

    /// True when a poll should be issued now. Reschedules from `now`.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.next_due {
            Some(due) if due <= now => {
                self.next_due = Some(now + self.interval);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_only_while_connected() {
        let mut poller = HeartbeatPoller::new(Duration::from_secs(5));
        poller.sync(ConnectionState::Connecting, Instant::now());
        assert!(!poller.is_armed());

        poller.sync(ConnectionState::Connected, Instant::now());
        assert!(!poller.fire(Instant::now()));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(poller.fire(Instant::now()));
        assert!(!poller.fire(Instant::now()));

        poller.sync(ConnectionState::Reconnecting, Instant::now());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!poller.fire(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_catch_up_missed_ticks() {
        let mut poller = HeartbeatPoller::new(Duration::from_secs(5));
        poller.sync(ConnectionState::Connected, Instant::now());
        tokio::time::advance(Duration::from_secs(23)).await;

        assert!(poller.fire(Instant::now()));
        assert!(!poller.fire(Instant::now()));
        assert_eq!(
            poller.deadline().map(|due| due - Instant::now()),
            Some(Duration::from_secs(5))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_with_a_full_interval_after_reconnect() {
        let mut poller = HeartbeatPoller::new(Duration::from_secs(5));
        poller.sync(ConnectionState::Connected, Instant::now());
        poller.sync(ConnectionState::Reconnecting, Instant::now());
        tokio::time::advance(Duration::from_secs(4)).await;
        poller.sync(ConnectionState::Connected, Instant::now());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!poller.fire(Instant::now()));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(poller.fire(Instant::now()));
    }
}
