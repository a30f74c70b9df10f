use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifications not permitted")]
    NotPermitted,
    #[error("notification sink unavailable: {0}")]
    Unavailable(String),
}

/// A title/body alert raised by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

/// Fire-and-forget notification sink. Errors are logged by the engine and
/// never interrupt event processing.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        info!(event = "notification", title, body);
        Ok(())
    }
}
