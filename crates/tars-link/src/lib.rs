//! Connection and state-synchronization engine for the TARS agent dashboard.
//!
//! [`Engine`] owns one WebSocket link to the agent, keeps it alive across
//! transient failures and folds the inbound event stream into a
//! [`tars_core::DashboardState`] that any number of observers can watch.

pub mod config;
pub mod connection;
pub mod engine;
pub mod heartbeat;
pub mod notify;
pub mod router;
pub mod ws;

pub use config::{
    authorized_endpoint, endpoint_for_page, is_relay_endpoint, local_endpoint, parse_endpoint,
    BackoffPolicy, ConfigError, HistoryLimits, LinkConfig, DEFAULT_BACKOFF_FACTOR,
    DEFAULT_BACKOFF_INITIAL_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_HEARTBEAT_SECS,
    DEFAULT_KEEPALIVE_SECS, LOCAL_WS_PORT, RELAY_WS_PATH,
};
pub use connection::{ConnectionManager, DialTarget, Dialer, LinkEvent, LinkEventKind, LinkHandle};
pub use engine::{Engine, EngineCommand, EngineHandle, EngineStopped};
pub use heartbeat::HeartbeatPoller;
pub use notify::{Notification, Notifier, NotifyError, TracingNotifier};
pub use router::{RouteOutcome, Router};
pub use ws::WsDialer;
