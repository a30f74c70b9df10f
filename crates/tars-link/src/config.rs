use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Port the agent's dashboard socket listens on during local development.
pub const LOCAL_WS_PORT: u16 = 8421;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 5;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 15;
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
/// Path the relay serves its socket on. Only the relay answers a text
/// `ping`; the agent's own socket treats it as a malformed command.
pub const RELAY_WS_PATH: &str = "/ws";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid url '{input}': {source}")]
    InvalidUrl {
        input: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported scheme '{0}' (expected ws, wss, http or https)")]
    UnsupportedScheme(String),
    #[error("page origin '{0}' has no host")]
    MissingHost(String),
    #[error("invalid backoff: {0}")]
    InvalidBackoff(String),
}

/// Bounded exponential delay between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    initial: Duration,
    factor: f64,
    max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
            factor: DEFAULT_BACKOFF_FACTOR,
            max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, factor: f64, max: Duration) -> Result<Self, ConfigError> {
        if initial.is_zero() {
            return Err(ConfigError::InvalidBackoff(
                "initial delay must be positive".to_string(),
            ));
        }
        if !factor.is_finite() || factor < 1.0 {
            return Err(ConfigError::InvalidBackoff(format!(
                "growth factor must be >= 1, got {factor}"
            )));
        }
        if max < initial {
            return Err(ConfigError::InvalidBackoff(format!(
                "cap {}ms is below initial delay {}ms",
                max.as_millis(),
                initial.as_millis()
            )));
        }
        Ok(Self {
            initial,
            factor,
            max,
        })
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `attempt` (1-based) of a failure streak.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let scaled = self.initial.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

/// Most entries each history slice keeps; older ones are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    pub tasks: usize,
    pub thinking: usize,
    pub chat: usize,
    pub actions: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            tasks: 200,
            thinking: 500,
            chat: 500,
            actions: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub url: Url,
    pub token: Option<String>,
    pub backoff: BackoffPolicy,
    pub heartbeat_interval: Duration,
    /// Text keepalive period; only sent to relay endpoints.
    pub keepalive_interval: Option<Duration>,
    pub history: HistoryLimits,
    pub notifications: bool,
    pub auto_connect: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: local_endpoint(),
            token: None,
            backoff: BackoffPolicy::default(),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            keepalive_interval: Some(Duration::from_secs(DEFAULT_KEEPALIVE_SECS)),
            history: HistoryLimits::default(),
            notifications: true,
            auto_connect: true,
        }
    }
}

impl LinkConfig {
    pub fn with_url(url: Url) -> Self {
        Self {
            url,
            ..Self::default()
        }
    }
}

pub fn local_endpoint() -> Url {
    Url::parse(&format!("ws://localhost:{LOCAL_WS_PORT}/")).expect("static local endpoint")
}

/// Same-origin endpoint for a deployed dashboard: `wss` behind `https`,
/// `ws` otherwise, always at `/ws`.
pub fn endpoint_for_page(origin: &str) -> Result<Url, ConfigError> {
    let mut url = parse_url(origin)?;
    if url.host_str().is_none() {
        return Err(ConfigError::MissingHost(origin.to_string()));
    }
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };
    set_scheme(&mut url, scheme)?;
    url.set_path(RELAY_WS_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Parse an explicit endpoint, accepting http(s) as an alias for ws(s).
pub fn parse_endpoint(input: &str) -> Result<Url, ConfigError> {
    let mut url = parse_url(input)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };
    set_scheme(&mut url, scheme)?;
    Ok(url)
}

/// Whether `url` points at the relay rather than the agent's own socket.
pub fn is_relay_endpoint(url: &Url) -> bool {
    url.path() == RELAY_WS_PATH
}

/// Endpoint with the credential attached the way the relay expects it.
pub fn authorized_endpoint(url: &Url, token: Option<&str>) -> Url {
    let mut url = url.clone();
    if let Some(token) = token.filter(|value| !value.trim().is_empty()) {
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "token")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            for (key, value) in &retained {
                pairs.append_pair(key, value);
            }
            pairs.append_pair("token", token);
        }
    }
    url
}

fn set_scheme(url: &mut Url, scheme: &str) -> Result<(), ConfigError> {
    if url.scheme() == scheme {
        return Ok(());
    }
    let from = url.scheme().to_string();
    url.set_scheme(scheme)
        .map_err(|_| ConfigError::UnsupportedScheme(from))
}

fn parse_url(input: &str) -> Result<Url, ConfigError> {
    Url::parse(input.trim()).map_err(|source| ConfigError::InvalidUrl {
        input: input.to_string(),
        source,
    })
}
