mod logging;
mod prompt;
mod view;

use clap::Parser;
use std::{env, error::Error, sync::Arc, time::Duration};
use tars_link::{
    endpoint_for_page, local_endpoint, parse_endpoint, BackoffPolicy, ConfigError, Engine,
    EngineHandle, EngineStopped, HistoryLimits, LinkConfig, WsDialer, DEFAULT_BACKOFF_FACTOR,
    DEFAULT_BACKOFF_INITIAL_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_HEARTBEAT_SECS,
    DEFAULT_KEEPALIVE_SECS,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use url::Url;

use crate::prompt::{PromptCommand, HELP};
use crate::view::{ChangePrinter, StdoutNotifier};

#[derive(Parser, Debug)]
#[command(name = "tars-monitor", about = "Follow a TARS agent from the terminal")]
struct Args {
    /// Explicit endpoint (ws, wss, http or https).
    #[arg(long, default_value = "")]
    url: String,
    /// Dashboard page origin; the endpoint becomes <origin>/ws.
    #[arg(long, default_value = "")]
    page_origin: String,
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long)]
    heartbeat_secs: Option<u64>,
    #[arg(long)]
    backoff_initial_ms: Option<u64>,
    #[arg(long)]
    backoff_max_ms: Option<u64>,
    /// Relay keepalive period; 0 disables it. Never sent to the local agent.
    #[arg(long)]
    keepalive_secs: Option<u64>,
    #[arg(long)]
    no_notify: bool,
    /// Start disconnected; use /connect.
    #[arg(long)]
    no_connect: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error("{var} must be a whole number, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct RuntimeConfig {
    link: LinkConfig,
    log_dir: String,
    log_stderr: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let config = load_config(args)?;
    let _log_guard = logging::init_logging(&config.log_dir, config.log_stderr);
    info!(event = "monitor_starting", url = %config.link.url);

    let dialer = WsDialer::new(config.link.keepalive_interval);
    let (handle, engine_task) = Engine::spawn(config.link, dialer, Arc::new(StdoutNotifier));
    let mut connection = handle.connection();
    let mut state = handle.state();
    let mut printer = ChangePrinter::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    loop {
        tokio::select! {
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *connection.borrow_and_update();
                println!("[link] {current}");
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                for line in printer.diff(&snapshot) {
                    println!("{line}");
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match prompt::parse_line(&line) {
                    Ok(Some(PromptCommand::Quit)) => break,
                    Ok(Some(PromptCommand::Help)) => println!("{HELP}"),
                    Ok(Some(command)) => {
                        if dispatch(&handle, command).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => println!("! {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown();
    engine_task.await?;
    info!(event = "monitor_stopped");
    Ok(())
}

fn dispatch(handle: &EngineHandle, command: PromptCommand) -> Result<(), EngineStopped> {
    match command {
        PromptCommand::Message(text) => {
            if !handle.connection().borrow().is_connected() {
                println!("! not connected; message not sent");
                return Ok(());
            }
            handle.send_message(text)
        }
        PromptCommand::Task(text) => handle.send_task(text),
        PromptCommand::Kill => handle.kill_agent(),
        PromptCommand::Stats => handle.request_stats(),
        PromptCommand::Memory => handle.request_memory(),
        PromptCommand::SaveMemory { field, content } => handle.save_memory(field, content),
        PromptCommand::Config { key, value } => handle.update_config(key, value),
        PromptCommand::Url(url) => {
            println!("[link] endpoint set to {url}; applies on next connect");
            handle.set_ws_url(url)
        }
        PromptCommand::Token(token) => handle.set_auth_token(token),
        PromptCommand::Connect => handle.connect(),
        PromptCommand::Disconnect => handle.disconnect(),
        PromptCommand::Help | PromptCommand::Quit => Ok(()),
    }
}

fn load_config(args: Args) -> Result<RuntimeConfig, StartupError> {
    let url = resolve_endpoint(&args.url, &args.page_origin)?;
    let heartbeat_secs = resolve_number(
        args.heartbeat_secs,
        "TARS_HEARTBEAT_SECS",
        DEFAULT_HEARTBEAT_SECS,
    )?;
    let initial_ms = resolve_number(
        args.backoff_initial_ms,
        "TARS_BACKOFF_INITIAL_MS",
        DEFAULT_BACKOFF_INITIAL_MS,
    )?;
    let max_ms = resolve_number(
        args.backoff_max_ms,
        "TARS_BACKOFF_MAX_MS",
        DEFAULT_BACKOFF_MAX_MS,
    )?;
    let keepalive_secs = resolve_number(
        args.keepalive_secs,
        "TARS_KEEPALIVE_SECS",
        DEFAULT_KEEPALIVE_SECS,
    )?;
    let backoff = BackoffPolicy::new(
        Duration::from_millis(initial_ms),
        DEFAULT_BACKOFF_FACTOR,
        Duration::from_millis(max_ms),
    )?;
    let link = LinkConfig {
        url,
        token: flag_or_env(&args.token, "TARS_AUTH_TOKEN"),
        backoff,
        heartbeat_interval: Duration::from_secs(heartbeat_secs.max(1)),
        keepalive_interval: (keepalive_secs > 0).then(|| Duration::from_secs(keepalive_secs)),
        history: HistoryLimits::default(),
        notifications: !args.no_notify && resolve_bool("TARS_NOTIFY", true),
        auto_connect: !args.no_connect,
    };
    Ok(RuntimeConfig {
        link,
        log_dir: flag_or_env(&args.log_dir, "TARS_LOG_DIR").unwrap_or_else(|| ".tars/logs".to_string()),
        log_stderr: resolve_bool("TARS_LOG_STDOUT", false),
    })
}

/// Explicit endpoint first, then a page origin, then the local agent.
fn resolve_endpoint(flag_url: &str, flag_origin: &str) -> Result<Url, ConfigError> {
    if let Some(url) = flag_or_env(flag_url, "TARS_WS_URL") {
        return parse_endpoint(&url);
    }
    if let Some(origin) = flag_or_env(flag_origin, "TARS_PAGE_ORIGIN") {
        return endpoint_for_page(&origin);
    }
    Ok(local_endpoint())
}

fn flag_or_env(flag: &str, var: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_number(flag: Option<u64>, var: &'static str, default: u64) -> Result<u64, StartupError> {
    if let Some(value) = flag {
        return Ok(value);
    }
    match flag_or_env("", var) {
        Some(value) => value
            .parse()
            .map_err(|_| StartupError::InvalidNumber { var, value }),
        None => Ok(default),
    }
}

fn resolve_bool(var: &str, default: bool) -> bool {
    env::var(var)
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(default)
}

fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
