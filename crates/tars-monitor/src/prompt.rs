use serde_json::Value;
use tars_link::{parse_endpoint, ConfigError};
use thiserror::Error;
use url::Url;

pub const HELP: &str = "commands: /task <text>, /kill, /stats, /memory, /save <context|preferences> <text>, \
/config <key> <value>, /url <endpoint>, /token [value], /connect, /disconnect, /help, /quit; \
anything else is sent as a chat message";

#[derive(Debug, Clone, PartialEq)]
pub enum PromptCommand {
    Message(String),
    Task(String),
    Kill,
    Stats,
    Memory,
    SaveMemory { field: String, content: String },
    Config { key: String, value: Value },
    Url(Url),
    Token(Option<String>),
    Connect,
    Disconnect,
    Help,
    Quit,
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("unknown command '{0}' (try /help)")]
    Unknown(String),
    #[error("{0} needs {1}")]
    MissingArgument(&'static str, &'static str),
    #[error("memory field must be 'context' or 'preferences', got '{0}'")]
    MemoryField(String),
    #[error(transparent)]
    Endpoint(#[from] ConfigError),
}

/// Parse one line of operator input. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<PromptCommand>, PromptError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(PromptCommand::Message(line.to_string())));
    };
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    let command = match name.to_ascii_lowercase().as_str() {
        "task" => PromptCommand::Task(required(args, "/task", "a task description")?.to_string()),
        "kill" => PromptCommand::Kill,
        "stats" => PromptCommand::Stats,
        "memory" => PromptCommand::Memory,
        "save" => {
            let args = required(args, "/save", "a field and content")?;
            let (field, content) = args.split_once(char::is_whitespace).unwrap_or((args, ""));
            if field != "context" && field != "preferences" {
                return Err(PromptError::MemoryField(field.to_string()));
            }
            PromptCommand::SaveMemory {
                field: field.to_string(),
                content: content.trim().to_string(),
            }
        }
        "config" => {
            let args = required(args, "/config", "a key and value")?;
            let Some((key, raw)) = args.split_once(char::is_whitespace) else {
                return Err(PromptError::MissingArgument("/config", "a value"));
            };
            PromptCommand::Config {
                key: key.to_string(),
                value: parse_value(raw.trim()),
            }
        }
        "url" => PromptCommand::Url(parse_endpoint(required(args, "/url", "an endpoint")?)?),
        "token" => PromptCommand::Token((!args.is_empty()).then(|| args.to_string())),
        "connect" => PromptCommand::Connect,
        "disconnect" => PromptCommand::Disconnect,
        "help" | "?" => PromptCommand::Help,
        "quit" | "exit" => PromptCommand::Quit,
        other => return Err(PromptError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn required<'a>(
    args: &'a str,
    command: &'static str,
    what: &'static str,
) -> Result<&'a str, PromptError> {
    if args.is_empty() {
        Err(PromptError::MissingArgument(command, what))
    } else {
        Ok(args)
    }
}

/// JSON when it parses (`30`, `true`, `{"a":1}`), plain string otherwise.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
