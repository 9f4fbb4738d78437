use std::collections::HashMap;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use connector_session::codec::{JsonCodec, RconCodec, json};
use connector_session::config::{ENV_PASSWORD, ENV_SERVER_URL, ENV_TOKEN, ENV_TOKEN_URL, ENV_USERNAME};
use connector_session::transport::{TcpTransport, WebSocketTransport};
use connector_session::{
    Command, ConfigError, CredentialManager, Event, Session, SessionConfig, SessionError, TokenHttpClient,
    TokenPlacement,
};
use serde_json::Value;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("invalid --param `{0}`; expected key=value")]
    InvalidParam(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "connector", about = "Drive a connector session against a live server")]
struct Cli {
    #[arg(long, env = ENV_SERVER_URL)]
    server_url: String,

    #[arg(long, env = ENV_TOKEN)]
    token: Option<String>,

    #[arg(long, env = ENV_USERNAME)]
    username: Option<String>,

    #[arg(long, env = ENV_PASSWORD)]
    password: Option<String>,

    #[arg(long, env = ENV_TOKEN_URL)]
    token_url: Option<String>,

    #[arg(long, env = "CONNECTOR_COMMAND_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Duplex JSON session over WebSocket.
    Ws(WsCommand),
    /// Remote console session over TCP.
    Rcon(RconCommand),
    /// Token-authenticated HTTP request.
    Http(HttpCommand),
}

#[derive(Args, Debug)]
struct WsCommand {
    #[command(subcommand)]
    command: WsSubcommand,
}

#[derive(Subcommand, Debug)]
enum WsSubcommand {
    /// Issue one command and print its result.
    Call {
        op: String,
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Print every event for the given topics until Ctrl-C.
    Watch {
        #[arg(required = true)]
        topics: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct RconCommand {
    #[command(subcommand)]
    command: RconSubcommand,
}

#[derive(Subcommand, Debug)]
enum RconSubcommand {
    Exec {
        #[arg(required = true, trailing_var_arg = true)]
        words: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct HttpCommand {
    #[command(subcommand)]
    command: HttpSubcommand,
}

#[derive(Subcommand, Debug)]
enum HttpSubcommand {
    Get {
        path: String,
        /// Send the token as this query parameter.
        #[arg(long, conflicts_with = "token_header")]
        token_param: Option<String>,
        /// Send the token in this header. Defaults to a bearer token.
        #[arg(long)]
        token_header: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = session_config(&cli)?;

    match cli.command {
        Mode::Ws(ws) => run_ws(config, ws).await,
        Mode::Rcon(rcon) => run_rcon(config, rcon).await,
        Mode::Http(http) => run_http(config, http).await,
    }
}

/// Route CLI values through the same lookup the library uses for the
/// environment, so flag and env precedence stay identical. Keys without a
/// flag come from the process environment.
fn session_config(cli: &Cli) -> Result<SessionConfig, CliError> {
    session_config_with(cli, |key| std::env::var(key).ok())
}

fn session_config_with(cli: &Cli, env: impl Fn(&str) -> Option<String>) -> Result<SessionConfig, CliError> {
    let mut flags = HashMap::new();
    flags.insert(ENV_SERVER_URL, Some(cli.server_url.clone()));
    flags.insert(ENV_TOKEN, cli.token.clone());
    flags.insert(ENV_USERNAME, cli.username.clone());
    flags.insert(ENV_PASSWORD, cli.password.clone());
    flags.insert(ENV_TOKEN_URL, cli.token_url.clone());
    let mut config = SessionConfig::from_lookup(|key| match flags.get(key) {
        Some(value) => value.clone(),
        None => env(key),
    })?;
    if let Some(ms) = cli.timeout_ms {
        config = config.with_command_timeout(Duration::from_millis(ms));
        config.validate()?;
    }
    Ok(config)
}

async fn run_ws(config: SessionConfig, ws: WsCommand) -> Result<(), CliError> {
    let transport = WebSocketTransport::new(config.server_url.clone()).with_default_path(json::SOCKET_PATH);
    let config = config.with_keepalive(KEEPALIVE_INTERVAL, Command::new(json::PING));
    let session = Session::new(config, transport, JsonCodec)?;

    match ws.command {
        WsSubcommand::Call { op, params } => {
            let mut command = Command::new(op);
            for param in &params {
                let (key, value) = parse_param(param)?;
                command = command.with_param(key, value);
            }
            session.connect().await?;
            let result = session.send_command(command).await;
            session.disconnect().await;
            print_json(&result?)
        }
        WsSubcommand::Watch { topics } => {
            for topic in topics {
                session.subscribe(topic, print_event);
            }
            session.connect().await?;
            tokio::signal::ctrl_c().await?;
            session.disconnect().await;
            Ok(())
        }
    }
}

async fn run_rcon(config: SessionConfig, rcon: RconCommand) -> Result<(), CliError> {
    let transport = TcpTransport::new(config.server_url.clone());
    let session = Session::new(config, transport, RconCodec)?;

    match rcon.command {
        RconSubcommand::Exec { words } => {
            let (op, args) = words.split_first().map_or((String::new(), &[][..]), |(op, rest)| (op.clone(), rest));
            let mut command = Command::new(op);
            if !args.is_empty() {
                command = command.with_param("args", args.join(" "));
            }
            session.connect().await?;
            let result = session.send_command(command).await;
            session.disconnect().await;
            match result? {
                Value::String(text) => {
                    println!("{text}");
                    Ok(())
                }
                other => print_json(&other),
            }
        }
    }
}

async fn run_http(config: SessionConfig, http: HttpCommand) -> Result<(), CliError> {
    let credentials = CredentialManager::new(config.credentials.clone());
    match http.command {
        HttpSubcommand::Get { path, token_param, token_header } => {
            let placement = match (token_param, token_header) {
                (Some(name), _) => TokenPlacement::Query { name },
                (None, Some(name)) => TokenPlacement::Header { name },
                (None, None) => TokenPlacement::Bearer,
            };
            let client = TokenHttpClient::new(config.server_url, credentials, placement);
            let value = client.get(&path).await?;
            print_json(&value)
        }
    }
}

fn parse_param(raw: &str) -> Result<(String, Value), CliError> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(CliError::InvalidParam(raw.to_owned()));
    };
    if key.is_empty() {
        return Err(CliError::InvalidParam(raw.to_owned()));
    }
    // bare words are strings; anything that parses as JSON keeps its type
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok((key.to_owned(), value))
}

fn print_event(event: Event) {
    let line = serde_json::json!({
        "topic": event.topic,
        "event_type": event.event_type,
        "value": event.payload(),
    });
    println!("{line}");
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
