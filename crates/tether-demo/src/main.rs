//! Command-line front end for the tether protocol.
//!
//! `tether serve` runs an echo server over TCP, `tether request` and
//! `tether signal` talk to one. Settings come from `tether.ron` in the
//! config directory and can be overridden with flags, e.g.
//! `tether --port 9000 request echo "hello"`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tether_config::{CliArgs, ClientConfig, Config, ServerConfig, default_config_dir};
use tether_net::platform::bind;
use tether_net::{
    CallContext, Client, ClientConnection, ClientError, ClientOptions, HandlerError, Payload,
    Server, ServerHandler, ServerOptions, SocketConfig, TcpDialer,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tether", about = "Request/reply and signal messaging over TCP")]
struct Cli {
    #[command(flatten)]
    args: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the echo server until Ctrl-C.
    Serve,
    /// Send one request and print the reply.
    Request {
        /// Request name.
        name: String,
        /// UTF-8 payload.
        #[arg(default_value = "")]
        payload: String,
        /// Restore this session before sending.
        #[arg(long)]
        session: Option<String>,
        /// Deadline for the whole call, in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Send one fire-and-forget signal.
    Signal {
        /// Signal name.
        name: String,
        /// UTF-8 payload.
        #[arg(default_value = "")]
        payload: String,
    },
}

/// Echoes payloads back and hands out sessions.
struct EchoHandler;

#[async_trait]
impl ServerHandler for EchoHandler {
    async fn on_client_connected(&self, client: &ClientConnection) {
        info!(connection = %client.id(), addr = client.remote_addr(), "client connected");
    }

    async fn on_client_disconnected(&self, client: &ClientConnection) {
        info!(connection = %client.id(), "client disconnected");
    }

    async fn on_signal(&self, client: &ClientConnection, name: Option<&str>, payload: Payload) {
        info!(
            connection = %client.id(),
            name = name.unwrap_or("-"),
            len = payload.len(),
            "signal received"
        );
    }

    async fn on_request(
        &self,
        client: &ClientConnection,
        name: Option<&str>,
        payload: Payload,
    ) -> Result<Payload, HandlerError> {
        match name {
            None | Some("echo") => Ok(payload),
            Some("login") => {
                let info = payload
                    .to_text()
                    .filter(|text| !text.is_empty())
                    .map(|text| {
                        serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
                    });
                let session = client
                    .create_session(info)
                    .await
                    .map_err(|e| HandlerError::application("E_SESSION", e.to_string()))?;
                Ok(Payload::utf8(session.key))
            }
            Some("whoami") => match client.session() {
                Some(session) => Ok(Payload::utf8(session.key)),
                None => Err(HandlerError::application("E_NO_SESSION", "no session")),
            },
            Some(other) => Err(HandlerError::application(
                "E_UNKNOWN",
                format!("unknown request: {other}"),
            )),
        }
    }
}

fn client_options(config: &ClientConfig) -> ClientOptions {
    ClientOptions {
        autoconnect: config.autoconnect,
        request_timeout: config.request_timeout(),
        dial_timeout: config.dial_timeout(),
        reconnection_interval: config.reconnection_interval(),
        heartbeat_interval: config.heartbeat_interval(),
        buffer_size: config.buffer_size,
    }
}

fn server_options(config: &ServerConfig) -> ServerOptions {
    ServerOptions {
        sessions_enabled: config.sessions_enabled,
        max_connections: config.max_connections,
        max_session_connections: config.max_session_connections,
        read_timeout: config.read_timeout(),
        buffer_size: config.buffer_size,
        sub_protocol: config.sub_protocol.clone(),
        socket: SocketConfig::default(),
    }
}

fn payload_arg(text: &str) -> Payload {
    if text.is_empty() {
        Payload::default()
    } else {
        Payload::utf8(text)
    }
}

fn print_reply(payload: &Payload) {
    match payload.to_text() {
        Some(text) => println!("{text}"),
        None => println!("<{} bytes>", payload.len()),
    }
}

async fn serve(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let options = server_options(config);
    let listener = bind(&config.address(), &options.socket).await?;
    let server = Server::new(options, Arc::new(EchoHandler));

    let accept = {
        let server = server.clone();
        tokio::spawn(async move { server.run(listener).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop();
    accept.await??;
    Ok(())
}

async fn send_request(
    client: &Client,
    ctx: &CallContext,
    session: Option<&str>,
    name: &str,
    payload: &str,
) -> Result<(), ClientError> {
    if let Some(key) = session {
        client.restore_session(ctx, key).await?;
    }
    let reply = client.request(ctx, Some(name), payload_arg(payload)).await?;
    print_reply(&reply);
    Ok(())
}

async fn run_client(
    config: &ClientConfig,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new(TcpDialer::new(config.address()), client_options(config));

    let result = match command {
        Command::Request {
            name,
            payload,
            session,
            timeout_ms,
        } => {
            let ctx = match timeout_ms {
                Some(ms) => CallContext::with_timeout(Duration::from_millis(ms)),
                None => CallContext::new(),
            };
            send_request(&client, &ctx, session.as_deref(), &name, &payload).await
        }
        Command::Signal { name, payload } => {
            client
                .signal(&CallContext::new(), Some(&name), payload_arg(&payload))
                .await
        }
        Command::Serve => Ok(()),
    };

    client.close().await;
    result.map_err(Into::into)
}

fn load_config(args: &CliArgs) -> (Config, Option<PathBuf>) {
    let config_dir = match args.config.clone().map(Ok).unwrap_or_else(default_config_dir) {
        Ok(dir) => Some(dir),
        Err(e) => {
            eprintln!("{e}, using defaults");
            None
        }
    };

    let mut config = match &config_dir {
        Some(dir) => Config::load_or_create(dir).unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}, using defaults");
            Config::default()
        }),
        None => Config::default(),
    };
    config.apply_cli_overrides(args);
    (config, config_dir)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (config, config_dir) = load_config(&cli.args);

    let log_dir = config_dir.as_deref().map(|dir| config.log_dir(dir));
    let json_file = config.logging.json_file;
    if let Err(e) = tether_log::init_logging(log_dir.as_deref(), json_file, Some(&config)) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let result = match cli.command {
        Command::Serve => serve(&config.server).await,
        command => run_client(&config.client, command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
