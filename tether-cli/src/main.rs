//! tether – operator binary.
//!
//! `tether start` runs the host in the foreground:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (reloadable filter for `toggle-debug`).
//! 3. Probe the control socket; a live instance means exit code 2.
//! 4. Build the Ollama provider, relay and supervisor; mint the Server ID.
//! 5. Start the control socket and the transport listener.
//!
//! Every other subcommand talks to the running instance over the control
//! socket; `connect` is a terminal client for any reachable host.
//!
//! Exit codes: 0 normal, 1 fatal init failure, 2 single-instance lock held.

mod config;
mod control;

use std::io::Write as _;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use tether_core::{
    Client, ClientConfig, ClientEvent, FinishReason, Relay, RelayConfig, Supervisor,
    TerminalOutcome, Topic,
};
use tether_ollama::{OllamaConfig, OllamaProvider};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "tether", version, about = "Share a local text-generation engine with remote peers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the host in the foreground.
    Start,
    /// Stop the running host.
    Stop,
    /// Show the running host's status.
    Status,
    /// Change the model advertised to peers.
    SelectModel { model: String },
    /// Print the Server ID peers use to find this host.
    ServerId,
    /// Print the Server ID in a form suitable for QR rendering.
    ShowQr,
    /// Toggle debug logging on the running host.
    ToggleDebug,
    /// Connect to a host as a terminal client (`host:port`).
    Connect { addr: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let cfg = Config::from_env();

    let code = match run(cli.command, cfg).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("tether: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(command: Command, cfg: Config) -> anyhow::Result<i32> {
    match command {
        Command::Start => start(cfg).await,
        Command::Stop => {
            let result = control::request(&cfg.control_socket_path, "stop", None).await?;
            println!("{result}");
            Ok(0)
        }
        Command::Status => {
            let result = control::request(&cfg.control_socket_path, "status", None).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(0)
        }
        Command::SelectModel { model } => {
            let result =
                control::request(&cfg.control_socket_path, "select-model", Some(model)).await?;
            println!("model: {}", result.as_str().unwrap_or_default());
            Ok(0)
        }
        Command::ServerId => {
            let result = control::request(&cfg.control_socket_path, "server-id", None).await?;
            println!("{}", result.as_str().unwrap_or_default());
            Ok(0)
        }
        Command::ShowQr => {
            // Rendering is left to external tooling; print the payload it
            // would encode.
            let result = control::request(&cfg.control_socket_path, "server-id", None).await?;
            println!("tether://{}", result.as_str().unwrap_or_default());
            Ok(0)
        }
        Command::ToggleDebug => {
            let result = control::request(&cfg.control_socket_path, "toggle-debug", None).await?;
            println!("debug: {}", result["debug"]);
            Ok(0)
        }
        Command::Connect { addr } => {
            connect(addr).await?;
            Ok(0)
        }
    }
}

// ── Host ──────────────────────────────────────────────────────────────────────

async fn start(cfg: Config) -> anyhow::Result<i32> {
    let debug_toggle = init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "tether host starting");

    // The control socket doubles as the single-instance lock.
    if control::instance_alive(&cfg.control_socket_path).await {
        eprintln!("tether: another host is already running; stop it first");
        return Ok(2);
    }

    let provider = Arc::new(OllamaProvider::new(OllamaConfig {
        base_url: cfg.ollama_url.clone(),
        ..OllamaConfig::default()
    }));
    let relay = Relay::new(
        RelayConfig {
            host_name: cfg.host_name.clone(),
            model: cfg.model.clone(),
            max_clients: cfg.max_clients,
            ..RelayConfig::default()
        },
        provider,
    );
    let supervisor = Supervisor::new(relay.clone());

    let topic = Topic::generate();
    info!(server_id = %topic, "host identity minted");

    match relay.probe_provider().await {
        Ok(()) => info!(url = %cfg.ollama_url, "inference engine reachable"),
        Err(e) => warn!(url = %cfg.ollama_url, error = %e, "inference engine unreachable; peers will see per-request errors"),
    }

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let control_ctx = control::ControlContext {
        relay: relay.clone(),
        topic,
        debug: debug_toggle,
        stop_tx,
    };
    let control_path = cfg.control_socket_path.clone();
    tokio::spawn(async move {
        if let Err(e) = control::serve(control_path, control_ctx).await {
            warn!(error = %e, "control listener exited");
        }
    });

    let listener = tokio::net::TcpListener::bind(&cfg.bind_address)
        .await
        .with_context(|| format!("binding transport listener on {}", cfg.bind_address))?;
    info!(addr = %cfg.bind_address, server_id = %topic, "host listening");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            _ = stop_rx.wait_for(|stop| *stop) => {
                info!("stop requested over control socket");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(%peer_addr, "incoming peer socket");
                    supervisor.offer(stream).await;
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }

    supervisor.shutdown().await;
    control::cleanup_socket(&cfg.control_socket_path);
    info!("tether host stopped");
    Ok(0)
}

fn init_tracing(cfg: &Config) -> control::DebugToggle {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{reload, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let registry = tracing_subscriber::registry().with(filter_layer);
    if cfg.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    control::DebugToggle::new(handle, cfg.log_level.clone())
}

// ── Terminal client ───────────────────────────────────────────────────────────

async fn connect(addr: String) -> anyhow::Result<()> {
    if !addr.contains(':') {
        // A bare Server ID cannot be dialled without the overlay daemon,
        // but it should at least be a well-formed one.
        match addr.parse::<Topic>() {
            Ok(_) => anyhow::bail!(
                "'{addr}' is a Server ID; resolving it needs the overlay transport, connect with host:port"
            ),
            Err(e) => anyhow::bail!("'{addr}' is not a valid server id: {e}"),
        }
    }

    let stream = tokio::net::TcpStream::connect(&addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let (client, mut events) = Client::attach(stream, ClientConfig::default());

    println!("type a prompt and press enter · /abort cancels · /quit exits");
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                None | Some(ClientEvent::Disconnected) => {
                    println!("\n[disconnected]");
                    break;
                }
                Some(ClientEvent::ServerInfo(info)) => {
                    println!("[connected to {} · model {} · {:?}]", info.host_name, info.model, info.status);
                }
                Some(ClientEvent::Chunk { text, .. }) => {
                    print!("{text}");
                    std::io::stdout().flush().ok();
                }
                Some(ClientEvent::Terminal { outcome, .. }) => match outcome {
                    TerminalOutcome::Finished(FinishReason::Stop) => println!(),
                    TerminalOutcome::Finished(FinishReason::Abort) => println!("\n[aborted]"),
                    TerminalOutcome::Finished(FinishReason::Error) => println!("\n[ended with an error]"),
                    TerminalOutcome::Failed { code, message } => println!("\n[{code}: {message}]"),
                },
                Some(ClientEvent::ServerError { code, message }) => {
                    println!("[{code}: {message}]");
                }
            },
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if line == "/quit" {
                        break;
                    }
                    if line == "/abort" {
                        if let Err(e) = client.send_abort().await {
                            println!("[{e}]");
                        }
                        continue;
                    }
                    if let Err(e) = client.send_chat_start(line).await {
                        println!("[{e}]");
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    }

    Ok(())
}
