//! Relay Agent
//!
//! A CLI tool for exposing a local HTTP server through a publish/subscribe
//! relay. The agent claims a subdomain on the bus, receives requests for it,
//! forwards them to `localhost:{port}` and streams the responses back.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay_agent::agent::{create_event_channel, supervise, AgentEvent, EventSink};
use relay_agent::bus::{SharedBus, WsBus};
use relay_agent::config::{parse_bus_url, Config};
use relay_agent::error::BusError;

const DEFAULT_BUS_URL: &str = "ws://localhost:4000/bus";

#[derive(Parser, Debug)]
#[command(name = "relay-agent")]
#[command(author, version, about = "Expose a local HTTP server through a relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Bus endpoint (ws:// or wss://)
    #[arg(short, long, global = true, env = "RELAY_BUS_URL")]
    bus_url: Option<String>,

    /// Session credential
    #[arg(short = 'k', long, global = true, env = "RELAY_TOKEN")]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Claim a subdomain and relay its requests to a local port
    Start(StartArgs),

    /// Save a credential to the config file
    Login,
}

#[derive(Parser, Debug)]
struct StartArgs {
    /// Subdomain to claim
    #[arg(short, long, env = "RELAY_SUBDOMAIN")]
    subdomain: Option<String>,

    /// Local port to forward to
    #[arg(short, long, env = "RELAY_PORT")]
    port: Option<u16>,

    /// Per-request deadline in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Maximum requests executing at once
    #[arg(long)]
    max_concurrent: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().unwrap_or_default();

    // Resolve bus URL from CLI > config > default
    let bus_url = cli
        .bus_url
        .or(config.auth.bus_url.clone())
        .unwrap_or_else(|| DEFAULT_BUS_URL.to_string());

    match cli.command {
        Some(Commands::Start(args)) => {
            run_start(cli.token, cli.verbose, &bus_url, args, config).await
        }
        Some(Commands::Login) => run_login(&bus_url),
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            eprintln!();
            eprintln!("Quick start:");
            eprintln!("  relay-agent login -b <bus-url>                  Save your credential");
            eprintln!("  relay-agent start -s <subdomain> -p <port>      Start relaying");
            std::process::exit(1);
        }
    }
}

async fn run_start(
    cli_token: Option<String>,
    verbose: bool,
    bus_url: &str,
    args: StartArgs,
    mut config: Config,
) -> Result<()> {
    init_logging(verbose);

    let token = cli_token.or(config.auth.token.clone()).ok_or_else(|| {
        anyhow::anyhow!(
            "Credential required. Use --token, set RELAY_TOKEN environment variable, \n\
             or run 'relay-agent login' to save one to {:?}",
            Config::config_path().unwrap_or_default()
        )
    })?;
    let subdomain = args
        .subdomain
        .or(config.tunnel.subdomain.clone())
        .context("Subdomain required. Use --subdomain or set [tunnel] subdomain in the config file")?;
    let port = args
        .port
        .or(config.tunnel.local_port)
        .context("Local port required. Use --port or set [tunnel] local_port in the config file")?;

    if let Some(timeout) = args.timeout {
        config.limits.request_timeout_secs = timeout;
    }
    if let Some(max) = args.max_concurrent {
        config.limits.max_concurrent_requests = max;
    }

    let url = parse_bus_url(bus_url)?;
    let agent_config = config.agent_config(token, subdomain, port);
    agent_config.validate()?;
    debug!("{:?}", agent_config);

    let (event_tx, event_rx) = create_event_channel();
    let events = EventSink::new(Some(event_tx));
    tokio::spawn(log_events(event_rx));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down...");
                shutdown.cancel();
            }
        });
    }

    info!(
        "Relaying '{}' to localhost:{} via {}",
        agent_config.subdomain, port, url
    );

    supervise(
        || {
            let url = url.to_string();
            async move {
                let bus: SharedBus = WsBus::connect(&url).await?;
                Ok::<_, BusError>(bus)
            }
        },
        &agent_config,
        events,
        shutdown,
    )
    .await
    .context("Tunnel session failed")
}

fn run_login(bus_url: &str) -> Result<()> {
    parse_bus_url(bus_url)?;

    println!("Paste the credential issued for {} below.", bus_url);
    println!();

    print!("Token: ");
    use std::io::{self, Write};
    io::stdout().flush()?;

    let mut token = String::new();
    io::stdin().read_line(&mut token)?;
    let token = token.trim().to_string();

    if token.is_empty() {
        anyhow::bail!("No token provided");
    }

    let mut config = Config::load().unwrap_or_default();
    config.auth.token = Some(token);
    config.auth.bus_url = Some(bus_url.to_string());
    config.save()?;

    println!();
    println!(
        "Token saved to {:?}",
        Config::config_path().unwrap_or_default()
    );
    println!("You can now run: relay-agent start -s <subdomain> -p <port>");

    Ok(())
}

/// Status callback consumer: every agent event becomes a log line
async fn log_events(mut rx: mpsc::Receiver<AgentEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::SessionStatus { subdomain, state } => {
                info!("Tunnel '{}' is {}", subdomain, state)
            }
            AgentEvent::HeartbeatFailed {
                consecutive,
                reason,
            } => warn!("Heartbeat missed ({}): {}", consecutive, reason),
            AgentEvent::RequestReceived(req) => {
                debug!("<- {} {} {}", req.request_id, req.method, req.path)
            }
            AgentEvent::RequestFinished(res) => match (res.status, res.error) {
                (_, Some(code)) => info!("-> {} {} ({:?})", res.request_id, code, res.duration),
                (Some(status), None) => {
                    info!("-> {} {} ({:?})", res.request_id, status, res.duration)
                }
                (None, None) => debug!("-> {} done", res.request_id),
            },
            AgentEvent::Fatal { reason } => error!("{}", reason),
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
