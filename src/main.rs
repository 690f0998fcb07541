//! Command line interface for operating the relay. Supports serving the
//! WebSocket protocol endpoint alongside HTTP health/info routes, and checking
//! event files for well-formedness and valid signatures.

mod config;
mod event;
mod filter;
mod message;
mod registry;
mod relay;
mod server;
mod service;
mod session;
mod ws;

use std::{fs, net::SocketAddr, path::Path, sync::Arc};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::Settings;
use relay::Relay;
use service::Services;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "relayd",
    author,
    version,
    about = "Real-time Nostr event relay",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Launch the WebSocket relay and the HTTP info server.
    Serve,
    /// Decode event files and verify their ids and signatures.
    Check {
        /// Paths to JSON event files.
        #[arg(required = true)]
        files: Vec<String>,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Serve => {
            let http_addr: SocketAddr = cfg.bind_http.as_str().parse()?;
            let ws_addr: SocketAddr = cfg.bind_ws.as_str().parse()?;
            let relay = Arc::new(Relay::new(
                cfg.relay_config(),
                Services::builtin(&cfg.service_kinds),
            ));
            info!(
                verify_sig = cfg.verify_sig,
                outbox_capacity = cfg.outbox_capacity,
                service_kinds = ?relay.services().kinds(),
                "starting relay"
            );
            tokio::try_join!(
                server::serve_http(http_addr, Arc::clone(&relay), std::future::pending()),
                ws::serve_ws(ws_addr, &cfg.ws_path, relay, std::future::pending())
            )?;
        }
        Commands::Check { files } => {
            for f in files {
                check_file(&f)?;
            }
        }
    }
    Ok(())
}

/// Decode one event file and verify it.
fn check_file(path: &str) -> anyhow::Result<()> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let ev: event::Event =
        serde_json::from_str(&data).with_context(|| format!("decoding {path}"))?;
    if let Err(e) = ev.verify() {
        bail!("{path}: event {} failed verification: {e}", ev.id);
    }
    println!("{path}: ok ({})", ev.id);
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut content = String::new();
    content.push_str("BIND_HTTP=127.0.0.1:7777\n");
    content.push_str("BIND_WS=127.0.0.1:7778\n");
    content.push_str("WS_PATH=/\n");
    content.push_str("VERIFY_SIG=0\n");
    content.push_str(&format!(
        "OUTBOX_CAPACITY={}\n",
        relay::DEFAULT_OUTBOX_CAPACITY
    ));
    content.push_str("LOG_LEVEL=info\n");
    content.push_str(&format!("SERVICE_KINDS={}\n", service::AGENT_COMMAND_KIND));
    fs::write(env_path, content)?;
    Ok(())
}

/// Install the global fmt subscriber. `RUST_LOG` wins over `LOG_LEVEL`.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // settings are read twice so logging is up before anything else reports
    let level = Settings::from_env(&cli.env)
        .map(|s| s.log_level)
        .unwrap_or_else(|_| "info".into());
    init_tracing(&level);
    run(cli).await
}
