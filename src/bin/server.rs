//! SOCKS5 Relay Server Binary
//!
//! Usage: lansocks-server [OPTIONS]
//!
//! Options:
//!   -p, --port <PORT>    Listen on all interfaces at PORT
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Print a default configuration
//!   -h, --help           Print help information

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use lansocks::server::{
    ConnectionId, ConnectionStats, Server, ServerConfig, ServerConfigFile, ServerEvent,
};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG (e.g. RUST_LOG=lansocks=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        run_server(ServerConfig::default()).await?;
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-p" | "--port" => {
            if args.len() < 3 {
                eprintln!("Error: --port requires a port number");
                return Ok(());
            }
            let port: u32 = args[2]
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid port: {}", args[2]))?;
            run_server(ServerConfig::new(port)).await?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            let config = load_config(&args[2])?;
            run_server(config).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"lansocks - share this machine's connectivity over SOCKS5

USAGE:
    lansocks-server [OPTIONS]

OPTIONS:
    -p, --port <PORT>       Listen on all interfaces at PORT (default 1080)
    -c, --config <FILE>     Path to configuration file
    -g, --generate          Print a default configuration
    -h, --help              Print help information

EXAMPLES:
    Run on the default port:
        lansocks-server

    Generate a configuration, edit it, then run with it:
        lansocks-server --generate > lansocks.toml
        lansocks-server --config lansocks.toml

    Point a LAN device at it:
        curl --socks5-hostname 192.168.1.20:1080 https://example.com
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let config_file = ServerConfigFile::from_config(&ServerConfig::default());

    println!("# lansocks Server Configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("{}", config_file.to_toml()?);
    println!("# Give up on unreachable targets after N seconds (unlimited when absent):");
    println!("# connect_timeout_secs = 30");

    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<ServerConfig> {
    let content = std::fs::read_to_string(path)?;
    let config_file = ServerConfigFile::from_toml(&content)?;
    Ok(config_file.to_config()?)
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let server = Server::new(config, Arc::new(tx));

    let printer = tokio::spawn(print_events(rx));

    let addr = server.start().await?;
    println!("SOCKS5 proxy running on port {}. Press Ctrl-C to stop.", addr.port());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    server.stop().await;

    println!();
    println!("{}", server.metrics().format_report());

    drop(server);
    if let Err(e) = printer.await {
        tracing::warn!("event printer failed: {}", e);
    }
    Ok(())
}

/// Mirror of the live connection list, kept the way a UI owner would.
async fn print_events(mut rx: mpsc::UnboundedReceiver<ServerEvent>) {
    let mut table: HashMap<ConnectionId, ConnectionStats> = HashMap::new();

    while let Some(event) = rx.recv().await {
        match event {
            ServerEvent::StateChanged { running } => {
                tracing::info!("server {}", if running { "running" } else { "stopped" });
            }
            ServerEvent::Error(report) => {
                tracing::error!("{:?}: {}", report.category, report.message);
            }
            ServerEvent::ConnectionUpdated(stats) => {
                if stats.is_closed() {
                    table.remove(&stats.id);
                    tracing::info!(
                        "#{} {} → {} closed (in {} B, out {} B); {} open",
                        stats.id,
                        stats.peer_addr,
                        destination_label(&stats),
                        stats.bytes_in,
                        stats.bytes_out,
                        table.len(),
                    );
                } else {
                    let previous = table.insert(stats.id, stats.clone());
                    if previous.map(|p| p.state) != Some(stats.state) {
                        tracing::debug!(
                            "#{} {} → {} {}",
                            stats.id,
                            stats.peer_addr,
                            destination_label(&stats),
                            stats.state,
                        );
                    }
                }
            }
        }
    }
}

fn destination_label(stats: &ConnectionStats) -> String {
    stats
        .destination
        .as_ref()
        .map(|d| d.to_string())
        .unwrap_or_else(|| "?".to_string())
}
