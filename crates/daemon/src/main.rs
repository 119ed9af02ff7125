/// Anonymous tunnel daemon
///
/// Runs a tunnel node that:
/// - Builds layered-encrypted circuits over UDP
/// - Relays and exits circuits for other peers
/// - Serves SOCKS5 UDP proxies, one per hop count
/// - Hosts introduction and rendezvous points for hidden downloads

use anyhow::Result;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

use anontunnel_common::NodeConfig;
use anontunnel_daemon::{load_or_generate_identity, LocalDht, NoTorrents, ProxyManager, TunnelNode};

const DEFAULT_CONFIG: &str = "anontunnel.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("help" | "--help" | "-h") => {
            print_help();
            Ok(())
        }
        Some("version" | "--version" | "-v") => {
            println!("anontunnel-daemon v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some("run") => run(args.get(2).map(PathBuf::from)).await,
        None => run(None).await,
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    }
}

/// Load the configuration, writing the defaults out if there is none
fn load_config(path: &Path) -> Result<(NodeConfig, bool)> {
    if path.exists() {
        return Ok((NodeConfig::from_file(&path.to_path_buf())?, false));
    }
    Ok((NodeConfig::default(), true))
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config_path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let (config, fresh) = load_config(&config_path)?;

    // Initialize logging
    let level = if config.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting anontunnel daemon v{}", env!("CARGO_PKG_VERSION"));
    if fresh {
        info!("No configuration file found, using defaults");
        match config.to_file(&config_path) {
            Ok(()) => info!("Saved default configuration to {:?}", config_path),
            Err(e) => warn!("Failed to save default config: {}", e),
        }
    } else {
        info!("Loaded configuration from {:?}", config_path);
    }

    let identity = load_or_generate_identity(Path::new(&config.data_dir))?;
    let node = TunnelNode::bind(
        &config,
        identity,
        Arc::new(LocalDht::new()),
        Arc::new(NoTorrents),
    )
    .await?;

    let proxy_ip: IpAddr = "127.0.0.1".parse()?;
    let proxies =
        ProxyManager::bind(proxy_ip, &config.tunnel.socks_listen_ports, node.handle().events)
            .await?;
    for (index, addr) in proxies.local_addrs().iter().enumerate() {
        info!("SOCKS5 for {}-hop circuits on {}", index + 1, addr);
    }

    let proxy_task = tokio::spawn(proxies.start());

    info!("Node is running. Press Ctrl+C to stop.");
    node.run_until(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Shutdown signal received");
    })
    .await?;

    proxy_task.abort();
    info!("Node stopped");
    Ok(())
}

/// Print help message
fn print_help() {
    println!("anontunnel daemon - onion-routed UDP tunnels for P2P downloads");
    println!();
    println!("USAGE:");
    println!("    anontunnel-daemon [COMMAND] [CONFIG]");
    println!();
    println!("COMMANDS:");
    println!("    run         Run the tunnel node (default)");
    println!("    help        Show this help message");
    println!("    version     Show version information");
    println!();
    println!("CONFIG:");
    println!("    Path to a TOML configuration file (default: {})", DEFAULT_CONFIG);
    println!("    A file with the defaults is written when none exists.");
    println!();
    println!("PROXIES:");
    println!("    SOCKS5 UDP ASSOCIATE on 127.0.0.1:1080 (1 hop), :1081 (2 hops), :1082 (3 hops)");
    println!();
    println!("EXAMPLES:");
    println!("    anontunnel-daemon");
    println!("    anontunnel-daemon run /etc/anontunnel.toml");
}
