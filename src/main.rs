//! ringtun CLI - loopback demo and config tooling.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use ringtun::config::{init_logging, Config};
use ringtun::tun::{
    EspPipeline, LoopbackDriver, PacketRouter, PlainPacket, TunEndpoint, TunRegistry,
};
use ringtun::VERSION;

#[derive(Parser)]
#[command(name = "ringtun", version = VERSION, about = "Ring-buffer TUN transport and packet router")]
struct Cli {
    /// Path to config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full data path against the in-process loopback driver.
    Run,
    /// Configuration tooling.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print an example configuration.
    Example,
    /// Validate a configuration file.
    Validate {
        /// File to check; defaults to the standard location.
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = ringtun::config::LoggingConfig {
        level: cli.log_level.clone(),
        ..Default::default()
    };
    init_logging(&log_config)?;

    let config = if let Some(ref path) = cli.config {
        Config::load(path).with_context(|| format!("loading {}", path.display()))?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::example()
    };

    match cli.command {
        Commands::Run => run_loopback(config).await,
        Commands::Config { command } => run_config(command, cli.config),
    }
}

fn run_config(command: ConfigCommands, cli_path: Option<PathBuf>) -> anyhow::Result<()> {
    match command {
        ConfigCommands::Example => {
            print!("{}", toml::to_string_pretty(&Config::example())?);
            Ok(())
        }
        ConfigCommands::Validate { path } => {
            let path = path
                .or(cli_path)
                .unwrap_or_else(Config::default_path);
            Config::load(&path).with_context(|| format!("validating {}", path.display()))?;
            println!("{} is valid", path.display());
            Ok(())
        }
    }
}

/// Pipeline stand-in for the demo: every outbound packet is "decrypted"
/// immediately and handed back to the router, so traffic between two
/// endpoints makes a full round trip through both rings.
struct EchoPipeline {
    router: parking_lot::Mutex<Option<Arc<PacketRouter>>>,
}

impl EchoPipeline {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            router: parking_lot::Mutex::new(None),
        })
    }

    fn attach(&self, router: Arc<PacketRouter>) {
        *self.router.lock() = Some(router);
    }
}

impl EspPipeline for EchoPipeline {
    fn queue_outbound(&self, packet: PlainPacket) -> ringtun::Result<()> {
        info!(src = %packet.src, dst = %packet.dst, len = packet.data.len(), "outbound packet");
        if let Some(router) = self.router.lock().clone() {
            router.deliver_plain(&packet.data)?;
        }
        Ok(())
    }
}

async fn run_loopback(config: Config) -> anyhow::Result<()> {
    info!(version = VERSION, "ringtun loopback demo");

    let driver = Arc::new(LoopbackDriver::new());
    let registry = Arc::new(TunRegistry::new());
    let pipeline = EchoPipeline::new();
    let router = Arc::new(PacketRouter::new(registry.clone(), pipeline.clone()));
    pipeline.attach(router.clone());

    let mut endpoints: Vec<Arc<TunEndpoint>> = Vec::new();
    if let Some(options) = config.default_endpoint.clone() {
        let endpoint = TunEndpoint::create(driver.clone(), options)?;
        registry.set_default(endpoint.clone());
        endpoints.push(endpoint);
    }
    for options in config.endpoints.clone() {
        let endpoint = TunEndpoint::create(driver.clone(), options)?;
        registry.register(endpoint.clone())?;
        endpoints.push(endpoint);
    }
    if endpoints.is_empty() {
        anyhow::bail!("no endpoints configured");
    }

    let token = router.shutdown_token();
    let router_task = router.clone().spawn();

    // Generate traffic: each configured endpoint pings the next one.
    let generator = {
        let driver = driver.clone();
        let endpoints = endpoints.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            let mut seq = 0u64;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for (i, endpoint) in endpoints.iter().enumerate() {
                    let peer = &endpoints[(i + 1) % endpoints.len()];
                    let (Some(std::net::IpAddr::V4(src)), Some(std::net::IpAddr::V4(dst))) =
                        (endpoint.address(), peer.address())
                    else {
                        continue;
                    };
                    let payload = format!("ping {seq}");
                    let packet = ringtun::tun::packet::build_ipv4_udp(src, dst, payload.as_bytes());
                    if let Err(e) = driver.inject(endpoint.device(), &packet) {
                        warn!(device = %endpoint.name(), error = %e, "inject failed");
                    }
                }
                seq += 1;
            }
        })
    };

    // Drain what the router delivers back to each device.
    let collectors: Vec<_> = endpoints
        .iter()
        .map(|endpoint| {
            let driver = driver.clone();
            let endpoint = endpoint.clone();
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        result = driver.collect_blocking(endpoint.device()) => match result {
                            Ok(packet) => {
                                info!(device = %endpoint.name(), len = packet.len(), "delivered to device");
                            }
                            Err(e) => {
                                warn!(device = %endpoint.name(), error = %e, "collect failed");
                                break;
                            }
                        }
                    }
                }
            })
        })
        .collect();

    // Periodic stats.
    let stats_task = {
        let stats = router.stats();
        let token = token.clone();
        let interval = config.router.stats_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = stats.snapshot();
                        info!(?snapshot, "router stats");
                    }
                }
            }
        })
    };

    signal::ctrl_c().await?;
    info!("shutting down");
    token.cancel();

    router_task.await?;
    generator.await?;
    stats_task.await?;
    for collector in collectors {
        collector.await?;
    }
    for endpoint in &endpoints {
        endpoint.close();
    }
    info!(stats = ?router.stats().snapshot(), "final stats");
    Ok(())
}
