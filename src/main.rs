//! EmberMQ broker binary
//!
//! Loads the TOML configuration (if any), applies CLI overrides, wires the
//! ACL evaluator and bridge sink into the broker and serves until Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use embermq::acl::TopicAcl;
use embermq::bridge::{self, BridgeSink, NullBridge};
use embermq::broker::Broker;
use embermq::config::Config;

/// EmberMQ - MQTT 3.1.1 message broker
#[derive(Parser, Debug)]
#[command(name = "embermq")]
#[command(version)]
#[command(about = "MQTT 3.1.1 message broker with cluster federation hooks")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network host to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Worker count for message processing
    #[arg(short, long)]
    workers: Option<usize>,

    /// Port for WebSocket to listen on
    #[arg(long)]
    ws_port: Option<u16>,

    /// Path for WebSocket to listen on
    #[arg(long)]
    ws_path: Option<String>,

    /// Cluster discovery endpoint
    #[arg(short, long)]
    router: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::parse("")?,
    };

    // CLI flags override file values
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(ws_port) = args.ws_port {
        config.ws_port = Some(ws_port);
    }
    if let Some(ws_path) = args.ws_path {
        config.ws_path = ws_path;
    }
    if let Some(router) = args.router {
        config.router = Some(router);
    }
    if args.debug {
        config.debug = true;
    }
    config.validate()?;

    let level = if config.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("loaded configuration from {}", path.display());
    }

    let broker_config = config.broker_config()?;
    info!("starting EmberMQ");
    info!("  bind address: {}", broker_config.bind_addr);
    if let Some(addr) = broker_config.tls_bind_addr {
        info!("  tls address: {}", addr);
    }
    if let Some(addr) = broker_config.ws_bind_addr {
        info!("  websocket address: {} (path {})", addr, broker_config.ws_path);
    }
    info!("  workers: {}", broker_config.workers);
    info!(
        "  acl: {}",
        if config.acl.enabled { "enabled" } else { "disabled" }
    );

    let acl = TopicAcl::new(config.acl.clone());

    let sink: Arc<dyn BridgeSink> = match config.plugins.bridge.as_deref() {
        Some(name) => match bridge::sink_by_name(name) {
            Some(sink) => {
                info!("  bridge: {}", name);
                sink
            }
            None => {
                eprintln!("unknown bridge plugin: {}", name);
                std::process::exit(1);
            }
        },
        None => Arc::new(NullBridge),
    };

    if let Some(router) = &config.router {
        // Discovery dialing lives outside the core; route connections are
        // injected through Broker::accept_router by the cluster client
        info!("  router discovery endpoint: {}", router);
    }

    let broker = Arc::new(Broker::with_parts(broker_config, acl, sink));

    let runner = broker.clone();
    tokio::select! {
        result = runner.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            broker.shutdown();
        }
    }

    Ok(())
}
