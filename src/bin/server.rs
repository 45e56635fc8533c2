//! Hotwire Server Binary
//!
//! Starts a cache manager with a binary and an HTTP protocol server, and
//! optionally a single-port router in front of both.

use std::sync::Arc;

use clap::Parser;
use hotwire::{
    LocalCacheManager, Orchestrator, Protocol, ProtocolServerConfig, RouterConfig,
    SecurityProviders, ServerConfig,
};
use tracing_subscriber::{fmt, EnvFilter};

/// Hotwire Server
#[derive(Parser, Debug)]
#[command(name = "hotwire-server")]
#[command(about = "Remote cache server speaking the Hotwire binary protocol")]
#[command(version)]
struct Args {
    /// Listen host for every endpoint
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port of the binary protocol server
    #[arg(short, long, default_value = "11222")]
    port: u16,

    /// Port of the HTTP management server
    #[arg(long, default_value = "11223")]
    http_port: u16,

    /// Serve both protocols behind a single-port router on this port
    /// instead of separate ports
    #[arg(short, long)]
    router_port: Option<u16>,

    /// Worker threads per protocol server
    #[arg(short, long, default_value = "8")]
    workers: usize,

    /// Caches to define at startup (the "default" cache always exists)
    #[arg(short, long)]
    cache: Vec<String>,

    /// Delay applied by the HTTP stop endpoint, in milliseconds
    #[arg(long, default_value = "3000")]
    shutdown_delay_ms: u64,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hotwire=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("Hotwire Server v{}", hotwire::VERSION);

    // Behind the router the protocol servers do not bind their own ports
    let own_transport = args.router_port.is_none();
    let binary = ProtocolServerConfig::builder()
        .host(&args.host)
        .port(args.port)
        .worker_threads(args.workers)
        .start_transport(own_transport)
        .build();
    let http = ProtocolServerConfig::builder()
        .host(&args.host)
        .port(args.http_port)
        .worker_threads(args.workers.clamp(1, 4))
        .start_transport(own_transport)
        .build();

    let mut builder = ServerConfig::builder()
        .connector(Protocol::Binary, binary)
        .connector(Protocol::Http, http)
        .shutdown_delay_ms(args.shutdown_delay_ms);
    for cache in &args.cache {
        builder = builder.cache(cache);
    }
    if let Some(port) = args.router_port {
        builder = builder.router(RouterConfig {
            host: args.host.clone(),
            port,
            ..Default::default()
        });
    }
    let config = builder.build();

    let cache_manager = Arc::new(
        LocalCacheManager::new(config.cache_manager_name.clone())
            .with_caches(config.caches.iter().cloned()),
    );
    let orchestrator = Orchestrator::new(config, cache_manager, SecurityProviders::install());

    // Set up Ctrl+C handler
    let on_signal = orchestrator.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("Received Ctrl+C, initiating shutdown...");
        on_signal.stop();
    }) {
        tracing::warn!("Cannot install Ctrl+C handler: {}", e);
    }

    if let Err(e) = orchestrator.run() {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Server stopped");
}
