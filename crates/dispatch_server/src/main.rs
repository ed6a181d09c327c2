use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;

use dispatch_core::config::EngineConfig;
use dispatch_core::directory::StaticDirectory;
use dispatch_core::engine::Engine;
use dispatch_core::notify::NoopPushGateway;
use dispatch_core::store::InMemoryRideStore;

mod connection;
mod wire;

/// WebSocket front end for the real-time dispatch engine.
#[derive(Debug, Parser)]
#[command(name = "dispatch_server")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "DISPATCH_BIND", default_value = "0.0.0.0:9100")]
    bind: SocketAddr,
    /// Candidate search radius in kilometers.
    #[arg(long, default_value_t = 10.0)]
    radius_km: f64,
    /// Seconds a driver may sit on an offer before it counts as a
    /// rejection.
    #[arg(long, default_value_t = 30)]
    offer_timeout_secs: u64,
    /// Offer rounds per ride before giving up.
    #[arg(long, default_value_t = 8)]
    max_offer_attempts: usize,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = EngineConfig::default()
        .with_radius_km(args.radius_km)
        .with_offer_timeout(Duration::from_secs(args.offer_timeout_secs))
        .with_max_offer_attempts(args.max_offer_attempts);
    let engine = Engine::new(
        config,
        Arc::new(InMemoryRideStore::new()),
        Arc::new(StaticDirectory::new()),
        Arc::new(NoopPushGateway),
    );

    let listener = match TcpListener::bind(args.bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {err}", args.bind);
            std::process::exit(1);
        }
    };
    info!("dispatch server listening on ws://{}", args.bind);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let engine = engine.clone();
                tokio::spawn(async move {
                    connection::handle_connection(stream, addr, engine).await;
                });
            }
            Err(err) => error!("accept failed: {err}"),
        }
    }
}
