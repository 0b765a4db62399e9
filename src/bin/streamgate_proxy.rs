use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use config::Config;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use log::{error, info};
use tokio::net::TcpListener;
use tokio::time::interval;

use streamgate::proxy::cache::SegmentCache;
use streamgate::proxy::{build_client, ProxyServer};
use streamgate::settings::Settings;

#[derive(Parser, Debug)]
struct Args {
    /// Path to the config file; environment variables override it
    #[arg(long, default_value = "streamgate.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let builder = Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .add_source(config::Environment::default())
        .build()?;
    let settings: Settings = builder.try_deserialize()?;
    let settings = settings.clamped();

    let addr: SocketAddr = settings.listen_proxy.parse()?;
    info!(
        "cors proxy ready: http://{} (fetch_timeout_ms={})",
        addr, settings.fetch_timeout_ms
    );

    let cache = Arc::new(SegmentCache::new(Duration::from_secs(
        settings.stream_timeout_sec,
    )));
    let client = build_client(&settings)?;

    // expired cache sweeper
    let sweeper = cache.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            sweeper.sweep();
        }
    });

    let server = ProxyServer::new(client, cache);
    let listener = TcpListener::bind(&addr).await?;
    loop {
        let (socket, _) = listener.accept().await?;
        let io = TokioIo::new(socket);
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new().serve_connection(io, server).await {
                error!("Failed to handle request: {}", e);
            }
        });
    }
}
