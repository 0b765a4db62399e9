use std::ffi::CStr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use config::Config;
use ffmpeg_sys_next::{av_version_info, avformat_network_init};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::time::interval;

use streamgate::http::GatewayServer;
use streamgate::registry::StreamRegistry;
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

    unsafe {
        info!(
            "FFMPEG version={}",
            CStr::from_ptr(av_version_info()).to_string_lossy()
        );
        avformat_network_init();
    }

    let builder = Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .add_source(config::Environment::default())
        .build()?;
    let settings: Settings = builder.try_deserialize()?;
    let settings = settings.clamped();

    if settings.use_tls {
        warn!("use_tls is set; TLS termination is delegated to the fronting proxy");
    }
    if settings.workers > 1 {
        warn!(
            "workers={} requested; process supervision is external, running one worker",
            settings.workers
        );
    }

    let addr: SocketAddr = settings.listen.parse()?;
    info!(
        "gateway ready: http://{} (seg_ms={}, aac={}k@{}Hz/{})",
        addr,
        settings.seg_ms,
        settings.aac_br / 1000,
        settings.aac_sr,
        if settings.aac_ch == 1 { "mono" } else { "stereo" }
    );

    let registry = Arc::new(StreamRegistry::new(settings));

    // idle stream reaper
    let reaper = registry.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let registry = reaper.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || registry.reap_expired()).await {
                error!("reaper task failed: {}", e);
            }
        }
    });

    let server = GatewayServer::new(registry);
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
