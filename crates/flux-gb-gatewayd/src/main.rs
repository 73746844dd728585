use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use flux_gb_gateway::{
    sip::{SipServer, SipServerConfig},
    DeviceManager, QueryService, ResponseCorrelator, SessionOrchestrator, SsrcAllocator, StreamRegistry,
};

mod api;
mod config;
mod media_client;

use api::AppState;
use config::ConfigLoader;
use media_client::HttpMediaSource;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "./config/gateway.toml")]
    config: String,

    /// 覆盖 http.bind
    #[arg(long)]
    http_bind: Option<String>,

    /// 覆盖 sip.bind
    #[arg(long)]
    sip_bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ConfigLoader::new(&args.config).load()?;
    if let Some(bind) = args.http_bind {
        config.http.bind = bind;
    }
    if let Some(bind) = args.sip_bind {
        config.sip.bind = bind;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    tracing::info!(target: "gb_gatewayd", config = %args.config, "starting gb28181 gateway");

    let identity = config.identity();
    let devices = Arc::new(DeviceManager::new());
    let correlator = Arc::new(ResponseCorrelator::with_bounds(
        Duration::from_secs(config.query.min_timeout_secs),
        Duration::from_secs(config.query.max_timeout_secs),
    ));

    let sip_cfg = SipServerConfig {
        bind_addr: config.sip.bind.clone(),
        identity: identity.clone(),
        device_expires: config.sip.device_expires,
        auth_password: config.sip.password.clone(),
        ..Default::default()
    };
    let sip = Arc::new(SipServer::new(sip_cfg, devices.clone(), correlator.clone()).await?);
    tracing::info!(target: "gb_gatewayd", "sip listening on {}", sip.local_addr()?);

    let sip_task = sip.clone();
    tokio::spawn(async move {
        if let Err(e) = sip_task.start().await {
            tracing::error!(target: "gb_gatewayd", "sip server stopped: {}", e);
        }
    });

    let media = Arc::new(HttpMediaSource::new(
        config.media.api_url.clone(),
        Duration::from_millis(config.media.request_timeout_ms),
    )?);

    let orchestrator = Arc::new(SessionOrchestrator::new(
        identity.clone(),
        Arc::new(StreamRegistry::new()),
        devices.clone(),
        sip.clone(),
        media,
        Arc::new(SsrcAllocator::new(&identity.sip_id)),
        config.session_timeouts(),
    ));
    let queries = Arc::new(QueryService::new(identity, devices, sip, correlator));

    let app = api::create_router(AppState { orchestrator, queries });

    let addr = config.http.bind;
    tracing::info!(target: "gb_gatewayd", "http listening on {}", addr);

    axum::Server::bind(
        &addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid http bind {}: {}", addr, e))?,
    )
    .serve(app.into_make_service())
    .await?;

    Ok(())
}
