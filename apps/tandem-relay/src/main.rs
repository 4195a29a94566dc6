use std::sync::Arc;

use anyhow::Context;
use tandem_relay::config::AppConfig;
use tandem_relay::engine::{RtcSessionFactory, RtcSettings};
use tandem_relay::routes::build_router;
use tandem_relay::{telemetry, AppState};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env().context("reading TANDEM_* configuration")?;
    telemetry::init(&cfg.log_config())?;

    let settings = RtcSettings::from(&cfg);
    info!(
        ice_ports = ?settings.port_range,
        public_ips = ?settings.public_ips,
        stun_servers = settings.stun_urls.len(),
        "building media engine"
    );
    let factory = RtcSessionFactory::new(&settings).context("configuring media engine")?;
    let state = AppState::new(Arc::new(factory));
    let app = build_router(state, &cfg.static_dir);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    info!(addr = %cfg.bind_addr, static_dir = %cfg.static_dir, "signaling relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("signaling relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
