use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voiplink::config::Config;
use voiplink::infrastructure::media::RecordingMediaFactory;
use voiplink::interface::{init_metrics, spawn_signal_recorder};
use voiplink::SipVoipLink;

const DEFAULT_CONFIG_PATH: &str = "config/voiplink.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Config::load(Some(&config_path))?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting voiplink");
    info!(path = %config_path.display(), accounts = config.accounts.len(), "Configuration loaded");

    // Media is handled by an external RTP subsystem; until one is attached
    // the daemon records what it would have asked of it.
    let media = Arc::new(RecordingMediaFactory::new());
    let link = SipVoipLink::new(&config, media).await?;

    if let Some(listen) = config.metrics.listen {
        init_metrics(listen)?;
        spawn_signal_recorder(link.subscribe());
    }

    link.start().await?;
    link.register_all().await;

    let mut signals = link.subscribe();
    tokio::spawn(async move {
        while let Ok(signal) = signals.recv().await {
            match serde_json::to_string(&signal) {
                Ok(json) => info!(signal = %json, "Signal"),
                Err(_) => info!(?signal, "Signal"),
            }
        }
    });

    info!("voiplink started, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Err(e) = link.shutdown().await {
        warn!("Shutdown incomplete: {}", e);
    }
    Ok(())
}
