//! Vision Stream Client
//!
//! Streams the configured capture source to a processing server and plays
//! back what it returns.
//!
//! Usage: `streamer [ws://host:port/path]`

use anyhow::{Context, Result};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vision_stream::{
    config::AppConfig,
    session::{SessionController, SessionState},
    ui::WebServer,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Vision Stream Client v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load().context("loading configuration")?;
    if let Some(endpoint) = std::env::args().nth(1) {
        config.network.endpoint = endpoint;
        config.validate().context("invalid endpoint argument")?;
    }
    tracing::info!("Endpoint: {}", config.network.endpoint);

    let controller = SessionController::from_config(config.clone());

    let _web_handle = if config.ui.enabled {
        Some(WebServer::new(config.ui.clone(), controller.clone()).start_background())
    } else {
        None
    };

    let session = controller.start().await.context("starting session")?;
    tracing::info!("Session {} started", session.id);

    let mut status = controller.subscribe();
    let mut stats_timer = tokio::time::interval(STATS_INTERVAL);
    stats_timer.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                controller.stop().await;
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                tracing::debug!("Session {} (connection {})", current.state, current.connection);
                if current.state == SessionState::Idle {
                    match current.last_error {
                        Some(error) => anyhow::bail!("session ended: {}", error),
                        None => {
                            tracing::info!("Session ended by server");
                            break;
                        }
                    }
                }
            }
            _ = stats_timer.tick() => {
                let stats = controller.stats();
                tracing::info!(
                    "Captured: {} frames | Sent: {} chunks, {:.1} KB | Dropped: {} | Received: {} media, {} detection sets | Rendered: {}",
                    stats.frames_captured,
                    stats.pump.chunks_sent,
                    stats.pump.bytes_sent as f64 / 1024.0,
                    stats.pump.chunks_dropped,
                    stats.inbound.media_chunks,
                    stats.inbound.detection_sets,
                    stats.overlay_frames,
                );
            }
        }
    }

    tracing::info!("Stopped");
    Ok(())
}
