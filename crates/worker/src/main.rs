//! `snapbooth-worker` -- headless photo booth host.
//!
//! Counts down, reads the captured photo from disk, restyles it through
//! ComfyUI and writes the result next to the capture.
//!
//! ```text
//! snapbooth-worker <captured-image> [style]
//! ```
//!
//! Configuration comes from the environment (see `BoothConfig::from_env`);
//! a `.env` file in the working directory is honoured. Ctrl-C aborts the
//! current shot.

use std::path::PathBuf;

use snapbooth_pipeline::config::BoothConfig;
use snapbooth_pipeline::session::BoothSession;
use snapbooth_worker::sequencer::Sequencer;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "snapbooth_worker=info,snapbooth_pipeline=info,snapbooth_comfyui=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let capture = args.next().map(PathBuf::from).unwrap_or_else(|| {
        tracing::error!("usage: snapbooth-worker <captured-image> [style]");
        std::process::exit(2);
    });
    let style = args.next();

    let config = BoothConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });
    tracing::info!(
        ws_url = %config.ws_url,
        api_url = %config.api_url,
        output_dir = %config.output_dir.display(),
        "Starting snapbooth-worker",
    );

    let session = BoothSession::from_config(&config).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to load styles");
        std::process::exit(1);
    });
    tracing::info!(styles = ?session.styles(), "Styles loaded");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
        tracing::info!("Interrupted");
    };

    let mut sequencer = Sequencer::new(session);
    match sequencer
        .take_shot(&capture, style.as_deref(), shutdown)
        .await
    {
        Ok(shot) if shot.generated => {
            tracing::info!(path = %shot.path.display(), "Shot complete");
        }
        Ok(shot) => {
            tracing::warn!(path = %shot.path.display(), "Shot complete without generation");
        }
        Err(e) => {
            tracing::error!(error = %e, "Shot failed");
            drop(sequencer);
            std::process::exit(1);
        }
    }
}
