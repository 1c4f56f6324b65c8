use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

use softmotor::board::sim::SimBoard;
use softmotor::board::BoardDriver;
use softmotor::config::FileConfig;
use softmotor::supervisor::board::BoardSupervisor;

fn config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    match (args.next(), args.next()) {
        (Some(flag), Some(path)) if flag == "--config" => Ok(PathBuf::from(path)),
        (Some(path), None) => Ok(PathBuf::from(path)),
        (None, _) => anyhow::bail!("usage: softmotord [--config] <board.yaml>"),
        _ => anyhow::bail!("usage: softmotord [--config] <board.yaml>"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let path = config_path()?;
    let config = FileConfig::load(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    let board_model = config.build()?;

    info!(
        host = %board_model.host,
        port = board_model.port,
        axes = board_model.axes.len(),
        "starting softmotord"
    );

    // Runs against the in-process board simulator; a hardware transport
    // plugs in through the same driver trait.
    let driver: Arc<dyn BoardDriver> = Arc::new(SimBoard::new(board_model.axes.len()));

    let mut supervisor = BoardSupervisor::new(Arc::clone(&driver), board_model);
    supervisor.initialize().await?;
    let axes = supervisor.spawn_axes();
    info!(axes = axes.len(), "axis supervisors running");

    let mut status_tick = tokio::time::interval(Duration::from_secs(10));
    status_tick.tick().await; // first tick fires immediately
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            _ = status_tick.tick() => {
                for axis in &axes {
                    let fields = axis.pv.read().await;
                    match serde_json::to_string(&json!({
                        "axis": axis.short_id,
                        "fields": fields,
                    })) {
                        Ok(line) => info!(target: "status", "{}", line),
                        Err(e) => warn!(axis = %axis.short_id, error = %e, "status serialization failed"),
                    }
                }
            }
        }
    }

    supervisor.shutdown().await?;
    for axis in axes {
        if let Err(e) = axis.handle.await {
            warn!(axis = %axis.short_id, error = %e, "axis task ended abnormally");
        }
    }
    info!("softmotord stopped");
    Ok(())
}
