use anyhow::Result;
use rollcall_core::{OnnxDetector, PixelSliceExtractor, RegionDetector};
use rollcall_store::AsyncStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use engine::V4lSource;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Arc::new(Config::from_env());
    std::fs::create_dir_all(&config.photo_dir)?;

    let store = AsyncStore::open(&config.db_path).await?;
    tracing::info!(db = %config.db_path.display(), "store opened");

    let source = V4lSource {
        device: config.camera_device.clone(),
        warmup_frames: config.warmup_frames,
    };
    let model_path = config.detector_model_path();
    let engine = engine::spawn_engine(
        source,
        Box::new(move || {
            OnnxDetector::load(&model_path).map(|d| Box::new(d) as Box<dyn RegionDetector + Send>)
        }),
        Box::new(PixelSliceExtractor),
        config.detection_threshold,
        config.similarity_threshold,
    );

    let service = dbus_interface::RollcallService::new(engine, store, config);
    let _conn = zbus::connection::Builder::session()?
        .name("org.rollcall.Rollcall1")?
        .serve_at("/org/rollcall/Rollcall1", service)?
        .build()
        .await?;

    tracing::info!("rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
