//! DeskStream - live screen streaming host
//!
//! This is the main entry point: it loads configuration, starts the capture
//! loop and the broadcast fan-out, and runs until Ctrl+C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use desk_stream::{
    config::{Config, ConfigManager},
    desktop::{RuntimeParams, ScrapSource},
    logging::{init_logging, LogLevel},
    stream::{spawn_forwarder, BroadcastHub, ControlRouter, StreamScheduler, StreamSettings},
};
use tracing::{error, info};

/// How often the pipeline counters are logged
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Application state
struct App {
    config: Config,
    config_manager: ConfigManager,
}

impl App {
    /// Loads configuration
    fn initialize() -> anyhow::Result<Self> {
        let config_manager = ConfigManager::new().context("locating config directory")?;
        let config = config_manager
            .load_or_create_default()
            .context("loading configuration")?;

        Ok(Self {
            config,
            config_manager,
        })
    }

    /// Runs the stream until Ctrl+C
    async fn run(self) -> anyhow::Result<()> {
        info!("Configuration loaded from: {:?}", self.config_manager.config_file());

        let stream = &self.config.stream;
        info!("Stream - Target FPS: {}", stream.target_fps);
        info!("Stream - Scale: {}", stream.scale);
        info!("Stream - Quality: {} (delta ceiling {})", stream.base_quality, stream.delta_quality_ceiling);
        info!("Stream - Keyframe every {} cycles", stream.keyframe_interval);
        info!(
            "Adaptation - Lag limits: {}ms / {}ms",
            self.config.adaptation.lag_soft_limit_ms, self.config.adaptation.lag_hard_limit_ms
        );

        let params = RuntimeParams::new(stream.target_fps as i64, stream.scale as f64);
        let (scheduler, endpoints) =
            StreamScheduler::new(StreamSettings::from_config(&self.config), params);

        let hub = BroadcastHub::default();
        let forwarder = spawn_forwarder(endpoints.frames, Arc::new(hub.clone()));

        // Connection handlers feed viewer messages through this router
        let _controls = ControlRouter::new(endpoints.heartbeats, endpoints.params);

        let display_index = self.config.capture.display_index;
        let mut handle = scheduler
            .spawn(move || ScrapSource::open(display_index))
            .context("spawning capture thread")?;

        info!("DeskStream is streaming. Press Ctrl+C to exit");

        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => {
                    let stats = handle.stats();
                    info!(
                        "Cycles: {} | Sent: {} ({} keyframes, {} KB) | Skipped: {} | Failed: {} | Viewers: {} | Avg cycle: {:.1}ms",
                        stats.cycles,
                        stats.frames_sent(),
                        stats.keyframes_sent,
                        stats.bytes_sent / 1024,
                        stats.frames_skipped(),
                        stats.failures(),
                        hub.viewer_count(),
                        stats.avg_cycle_time_ms
                    );
                }
            }
        }

        info!("Shutting down DeskStream...");

        tokio::task::spawn_blocking(move || handle.stop())
            .await
            .context("joining capture thread")?;
        forwarder.await.context("joining frame forwarder")?;

        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let app = match App::initialize() {
        Ok(app) => {
            init_logging(app.config.logging.level);
            app
        }
        Err(e) => {
            init_logging(LogLevel::default());
            error!("Failed to initialize application: {:#}", e);
            std::process::exit(1);
        }
    };

    info!("Starting DeskStream v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = app.run().await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("DeskStream stopped.");
}
