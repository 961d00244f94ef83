pub mod channels;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod dongle;
pub mod error;
pub mod mqtt;
pub mod options;
pub mod prelude;
pub mod schedule;
pub mod schedule_file;
pub mod scheduler;
pub mod soc_tracker;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::mqtt::Mqtt;
use crate::prelude::*;

use std::io::Write;
use tokio::task::JoinHandle;

/// Sets up env_logger. `RUST_LOG` wins over the configured level.
pub fn init_logging(loglevel: &str) {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(loglevel))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if let Err(e) = result {
        warn!("logger already initialised: {}", e);
    }
}

/// Runs until `shutdown_rx` fires or the MQTT client gives up connecting.
pub async fn app(mut shutdown_rx: broadcast::Receiver<()>, config: ConfigWrapper) -> Result<()> {
    info!("solar-charge-bridge {} starting", CARGO_PKG_VERSION);
    config.log_summary();

    let channels = Channels::new();
    let link = LinkStatus::new();

    info!("  Creating Coordinator...");
    let coordinator = Coordinator::new(config.clone(), channels.clone(), link.clone());
    let coordinator_clone = coordinator.clone();
    let coordinator_handle = tokio::spawn(async move {
        if let Err(e) = coordinator_clone.start().await {
            error!("Coordinator task failed: {}", e);
        }
    });

    coordinator.restore_schedule();

    info!("  Creating MQTT client...");
    let mqtt = Mqtt::new(config.clone(), channels.clone(), link);
    let mqtt_clone = mqtt.clone();
    let mut mqtt_handle: JoinHandle<Result<()>> = tokio::spawn(async move { mqtt_clone.start().await });

    info!("Waiting for shutdown signal...");
    let failure = tokio::select! {
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received, stopping components...");
            None
        }
        Some(err) = mqtt_failure(&mut mqtt_handle) => {
            error!("MQTT failed: {}", err);
            Some(err)
        }
    };

    // coordinator first: disabling a running charge needs mqtt up
    coordinator.stop().await;
    let _ = mqtt.stop().await;

    if let Err(e) = coordinator_handle.await {
        error!("Error waiting for coordinator task: {}", e);
    }
    if !mqtt_handle.is_finished() {
        if let Err(e) = mqtt_handle.await {
            error!("Error waiting for MQTT task: {}", e);
        }
    }

    info!("Application shutdown complete");

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

// resolves only if the mqtt task ended badly; a clean exit (eg disabled) is None
async fn mqtt_failure(handle: &mut JoinHandle<Result<()>>) -> Option<Error> {
    match handle.await {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(err) => Some(anyhow!("MQTT task panicked: {}", err)),
    }
}
