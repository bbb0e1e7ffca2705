use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use stationlink::{callback, ConnectionManager, ManagerConfig, StationEvent};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "stations.toml".to_owned());
    info!(config = %config_path, "loading station configuration");
    let config = ManagerConfig::from_path(&config_path)
        .map_err(|e| eyre!("failed to load {}: {}", config_path, e))?;
    if config.stations.is_empty() {
        return Err(eyre!("{} configures no stations", config_path));
    }

    let (manager, mut events) = ConnectionManager::from_config(&config)?;

    // Telemetry delivery is the collaborator's job; the bridge just logs it.
    manager
        .subscribe(
            "devices/+/data",
            callback(|envelope| {
                info!(
                    station_id = %envelope.station_id,
                    device_id = envelope.device_id.as_deref().unwrap_or("-"),
                    topic = %envelope.topic,
                    "telemetry received"
                );
                Ok(())
            }),
            None,
        )
        .await?;

    manager.connect_all().await;
    info!(stations = manager.station_ids().len(), "bridge running");

    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                StationEvent::Error { station_id, error } => {
                    warn!(%station_id, %error, "station error")
                }
                StationEvent::Message(_) => {}
                other => info!(station_id = %other.station_id(), event = ?other, "station event"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.disconnect_all().await;
    event_log.abort();

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
    Ok(())
}
