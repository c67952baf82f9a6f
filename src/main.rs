use std::time::Duration;

use tracing::{error, info};

use tvbox_control::app::config::load_config;
use tvbox_control::app::logging::init_logging;
use tvbox_control::app::monitor::MonitorService;

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config, using defaults: {err}");
            Default::default()
        }
    };
    init_logging(&config.logging.log_level);

    info!(
        host = %config.adb.host,
        port = config.adb.port,
        serial = ?config.adb.serial,
        "starting tvbox-control"
    );

    let service = MonitorService::from_config(&config).await;
    service.start_all().await;

    let mut ticker =
        tokio::time::interval(Duration::from_secs(config.service.snapshot_interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = service.snapshot().await;
                match serde_json::to_string(&snapshot) {
                    Ok(payload) => info!(snapshot = %payload, "service snapshot"),
                    Err(err) => error!(error = %err, "failed to serialize snapshot"),
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!(error = %err, "failed to listen for shutdown signal");
                }
                break;
            }
        }
    }

    service.shutdown_with_log().await;
}
