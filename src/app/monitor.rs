use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::app::adb::connection::{Connection, DeviceEndpoint};
use crate::app::adb::controller::AdbController;
use crate::app::adb::locator::resolve_adb_program;
use crate::app::adb::runner::{CommandExecutor, ProcessExecutor};
use crate::app::cec::{detect_backend, CecController};
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::models::ServiceSnapshot;
use crate::app::perf::monitor::PerformanceMonitor;
use crate::app::watchdog::AppWatchdog;

/// Composition root: the device facade plus the three background monitors,
/// each optional via config. `snapshot()` aggregates every subsystem with
/// per-section failure isolation.
pub struct MonitorService {
    adb: AdbController,
    performance: Option<PerformanceMonitor>,
    watchdog: Option<AppWatchdog>,
    cec: Option<CecController>,
}

impl MonitorService {
    pub async fn from_config(config: &AppConfig) -> Self {
        let executor: Arc<dyn CommandExecutor> = Arc::new(ProcessExecutor);
        Self::with_executor(config, executor).await
    }

    pub async fn with_executor(config: &AppConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        let endpoint = match &config.adb.serial {
            Some(serial) if !serial.trim().is_empty() => {
                DeviceEndpoint::with_serial(serial.trim())
            }
            _ => DeviceEndpoint::host_port(config.adb.host.clone(), config.adb.port),
        };
        let connection = Connection::new(
            endpoint,
            resolve_adb_program(&config.adb.adb_path),
            Duration::from_secs(config.adb.idle_timeout_secs),
            Arc::clone(&executor),
        );
        let adb = AdbController::new(connection, config.adb.has_battery, config.adb.has_cellular);

        let performance = config
            .performance
            .enabled
            .then(|| PerformanceMonitor::new(config.performance.clone(), Arc::clone(&executor)));

        let watchdog = (config.watchdog.enabled && !config.watchdog.packages.is_empty())
            .then(|| AppWatchdog::new(adb.clone(), config.watchdog.clone()));

        let cec = if config.cec.enabled {
            let backend =
                detect_backend(executor.as_ref(), config.cec.client_path.as_deref()).await;
            Some(CecController::new(
                backend,
                config.cec.clone(),
                Arc::clone(&executor),
            ))
        } else {
            None
        };

        Self {
            adb,
            performance,
            watchdog,
            cec,
        }
    }

    pub fn adb(&self) -> &AdbController {
        &self.adb
    }

    pub fn performance(&self) -> Option<&PerformanceMonitor> {
        self.performance.as_ref()
    }

    pub fn watchdog(&self) -> Option<&AppWatchdog> {
        self.watchdog.as_ref()
    }

    pub fn cec(&self) -> Option<&CecController> {
        self.cec.as_ref()
    }

    pub async fn start_all(&self) {
        if let Some(performance) = &self.performance {
            performance.start().await;
        }
        if let Some(watchdog) = &self.watchdog {
            watchdog.start().await;
        }
        if let Some(cec) = &self.cec {
            if !cec.initialize().await {
                warn!("cec controller failed to initialize");
            }
        }
    }

    pub async fn stop_all(&self) {
        if let Some(performance) = &self.performance {
            performance.stop().await;
        }
        if let Some(watchdog) = &self.watchdog {
            watchdog.stop().await;
        }
        if let Some(cec) = &self.cec {
            cec.shutdown().await;
        }
        self.adb.disconnect().await;
    }

    /// One aggregate read over every subsystem. A failing or disabled
    /// subsystem leaves its section absent and a note in `errors`; it never
    /// aborts the snapshot.
    pub async fn snapshot(&self) -> ServiceSnapshot {
        let mut snapshot = ServiceSnapshot {
            adb: Some(self.adb.metrics().await),
            ..ServiceSnapshot::default()
        };

        if let Some(performance) = &self.performance {
            match performance.latest_sample() {
                Some(sample) => snapshot.performance = Some(sample),
                None => {
                    snapshot
                        .errors
                        .insert("performance".to_string(), "no sample yet".to_string());
                }
            }
            snapshot.system = Some(performance.system_info().await);
        }

        if let Some(watchdog) = &self.watchdog {
            snapshot.app_watchdog = Some(watchdog.status());
            if let Some(package) = watchdog.primary_package() {
                snapshot.watched_app = Some(watchdog.health(package).await);
            }
        }

        if let Some(cec) = &self.cec {
            snapshot.cec = Some(cec.tv_status().await);
        }

        snapshot
    }

    pub fn send_cec_command(&self, name: &str) -> Result<(), AppError> {
        let Some(cec) = &self.cec else {
            return Err(AppError::system("cec controller not available", "cec-send"));
        };
        cec.send_command(name)
    }

    pub async fn scan_cec_devices(&self) -> Vec<crate::app::models::CecDevice> {
        match &self.cec {
            Some(cec) => cec.scan_devices().await,
            None => Vec::new(),
        }
    }

    pub async fn restart_watched_app(&self) -> Result<bool, AppError> {
        let Some(watchdog) = &self.watchdog else {
            return Err(AppError::system(
                "app watchdog not available",
                "watchdog-restart",
            ));
        };
        let Some(package) = watchdog.primary_package().map(|p| p.to_string()) else {
            return Err(AppError::system(
                "no watchdog packages configured",
                "watchdog-restart",
            ));
        };
        watchdog.manual_restart(&package).await
    }

    pub async fn shutdown_with_log(&self) {
        info!("shutting down monitor service");
        self.stop_all().await;
    }
}

impl Drop for MonitorService {
    fn drop(&mut self) {
        if self.performance.as_ref().is_some_and(|p| p.is_running()) {
            error!("monitor service dropped while performance monitor still running");
        }
    }
}
