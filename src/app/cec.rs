use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::adb::runner::{CommandExecutor, CommandSpec};
use crate::app::config::CecSettings;
use crate::app::error::AppError;
use crate::app::models::{CecDevice, CecStatus};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);
const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which control tool drives the bus. Probed once at startup; Mock keeps
/// the rest of the system functional on machines without a CEC adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CecBackend {
    CecClient(String),
    CecCtl(String),
    Mock,
}

impl CecBackend {
    pub fn name(&self) -> &'static str {
        match self {
            CecBackend::CecClient(_) => "cec-client",
            CecBackend::CecCtl(_) => "cec-ctl",
            CecBackend::Mock => "mock",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CecCommandDef {
    pub code: &'static str,
    pub target: &'static str,
    pub description: &'static str,
}

fn command_table() -> HashMap<&'static str, CecCommandDef> {
    let entries: [(&'static str, &'static str, &'static str, &'static str); 21] = [
        ("power_on", "04", "0", "Power on device"),
        ("power_off", "36", "0", "Power off device"),
        ("power_toggle", "6B", "0", "Toggle power state"),
        ("up", "44 01", "0", "Navigate up"),
        ("down", "44 02", "0", "Navigate down"),
        ("left", "44 03", "0", "Navigate left"),
        ("right", "44 04", "0", "Navigate right"),
        ("select", "44 00", "0", "Select/OK button"),
        ("back", "44 0D", "0", "Back button"),
        ("home", "44 09", "0", "Home button"),
        ("menu", "44 09", "0", "Menu button"),
        ("volume_up", "44 41", "0", "Volume up"),
        ("volume_down", "44 42", "0", "Volume down"),
        ("mute", "44 43", "0", "Mute toggle"),
        ("input_hdmi1", "82 10 00", "0", "Switch to HDMI 1"),
        ("input_hdmi2", "82 20 00", "0", "Switch to HDMI 2"),
        ("input_hdmi3", "82 30 00", "0", "Switch to HDMI 3"),
        ("input_hdmi4", "82 40 00", "0", "Switch to HDMI 4"),
        ("get_power_status", "8F", "0", "Get power status"),
        ("get_active_source", "85", "F", "Get active source"),
        ("set_active_source", "82 10 00", "F", "Set as active source"),
    ];
    entries
        .into_iter()
        .map(|(name, code, target, description)| {
            (
                name,
                CecCommandDef {
                    code,
                    target,
                    description,
                },
            )
        })
        .collect()
}

/// Probes for a usable CEC tool: an explicitly configured path wins, then
/// `which cec-client`, then `which cec-ctl`, else the mock backend.
pub async fn detect_backend(
    executor: &dyn CommandExecutor,
    configured: Option<&str>,
) -> CecBackend {
    if let Some(path) = configured {
        if path.contains("cec-ctl") {
            return CecBackend::CecCtl(path.to_string());
        }
        if !path.trim().is_empty() {
            return CecBackend::CecClient(path.to_string());
        }
    }

    for client in ["cec-client", "cec-ctl"] {
        let spec = CommandSpec::new(
            "which",
            vec![client.to_string()],
            PROBE_TIMEOUT,
            "cec-probe",
        );
        match executor.execute(&spec).await {
            Ok(output) if output.exit_code == Some(0) => {
                let path = output.stdout.trim().to_string();
                if path.is_empty() {
                    continue;
                }
                info!(client, path = %path, "found cec client");
                return if client == "cec-ctl" {
                    CecBackend::CecCtl(path)
                } else {
                    CecBackend::CecClient(path)
                };
            }
            _ => continue,
        }
    }

    warn!("no cec client found, commands will be mocked");
    CecBackend::Mock
}

#[derive(Debug, Clone)]
struct QueueEntry {
    name: String,
    code: String,
    target: String,
}

struct CecInner {
    connected: AtomicBool,
    queued: AtomicUsize,
    last_command: Mutex<Option<DateTime<Utc>>>,
    device_cache: Mutex<Option<(tokio::time::Instant, Vec<CecDevice>)>>,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<QueueEntry>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Serialized command queue against the CEC bus. One worker drains the
/// queue strictly FIFO with a fixed delay between sends; the bus cannot
/// absorb rapid-fire commands.
#[derive(Clone)]
pub struct CecController {
    backend: CecBackend,
    settings: CecSettings,
    commands: Arc<HashMap<&'static str, CecCommandDef>>,
    executor: Arc<dyn CommandExecutor>,
    inner: Arc<CecInner>,
}

impl CecController {
    pub fn new(
        backend: CecBackend,
        settings: CecSettings,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        info!(
            backend = backend.name(),
            device_name = %settings.device_name,
            physical_address = %settings.physical_address,
            "cec controller constructed"
        );
        Self {
            backend,
            settings,
            commands: Arc::new(command_table()),
            executor,
            inner: Arc::new(CecInner {
                connected: AtomicBool::new(false),
                queued: AtomicUsize::new(0),
                last_command: Mutex::new(None),
                device_cache: Mutex::new(None),
                queue_tx: Mutex::new(None),
                worker: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn backend(&self) -> &CecBackend {
        &self.backend
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn available_commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().map(|name| name.to_string()).collect();
        names.sort();
        names
    }

    pub fn command_info(&self, name: &str) -> Option<&CecCommandDef> {
        self.commands.get(name)
    }

    /// Tests bus connectivity and starts the queue worker.
    pub async fn initialize(&self) -> bool {
        if !self.test_connection().await {
            error!("cec connection test failed");
            return false;
        }
        self.inner.connected.store(true, Ordering::SeqCst);

        let (tx, mut rx) = mpsc::unbounded_channel::<QueueEntry>();
        *self.inner.queue_tx.lock().expect("queue tx poisoned") = Some(tx);

        let controller = self.clone();
        let delay = Duration::from_millis(self.settings.inter_command_delay_ms);
        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                controller.inner.queued.fetch_sub(1, Ordering::SeqCst);
                if let Err(err) = controller.execute_entry(&entry).await {
                    error!(command = %entry.name, error = %err, "cec command failed");
                }
                tokio::time::sleep(delay).await;
            }
        });
        *self.inner.worker.lock().await = Some(handle);
        info!("cec controller initialized");
        true
    }

    pub async fn shutdown(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner
            .queue_tx
            .lock()
            .expect("queue tx poisoned")
            .take();
        if let Some(handle) = self.inner.worker.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        info!("cec controller shut down");
    }

    async fn test_connection(&self) -> bool {
        match &self.backend {
            CecBackend::CecClient(path) => {
                let spec = CommandSpec::new(
                    path,
                    vec!["-s".to_string(), "-d".to_string(), "1".to_string()],
                    PROBE_TIMEOUT,
                    "cec-test",
                )
                .with_stdin(b"scan\nq\n".to_vec());
                match self.executor.execute(&spec).await {
                    Ok(output) => {
                        output.exit_code == Some(0)
                            && output.stdout.to_lowercase().contains("device")
                    }
                    Err(err) => {
                        error!(error = %err, "cec-client connection test failed");
                        false
                    }
                }
            }
            CecBackend::CecCtl(path) => {
                let spec = CommandSpec::new(
                    path,
                    vec!["--list-devices".to_string()],
                    PROBE_TIMEOUT,
                    "cec-test",
                );
                matches!(self.executor.execute(&spec).await, Ok(output) if output.exit_code == Some(0))
            }
            CecBackend::Mock => {
                warn!("using mock cec backend");
                true
            }
        }
    }

    /// Enqueues a named command; fails fast on unknown names. Delivery order
    /// matches submission order.
    pub fn send_command(&self, name: &str) -> Result<(), AppError> {
        let Some(def) = self.commands.get(name) else {
            return Err(AppError::unsupported(
                format!("unknown cec command: {name}"),
                "cec-send",
            ));
        };
        self.enqueue(QueueEntry {
            name: name.to_string(),
            code: def.code.to_string(),
            target: def.target.to_string(),
        })
    }

    /// Raw code path; still serialized through the queue.
    pub fn send_custom(&self, code: &str, target: &str) -> Result<(), AppError> {
        self.enqueue(QueueEntry {
            name: "custom".to_string(),
            code: code.to_string(),
            target: target.to_string(),
        })
    }

    fn enqueue(&self, entry: QueueEntry) -> Result<(), AppError> {
        let guard = self.inner.queue_tx.lock().expect("queue tx poisoned");
        let Some(tx) = guard.as_ref() else {
            return Err(AppError::system(
                "cec controller is not initialized",
                "cec-send",
            ));
        };
        info!(command = %entry.name, code = %entry.code, target = %entry.target, "queued cec command");
        // Counted before the send so the worker's decrement cannot race it
        // below zero.
        self.inner.queued.fetch_add(1, Ordering::SeqCst);
        if tx.send(entry).is_err() {
            self.inner.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(AppError::system("cec worker is gone", "cec-send"));
        }
        *self.inner.last_command.lock().expect("last command poisoned") = Some(Utc::now());
        Ok(())
    }

    async fn execute_entry(&self, entry: &QueueEntry) -> Result<(), AppError> {
        if !self.is_connected() {
            return Err(AppError::system("cec not connected", "cec-exec"));
        }
        match &self.backend {
            CecBackend::CecClient(path) => {
                let payload = format!("tx {}:{}\nq\n", entry.target, entry.code);
                let spec = CommandSpec::new(
                    path,
                    vec!["-s".to_string(), "-d".to_string(), "1".to_string()],
                    COMMAND_TIMEOUT,
                    "cec-exec",
                )
                .with_stdin(payload.into_bytes());
                let output = self.executor.execute(&spec).await?;
                if output.exit_code != Some(0) {
                    warn!(command = %entry.name, stderr = %output.stderr.trim(), "cec-client rejected command");
                    return Err(AppError::system(
                        format!("cec command failed: {}", output.stderr.trim()),
                        "cec-exec",
                    ));
                }
                Ok(())
            }
            CecBackend::CecCtl(path) => {
                let spec = CommandSpec::new(
                    path,
                    vec![
                        format!("--to={}", entry.target),
                        format!("--custom-command={}", entry.code),
                    ],
                    COMMAND_TIMEOUT,
                    "cec-exec",
                );
                let output = self.executor.execute(&spec).await?;
                if output.exit_code != Some(0) {
                    warn!(command = %entry.name, stderr = %output.stderr.trim(), "cec-ctl rejected command");
                    return Err(AppError::system(
                        format!("cec command failed: {}", output.stderr.trim()),
                        "cec-exec",
                    ));
                }
                Ok(())
            }
            CecBackend::Mock => {
                info!(target = %entry.target, code = %entry.code, "mock cec command");
                Ok(())
            }
        }
    }

    /// Device scan with a TTL cache keyed on scan time; repeat calls inside
    /// the window return the cached list without touching the bus.
    pub async fn scan_devices(&self) -> Vec<CecDevice> {
        if !self.is_connected() {
            return Vec::new();
        }

        let ttl = Duration::from_secs(self.settings.cache_ttl_secs);
        {
            let cache = self.inner.device_cache.lock().expect("device cache poisoned");
            if let Some((scanned_at, devices)) = cache.as_ref() {
                if scanned_at.elapsed() < ttl {
                    return devices.clone();
                }
            }
        }

        let devices = match &self.backend {
            CecBackend::CecClient(path) => self.scan_with_cec_client(path).await,
            CecBackend::CecCtl(path) => self.scan_with_cec_ctl(path).await,
            CecBackend::Mock => vec![
                CecDevice {
                    address: 0,
                    name: "TV".to_string(),
                    vendor: "Mock".to_string(),
                    device_type: "TV".to_string(),
                    power_status: "on".to_string(),
                    active_source: true,
                },
                CecDevice {
                    address: 1,
                    name: self.settings.device_name.clone(),
                    vendor: "Mock".to_string(),
                    device_type: "Playback".to_string(),
                    power_status: "on".to_string(),
                    active_source: false,
                },
            ],
        };

        *self.inner.device_cache.lock().expect("device cache poisoned") =
            Some((tokio::time::Instant::now(), devices.clone()));
        devices
    }

    async fn scan_with_cec_client(&self, path: &str) -> Vec<CecDevice> {
        let spec = CommandSpec::new(
            path,
            vec!["-s".to_string(), "-d".to_string(), "1".to_string()],
            SCAN_TIMEOUT,
            "cec-scan",
        )
        .with_stdin(b"scan\nq\n".to_vec());
        match self.executor.execute(&spec).await {
            Ok(output) if output.exit_code == Some(0) => output
                .stdout
                .lines()
                .filter_map(parse_cec_client_device)
                .collect(),
            Ok(output) => {
                warn!(exit = ?output.exit_code, "cec-client scan failed");
                Vec::new()
            }
            Err(err) => {
                error!(error = %err, "cec-client scan failed to run");
                Vec::new()
            }
        }
    }

    async fn scan_with_cec_ctl(&self, path: &str) -> Vec<CecDevice> {
        let spec = CommandSpec::new(
            path,
            vec!["--list-devices".to_string()],
            PROBE_TIMEOUT,
            "cec-scan",
        );
        match self.executor.execute(&spec).await {
            Ok(output) if output.exit_code == Some(0) => output
                .stdout
                .lines()
                .filter_map(parse_cec_ctl_device)
                .collect(),
            Ok(output) => {
                warn!(exit = ?output.exit_code, "cec-ctl scan failed");
                Vec::new()
            }
            Err(err) => {
                error!(error = %err, "cec-ctl scan failed to run");
                Vec::new()
            }
        }
    }

    pub async fn tv_status(&self) -> CecStatus {
        let devices = self.scan_devices().await;
        let tv = devices.iter().find(|device| device.address == 0);
        CecStatus {
            connected: self.is_connected(),
            backend: self.backend.name().to_string(),
            tv_found: tv.is_some(),
            tv_name: tv.map(|device| device.name.clone()),
            tv_power: tv.map(|device| device.power_status.clone()),
            devices_count: devices.len(),
            last_command: self
                .inner
                .last_command
                .lock()
                .expect("last command poisoned")
                .map(|t| t.to_rfc3339()),
            queued_commands: self.inner.queued.load(Ordering::SeqCst),
            available_commands: self.available_commands(),
        }
    }
}

/// `device #0: TV` lines from cec-client scan output.
pub fn parse_cec_client_device(line: &str) -> Option<CecDevice> {
    let re = Regex::new(r"(?i)device #(\d+):\s*(.+)").ok()?;
    let caps = re.captures(line)?;
    let address: u8 = caps[1].parse().ok()?;
    let name = caps[2].trim().to_string();
    Some(CecDevice {
        address,
        name,
        vendor: "Unknown".to_string(),
        device_type: if address == 0 { "TV" } else { "Unknown" }.to_string(),
        power_status: "unknown".to_string(),
        active_source: false,
    })
}

/// `Device N at ...` lines from cec-ctl listings.
pub fn parse_cec_ctl_device(line: &str) -> Option<CecDevice> {
    if !(line.contains("Device") && line.contains("at")) {
        return None;
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }
    let address: u8 = parts[1].parse().ok()?;
    let name = parts[3..].join(" ");
    Some(CecDevice {
        address,
        name,
        vendor: "Unknown".to_string(),
        device_type: if address == 0 { "TV" } else { "Unknown" }.to_string(),
        power_status: "unknown".to_string(),
        active_source: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testutil::ScriptedExecutor;

    fn settings() -> CecSettings {
        CecSettings {
            enabled: true,
            device_name: "TV Box Controller".to_string(),
            physical_address: "1.0.0.0".to_string(),
            client_path: None,
            inter_command_delay_ms: 100,
            cache_ttl_secs: 30,
        }
    }

    fn cec_client_executor() -> Arc<ScriptedExecutor> {
        ScriptedExecutor::with_responder(|spec| {
            if spec.program == "cec-client" {
                return ScriptedExecutor::ok_output("device #0: TV\ndevice #1: Playback 1\n");
            }
            ScriptedExecutor::ok_output("")
        })
    }

    #[test]
    fn command_table_holds_known_codes() {
        let table = command_table();
        assert_eq!(table.get("power_toggle").expect("entry").code, "6B");
        assert_eq!(table.get("volume_up").expect("entry").code, "44 41");
        assert_eq!(table.get("get_active_source").expect("entry").target, "F");
        assert!(table.get("warp_drive").is_none());
    }

    #[test]
    fn parses_scan_output_lines() {
        let device = parse_cec_client_device("device #0: Samsung TV").expect("device");
        assert_eq!(device.address, 0);
        assert_eq!(device.name, "Samsung TV");
        assert_eq!(device.device_type, "TV");

        let device = parse_cec_ctl_device("Device 1 at 1.0.0.0 Playback Device").expect("device");
        assert_eq!(device.address, 1);
        assert_eq!(device.name, "1.0.0.0 Playback Device");

        assert!(parse_cec_client_device("log: nothing here").is_none());
        assert!(parse_cec_ctl_device("random text").is_none());
    }

    #[tokio::test]
    async fn unknown_command_fails_fast() {
        let controller = CecController::new(
            CecBackend::Mock,
            settings(),
            ScriptedExecutor::ok_for_all(""),
        );
        assert!(controller.initialize().await);
        let err = controller.send_command("warp_drive").expect_err("unknown");
        assert_eq!(err.code, crate::app::error::ERR_UNSUPPORTED);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn send_before_initialize_is_rejected() {
        let controller = CecController::new(
            CecBackend::Mock,
            settings(),
            ScriptedExecutor::ok_for_all(""),
        );
        let err = controller.send_command("power_on").expect_err("not initialized");
        assert_eq!(err.code, crate::app::error::ERR_SYSTEM);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_reach_the_bus_in_submission_order() {
        let executor = cec_client_executor();
        let controller = CecController::new(
            CecBackend::CecClient("cec-client".to_string()),
            settings(),
            executor.clone(),
        );
        assert!(controller.initialize().await);

        controller.send_command("power_on").expect("queue");
        controller.send_command("volume_up").expect("queue");
        controller.send_command("mute").expect("queue");

        // Let the worker drain; the fixed inter-command delay advances
        // instantly under paused time.
        tokio::time::sleep(Duration::from_secs(2)).await;

        let sends: Vec<String> = executor
            .calls()
            .into_iter()
            .filter(|call| call.contains("tx 0:"))
            .collect();
        assert_eq!(sends.len(), 3);
        assert!(sends[0].contains("tx 0:04"));
        assert!(sends[1].contains("tx 0:44 41"));
        assert!(sends[2].contains("tx 0:44 43"));

        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn device_scan_is_cached_within_ttl() {
        let executor = cec_client_executor();
        let controller = CecController::new(
            CecBackend::CecClient("cec-client".to_string()),
            settings(),
            executor.clone(),
        );
        assert!(controller.initialize().await);
        // The connectivity probe issued one scan-shaped call already.
        let baseline = executor.calls_containing("scan");

        let first = controller.scan_devices().await;
        assert_eq!(first.len(), 2);
        assert_eq!(executor.calls_containing("scan"), baseline + 1);

        let second = controller.scan_devices().await;
        assert_eq!(second, first);
        assert_eq!(executor.calls_containing("scan"), baseline + 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        controller.scan_devices().await;
        assert_eq!(executor.calls_containing("scan"), baseline + 2);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn mock_backend_reports_fabricated_devices() {
        let controller = CecController::new(
            CecBackend::Mock,
            settings(),
            ScriptedExecutor::ok_for_all(""),
        );
        assert!(controller.initialize().await);
        let status = controller.tv_status().await;
        assert!(status.connected);
        assert_eq!(status.backend, "mock");
        assert!(status.tv_found);
        assert_eq!(status.devices_count, 2);
        assert!(status.available_commands.contains(&"power_toggle".to_string()));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn detect_backend_prefers_configured_path() {
        let executor = ScriptedExecutor::ok_for_all("");
        assert_eq!(
            detect_backend(executor.as_ref(), Some("/usr/bin/cec-ctl")).await,
            CecBackend::CecCtl("/usr/bin/cec-ctl".to_string())
        );
        assert_eq!(
            detect_backend(executor.as_ref(), Some("/opt/cec/cec-client")).await,
            CecBackend::CecClient("/opt/cec/cec-client".to_string())
        );
    }

    #[tokio::test]
    async fn detect_backend_falls_back_to_mock() {
        let executor = ScriptedExecutor::with_responder(|_| {
            ScriptedExecutor::failed_output("not found", 1)
        });
        assert_eq!(detect_backend(executor.as_ref(), None).await, CecBackend::Mock);
    }
}
