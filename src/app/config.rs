use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdbSettings {
    pub host: String,
    pub port: u16,
    pub serial: Option<String>,
    pub adb_path: String,
    pub idle_timeout_secs: u64,
    pub has_battery: bool,
    pub has_cellular: bool,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5555,
            serial: None,
            adb_path: String::new(),
            idle_timeout_secs: 300,
            has_battery: false,
            has_cellular: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceSettings {
    pub enabled: bool,
    pub cpu_threshold: f64,
    pub interval_ms: u64,
    pub kill_after_violations: u32,
    pub auto_kill: bool,
    pub protected_processes: Vec<String>,
    pub violation_grace_secs: u64,
}

impl PerformanceSettings {
    pub fn default_protected() -> Vec<String> {
        [
            "init", "kernel", "systemd", "termux", "sshd", "adb", "tvbox-control",
        ]
        .iter()
        .map(|name| name.to_string())
        .collect()
    }
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cpu_threshold: 50.0,
            interval_ms: 500,
            kill_after_violations: 3,
            auto_kill: true,
            protected_processes: Self::default_protected(),
            violation_grace_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchdogSettings {
    pub enabled: bool,
    pub packages: Vec<String>,
    pub check_interval_secs: u64,
    pub restart_attempts: u32,
    pub restart_delay_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            packages: Vec::new(),
            check_interval_secs: 300,
            restart_attempts: 3,
            restart_delay_secs: 10,
            cooldown_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CecSettings {
    pub enabled: bool,
    pub device_name: String,
    pub physical_address: String,
    pub client_path: Option<String>,
    pub inter_command_delay_ms: u64,
    pub cache_ttl_secs: u64,
}

impl Default for CecSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            device_name: "TV Box Controller".to_string(),
            physical_address: "1.0.0.0".to_string(),
            client_path: None,
            inter_command_delay_ms: 100,
            cache_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSettings {
    pub snapshot_interval_secs: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub performance: PerformanceSettings,
    #[serde(default)]
    pub watchdog: WatchdogSettings,
    #[serde(default)]
    pub cec: CecSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub service: ServiceSettings,
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TVBOX_CONTROL_CONFIG") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".tvbox_control_config.json")
}

pub fn backup_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".tvbox_control_config.backup.json")
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    save_config_to_path(config, &config_path(), &backup_config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), ""))?;
    let mut config: AppConfig = serde_json::from_value(value.clone()).unwrap_or_default();
    config = apply_legacy_overrides(config, &value);
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

/// Earlier releases kept the endpoint and watchdog package at the top level.
fn apply_legacy_overrides(mut config: AppConfig, value: &serde_json::Value) -> AppConfig {
    if let Some(host) = value.get("host").and_then(|v| v.as_str()) {
        config.adb.host = host.to_string();
    }
    if let Some(port) = value.get("port").and_then(|v| v.as_u64()) {
        if port <= u16::MAX as u64 {
            config.adb.port = port as u16;
        }
    }
    if let Some(serial) = value.get("serial").and_then(|v| v.as_str()) {
        if !serial.trim().is_empty() {
            config.adb.serial = Some(serial.to_string());
        }
    }
    if let Some(package) = value.get("watch_package").and_then(|v| v.as_str()) {
        if !config.watchdog.packages.iter().any(|p| p == package) {
            config.watchdog.packages.push(package.to_string());
        }
    }
    config
}

fn validate_config(mut config: AppConfig) -> AppConfig {
    if config.adb.idle_timeout_secs < 10 {
        config.adb.idle_timeout_secs = 300;
    }
    if !(1.0..=100.0).contains(&config.performance.cpu_threshold) {
        config.performance.cpu_threshold = 50.0;
    }
    if config.performance.interval_ms < 100 {
        config.performance.interval_ms = 500;
    }
    if config.performance.kill_after_violations == 0 {
        config.performance.kill_after_violations = 3;
    }
    if config.performance.violation_grace_secs == 0 {
        config.performance.violation_grace_secs = 300;
    }
    if config.watchdog.check_interval_secs < 10 {
        config.watchdog.check_interval_secs = 300;
    }
    if config.watchdog.restart_attempts == 0 {
        config.watchdog.restart_attempts = 3;
    }
    if config.cec.inter_command_delay_ms < 10 {
        config.cec.inter_command_delay_ms = 100;
    }
    if config.cec.cache_ttl_secs == 0 {
        config.cec.cache_ttl_secs = 30;
    }
    if config.service.snapshot_interval_secs < 5 {
        config.service.snapshot_interval_secs = 60;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_legacy_top_level_values() {
        let value = serde_json::json!({
            "host": "192.168.1.50",
            "port": 5556,
            "watch_package": "com.example.hub"
        });
        let mut config: AppConfig = serde_json::from_value(value.clone()).unwrap_or_default();
        config = apply_legacy_overrides(config, &value);
        assert_eq!(config.adb.host, "192.168.1.50");
        assert_eq!(config.adb.port, 5556);
        assert_eq!(config.watchdog.packages, vec!["com.example.hub".to_string()]);
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = AppConfig::default();
        config.performance.cpu_threshold = 250.0;
        config.performance.interval_ms = 1;
        config.performance.kill_after_violations = 0;
        config.watchdog.check_interval_secs = 0;
        config.cec.cache_ttl_secs = 0;
        config.adb.idle_timeout_secs = 1;
        let validated = validate_config(config);
        assert_eq!(validated.performance.cpu_threshold, 50.0);
        assert_eq!(validated.performance.interval_ms, 500);
        assert_eq!(validated.performance.kill_after_violations, 3);
        assert_eq!(validated.watchdog.check_interval_secs, 300);
        assert_eq!(validated.cec.cache_ttl_secs, 30);
        assert_eq!(validated.adb.idle_timeout_secs, 300);
    }

    #[test]
    fn roundtrips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let backup = dir.path().join("config.backup.json");

        let mut config = AppConfig::default();
        config.adb.host = "10.0.0.2".to_string();
        config.watchdog.packages.push("com.example.tv".to_string());
        save_config_to_path(&config, &path, &backup).expect("save");

        let loaded = load_config_from_path(&path).expect("load");
        assert_eq!(loaded, config);

        // Second save keeps a backup of the previous file.
        save_config_to_path(&config, &path, &backup).expect("save again");
        assert!(backup.exists());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let loaded = load_config_from_path(Path::new("/nonexistent/tvbox.json")).expect("load");
        assert_eq!(loaded, AppConfig::default());
    }
}
