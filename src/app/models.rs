use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connected: bool,
    pub host: String,
    pub port: u16,
    pub serial: Option<String>,
    pub last_activity: Option<String>,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamVolume {
    pub current: Option<i64>,
    pub max: Option<i64>,
}

impl StreamVolume {
    pub fn percent(&self) -> Option<f64> {
        match (self.current, self.max) {
            (Some(current), Some(max)) if max > 0 => {
                let pct = current as f64 / max as f64 * 100.0;
                Some((pct * 10.0).round() / 10.0)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AudioInfo {
    pub music: StreamVolume,
    pub ring: StreamVolume,
    pub alarm: StreamVolume,
    pub ringer_mode: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatteryInfo {
    pub level: Option<u8>,
    pub status: Option<String>,
    pub health_name: Option<String>,
    pub temperature_c: Option<f64>,
    pub ac_powered: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MemoryInfo {
    pub total_kb: u64,
    pub available_kb: Option<u64>,
    pub used_kb: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScreenInfo {
    pub on: bool,
    pub brightness: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PartitionUsage {
    pub total_kb: u64,
    pub used_kb: u64,
    pub avail_kb: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageInfo {
    pub data: Option<PartitionUsage>,
    pub sdcard: Option<PartitionUsage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WifiInfo {
    pub ssid: Option<String>,
    pub rssi_dbm: Option<i64>,
    pub link_mbps: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CellularInfo {
    pub level: Option<i64>,
    pub dbm: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkInfo {
    pub internet: Option<bool>,
    pub transport: Option<String>,
    pub wifi: Option<WifiInfo>,
    pub cellular: Option<CellularInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CpuInfo {
    pub usage_percent: Option<f64>,
    pub breakdown: HashMap<String, f64>,
}

/// One aggregate device read; every section degrades to None independently.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceMetrics {
    pub memory: Option<MemoryInfo>,
    pub network: Option<NetworkInfo>,
    pub screen: Option<ScreenInfo>,
    pub audio: Option<AudioInfo>,
    pub storage: Option<StorageInfo>,
    pub foreground_app: Option<String>,
    pub cpu: Option<CpuInfo>,
    pub battery: Option<BatteryInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForegroundApp {
    pub package: Option<String>,
    pub activity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessInfo {
    pub pid: i32,
    pub user: String,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub command: String,
    pub service_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceSample {
    pub timestamp: String,
    pub total_cpu_usage: f64,
    pub total_memory_usage: f64,
    pub process_count: usize,
    pub high_cpu_processes: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadAverage {
    pub one_min: f64,
    pub five_min: f64,
    pub fifteen_min: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemInfo {
    pub monitoring_active: bool,
    pub cpu_threshold: f64,
    pub auto_kill_enabled: bool,
    pub active_violations: usize,
    pub load_average: Option<LoadAverage>,
    pub memory: Option<MemoryInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WatchdogTargetStatus {
    pub restart_count: u32,
    pub last_restart: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchdogStatus {
    pub monitoring: bool,
    pub check_interval_secs: u64,
    pub restart_attempts: u32,
    pub restart_delay_secs: u64,
    pub targets: HashMap<String, WatchdogTargetStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppHealth {
    pub package: String,
    pub is_running: bool,
    pub is_foreground: Option<bool>,
    pub memory_pss_kb: Option<u64>,
    pub restart_count: u32,
    pub last_restart: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CecDevice {
    pub address: u8,
    pub name: String,
    pub vendor: String,
    pub device_type: String,
    pub power_status: String,
    pub active_source: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CecStatus {
    pub connected: bool,
    pub backend: String,
    pub tv_found: bool,
    pub tv_name: Option<String>,
    pub tv_power: Option<String>,
    pub devices_count: usize,
    pub last_command: Option<String>,
    pub queued_commands: usize,
    pub available_commands: Vec<String>,
}

/// Aggregate exposed to the REST/automation glue; each section is
/// independently absent when its subsystem fails or is disabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceSnapshot {
    pub adb: Option<DeviceMetrics>,
    pub performance: Option<PerformanceSample>,
    pub system: Option<SystemInfo>,
    pub app_watchdog: Option<WatchdogStatus>,
    pub watched_app: Option<AppHealth>,
    pub cec: Option<CecStatus>,
    pub errors: HashMap<String, String>,
}
