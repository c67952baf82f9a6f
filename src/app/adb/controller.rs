use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::adb::connection::Connection;
use crate::app::adb::parse;
use crate::app::error::AppError;
use crate::app::models::{
    AudioInfo, ConnectionInfo, CpuInfo, DeviceMetrics, ForegroundApp, NetworkInfo, ScreenInfo,
    StorageInfo, StreamVolume,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const DUMPSYS_TIMEOUT: Duration = Duration::from_secs(10);
const SETTINGS_TIMEOUT: Duration = Duration::from_secs(5);
const SCREENSHOT_CHUNK_TIMEOUT: Duration = Duration::from_secs(3);
const POWER_KEYCODE: u32 = 26;

/// Steps used when percent->index conversion is impossible because no max
/// index is discoverable. A heuristic, not a correct conversion.
const NO_MAX_NUDGE_STEPS: u32 = 5;

pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn nav_keycode(action: &str) -> Option<u32> {
    match action.to_lowercase().as_str() {
        "up" => Some(19),
        "down" => Some(20),
        "left" => Some(21),
        "right" => Some(22),
        "center" | "ok" => Some(23),
        "enter" => Some(66),
        "back" => Some(4),
        "home" => Some(3),
        _ => None,
    }
}

pub fn volume_keycode(direction: &str) -> Option<u32> {
    match direction.to_lowercase().as_str() {
        "up" => Some(24),
        "down" => Some(25),
        "mute" => Some(164),
        _ => None,
    }
}

pub fn media_keycode(action: &str) -> Option<u32> {
    match action.to_lowercase().as_str() {
        "play" => Some(126),
        "pause" => Some(127),
        "play_pause" => Some(85),
        "stop" => Some(86),
        "next" => Some(87),
        "previous" => Some(88),
        _ => None,
    }
}

pub fn clamp_percent(percent: i64) -> i64 {
    percent.clamp(0, 100)
}

pub fn volume_target_index(percent: i64, max: i64) -> i64 {
    ((percent as f64 * max as f64 / 100.0).round() as i64).clamp(0, max)
}

/// Corrective key presses needed to move from `current` to `target`.
pub fn nudge_plan(current: i64, target: i64) -> Option<(&'static str, u32)> {
    match target - current {
        0 => None,
        delta if delta > 0 => Some(("up", delta as u32)),
        delta => Some(("down", (-delta) as u32)),
    }
}

/// Device control facade: navigation, volume, screen, apps, screenshots and
/// the aggregate metrics read. Write operations propagate typed errors;
/// metrics probes degrade to None per key.
#[derive(Clone)]
pub struct AdbController {
    connection: Connection,
    has_battery: bool,
    has_cellular: bool,
}

impl AdbController {
    pub fn new(connection: Connection, has_battery: bool, has_cellular: bool) -> Self {
        Self {
            connection,
            has_battery,
            has_cellular,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub async fn connect(&self) -> Result<String, AppError> {
        let trace_id = new_trace_id();
        self.connection.ensure_connected(&trace_id).await?;
        Ok(format!("Connected to {}", self.connection.endpoint().target()))
    }

    pub async fn disconnect(&self) {
        let trace_id = new_trace_id();
        self.connection.disconnect(&trace_id).await;
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    pub async fn get_connection_info(&self) -> ConnectionInfo {
        self.connection.connection_info().await
    }

    async fn shell(
        &self,
        args: &[&str],
        timeout: Duration,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        self.connection.run_command(&full, timeout, trace_id).await
    }

    async fn send_key(&self, code: u32, trace_id: &str) -> Result<(), AppError> {
        self.shell(
            &["input", "keyevent", &code.to_string()],
            DEFAULT_TIMEOUT,
            trace_id,
        )
        .await?;
        Ok(())
    }

    pub async fn keyevent(&self, code: u32) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        self.send_key(code, &trace_id).await
    }

    pub async fn navigate(&self, action: &str) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        let code = nav_keycode(action).ok_or_else(|| {
            AppError::unsupported(format!("unsupported nav action: {action}"), &trace_id)
        })?;
        self.send_key(code, &trace_id).await
    }

    pub async fn volume(&self, direction: &str) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        self.volume_key(direction, &trace_id).await
    }

    async fn volume_key(&self, direction: &str, trace_id: &str) -> Result<(), AppError> {
        let code = volume_keycode(direction).ok_or_else(|| {
            AppError::unsupported(
                format!("volume direction must be up/down/mute, got {direction}"),
                trace_id,
            )
        })?;
        self.send_key(code, trace_id).await
    }

    pub async fn media_key(&self, action: &str) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        let code = media_keycode(action).ok_or_else(|| {
            AppError::unsupported(format!("unsupported media action: {action}"), &trace_id)
        })?;
        self.send_key(code, &trace_id).await
    }

    async fn audio_dump(&self, trace_id: &str) -> Result<String, AppError> {
        // `dumpsys -t 5` bounds the dump on newer builds; older ones reject
        // the flag, so retry plain.
        match self
            .shell(&["dumpsys", "-t", "5", "audio"], DUMPSYS_TIMEOUT, trace_id)
            .await
        {
            Ok(output) => Ok(output),
            Err(_) => self.shell(&["dumpsys", "audio"], DUMPSYS_TIMEOUT, trace_id).await,
        }
    }

    pub async fn audio_music_info(&self) -> Result<StreamVolume, AppError> {
        let trace_id = new_trace_id();
        self.music_info(&trace_id).await
    }

    async fn music_info(&self, trace_id: &str) -> Result<StreamVolume, AppError> {
        let output = self.audio_dump(trace_id).await?;
        let mut volume = parse::parse_music_volume(&output);
        if volume.max.is_none() {
            if let Ok(output) = self
                .shell(
                    &["settings", "get", "system", "volume_music_max"],
                    SETTINGS_TIMEOUT,
                    trace_id,
                )
                .await
            {
                volume.max = output.trim().parse().ok();
            }
        }
        Ok(volume)
    }

    pub async fn audio_full_info(&self) -> Result<AudioInfo, AppError> {
        let trace_id = new_trace_id();
        let output = self.audio_dump(&trace_id).await?;
        Ok(parse::parse_audio_dump(&output))
    }

    pub async fn set_volume_percent(&self, percent: i64) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        let pct = clamp_percent(percent);
        let info = self.music_info(&trace_id).await?;

        let Some(max) = info.max.filter(|max| *max > 0) else {
            let direction = if pct >= 50 { "up" } else { "down" };
            info!(
                trace_id = %trace_id,
                steps = NO_MAX_NUDGE_STEPS,
                direction,
                "no max volume detected, approximating with key presses"
            );
            for _ in 0..NO_MAX_NUDGE_STEPS {
                self.volume_key(direction, &trace_id).await?;
            }
            return Ok(());
        };

        let target = volume_target_index(pct, max);
        self.apply_volume_index(target, info.current, &trace_id).await
    }

    pub async fn set_volume_index(&self, index: i64) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        let info = self.music_info(&trace_id).await?;
        let target = match info.max.filter(|max| *max >= 0) {
            Some(max) => index.clamp(0, max),
            None => index.max(0),
        };
        self.apply_volume_index(target, info.current, &trace_id).await
    }

    /// Escalating write chain: media_session, then the media shell tool,
    /// then a raw settings write. None of the three is authoritative on
    /// every build, so the result is verified and corrected with key
    /// presses afterwards.
    async fn apply_volume_index(
        &self,
        target: i64,
        known_current: Option<i64>,
        trace_id: &str,
    ) -> Result<(), AppError> {
        let target_str = target.to_string();
        let strategies: [&[&str]; 3] = [
            &[
                "cmd",
                "media_session",
                "volume",
                "--show",
                "--stream",
                "3",
                "--set",
                &target_str,
            ],
            &["media", "volume", "--stream", "3", "--set", &target_str],
            &["settings", "put", "system", "volume_music", &target_str],
        ];

        let mut applied = false;
        for (idx, args) in strategies.iter().enumerate() {
            match self.shell(args, DEFAULT_TIMEOUT, trace_id).await {
                Ok(_) => {
                    debug!(trace_id = %trace_id, strategy = idx, "volume set accepted");
                    applied = true;
                    break;
                }
                Err(err) => {
                    debug!(trace_id = %trace_id, strategy = idx, error = %err, "volume strategy failed");
                }
            }
        }

        if !applied {
            match known_current {
                Some(current) => {
                    if let Some((direction, steps)) = nudge_plan(current, target) {
                        info!(
                            trace_id = %trace_id,
                            steps,
                            direction,
                            "all volume writes failed, falling back to key presses"
                        );
                        for _ in 0..steps {
                            self.volume_key(direction, trace_id).await?;
                        }
                    }
                }
                None => {
                    warn!(trace_id = %trace_id, "cannot set volume: no current level for fallback");
                }
            }
            return Ok(());
        }

        let after = self.music_info(trace_id).await?;
        if let Some(current) = after.current {
            if let Some((direction, steps)) = nudge_plan(current, target) {
                info!(trace_id = %trace_id, steps, direction, "nudging volume to target");
                for _ in 0..steps {
                    self.volume_key(direction, trace_id).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn get_brightness(&self) -> Result<i64, AppError> {
        let trace_id = new_trace_id();
        let output = self
            .shell(
                &["settings", "get", "system", "screen_brightness"],
                SETTINGS_TIMEOUT,
                &trace_id,
            )
            .await?;
        Ok(parse::parse_brightness(&output).unwrap_or(0))
    }

    pub async fn set_brightness(&self, value: i64) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        let clamped = value.clamp(0, 255);
        self.shell(
            &[
                "settings",
                "put",
                "system",
                "screen_brightness",
                &clamped.to_string(),
            ],
            SETTINGS_TIMEOUT,
            &trace_id,
        )
        .await?;
        Ok(())
    }

    pub async fn screen_state(&self) -> Result<bool, AppError> {
        let trace_id = new_trace_id();
        self.screen_state_traced(&trace_id).await
    }

    /// The power dump is authoritative when it carries a definitive signal;
    /// the display dump is consulted only when it does not.
    async fn screen_state_traced(&self, trace_id: &str) -> Result<bool, AppError> {
        match self
            .shell(&["dumpsys", "power"], Duration::from_secs(8), trace_id)
            .await
        {
            Ok(output) => {
                if let Some(on) = parse::parse_power_screen_state(&output) {
                    return Ok(on);
                }
            }
            Err(err) => {
                debug!(trace_id = %trace_id, error = %err, "dumpsys power screen probe failed");
            }
        }

        match self
            .shell(&["dumpsys", "display"], Duration::from_secs(8), trace_id)
            .await
        {
            Ok(output) => {
                if let Some(on) = parse::parse_display_screen_state(&output) {
                    return Ok(on);
                }
            }
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "dumpsys display screen probe failed");
            }
        }
        Ok(false)
    }

    pub async fn screen(&self, action: &str) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        match action.to_lowercase().as_str() {
            "toggle" | "power" => self.send_key(POWER_KEYCODE, &trace_id).await,
            "on" => {
                if !self.screen_state_traced(&trace_id).await? {
                    self.send_key(POWER_KEYCODE, &trace_id).await?;
                }
                Ok(())
            }
            "off" => {
                if self.screen_state_traced(&trace_id).await? {
                    self.send_key(POWER_KEYCODE, &trace_id).await?;
                }
                Ok(())
            }
            other => Err(AppError::unsupported(
                format!("unsupported screen action: {other}"),
                &trace_id,
            )),
        }
    }

    pub async fn launch_app(&self, package: &str) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        self.launch_app_traced(package, &trace_id).await
    }

    pub(crate) async fn launch_app_traced(
        &self,
        package: &str,
        trace_id: &str,
    ) -> Result<(), AppError> {
        self.shell(
            &[
                "monkey",
                "-p",
                package,
                "-c",
                "android.intent.category.LAUNCHER",
                "1",
            ],
            Duration::from_secs(20),
            trace_id,
        )
        .await?;
        Ok(())
    }

    pub async fn stop_app(&self, package: &str) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        self.stop_app_traced(package, &trace_id).await
    }

    pub(crate) async fn stop_app_traced(
        &self,
        package: &str,
        trace_id: &str,
    ) -> Result<(), AppError> {
        self.shell(&["am", "force-stop", package], DEFAULT_TIMEOUT, trace_id)
            .await?;
        Ok(())
    }

    pub async fn switch_app(&self, package: &str) -> Result<(), AppError> {
        self.launch_app(package).await
    }

    pub async fn top_app(&self) -> Result<ForegroundApp, AppError> {
        let trace_id = new_trace_id();
        let output = self
            .shell(&["dumpsys", "activity", "activities"], DUMPSYS_TIMEOUT, &trace_id)
            .await?;
        let component = parse::parse_foreground_component(&output);
        Ok(ForegroundApp {
            package: component.as_ref().map(|(pkg, _)| pkg.clone()),
            activity: component.map(|(_, act)| act),
        })
    }

    pub async fn list_packages(&self, pattern: Option<&str>) -> Result<Vec<String>, AppError> {
        let trace_id = new_trace_id();
        let mut args = vec!["pm", "list", "packages"];
        if let Some(pattern) = pattern {
            args.push(pattern);
        }
        let output = self.shell(&args, DEFAULT_TIMEOUT, &trace_id).await?;
        Ok(parse::parse_package_list(&output))
    }

    /// Transport state of the active media session; read failures degrade
    /// to None since this feeds polling consumers.
    pub async fn playback_state(&self) -> Option<&'static str> {
        let trace_id = new_trace_id();
        let foreground = match self.top_app().await {
            Ok(app) => app.package,
            Err(_) => None,
        };
        match self
            .shell(&["dumpsys", "media_session"], Duration::from_secs(8), &trace_id)
            .await
        {
            Ok(output) => parse::parse_playback_state(&output, foreground.as_deref()),
            Err(err) => {
                debug!(trace_id = %trace_id, error = %err, "media_session dump failed");
                None
            }
        }
    }

    pub async fn reboot(&self) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        self.shell(&["reboot"], DEFAULT_TIMEOUT, &trace_id).await?;
        self.connection.mark_disconnected().await;
        Ok(())
    }

    /// Streams `exec-out screencap -p` straight off the device. Fast but not
    /// universally supported; callers fall back to the pull path on error.
    async fn streamed_capture(&self, trace_id: &str) -> Result<Vec<u8>, AppError> {
        let (program, args) = self
            .connection
            .invocation(&["exec-out", "screencap", "-p"]);
        let mut child = tokio::process::Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                AppError::connection(format!("Failed to spawn {program}: {err}"), trace_id)
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::system("Failed to capture screencap stdout", trace_id))?;

        let mut data = Vec::new();
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let read = tokio::time::timeout(SCREENSHOT_CHUNK_TIMEOUT, stdout.read(&mut chunk))
                .await
                .map_err(|_| AppError::timeout("screencap stream stalled", trace_id))?
                .map_err(|err| AppError::system(format!("screencap read failed: {err}"), trace_id))?;
            if read == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..read]);
        }

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .map_err(|_| AppError::timeout("screencap did not exit", trace_id))?
            .map_err(|err| AppError::system(format!("screencap wait failed: {err}"), trace_id))?;

        if status.success() && !data.is_empty() {
            Ok(data)
        } else {
            Err(AppError::system(
                format!("screencap stream failed (exit {:?})", status.code()),
                trace_id,
            ))
        }
    }

    fn remote_capture_path(trace_id: &str) -> String {
        let suffix: String = trace_id.chars().take(8).collect();
        format!("/sdcard/.tvbox_capture_{suffix}.png")
    }

    async fn pull_capture(&self, local: &Path, trace_id: &str) -> Result<(), AppError> {
        let remote = Self::remote_capture_path(trace_id);
        let local_str = local.to_string_lossy().to_string();
        let result: Result<(), AppError> = async {
            self.shell(&["screencap", "-p", &remote], DUMPSYS_TIMEOUT, trace_id)
                .await?;
            self.connection
                .run_command(&["pull", &remote, &local_str], DEFAULT_TIMEOUT, trace_id)
                .await?;
            Ok(())
        }
        .await;

        // The remote temp is removed on both outcomes.
        if let Err(err) = self
            .shell(&["rm", "-f", &remote], SETTINGS_TIMEOUT, trace_id)
            .await
        {
            debug!(trace_id = %trace_id, error = %err, "failed to clean up remote capture file");
        }
        result
    }

    pub async fn screenshot(&self, path: &Path) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        match self.streamed_capture(&trace_id).await {
            Ok(data) => {
                tokio::fs::write(path, &data).await.map_err(|err| {
                    AppError::system(format!("Failed to write screenshot: {err}"), &trace_id)
                })?;
                debug!(trace_id = %trace_id, bytes = data.len(), "screenshot saved via stream");
                Ok(())
            }
            Err(err) => {
                debug!(trace_id = %trace_id, error = %err, "streamed capture failed, using pull fallback");
                self.pull_capture(path, &trace_id).await
            }
        }
    }

    pub async fn screenshot_bytes(&self) -> Result<Vec<u8>, AppError> {
        let trace_id = new_trace_id();
        match self.streamed_capture(&trace_id).await {
            Ok(data) => Ok(data),
            Err(err) => {
                debug!(trace_id = %trace_id, error = %err, "streamed capture failed, using pull fallback");
                let staging = tempfile::NamedTempFile::new().map_err(|err| {
                    AppError::system(format!("Failed to create staging file: {err}"), &trace_id)
                })?;
                self.pull_capture(staging.path(), &trace_id).await?;
                let data = std::fs::read(staging.path()).map_err(|err| {
                    AppError::system(format!("Failed to read staging file: {err}"), &trace_id)
                })?;
                if data.is_empty() {
                    return Err(AppError::system("Screenshot data is empty", &trace_id));
                }
                Ok(data)
            }
        }
    }

    /// Aggregate device read. Probes run concurrently and fail
    /// independently; a broken probe clears its own key only.
    pub async fn metrics(&self) -> DeviceMetrics {
        let trace_id = new_trace_id();
        let (memory, network, screen, audio, storage, foreground_app, cpu, battery) = tokio::join!(
            self.probe_memory(&trace_id),
            self.probe_network(&trace_id),
            self.probe_screen(&trace_id),
            self.probe_audio(&trace_id),
            self.probe_storage(&trace_id),
            self.probe_foreground(&trace_id),
            self.probe_cpu(&trace_id),
            self.probe_battery(&trace_id),
        );

        DeviceMetrics {
            memory,
            network,
            screen,
            audio,
            storage,
            foreground_app,
            cpu,
            battery,
        }
    }

    async fn probe_memory(&self, trace_id: &str) -> Option<crate::app::models::MemoryInfo> {
        match self
            .shell(&["cat", "/proc/meminfo"], SETTINGS_TIMEOUT, trace_id)
            .await
        {
            Ok(output) => parse::parse_meminfo(&output),
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "memory probe failed");
                None
            }
        }
    }

    async fn probe_network(&self, trace_id: &str) -> Option<NetworkInfo> {
        let connectivity = self.shell(
            &["dumpsys", "-t", "10", "connectivity"],
            DEFAULT_TIMEOUT,
            trace_id,
        );
        let wifi = self.shell(&["dumpsys", "-t", "5", "wifi"], DUMPSYS_TIMEOUT, trace_id);
        let cellular = async {
            if self.has_cellular {
                Some(
                    self.shell(
                        &["dumpsys", "-t", "5", "telephony.registry"],
                        DUMPSYS_TIMEOUT,
                        trace_id,
                    )
                    .await,
                )
            } else {
                None
            }
        };
        let (connectivity, wifi, cellular) = tokio::join!(connectivity, wifi, cellular);

        let mut info = NetworkInfo::default();
        let mut seen = false;
        if let Ok(output) = connectivity {
            let (internet, transport) = parse::parse_connectivity_dump(&output);
            if internet.is_some() || transport.is_some() {
                seen = true;
            }
            info.internet = internet;
            info.transport = transport;
        }
        if let Ok(output) = wifi {
            if let Some(parsed) = parse::parse_wifi_dump(&output) {
                info.wifi = Some(parsed);
                seen = true;
            }
        }
        if let Some(Ok(output)) = cellular {
            if let Some(parsed) = parse::parse_telephony_dump(&output) {
                info.cellular = Some(parsed);
                seen = true;
            }
        }
        seen.then_some(info)
    }

    async fn probe_screen(&self, trace_id: &str) -> Option<ScreenInfo> {
        let on = match self.screen_state_traced(trace_id).await {
            Ok(on) => on,
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "screen probe failed");
                return None;
            }
        };
        let brightness = self
            .shell(
                &["settings", "get", "system", "screen_brightness"],
                SETTINGS_TIMEOUT,
                trace_id,
            )
            .await
            .ok()
            .and_then(|output| parse::parse_brightness(&output));
        Some(ScreenInfo { on, brightness })
    }

    async fn probe_audio(&self, trace_id: &str) -> Option<AudioInfo> {
        match self.audio_dump(trace_id).await {
            Ok(output) => Some(parse::parse_audio_dump(&output)),
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "audio probe failed");
                None
            }
        }
    }

    async fn probe_storage(&self, trace_id: &str) -> Option<StorageInfo> {
        let data = self.shell(&["df", "-k", "/data"], SETTINGS_TIMEOUT, trace_id);
        let sdcard = self.shell(&["df", "-k", "/sdcard"], SETTINGS_TIMEOUT, trace_id);
        let (data, sdcard) = tokio::join!(data, sdcard);

        let storage = StorageInfo {
            data: data.ok().as_deref().and_then(parse::parse_df_output),
            sdcard: sdcard.ok().as_deref().and_then(parse::parse_df_output),
        };
        (storage.data.is_some() || storage.sdcard.is_some()).then_some(storage)
    }

    async fn probe_foreground(&self, trace_id: &str) -> Option<String> {
        match self
            .shell(&["dumpsys", "activity", "activities"], DUMPSYS_TIMEOUT, trace_id)
            .await
        {
            Ok(output) => parse::parse_foreground_component(&output).map(|(pkg, _)| pkg),
            Err(err) => {
                debug!(trace_id = %trace_id, error = %err, "foreground probe failed");
                None
            }
        }
    }

    async fn probe_cpu(&self, trace_id: &str) -> Option<CpuInfo> {
        let usage = self.shell(
            &["top", "-n", "1", "-d", "1"],
            SETTINGS_TIMEOUT,
            trace_id,
        );
        let breakdown = self.shell(
            &["dumpsys", "-t", "5", "cpuinfo"],
            Duration::from_secs(8),
            trace_id,
        );
        let (usage, breakdown) = tokio::join!(usage, breakdown);

        let breakdown_fields = breakdown
            .as_deref()
            .ok()
            .and_then(parse::parse_cpuinfo_breakdown);
        let usage_percent = match usage.as_deref().ok().and_then(parse::parse_top_cpu_percent) {
            Some(value) => Some(value),
            // The cpuinfo TOTAL line still gives an overall figure when top
            // output is unusable.
            None => breakdown
                .as_deref()
                .ok()
                .and_then(parse::parse_cpuinfo_total_percent),
        };

        if usage_percent.is_none() && breakdown_fields.is_none() {
            return None;
        }
        Some(CpuInfo {
            usage_percent,
            breakdown: breakdown_fields.unwrap_or_default(),
        })
    }

    async fn probe_battery(&self, trace_id: &str) -> Option<crate::app::models::BatteryInfo> {
        if !self.has_battery {
            return None;
        }
        match self
            .shell(&["dumpsys", "-t", "5", "battery"], DUMPSYS_TIMEOUT, trace_id)
            .await
        {
            Ok(output) => parse::parse_battery_dump(&output),
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "battery probe failed");
                None
            }
        }
    }
}
