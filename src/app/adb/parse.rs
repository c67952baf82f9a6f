use std::collections::HashMap;

use regex::Regex;

use crate::app::models::{
    AudioInfo, BatteryInfo, CellularInfo, MemoryInfo, PartitionUsage, StreamVolume, WifiInfo,
};

/// Parses `dumpsys audio` into per-stream volumes plus the ringer mode.
/// The dump format varies by OS build; every field tolerates absence.
pub fn parse_audio_dump(output: &str) -> AudioInfo {
    let mut info = AudioInfo::default();
    let mut current_stream: Option<usize> = None;

    for raw in output.lines() {
        let line = raw.trim();

        if line.contains("- STREAM_MUSIC:") {
            current_stream = Some(0);
            continue;
        } else if line.contains("- STREAM_RING:") {
            current_stream = Some(1);
            continue;
        } else if line.contains("- STREAM_ALARM:") {
            current_stream = Some(2);
            continue;
        } else if line.starts_with("- STREAM_") {
            current_stream = None;
            continue;
        }

        if current_stream.is_none() {
            if let Some(value) = line.strip_prefix("- mode (internal) =") {
                let mode = value.trim();
                if !mode.is_empty() {
                    info.ringer_mode = Some(mode.to_string());
                }
            }
            continue;
        }

        let stream = match current_stream {
            Some(0) => &mut info.music,
            Some(1) => &mut info.ring,
            Some(2) => &mut info.alarm,
            _ => continue,
        };

        if let Some(value) = line.split("Max:").nth(1) {
            if let Some(parsed) = first_integer(value) {
                stream.max = Some(parsed);
            }
        }

        // streamVolume is the authoritative field when present; the
        // Current: forms are older-build fallbacks.
        if let Some(value) = line.split("streamVolume:").nth(1) {
            if let Some(parsed) = first_integer(value) {
                stream.current = Some(parsed);
            }
        } else if line.contains("Current:") {
            if stream.current.is_none() || line.contains("(speaker):") {
                if let Some(parsed) = current_volume_from_line(line) {
                    stream.current = Some(parsed);
                }
            }
        }
    }

    info
}

pub fn parse_music_volume(output: &str) -> StreamVolume {
    parse_audio_dump(output).music
}

fn current_volume_from_line(line: &str) -> Option<i64> {
    let speaker = Regex::new(r"\(speaker\):\s*(\d+)").ok()?;
    let default = Regex::new(r"\(default\):\s*(\d+)").ok()?;
    let loose = Regex::new(r"Current:[^0-9]*(\d+)").ok()?;
    if let Some(caps) = speaker.captures(line) {
        return caps[1].parse().ok();
    }
    if let Some(caps) = default.captures(line) {
        return caps[1].parse().ok();
    }
    loose.captures(line).and_then(|caps| caps[1].parse().ok())
}

fn first_integer(value: &str) -> Option<i64> {
    value
        .trim()
        .split_whitespace()
        .next()
        .and_then(|token| token.trim_end_matches(',').parse().ok())
}

/// Maps a playback-state token to the canonical transport string. Both the
/// symbolic and the bare-numeric dump formats resolve to the same result.
pub fn canonical_playback_state(symbol: Option<&str>, code: Option<i64>) -> Option<&'static str> {
    if let Some(symbol) = symbol {
        match symbol.to_uppercase().as_str() {
            "PLAYING" | "STATE_PLAYING" => return Some("playing"),
            "PAUSED" | "STATE_PAUSED" => return Some("paused"),
            "STOPPED" | "STATE_STOPPED" => return Some("stopped"),
            "NONE" | "IDLE" | "STATE_NONE" | "STATE_IDLE" => return Some("idle"),
            _ => {}
        }
    }
    match code {
        Some(3) => Some("playing"),
        Some(2) => Some("paused"),
        Some(1) => Some("stopped"),
        Some(0) => Some("idle"),
        _ => None,
    }
}

fn playback_state_from_line(line: &str) -> Option<&'static str> {
    let sym_paren = Regex::new(r"state=([A-Z_]+)\((\d+)\)").ok()?;
    let sym_state = Regex::new(r"state=STATE_([A-Z_]+)").ok()?;
    let sym_plain = Regex::new(r"PlaybackState\s*\{\s*state=([A-Z_]+)").ok()?;
    let numeric = Regex::new(r"state=(\d+)").ok()?;

    let mut symbol: Option<String> = None;
    let mut code: Option<i64> = None;
    if let Some(caps) = sym_paren.captures(line) {
        symbol = Some(caps[1].to_string());
        code = caps[2].parse().ok();
    } else if let Some(caps) = sym_state.captures(line) {
        symbol = Some(caps[1].to_string());
    } else if let Some(caps) = sym_plain.captures(line) {
        symbol = Some(caps[1].to_string());
    } else if let Some(caps) = numeric.captures(line) {
        code = caps[1].parse().ok();
    }
    canonical_playback_state(symbol.as_deref(), code)
}

/// Extracts the transport state from a `dumpsys media_session` dump. When a
/// foreground package is known its session block is preferred; otherwise the
/// first active session in the Sessions Stack wins.
pub fn parse_playback_state(output: &str, prefer_package: Option<&str>) -> Option<&'static str> {
    let lines: Vec<&str> = output.lines().collect();

    if let Some(package) = prefer_package {
        for (idx, line) in lines.iter().enumerate() {
            if !line.contains(package) {
                continue;
            }
            let window = &lines[idx..lines.len().min(idx + 30)];
            let active = window
                .iter()
                .any(|candidate| candidate.replace(' ', "").contains("active=true"));
            if !active {
                continue;
            }
            for candidate in window {
                if !candidate.contains("state=PlaybackState") {
                    continue;
                }
                if let Some(state) = playback_state_from_line(candidate) {
                    return Some(state);
                }
            }
        }
    }

    let mut in_stack = false;
    let mut active = false;
    for line in &lines {
        if !in_stack {
            if line.contains("Sessions Stack") {
                in_stack = true;
                active = false;
            }
            continue;
        }
        if line.contains("active=") {
            active = line.replace(' ', "").contains("active=true");
        }
        if active && line.contains("state=PlaybackState") {
            if let Some(state) = playback_state_from_line(line) {
                return Some(state);
            }
        }
    }
    None
}

pub fn parse_battery_dump(output: &str) -> Option<BatteryInfo> {
    let mut info = BatteryInfo::default();
    let mut seen = false;

    for raw in output.lines() {
        let line = raw.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();
        match key.as_str() {
            "level" => {
                info.level = value.parse().ok();
                seen = true;
            }
            "status" => {
                info.status = Some(value.to_string());
                seen = true;
            }
            "health" => {
                info.health_name = Some(battery_health_name(value));
                seen = true;
            }
            "temperature" => {
                if let Ok(decic) = value.parse::<i64>() {
                    info.temperature_c = Some((decic as f64 / 10.0 * 10.0).round() / 10.0);
                    seen = true;
                }
            }
            "ac powered" => {
                info.ac_powered = Some(value.eq_ignore_ascii_case("true"));
                seen = true;
            }
            _ => {}
        }
    }

    seen.then_some(info)
}

fn battery_health_name(raw: &str) -> String {
    match raw.trim() {
        "1" => "unknown".to_string(),
        "2" => "good".to_string(),
        "3" => "overheat".to_string(),
        "4" => "dead".to_string(),
        "5" => "over_voltage".to_string(),
        "6" => "failure".to_string(),
        "7" => "cold".to_string(),
        other => other.to_string(),
    }
}

pub fn parse_meminfo(output: &str) -> Option<MemoryInfo> {
    let mut total_kb: Option<u64> = None;
    let mut available_kb: Option<u64> = None;
    let mut free_kb: Option<u64> = None;
    let mut cached_kb: Option<u64> = None;
    let mut buffers_kb: Option<u64> = None;

    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next().unwrap_or_default().trim_end_matches(':');
        let value = match parts.next().and_then(|v| v.parse::<u64>().ok()) {
            Some(v) => v,
            None => continue,
        };
        match key {
            "MemTotal" => total_kb = Some(value),
            "MemAvailable" => available_kb = Some(value),
            "MemFree" => free_kb = Some(value),
            "Cached" => cached_kb = Some(value),
            "Buffers" => buffers_kb = Some(value),
            _ => {}
        }
    }

    let total_kb = total_kb.filter(|v| *v > 0)?;
    let used_kb = if let Some(available) = available_kb {
        total_kb.saturating_sub(available)
    } else if let Some(free) = free_kb {
        total_kb
            .saturating_sub(free)
            .saturating_sub(cached_kb.unwrap_or(0))
            .saturating_sub(buffers_kb.unwrap_or(0))
    } else {
        0
    };
    let used_percent = (used_kb as f64 / total_kb as f64 * 1000.0).round() / 10.0;

    Some(MemoryInfo {
        total_kb,
        available_kb,
        used_kb,
        used_percent,
    })
}

/// Overall CPU usage from a `top` summary line. Supports both the
/// "CPU: 15% usr 5% sys 0% nic 80% idle" and the cumulative
/// "400%cpu  98%user 0%nice 207%sys 79%idle" variants; when an idle figure
/// is present the busy share is derived from it.
pub fn parse_top_cpu_percent(output: &str) -> Option<f64> {
    let percent = Regex::new(r"(\d+(?:\.\d+)?)%").ok()?;
    let idle = Regex::new(r"(\d+(?:\.\d+)?)%\s*idle").ok()?;

    for raw in output.lines() {
        let line = raw.trim();
        if !(line.contains("CPU:") || line.to_lowercase().contains("cpu")) {
            continue;
        }
        if !line.contains('%') {
            continue;
        }
        if line.to_lowercase().contains("idle") {
            if let Some(caps) = idle.captures(line) {
                if let Ok(idle_pct) = caps[1].parse::<f64>() {
                    return Some((100.0 - idle_pct).max(0.0));
                }
            }
        }
        if let Some(caps) = percent.captures(line) {
            if let Ok(value) = caps[1].parse::<f64>() {
                return Some(value);
            }
        }
        break;
    }
    None
}

/// Breakdown from `dumpsys cpuinfo`'s TOTAL line, e.g.
/// `12% TOTAL: 7.5% user + 4.1% kernel + 0.3% iowait`.
pub fn parse_cpuinfo_breakdown(output: &str) -> Option<HashMap<String, f64>> {
    for line in output.lines() {
        let lowered = line.trim().to_lowercase();
        if !(line.contains("TOTAL:") || lowered.starts_with("total:")) {
            continue;
        }
        let tail = line.rsplit_once(':').map(|(_, t)| t).unwrap_or(line);
        let mut fields = HashMap::new();
        for token in tail.split('+') {
            let token = token.trim();
            let Some((value, name)) = token.split_once('%') else {
                continue;
            };
            if let Ok(value) = value.trim().parse::<f64>() {
                let name = name.trim();
                if !name.is_empty() {
                    fields.insert(name.to_string(), value);
                }
            }
        }
        if !fields.is_empty() {
            return Some(fields);
        }
        break;
    }
    None
}

/// Overall figure from the cpuinfo TOTAL line. Prefers the leading
/// `NN% TOTAL:` form; falls back to the first percent token after the colon.
pub fn parse_cpuinfo_total_percent(output: &str) -> Option<f64> {
    let leading = Regex::new(r"(\d+(?:\.\d+)?)%\s*TOTAL").ok()?;
    for line in output.lines() {
        let lowered = line.trim().to_lowercase();
        if !(line.contains("TOTAL:") || lowered.starts_with("total:")) {
            continue;
        }
        if let Some(caps) = leading.captures(line) {
            return caps[1].parse().ok();
        }
        let tail = line.rsplit_once(':').map(|(_, t)| t).unwrap_or(line);
        for token in tail.split_whitespace() {
            if let Some(value) = token.strip_suffix('%') {
                if let Ok(value) = value.parse::<f64>() {
                    return Some(value);
                }
            }
        }
        break;
    }
    None
}

/// Screen state from `dumpsys power`; None when the dump has no definitive
/// on/off signal so callers can consult the secondary source.
pub fn parse_power_screen_state(output: &str) -> Option<bool> {
    if output.contains("Display Power: state=ON")
        || output.contains("mHoldingDisplaySuspendBlocker=true")
    {
        return Some(true);
    }
    if output.contains("Display Power: state=OFF") {
        return Some(false);
    }
    None
}

pub fn parse_display_screen_state(output: &str) -> Option<bool> {
    for line in output.lines() {
        if line.contains("mScreenState=") {
            return Some(line.contains("mScreenState=ON"));
        }
    }
    None
}

pub fn parse_brightness(output: &str) -> Option<i64> {
    output
        .lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse().ok())
}

/// `package/activity` component of the resumed activity.
pub fn parse_foreground_component(output: &str) -> Option<(String, String)> {
    for raw in output.lines() {
        let line = raw.trim();
        if !(line.contains("mResumedActivity:") || line.contains("topResumedActivity")) {
            continue;
        }
        for token in line.split_whitespace() {
            if !(token.contains('/') && token.contains('.')) {
                continue;
            }
            let component = token.trim_end_matches('}');
            if let Some((package, activity)) = component.split_once('/') {
                if !package.is_empty() {
                    return Some((package.to_string(), activity.to_string()));
                }
            }
        }
        break;
    }
    None
}

pub fn parse_package_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .filter(|pkg| !pkg.is_empty())
        .map(|pkg| pkg.to_string())
        .collect()
}

pub fn parse_df_output(output: &str) -> Option<PartitionUsage> {
    for line in output.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 6 {
            continue;
        }
        let (Ok(total_kb), Ok(used_kb), Ok(avail_kb)) = (
            parts[1].parse::<u64>(),
            parts[2].parse::<u64>(),
            parts[3].parse::<u64>(),
        ) else {
            continue;
        };
        let used_percent = parts[4]
            .trim()
            .trim_end_matches('%')
            .parse::<f64>()
            .unwrap_or_else(|_| {
                if total_kb > 0 {
                    (used_kb as f64 * 1000.0 / total_kb as f64).round() / 10.0
                } else {
                    0.0
                }
            });
        return Some(PartitionUsage {
            total_kb,
            used_kb,
            avail_kb,
            used_percent,
        });
    }
    None
}

pub fn parse_connectivity_dump(output: &str) -> (Option<bool>, Option<String>) {
    let mut internet = None;
    let mut transport = None;
    for line in output.lines() {
        if line.contains("mNetworkCapabilities") && line.contains("NET_CAPABILITY_INTERNET") {
            internet = Some(true);
        }
        if line.contains("NetworkAgentInfo") {
            if line.contains("WIFI") {
                transport = Some("wifi".to_string());
            } else if line.contains("ETHERNET") {
                transport = Some("ethernet".to_string());
            } else if line.contains("MOBILE") || line.contains("CELLULAR") {
                transport = Some("cellular".to_string());
            }
        }
    }
    (internet, transport)
}

pub fn parse_wifi_dump(output: &str) -> Option<WifiInfo> {
    let mut info = WifiInfo::default();
    let mut seen = false;

    for raw in output.lines() {
        let line = raw.trim();
        if let Some(value) = line.strip_prefix("SSID:") {
            if !value.contains("<unknown ssid>") {
                let ssid = value.trim().trim_matches('"');
                if !ssid.is_empty() {
                    info.ssid = Some(ssid.to_string());
                    seen = true;
                }
            }
        } else if let Some(value) = line.split("RSSI:").nth(1) {
            if let Some(rssi) = value.split_whitespace().next().and_then(|t| {
                t.trim_end_matches(',').parse::<i64>().ok()
            }) {
                info.rssi_dbm = Some(rssi);
                seen = true;
            }
        } else if let Some(value) = line.split("Link speed:").nth(1) {
            let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
            if let Ok(mbps) = digits.parse::<i64>() {
                info.link_mbps = Some(mbps);
                seen = true;
            }
        }
    }

    seen.then_some(info)
}

pub fn parse_telephony_dump(output: &str) -> Option<CellularInfo> {
    for raw in output.lines() {
        let line = raw.trim();
        if !line.contains("mSignalStrength=") {
            continue;
        }
        let mut info = CellularInfo::default();
        if let Some(value) = line.split("level=").nth(1) {
            info.level = value
                .split(',')
                .next()
                .and_then(|t| t.trim().parse().ok());
        }
        if let Some(value) = line.split("dbm=").nth(1) {
            info.dbm = value
                .split(',')
                .next()
                .and_then(|t| t.trim().parse().ok());
        }
        if info.level.is_some() || info.dbm.is_some() {
            return Some(info);
        }
        break;
    }
    None
}

/// TOTAL PSS (kB) from `dumpsys meminfo <package>`.
pub fn parse_total_pss_kb(output: &str) -> Option<u64> {
    for line in output.lines() {
        if !line.contains("TOTAL PSS:") {
            continue;
        }
        let tail = line.split("TOTAL PSS:").nth(1)?;
        return tail
            .split_whitespace()
            .next()
            .and_then(|token| token.parse().ok());
    }
    None
}
