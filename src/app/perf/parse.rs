use regex::Regex;

use crate::app::models::ProcessInfo;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopSnapshot {
    pub processes: Vec<ProcessInfo>,
    pub total_cpu_usage: f64,
    pub total_memory_usage: f64,
}

/// Parses a `top -b -n 1` style listing. The header row locates the process
/// table; preceding summary lines are ignored.
pub fn parse_top_output(output: &str) -> TopSnapshot {
    let lines: Vec<&str> = output.lines().collect();
    let header_idx = lines
        .iter()
        .position(|line| line.contains("PID") && line.to_uppercase().contains("CPU"));

    let Some(header_idx) = header_idx else {
        return TopSnapshot::default();
    };

    let mut snapshot = TopSnapshot::default();
    for line in &lines[header_idx + 1..] {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(process) = parse_process_line(line) {
            snapshot.total_cpu_usage += process.cpu_percent;
            snapshot.total_memory_usage += process.mem_percent;
            snapshot.processes.push(process);
        }
    }
    snapshot.total_cpu_usage = snapshot.total_cpu_usage.min(100.0);
    snapshot.total_memory_usage = snapshot.total_memory_usage.min(100.0);
    snapshot
}

/// One row of the process table:
/// `PID USER PR NI VIRT RES SHR S %CPU %MEM TIME+ COMMAND [args...]`.
/// Malformed rows are skipped rather than failing the whole sample.
pub fn parse_process_line(line: &str) -> Option<ProcessInfo> {
    let clean = strip_ansi(line);
    let parts: Vec<&str> = clean.split_whitespace().collect();
    if parts.len() < 12 {
        return None;
    }

    let pid = parts[0].parse::<i32>().ok()?;
    let user = parts[1].to_string();
    let cpu_percent = percent_field(parts[8]);
    let mem_percent = percent_field(parts[9]);
    let command = parts[11..].join(" ");
    if command.is_empty() {
        return None;
    }

    Some(ProcessInfo {
        pid,
        user,
        cpu_percent,
        mem_percent,
        command,
        service_name: None,
    })
}

fn percent_field(raw: &str) -> f64 {
    raw.trim_end_matches('%').parse().unwrap_or(0.0)
}

fn strip_ansi(line: &str) -> String {
    match Regex::new(r"\x1b\[[0-9;]*[A-Za-z]") {
        Ok(re) => re.replace_all(line, "").to_string(),
        Err(_) => line.to_string(),
    }
}

pub fn high_cpu_processes(snapshot: &TopSnapshot, threshold: f64) -> Vec<ProcessInfo> {
    snapshot
        .processes
        .iter()
        .filter(|process| process.cpu_percent >= threshold)
        .cloned()
        .collect()
}
