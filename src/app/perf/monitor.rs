use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::adb::runner::{CommandExecutor, CommandSpec};
use crate::app::config::PerformanceSettings;
use crate::app::models::{LoadAverage, PerformanceSample, ProcessInfo, SystemInfo};
use crate::app::perf::parse::{high_cpu_processes, parse_top_output, TopSnapshot};

const KILL_TIMEOUT: Duration = Duration::from_secs(2);
const TOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct ViolationEntry {
    count: u32,
    last_seen: DateTime<Utc>,
}

/// Per-pid counters of consecutive high-CPU cycles. An entry lives until
/// the process is killed, recovers, or goes unseen past the grace window.
#[derive(Debug, Default)]
pub struct ViolationTracker {
    entries: HashMap<i32, ViolationEntry>,
}

impl ViolationTracker {
    /// Records one violating cycle for each pid and returns those that have
    /// reached the kill threshold.
    pub fn observe(&mut self, pids: &[i32], kill_after: u32, now: DateTime<Utc>) -> Vec<i32> {
        let mut due = Vec::new();
        for &pid in pids {
            let entry = self.entries.entry(pid).or_insert(ViolationEntry {
                count: 0,
                last_seen: now,
            });
            entry.count += 1;
            entry.last_seen = now;
            if entry.count >= kill_after {
                due.push(pid);
            }
        }
        due
    }

    pub fn confirm_kill(&mut self, pid: i32) {
        self.entries.remove(&pid);
    }

    pub fn violations(&self, pid: i32) -> u32 {
        self.entries.get(&pid).map(|entry| entry.count).unwrap_or(0)
    }

    pub fn active(&self) -> usize {
        self.entries.len()
    }

    /// Drops entries not re-observed within the grace window so the map
    /// cannot grow unbounded across process churn.
    pub fn purge_stale(&mut self, now: DateTime<Utc>, grace: chrono::Duration) {
        self.entries.retain(|pid, entry| {
            let keep = now.signed_duration_since(entry.last_seen) <= grace;
            if !keep {
                debug!(pid, "dropping stale violation entry");
            }
            keep
        });
    }
}

/// Protected processes are never auto-killed: allowlisted command names,
/// and root-owned processes without an app-like command.
pub fn is_protected(process: &ProcessInfo, protected: &[String]) -> bool {
    let command = process.command.to_lowercase();
    if protected
        .iter()
        .any(|name| !name.is_empty() && command.contains(name.to_lowercase().as_str()))
    {
        return true;
    }
    if process.user == "root"
        && !["app", "android", "game", "browser"]
            .iter()
            .any(|marker| command.contains(marker))
    {
        return true;
    }
    false
}

struct MonitorInner {
    running: AtomicBool,
    tracker: Mutex<ViolationTracker>,
    latest: Mutex<Option<PerformanceSample>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Background sampler of the box-side process table. Sustained high-CPU
/// offenders are terminated after a configured number of consecutive
/// violations, with a TERM-then-KILL escalation.
#[derive(Clone)]
pub struct PerformanceMonitor {
    settings: PerformanceSettings,
    executor: Arc<dyn CommandExecutor>,
    inner: Arc<MonitorInner>,
}

impl PerformanceMonitor {
    pub fn new(settings: PerformanceSettings, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            settings,
            executor,
            inner: Arc::new(MonitorInner {
                running: AtomicBool::new(false),
                tracker: Mutex::new(ViolationTracker::default()),
                latest: Mutex::new(None),
                task: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("performance monitor is already running");
            return;
        }
        info!(
            interval_ms = self.settings.interval_ms,
            cpu_threshold = self.settings.cpu_threshold,
            auto_kill = self.settings.auto_kill,
            "starting performance monitor"
        );
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            monitor.run_loop().await;
        });
        *self.inner.task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping performance monitor");
        if let Some(handle) = self.inner.task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn run_loop(&self) {
        let interval = Duration::from_millis(self.settings.interval_ms);
        while self.inner.running.load(Ordering::SeqCst) {
            if let Err(err) = self.run_cycle().await {
                error!(error = %err, "performance monitoring cycle failed");
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub(crate) async fn run_cycle(&self) -> Result<(), crate::app::error::AppError> {
        let Some(snapshot) = self.capture().await else {
            return Ok(());
        };
        let high = high_cpu_processes(&snapshot, self.settings.cpu_threshold);
        self.store_sample(&snapshot, &high);

        if !high.is_empty() {
            info!(
                total_cpu = snapshot.total_cpu_usage,
                total_memory = snapshot.total_memory_usage,
                offenders = high.len(),
                "high cpu processes detected"
            );
            if self.settings.auto_kill {
                self.enforce(&high).await;
            }
        }

        let now = Utc::now();
        let grace = chrono::Duration::seconds(self.settings.violation_grace_secs as i64);
        self.inner
            .tracker
            .lock()
            .expect("violation tracker poisoned")
            .purge_stale(now, grace);
        Ok(())
    }

    /// Tries progressively simpler top invocations until one works; output
    /// format differs across busybox/toybox builds.
    async fn capture(&self) -> Option<TopSnapshot> {
        let variants: [&[&str]; 4] = [
            &["-b", "-n", "1", "-o", "%CPU"],
            &["-b", "-n", "1"],
            &["-n", "1"],
            &[],
        ];
        for args in variants {
            let spec = CommandSpec::new(
                "top",
                args.iter().map(|a| a.to_string()).collect(),
                TOP_TIMEOUT,
                "perf-sample",
            );
            match self.executor.execute(&spec).await {
                Ok(output) if output.exit_code == Some(0) => {
                    return Some(parse_top_output(&output.stdout));
                }
                Ok(output) => {
                    debug!(args = ?args, exit = ?output.exit_code, "top variant failed");
                }
                Err(err) => {
                    debug!(args = ?args, error = %err, "top variant failed to run");
                }
            }
        }
        warn!("all top command variations failed");
        None
    }

    fn store_sample(&self, snapshot: &TopSnapshot, high: &[ProcessInfo]) {
        let sample = PerformanceSample {
            timestamp: Utc::now().to_rfc3339(),
            total_cpu_usage: snapshot.total_cpu_usage,
            total_memory_usage: snapshot.total_memory_usage,
            process_count: snapshot.processes.len(),
            high_cpu_processes: high.to_vec(),
        };
        *self.inner.latest.lock().expect("latest sample poisoned") = Some(sample);
    }

    async fn enforce(&self, high: &[ProcessInfo]) {
        let mut candidates: Vec<ProcessInfo> = Vec::new();
        for process in high {
            if is_protected(process, &self.settings.protected_processes) {
                debug!(
                    pid = process.pid,
                    command = %process.command,
                    "skipping protected process"
                );
                continue;
            }
            let mut process = process.clone();
            if process.service_name.is_none() {
                process.service_name = self.service_name(process.pid).await;
            }
            candidates.push(process);
        }

        let now = Utc::now();
        let due = {
            let mut tracker = self
                .inner
                .tracker
                .lock()
                .expect("violation tracker poisoned");
            let pids: Vec<i32> = candidates.iter().map(|p| p.pid).collect();
            let due = tracker.observe(&pids, self.settings.kill_after_violations, now);
            for process in &candidates {
                info!(
                    pid = process.pid,
                    cpu = process.cpu_percent,
                    violations = tracker.violations(process.pid),
                    limit = self.settings.kill_after_violations,
                    command = %process.command,
                    service = process.service_name.as_deref().unwrap_or("unknown"),
                    "high cpu violation"
                );
            }
            due
        };

        for pid in due {
            let Some(process) = candidates.iter().find(|p| p.pid == pid) else {
                continue;
            };
            if self.kill_process(process).await {
                self.inner
                    .tracker
                    .lock()
                    .expect("violation tracker poisoned")
                    .confirm_kill(pid);
            }
        }
    }

    async fn kill_process(&self, process: &ProcessInfo) -> bool {
        warn!(
            pid = process.pid,
            cpu = process.cpu_percent,
            command = %process.command,
            "killing sustained high cpu process"
        );
        if self.signal(process.pid, "-TERM").await {
            return true;
        }
        warn!(pid = process.pid, "TERM failed, escalating to KILL");
        let killed = self.signal(process.pid, "-KILL").await;
        if !killed {
            error!(pid = process.pid, "failed to kill process");
        }
        killed
    }

    async fn signal(&self, pid: i32, signal: &str) -> bool {
        let spec = CommandSpec::new(
            "kill",
            vec![signal.to_string(), pid.to_string()],
            KILL_TIMEOUT,
            "perf-kill",
        );
        matches!(self.executor.execute(&spec).await, Ok(output) if output.exit_code == Some(0))
    }

    async fn service_name(&self, pid: i32) -> Option<String> {
        let spec = CommandSpec::new(
            "ps",
            vec!["-p".to_string(), pid.to_string(), "-o".to_string(), "comm=".to_string()],
            KILL_TIMEOUT,
            "perf-psname",
        );
        match self.executor.execute(&spec).await {
            Ok(output) if output.exit_code == Some(0) => {
                let name = output.stdout.trim().to_string();
                (!name.is_empty()).then_some(name)
            }
            _ => None,
        }
    }

    pub fn latest_sample(&self) -> Option<PerformanceSample> {
        self.inner
            .latest
            .lock()
            .expect("latest sample poisoned")
            .clone()
    }

    pub async fn system_info(&self) -> SystemInfo {
        let mut info = SystemInfo {
            monitoring_active: self.is_running(),
            cpu_threshold: self.settings.cpu_threshold,
            auto_kill_enabled: self.settings.auto_kill,
            active_violations: self
                .inner
                .tracker
                .lock()
                .expect("violation tracker poisoned")
                .active(),
            load_average: None,
            memory: None,
        };

        if let Ok(raw) = tokio::fs::read_to_string("/proc/loadavg").await {
            let parts: Vec<&str> = raw.split_whitespace().collect();
            if parts.len() >= 3 {
                if let (Ok(one), Ok(five), Ok(fifteen)) = (
                    parts[0].parse::<f64>(),
                    parts[1].parse::<f64>(),
                    parts[2].parse::<f64>(),
                ) {
                    info.load_average = Some(LoadAverage {
                        one_min: one,
                        five_min: five,
                        fifteen_min: fifteen,
                    });
                }
            }
        }

        if let Ok(raw) = tokio::fs::read_to_string("/proc/meminfo").await {
            info.memory = crate::app::adb::parse::parse_meminfo(&raw);
        }

        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testutil::ScriptedExecutor;

    fn process(pid: i32, user: &str, cpu: f64, command: &str) -> ProcessInfo {
        ProcessInfo {
            pid,
            user: user.to_string(),
            cpu_percent: cpu,
            mem_percent: 1.0,
            command: command.to_string(),
            service_name: None,
        }
    }

    fn settings() -> PerformanceSettings {
        PerformanceSettings {
            enabled: true,
            cpu_threshold: 50.0,
            interval_ms: 500,
            kill_after_violations: 3,
            auto_kill: true,
            protected_processes: PerformanceSettings::default_protected(),
            violation_grace_secs: 300,
        }
    }

    fn top_row(pid: i32, user: &str, cpu: f64, command: &str) -> String {
        format!(" {pid} {user} 20 0 1.2G 150M 80M S {cpu:.1} 3.8 1:02.33 {command}\n")
    }

    fn top_output(rows: &[String]) -> String {
        let mut out = String::from("  PID USER PR NI VIRT RES SHR S %CPU %MEM TIME+ ARGS\n");
        for row in rows {
            out.push_str(row);
        }
        out
    }

    #[test]
    fn violation_lifecycle_fires_kill_exactly_at_threshold() {
        let mut tracker = ViolationTracker::default();
        let now = Utc::now();
        assert!(tracker.observe(&[4242], 3, now).is_empty());
        assert!(tracker.observe(&[4242], 3, now).is_empty());
        assert_eq!(tracker.observe(&[4242], 3, now), vec![4242]);
        assert_eq!(tracker.violations(4242), 3);

        tracker.confirm_kill(4242);
        assert_eq!(tracker.violations(4242), 0);
        assert_eq!(tracker.active(), 0);

        // A relaunched process starts counting from scratch.
        assert!(tracker.observe(&[4242], 3, now).is_empty());
    }

    #[test]
    fn stale_entries_are_purged_after_grace_window() {
        let mut tracker = ViolationTracker::default();
        let start = Utc::now();
        tracker.observe(&[100, 200], 3, start);

        let later = start + chrono::Duration::minutes(4);
        tracker.observe(&[200], 3, later);

        tracker.purge_stale(later + chrono::Duration::minutes(2), chrono::Duration::minutes(5));
        assert_eq!(tracker.violations(100), 0);
        assert_eq!(tracker.violations(200), 2);
    }

    #[test]
    fn protected_process_rules() {
        let protected = PerformanceSettings::default_protected();
        assert!(is_protected(&process(1, "root", 99.0, "/init"), &protected));
        assert!(is_protected(&process(2, "shell", 99.0, "adbd"), &protected));
        assert!(is_protected(&process(3, "root", 99.0, "kworker/1:2"), &protected));
        // Root with an app-like command is fair game.
        assert!(!is_protected(
            &process(4, "root", 99.0, "com.vendor.app.updater"),
            &protected
        ));
        assert!(!is_protected(
            &process(5, "u0_a101", 99.0, "com.bad.game"),
            &protected
        ));
    }

    #[tokio::test]
    async fn kills_after_consecutive_violations_exactly_once() {
        let bad_row = top_row(4242, "u0_a101", 97.0, "com.bad.app");
        let output = top_output(&[bad_row]);
        let executor = ScriptedExecutor::with_responder(move |spec| {
            if spec.program == "top" {
                return ScriptedExecutor::ok_output(&output);
            }
            ScriptedExecutor::ok_output("")
        });
        let monitor = PerformanceMonitor::new(settings(), executor.clone());

        for _ in 0..5 {
            monitor.run_cycle().await.expect("cycle");
        }

        assert_eq!(executor.calls_containing("kill -TERM 4242"), 1);
        assert_eq!(executor.calls_containing("kill -KILL"), 0);
        // Tracker entry is gone right after the kill.
        assert_eq!(
            monitor
                .inner
                .tracker
                .lock()
                .expect("tracker")
                .violations(4242),
            0
        );
    }

    #[tokio::test]
    async fn escalates_to_sigkill_when_term_fails() {
        let bad_row = top_row(4242, "u0_a101", 97.0, "com.bad.app");
        let output = top_output(&[bad_row]);
        let executor = ScriptedExecutor::with_responder(move |spec| {
            if spec.program == "top" {
                return ScriptedExecutor::ok_output(&output);
            }
            if spec.program == "kill" && spec.args[0] == "-TERM" {
                return ScriptedExecutor::failed_output("Operation not permitted", 1);
            }
            ScriptedExecutor::ok_output("")
        });
        let monitor = PerformanceMonitor::new(settings(), executor.clone());

        for _ in 0..3 {
            monitor.run_cycle().await.expect("cycle");
        }

        assert_eq!(executor.calls_containing("kill -TERM 4242"), 1);
        assert_eq!(executor.calls_containing("kill -KILL 4242"), 1);
    }

    #[tokio::test]
    async fn protected_processes_are_never_killed() {
        let rows = [
            top_row(1, "root", 99.0, "/init"),
            top_row(77, "shell", 98.0, "adbd"),
        ];
        let output = top_output(&rows);
        let executor = ScriptedExecutor::with_responder(move |spec| {
            if spec.program == "top" {
                return ScriptedExecutor::ok_output(&output);
            }
            ScriptedExecutor::ok_output("")
        });
        let monitor = PerformanceMonitor::new(settings(), executor.clone());

        for _ in 0..10 {
            monitor.run_cycle().await.expect("cycle");
        }

        assert_eq!(executor.calls_containing("kill"), 0);
    }

    #[tokio::test]
    async fn sample_snapshot_reflects_latest_cycle() {
        let rows = [
            top_row(4242, "u0_a101", 97.0, "com.bad.app"),
            top_row(901, "u0_a55", 1.0, "com.example.tv"),
        ];
        let output = top_output(&rows);
        let executor = ScriptedExecutor::with_responder(move |spec| {
            if spec.program == "top" {
                return ScriptedExecutor::ok_output(&output);
            }
            ScriptedExecutor::ok_output("")
        });
        let monitor = PerformanceMonitor::new(settings(), executor);

        monitor.run_cycle().await.expect("cycle");
        let sample = monitor.latest_sample().expect("sample");
        assert_eq!(sample.process_count, 2);
        assert_eq!(sample.high_cpu_processes.len(), 1);
        assert_eq!(sample.high_cpu_processes[0].pid, 4242);
    }

    #[tokio::test]
    async fn start_stop_round_trip() {
        let executor = ScriptedExecutor::with_responder(|spec| {
            if spec.program == "top" {
                return ScriptedExecutor::ok_output("");
            }
            ScriptedExecutor::ok_output("")
        });
        let monitor = PerformanceMonitor::new(settings(), executor);
        monitor.start().await;
        assert!(monitor.is_running());
        monitor.stop().await;
        assert!(!monitor.is_running());
    }
}
