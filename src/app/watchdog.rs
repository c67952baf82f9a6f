use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::adb::controller::{new_trace_id, AdbController};
use crate::app::config::WatchdogSettings;
use crate::app::error::AppError;
use crate::app::models::{AppHealth, WatchdogStatus, WatchdogTargetStatus};

const STOP_SETTLE: Duration = Duration::from_secs(2);
const LAUNCH_VERIFY_DELAY: Duration = Duration::from_secs(5);
const PS_TIMEOUT: Duration = Duration::from_secs(10);

/// A process counts as the package only on an exact command-name match or a
/// `:package` suffix; bare substring hits are unrelated processes sharing a
/// prefix.
pub fn process_matches_package(process_name: &str, package: &str) -> bool {
    process_name == package || process_name.ends_with(&format!(":{package}"))
}

/// Scans `ps -A` output for the package's process.
pub fn package_running(ps_output: &str, package: &str) -> bool {
    for line in ps_output.lines() {
        if !line.contains(package) {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 9 {
            continue;
        }
        if process_matches_package(parts[8], package) {
            return true;
        }
    }
    false
}

/// Restart is suppressed while the previous restart is inside the cooldown
/// window.
pub fn within_cooldown(
    last_restart: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: chrono::Duration,
) -> bool {
    matches!(last_restart, Some(t) if now.signed_duration_since(t) < cooldown)
}

#[derive(Debug, Clone, Default)]
struct TargetState {
    restart_count: u32,
    last_restart: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

struct WatchdogInner {
    running: AtomicBool,
    targets: Mutex<HashMap<String, TargetState>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Keeps the configured packages alive: liveness check each cycle, bounded
/// restart attempts with cooldown, and a post-restart verification.
#[derive(Clone)]
pub struct AppWatchdog {
    controller: AdbController,
    settings: WatchdogSettings,
    inner: Arc<WatchdogInner>,
}

impl AppWatchdog {
    pub fn new(controller: AdbController, settings: WatchdogSettings) -> Self {
        let targets = settings
            .packages
            .iter()
            .map(|package| (package.clone(), TargetState::default()))
            .collect();
        Self {
            controller,
            settings,
            inner: Arc::new(WatchdogInner {
                running: AtomicBool::new(false),
                targets: Mutex::new(targets),
                task: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn primary_package(&self) -> Option<&str> {
        self.settings.packages.first().map(|p| p.as_str())
    }

    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("app watchdog is already running");
            return;
        }
        info!(
            interval_secs = self.settings.check_interval_secs,
            packages = ?self.settings.packages,
            "starting app watchdog"
        );
        let watchdog = self.clone();
        let handle = tokio::spawn(async move {
            watchdog.run_loop().await;
        });
        *self.inner.task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping app watchdog");
        if let Some(handle) = self.inner.task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn run_loop(&self) {
        let interval = Duration::from_secs(self.settings.check_interval_secs);
        // Cycle errors shorten the next delay instead of killing the loop.
        let error_delay = (interval / 5)
            .min(Duration::from_secs(60))
            .max(Duration::from_secs(1));
        while self.inner.running.load(Ordering::SeqCst) {
            match self.run_cycle().await {
                Ok(()) => tokio::time::sleep(interval).await,
                Err(err) => {
                    error!(error = %err, "watchdog cycle failed");
                    tokio::time::sleep(error_delay).await;
                }
            }
        }
    }

    pub(crate) async fn run_cycle(&self) -> Result<(), AppError> {
        for package in self.settings.packages.clone() {
            if let Err(err) = self.check_package(&package).await {
                error!(package = %package, error = %err, "watchdog check failed");
            }
        }
        Ok(())
    }

    async fn check_package(&self, package: &str) -> Result<(), AppError> {
        if self.check_app_running(package).await {
            let mut targets = self.inner.targets.lock().expect("targets poisoned");
            if let Some(state) = targets.get_mut(package) {
                if state.consecutive_failures > 0 {
                    debug!(package = %package, "package is running again, resetting failure count");
                    state.consecutive_failures = 0;
                }
            }
            return Ok(());
        }

        warn!(package = %package, "package is not running");

        let last_restart = self
            .inner
            .targets
            .lock()
            .expect("targets poisoned")
            .get(package)
            .and_then(|state| state.last_restart);
        let cooldown = chrono::Duration::seconds(self.settings.cooldown_secs as i64);
        if within_cooldown(last_restart, Utc::now(), cooldown) {
            warn!(
                package = %package,
                "package was restarted recently, skipping restart attempt"
            );
            return Ok(());
        }

        let mut restarted = false;
        for attempt in 0..self.settings.restart_attempts {
            if attempt > 0 {
                info!(
                    package = %package,
                    attempt = attempt + 1,
                    attempts = self.settings.restart_attempts,
                    "retrying restart"
                );
                tokio::time::sleep(Duration::from_secs(self.settings.restart_delay_secs)).await;
            }
            if self.restart_app(package).await {
                restarted = true;
                break;
            }
        }

        if restarted {
            // A successful launch command is not proof the app came up.
            tokio::time::sleep(LAUNCH_VERIFY_DELAY).await;
            if self.check_app_running(package).await {
                info!(package = %package, "package restarted and verified running");
            } else {
                warn!(
                    package = %package,
                    "restart command succeeded but package not detected running"
                );
            }
        } else {
            let mut targets = self.inner.targets.lock().expect("targets poisoned");
            let state = targets.entry(package.to_string()).or_default();
            state.consecutive_failures += 1;
            error!(
                package = %package,
                attempts = self.settings.restart_attempts,
                consecutive_failures = state.consecutive_failures,
                "failed to restart package"
            );
        }
        Ok(())
    }

    pub async fn check_app_running(&self, package: &str) -> bool {
        let trace_id = new_trace_id();
        match self
            .controller
            .connection()
            .run_command(&["shell", "ps", "-A"], PS_TIMEOUT, &trace_id)
            .await
        {
            Ok(output) => package_running(&output, package),
            Err(err) => {
                // Assume not running so a restart attempt gets queued.
                warn!(package = %package, error = %err, "liveness check failed");
                false
            }
        }
    }

    async fn restart_app(&self, package: &str) -> bool {
        info!(package = %package, "attempting app restart");
        let trace_id = new_trace_id();

        if let Err(err) = self.controller.stop_app_traced(package, &trace_id).await {
            debug!(package = %package, error = %err, "force-stop failed, continuing");
        }
        tokio::time::sleep(STOP_SETTLE).await;

        match self.controller.launch_app_traced(package, &trace_id).await {
            Ok(()) => {
                let mut targets = self.inner.targets.lock().expect("targets poisoned");
                let state = targets.entry(package.to_string()).or_default();
                state.restart_count += 1;
                state.last_restart = Some(Utc::now());
                state.consecutive_failures = 0;
                info!(package = %package, "restart command issued");
                true
            }
            Err(err) => {
                error!(package = %package, error = %err, "failed to launch package");
                false
            }
        }
    }

    pub async fn manual_restart(&self, package: &str) -> Result<bool, AppError> {
        if !self.settings.packages.iter().any(|p| p == package) {
            return Err(AppError::unsupported(
                format!("package {package} is not a watchdog target"),
                new_trace_id(),
            ));
        }
        info!(package = %package, "manual restart requested");
        Ok(self.restart_app(package).await)
    }

    pub fn status(&self) -> WatchdogStatus {
        let targets = self.inner.targets.lock().expect("targets poisoned");
        WatchdogStatus {
            monitoring: self.is_running(),
            check_interval_secs: self.settings.check_interval_secs,
            restart_attempts: self.settings.restart_attempts,
            restart_delay_secs: self.settings.restart_delay_secs,
            targets: targets
                .iter()
                .map(|(package, state)| {
                    (
                        package.clone(),
                        WatchdogTargetStatus {
                            restart_count: state.restart_count,
                            last_restart: state.last_restart.map(|t| t.to_rfc3339()),
                            consecutive_failures: state.consecutive_failures,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Health detail for one package: liveness plus, when running, the
    /// foreground flag and memory footprint.
    pub async fn health(&self, package: &str) -> AppHealth {
        let is_running = self.check_app_running(package).await;

        let mut is_foreground = None;
        let mut memory_pss_kb = None;
        if is_running {
            if let Ok(top) = self.controller.top_app().await {
                is_foreground = Some(top.package.as_deref() == Some(package));
            }
            let trace_id = new_trace_id();
            if let Ok(output) = self
                .controller
                .connection()
                .run_command(
                    &["shell", "dumpsys", "meminfo", package],
                    PS_TIMEOUT,
                    &trace_id,
                )
                .await
            {
                memory_pss_kb = crate::app::adb::parse::parse_total_pss_kb(&output);
            }
        }

        let (restart_count, last_restart, consecutive_failures) = {
            let targets = self.inner.targets.lock().expect("targets poisoned");
            targets
                .get(package)
                .map(|state| {
                    (
                        state.restart_count,
                        state.last_restart.map(|t| t.to_rfc3339()),
                        state.consecutive_failures,
                    )
                })
                .unwrap_or((0, None, 0))
        };

        AppHealth {
            package: package.to_string(),
            is_running,
            is_foreground,
            memory_pss_kb,
            restart_count,
            last_restart,
            consecutive_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::connection::{Connection, DeviceEndpoint};
    use crate::app::testutil::ScriptedExecutor;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    const PACKAGE: &str = "com.example.hub";

    fn ps_line(name: &str) -> String {
        format!("u0_a120 4242 812 1234567 98765 0 0 S {name}\n")
    }

    fn watchdog_with(
        executor: Arc<ScriptedExecutor>,
        settings: WatchdogSettings,
    ) -> AppWatchdog {
        let connection = Connection::new(
            DeviceEndpoint::host_port("127.0.0.1", 5555),
            "adb",
            Duration::from_secs(300),
            executor,
        );
        let controller = AdbController::new(connection, false, false);
        AppWatchdog::new(controller, settings)
    }

    fn settings() -> WatchdogSettings {
        WatchdogSettings {
            enabled: true,
            packages: vec![PACKAGE.to_string()],
            check_interval_secs: 300,
            restart_attempts: 3,
            restart_delay_secs: 10,
            cooldown_secs: 120,
        }
    }

    #[test]
    fn exact_and_suffix_matches_only() {
        assert!(process_matches_package(PACKAGE, PACKAGE));
        assert!(process_matches_package(&format!("remote:{PACKAGE}"), PACKAGE));
        // A shared prefix is not the same app.
        assert!(!process_matches_package("com.example.hub2", PACKAGE));
        assert!(!process_matches_package("com.example", PACKAGE));
    }

    #[test]
    fn package_running_rejects_substring_hits() {
        let output = format!(
            "USER PID PPID VSZ RSS WCHAN ADDR S NAME\n{}{}",
            ps_line("com.example.hub2"),
            ps_line("com.other.app")
        );
        assert!(!package_running(&output, PACKAGE));

        let output = format!(
            "USER PID PPID VSZ RSS WCHAN ADDR S NAME\n{}",
            ps_line(PACKAGE)
        );
        assert!(package_running(&output, PACKAGE));
    }

    #[test]
    fn cooldown_window_suppresses_restart() {
        let now = Utc::now();
        let cooldown = chrono::Duration::seconds(120);
        assert!(within_cooldown(
            Some(now - chrono::Duration::seconds(30)),
            now,
            cooldown
        ));
        assert!(!within_cooldown(
            Some(now - chrono::Duration::seconds(180)),
            now,
            cooldown
        ));
        assert!(!within_cooldown(None, now, cooldown));
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_missing_package_and_verifies() {
        // The package shows up in ps only after the launch command ran.
        let launched = Arc::new(StdAtomicBool::new(false));
        let launched_flag = Arc::clone(&launched);
        let executor = ScriptedExecutor::with_responder(move |spec| {
            let joined = spec.args.join(" ");
            if joined.contains("ps -A") {
                if launched_flag.load(Ordering::SeqCst) {
                    return ScriptedExecutor::ok_output(&format!(
                        "USER PID PPID VSZ RSS WCHAN ADDR S NAME\n{}",
                        ps_line(PACKAGE)
                    ));
                }
                return ScriptedExecutor::ok_output(
                    "USER PID PPID VSZ RSS WCHAN ADDR S NAME\n",
                );
            }
            if joined.contains("monkey") {
                launched_flag.store(true, Ordering::SeqCst);
            }
            ScriptedExecutor::ok_output("")
        });
        let watchdog = watchdog_with(executor.clone(), settings());

        watchdog.run_cycle().await.expect("cycle");

        assert_eq!(executor.calls_containing("am force-stop"), 1);
        assert_eq!(executor.calls_containing("monkey -p com.example.hub"), 1);
        let status = watchdog.status();
        let target = status.targets.get(PACKAGE).expect("target");
        assert_eq!(target.restart_count, 1);
        assert_eq!(target.consecutive_failures, 0);
        assert!(target.last_restart.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn recent_restart_suppresses_new_attempt() {
        let executor = ScriptedExecutor::with_responder(|spec| {
            let joined = spec.args.join(" ");
            if joined.contains("ps -A") {
                // Never running.
                return ScriptedExecutor::ok_output(
                    "USER PID PPID VSZ RSS WCHAN ADDR S NAME\n",
                );
            }
            ScriptedExecutor::ok_output("")
        });
        let watchdog = watchdog_with(executor.clone(), settings());

        // Seeds last_restart = now.
        watchdog.manual_restart(PACKAGE).await.expect("manual restart");
        assert_eq!(executor.calls_containing("monkey"), 1);

        // Within the 120s cooldown: the cycle must not launch again.
        watchdog.run_cycle().await.expect("cycle");
        assert_eq!(executor.calls_containing("monkey"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_restart_attempts_are_bounded_and_counted() {
        let executor = ScriptedExecutor::with_responder(|spec| {
            let joined = spec.args.join(" ");
            if joined.contains("ps -A") {
                return ScriptedExecutor::ok_output(
                    "USER PID PPID VSZ RSS WCHAN ADDR S NAME\n",
                );
            }
            if joined.contains("monkey") {
                return ScriptedExecutor::failed_output("monkey aborted", 1);
            }
            ScriptedExecutor::ok_output("")
        });
        let watchdog = watchdog_with(executor.clone(), settings());

        watchdog.run_cycle().await.expect("cycle");

        assert_eq!(executor.calls_containing("monkey"), 3);
        let status = watchdog.status();
        assert_eq!(
            status.targets.get(PACKAGE).expect("target").consecutive_failures,
            1
        );
    }

    #[tokio::test]
    async fn running_package_resets_failure_count() {
        let executor = ScriptedExecutor::with_responder(|spec| {
            let joined = spec.args.join(" ");
            if joined.contains("ps -A") {
                return ScriptedExecutor::ok_output(&format!(
                    "USER PID PPID VSZ RSS WCHAN ADDR S NAME\n{}",
                    ps_line(PACKAGE)
                ));
            }
            ScriptedExecutor::ok_output("")
        });
        let watchdog = watchdog_with(executor, settings());
        {
            let mut targets = watchdog.inner.targets.lock().expect("targets");
            targets.get_mut(PACKAGE).expect("target").consecutive_failures = 2;
        }

        watchdog.run_cycle().await.expect("cycle");
        assert_eq!(
            watchdog
                .status()
                .targets
                .get(PACKAGE)
                .expect("target")
                .consecutive_failures,
            0
        );
    }

    #[tokio::test]
    async fn manual_restart_rejects_unknown_package() {
        let executor = ScriptedExecutor::ok_for_all("");
        let watchdog = watchdog_with(executor, settings());
        let err = watchdog
            .manual_restart("com.not.watched")
            .await
            .expect_err("unknown package");
        assert_eq!(err.code, crate::app::error::ERR_UNSUPPORTED);
    }
}
