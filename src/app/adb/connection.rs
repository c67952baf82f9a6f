use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::adb::runner::{checked_stdout, CommandExecutor, CommandSpec};
use crate::app::error::AppError;
use crate::app::models::ConnectionInfo;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const START_SERVER_TIMEOUT: Duration = Duration::from_secs(8);
const WAIT_FOR_DEVICE_TIMEOUT: Duration = Duration::from_secs(12);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
    pub serial: Option<String>,
}

impl DeviceEndpoint {
    pub fn host_port(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            serial: None,
        }
    }

    pub fn with_serial(serial: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5555,
            serial: Some(serial.into()),
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.serial.is_none() && (self.host == "127.0.0.1" || self.host == "localhost")
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The identifier used for connect/disconnect handshakes.
    pub fn target(&self) -> String {
        self.serial.clone().unwrap_or_else(|| self.address())
    }

    /// Device selector prepended to every addressed invocation. Loopback
    /// endpoints are left unselected so adb picks the local transport.
    pub fn selector_args(&self) -> Vec<String> {
        if let Some(serial) = &self.serial {
            return vec!["-s".to_string(), serial.clone()];
        }
        if self.is_loopback() {
            return Vec::new();
        }
        vec!["-s".to_string(), self.address()]
    }
}

struct ConnState {
    connected: bool,
    last_activity: Option<DateTime<Utc>>,
    // Monotonic twin of last_activity; drives the idle-expiry check.
    last_activity_at: Option<tokio::time::Instant>,
    idle_task: Option<JoinHandle<()>>,
}

struct ConnectionInner {
    endpoint: DeviceEndpoint,
    adb_program: String,
    idle_timeout: Duration,
    executor: Arc<dyn CommandExecutor>,
    state: Mutex<ConnState>,
}

/// On-demand connection manager for a single device endpoint. Connect and
/// disconnect sequences are serialized behind one lock; an idle countdown
/// task tears the link down after a period with no activity.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(
        endpoint: DeviceEndpoint,
        adb_program: impl Into<String>,
        idle_timeout: Duration,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                endpoint,
                adb_program: adb_program.into(),
                idle_timeout,
                executor,
                state: Mutex::new(ConnState {
                    connected: false,
                    last_activity: None,
                    last_activity_at: None,
                    idle_task: None,
                }),
            }),
        }
    }

    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.inner.endpoint
    }

    pub fn adb_program(&self) -> &str {
        &self.inner.adb_program
    }

    /// Full invocation for callers that need to drive the tool directly
    /// (streamed captures); the selector is already applied.
    pub fn invocation(&self, args: &[&str]) -> (String, Vec<String>) {
        let mut full = self.inner.endpoint.selector_args();
        full.extend(args.iter().map(|a| a.to_string()));
        (self.inner.adb_program.clone(), full)
    }

    pub async fn ensure_connected(&self, trace_id: &str) -> Result<(), AppError> {
        let mut state = self.inner.state.lock().await;
        if state.connected {
            self.touch_locked(&mut state);
            return Ok(());
        }
        self.negotiate(trace_id).await?;
        state.connected = true;
        self.touch_locked(&mut state);
        Ok(())
    }

    pub async fn disconnect(&self, trace_id: &str) {
        let mut state = self.inner.state.lock().await;
        if !state.connected {
            return;
        }
        self.teardown_locked(&mut state, trace_id).await;
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.connected
    }

    pub async fn connection_info(&self) -> ConnectionInfo {
        let state = self.inner.state.lock().await;
        ConnectionInfo {
            connected: state.connected,
            host: self.inner.endpoint.host.clone(),
            port: self.inner.endpoint.port,
            serial: self.inner.endpoint.serial.clone(),
            last_activity: state.last_activity.map(|t| t.to_rfc3339()),
            idle_timeout_secs: self.inner.idle_timeout.as_secs(),
        }
    }

    /// Runs an addressed command, connecting on demand. A connection-class
    /// failure triggers exactly one reconnect and one re-execution; the
    /// second failure propagates the original error with the retry error
    /// appended.
    pub async fn run_command(
        &self,
        args: &[&str],
        timeout: Duration,
        trace_id: &str,
    ) -> Result<String, AppError> {
        self.run_command_with_retry(args, timeout, true, trace_id).await
    }

    pub async fn run_command_with_retry(
        &self,
        args: &[&str],
        timeout: Duration,
        retry: bool,
        trace_id: &str,
    ) -> Result<String, AppError> {
        self.ensure_connected(trace_id).await?;
        match self.run_selected(args, timeout, trace_id).await {
            Ok(output) => {
                self.touch().await;
                Ok(output)
            }
            Err(err) if err.is_connection() && retry => {
                warn!(trace_id = %trace_id, error = %err, "connection failed, attempting reconnect");
                self.mark_disconnected().await;
                let retried: Result<String, AppError> = async {
                    self.ensure_connected(trace_id).await?;
                    self.run_selected(args, timeout, trace_id).await
                }
                .await;
                match retried {
                    Ok(output) => {
                        self.touch().await;
                        Ok(output)
                    }
                    Err(retry_err) => Err(AppError::connection(
                        format!("{}; retry failed: {}", err.error, retry_err.error),
                        trace_id,
                    )),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn run_selected(
        &self,
        args: &[&str],
        timeout: Duration,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let mut full = self.inner.endpoint.selector_args();
        full.extend(args.iter().map(|a| a.to_string()));
        let spec = CommandSpec::new(&self.inner.adb_program, full, timeout, trace_id);
        let output = self.inner.executor.execute(&spec).await?;
        checked_stdout(output, &spec)
    }

    /// Host-level invocation (no device selector): connect/disconnect,
    /// start-server.
    async fn run_host(
        &self,
        args: &[&str],
        timeout: Duration,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let spec = CommandSpec::new(
            &self.inner.adb_program,
            args.iter().map(|a| a.to_string()).collect(),
            timeout,
            trace_id,
        );
        let output = self.inner.executor.execute(&spec).await?;
        checked_stdout(output, &spec)
    }

    async fn negotiate(&self, trace_id: &str) -> Result<(), AppError> {
        let endpoint = &self.inner.endpoint;

        if let Some(serial) = endpoint.serial.clone() {
            info!(trace_id = %trace_id, serial = %serial, "using adb serial");
            // Bring the server up first to avoid concurrent startup races.
            if let Err(err) = self.run_host(&["start-server"], START_SERVER_TIMEOUT, trace_id).await {
                debug!(trace_id = %trace_id, error = %err, "adb start-server failed, ignored");
            }
            if serial.contains(':') {
                if let Err(err) = self
                    .run_host(&["connect", &serial], START_SERVER_TIMEOUT, trace_id)
                    .await
                {
                    debug!(trace_id = %trace_id, error = %err, "adb connect for serial failed, ignored");
                }
            }
            if let Err(err) = self
                .run_selected(&["wait-for-device"], WAIT_FOR_DEVICE_TIMEOUT, trace_id)
                .await
            {
                debug!(trace_id = %trace_id, error = %err, "wait-for-device not ready yet");
            }
            return Ok(());
        }

        if endpoint.is_loopback() {
            match self
                .run_selected(&["shell", "echo", "connection_test"], PROBE_TIMEOUT, trace_id)
                .await
            {
                Ok(_) => {
                    info!(trace_id = %trace_id, "loopback device available");
                    return Ok(());
                }
                Err(err) => {
                    debug!(
                        trace_id = %trace_id,
                        error = %err,
                        "loopback device not immediately available, trying explicit connect"
                    );
                }
            }
        }

        let target = endpoint.address();
        info!(trace_id = %trace_id, target = %target, "connecting to adb endpoint");
        match self.run_host(&["connect", &target], CONNECT_TIMEOUT, trace_id).await {
            Ok(output) => {
                if output.to_lowercase().contains("connected") {
                    info!(trace_id = %trace_id, target = %target, "adb connected");
                } else {
                    warn!(trace_id = %trace_id, output = %output.trim(), "adb connect returned unexpected output");
                }
            }
            Err(err) if err.is_timeout() => {
                return Err(AppError::connection(
                    format!("Connect timeout to {target}"),
                    trace_id,
                ));
            }
            Err(err) => {
                return Err(AppError::connection(
                    format!("Connect to {target} failed: {}", err.error),
                    trace_id,
                ));
            }
        }

        if let Err(err) = self
            .run_selected(&["wait-for-device"], Duration::from_secs(8), trace_id)
            .await
        {
            debug!(trace_id = %trace_id, error = %err, "wait-for-device not ready after connect");
        }
        Ok(())
    }

    async fn touch(&self) {
        let mut state = self.inner.state.lock().await;
        if state.connected {
            self.touch_locked(&mut state);
        }
    }

    /// Stamps activity and replaces the idle countdown so a stale timer can
    /// never fire against a refreshed connection.
    fn touch_locked(&self, state: &mut MutexGuard<'_, ConnState>) {
        state.last_activity = Some(Utc::now());
        state.last_activity_at = Some(tokio::time::Instant::now());
        if let Some(task) = state.idle_task.take() {
            task.abort();
        }
        if state.connected {
            let conn = self.clone();
            state.idle_task = Some(tokio::spawn(async move {
                conn.idle_countdown().await;
            }));
        }
    }

    async fn idle_countdown(self) {
        tokio::time::sleep(self.inner.idle_timeout).await;
        let mut state = self.inner.state.lock().await;
        let expired = state
            .last_activity_at
            .map(|t| t.elapsed() >= self.inner.idle_timeout)
            .unwrap_or(false);
        if state.connected && expired {
            info!(
                idle_secs = self.inner.idle_timeout.as_secs(),
                "auto-disconnecting adb after inactivity"
            );
            // Drop our own handle so teardown does not abort the running task.
            state.idle_task = None;
            self.teardown_locked(&mut state, "idle-disconnect").await;
        }
    }

    /// Drops the connected flag without a teardown handshake; used after a
    /// connection-class failure or a device reboot.
    pub(crate) async fn mark_disconnected(&self) {
        let mut state = self.inner.state.lock().await;
        state.connected = false;
        state.last_activity = None;
        state.last_activity_at = None;
        if let Some(task) = state.idle_task.take() {
            task.abort();
        }
    }

    async fn teardown_locked(&self, state: &mut MutexGuard<'_, ConnState>, trace_id: &str) {
        if let Some(task) = state.idle_task.take() {
            task.abort();
        }
        let target = self.inner.endpoint.target();
        if target.contains(':') {
            match self
                .run_host(&["disconnect", &target], DISCONNECT_TIMEOUT, trace_id)
                .await
            {
                Ok(_) => info!(trace_id = %trace_id, target = %target, "adb disconnected"),
                Err(err) => debug!(trace_id = %trace_id, error = %err, "adb disconnect failed, ignored"),
            }
        }
        state.connected = false;
        state.last_activity = None;
        state.last_activity_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testutil::ScriptedExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loopback() -> DeviceEndpoint {
        DeviceEndpoint::host_port("127.0.0.1", 5555)
    }

    #[test]
    fn selector_args_by_endpoint_kind() {
        assert!(loopback().selector_args().is_empty());
        assert_eq!(
            DeviceEndpoint::host_port("192.168.1.20", 5555).selector_args(),
            vec!["-s".to_string(), "192.168.1.20:5555".to_string()]
        );
        assert_eq!(
            DeviceEndpoint::with_serial("emulator-5554").selector_args(),
            vec!["-s".to_string(), "emulator-5554".to_string()]
        );
    }

    #[tokio::test]
    async fn run_command_connects_on_demand() {
        let executor = ScriptedExecutor::ok_for_all("ok\n");
        let conn = Connection::new(
            loopback(),
            "adb",
            Duration::from_secs(300),
            executor.clone(),
        );
        let out = conn
            .run_command(&["shell", "echo", "ok"], Duration::from_secs(5), "t1")
            .await
            .expect("command");
        assert_eq!(out, "ok\n");
        assert!(conn.is_connected().await);
        // Loopback negotiation probes with `shell echo connection_test`.
        assert_eq!(executor.calls_containing("connection_test"), 1);
    }

    #[tokio::test]
    async fn reconnect_retry_is_bounded_to_one_attempt() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&attempts);
        let executor = ScriptedExecutor::with_responder(move |spec| {
            let joined = spec.args.join(" ");
            if joined.contains("connection_test") {
                return ScriptedExecutor::ok_output("connection_test\n");
            }
            if joined.contains("dumpsys") {
                counted.fetch_add(1, Ordering::SeqCst);
                return ScriptedExecutor::failed_output("error: device offline", 1);
            }
            ScriptedExecutor::ok_output("")
        });
        let conn = Connection::new(
            loopback(),
            "adb",
            Duration::from_secs(300),
            executor.clone(),
        );

        let err = conn
            .run_command(&["shell", "dumpsys", "power"], Duration::from_secs(5), "t2")
            .await
            .expect_err("both attempts fail");
        assert!(err.is_connection());
        assert!(err.error.contains("retry failed"));
        // Exactly one retry: the failing command ran twice, no more.
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_disabled_propagates_first_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&attempts);
        let executor = ScriptedExecutor::with_responder(move |spec| {
            let joined = spec.args.join(" ");
            if joined.contains("dumpsys") {
                counted.fetch_add(1, Ordering::SeqCst);
                return ScriptedExecutor::failed_output("error: device not found", 1);
            }
            ScriptedExecutor::ok_output("")
        });
        let conn = Connection::new(
            loopback(),
            "adb",
            Duration::from_secs(300),
            executor,
        );

        let err = conn
            .run_command_with_retry(
                &["shell", "dumpsys", "power"],
                Duration::from_secs(5),
                false,
                "t3",
            )
            .await
            .expect_err("command fails");
        assert!(err.is_connection());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_disconnects_without_explicit_call() {
        let executor = ScriptedExecutor::ok_for_all("");
        let conn = Connection::new(
            loopback(),
            "adb",
            Duration::from_millis(200),
            executor,
        );
        conn.ensure_connected("t4").await.expect("connect");
        assert!(conn.is_connected().await);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!conn.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_idle_countdown() {
        let executor = ScriptedExecutor::ok_for_all("");
        let conn = Connection::new(
            loopback(),
            "adb",
            Duration::from_millis(200),
            executor,
        );
        conn.ensure_connected("t5").await.expect("connect");

        tokio::time::sleep(Duration::from_millis(150)).await;
        conn.run_command(&["shell", "echo", "hi"], Duration::from_secs(5), "t5")
            .await
            .expect("command");

        // Old countdown would have fired by now; the refreshed one has not.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(conn.is_connected().await);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let executor = ScriptedExecutor::ok_for_all("");
        let conn = Connection::new(loopback(), "adb", Duration::from_secs(300), executor);
        conn.disconnect("t6").await;
        conn.ensure_connected("t6").await.expect("connect");
        conn.disconnect("t6").await;
        conn.disconnect("t6").await;
        assert!(!conn.is_connected().await);
        let info = conn.connection_info().await;
        assert!(!info.connected);
        assert!(info.last_activity.is_none());
    }
}
