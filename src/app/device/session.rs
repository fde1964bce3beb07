use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::adb::bridge::{default_serial, AdbBridge};
use crate::app::adb::locator::ToolPaths;
use crate::app::adb::runner::{CommandRunner, SystemRunner};
use crate::app::apk::manifest::ManifestResolver;
use crate::app::config::{DriverConfig, Timings};
use crate::app::device::{poll_until, RunGuard};
use crate::app::error::{AppError, Result, TransportKind};
use crate::app::models::SessionState;
use crate::app::ports::PortRegistry;
use crate::app::protocol::action::{
    convert_query_args, parse_action_result, parse_map_response, MapRequest, Operation,
};
use crate::app::protocol::{Action, ActionResult, HttpClient, RequestOptions, Transport};

pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) const BACKEND_PACKAGE: &str = "sh.calaba.instrumentationbackend";
const MAIN_ACTION: &str = "android.intent.action.MAIN";
const DEFAULT_SCREENSHOT_NAME: &str = "screenshot";

/// Everything a session needs, resolved up front. Tests build this directly with scripted
/// runner and transport fakes.
pub struct DeviceParts {
    pub serial: String,
    pub server_port: u16,
    pub test_server_port: u16,
    pub app_path: Option<PathBuf>,
    pub test_server_path: Option<PathBuf>,
    pub screenshot_prefix: String,
    pub endpoint: String,
    pub client_version: String,
    pub tools: ToolPaths,
    pub timings: Timings,
    pub runner: Arc<dyn CommandRunner>,
    pub transport: Box<dyn Transport>,
    pub run_guard: RunGuard,
}

/// One device under test and the instrumentation server running on it.
pub struct Device {
    pub(crate) trace_id: String,
    pub(crate) server_port: u16,
    pub(crate) test_server_port: u16,
    pub(crate) app_path: Option<PathBuf>,
    pub(crate) test_server_path: Option<PathBuf>,
    screenshot_prefix: String,
    screenshot_count: u32,
    endpoint: String,
    client_version: String,
    pub(crate) timings: Timings,
    pub(crate) bridge: AdbBridge,
    manifest: ManifestResolver,
    transport: Box<dyn Transport>,
    pub(crate) run_guard: RunGuard,
    pub(crate) state: SessionState,
    package_names: HashMap<PathBuf, String>,
    activities: HashMap<PathBuf, String>,
}

impl Device {
    pub fn from_parts(parts: DeviceParts) -> Self {
        let bridge = AdbBridge::new(parts.tools.adb.clone(), parts.serial, parts.runner.clone());
        let manifest = ManifestResolver::new(parts.tools.aapt.clone(), parts.runner);
        Self {
            trace_id: Uuid::new_v4().to_string(),
            server_port: parts.server_port,
            test_server_port: parts.test_server_port,
            app_path: parts.app_path,
            test_server_path: parts.test_server_path,
            screenshot_prefix: parts.screenshot_prefix,
            screenshot_count: 0,
            endpoint: parts.endpoint,
            client_version: parts.client_version,
            timings: parts.timings,
            bridge,
            manifest,
            transport: parts.transport,
            run_guard: parts.run_guard,
            state: SessionState::Uninitialized,
            package_names: HashMap::new(),
            activities: HashMap::new(),
        }
    }

    /// Resolves serial and local port from `config`, then forwards the port.
    pub fn connect(config: &DriverConfig, run_guard: RunGuard) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let serial = match &config.serial {
            Some(serial) => serial.clone(),
            None => default_serial(&config.tools.adb, runner.as_ref())?,
        };
        let server_port = match config.server_port {
            Some(port) => port,
            None => PortRegistry::new(&config.ports_file).port_for(&serial)?,
        };
        let client = HttpClient::for_port(server_port, config.endpoint.as_deref(), config.debug_http);
        let endpoint = client.base_url().to_string();

        let mut device = Self::from_parts(DeviceParts {
            serial,
            server_port,
            test_server_port: config.test_server_port,
            app_path: config.app_path.clone(),
            test_server_path: config.test_server_path.clone(),
            screenshot_prefix: config.screenshot_prefix.clone(),
            endpoint,
            client_version: CLIENT_VERSION.to_string(),
            tools: config.tools.clone(),
            timings: config.timings.clone(),
            runner,
            transport: Box::new(client),
            run_guard,
        });
        device.forward_port()?;
        Ok(device)
    }

    pub fn serial(&self) -> &str {
        self.bridge.serial()
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    pub fn run_guard(&self) -> &RunGuard {
        &self.run_guard
    }

    pub(crate) fn ensure_not_aborted(&self) -> Result<()> {
        if self.run_guard.is_aborted() {
            return Err(AppError::RunAborted);
        }
        Ok(())
    }

    pub fn forward_port(&mut self) -> Result<()> {
        info!(
            trace_id = %self.trace_id,
            serial = %self.serial(),
            local = self.server_port,
            remote = self.test_server_port,
            "forwarding test server port"
        );
        self.bridge
            .forward(self.server_port, self.test_server_port)
            .map_err(|err| AppError::tool(format!("Port forward failed: {err}")))?;
        self.state = SessionState::PortForwarded;
        Ok(())
    }

    pub fn app_path(&self) -> Result<PathBuf> {
        self.app_path
            .clone()
            .ok_or_else(|| AppError::Config("APP_PATH is not set".to_string()))
    }

    pub fn test_server_path(&self) -> Result<PathBuf> {
        self.test_server_path
            .clone()
            .ok_or_else(|| AppError::Config("TEST_APP_PATH is not set".to_string()))
    }

    pub fn package_name(&mut self, apk: &Path) -> Result<String> {
        if let Some(name) = self.package_names.get(apk) {
            return Ok(name.clone());
        }
        let name = self.manifest.package_name(apk)?;
        self.package_names.insert(apk.to_path_buf(), name.clone());
        Ok(name)
    }

    pub fn main_activity(&mut self, apk: &Path) -> Result<String> {
        if let Some(activity) = self.activities.get(apk) {
            return Ok(activity.clone());
        }
        let activity = self.manifest.launchable_activity(apk)?;
        self.activities.insert(apk.to_path_buf(), activity.clone());
        Ok(activity)
    }

    pub(crate) fn test_server_package(&mut self) -> Result<String> {
        let path = self.test_server_path()?;
        self.package_name(&path)
    }

    pub(crate) fn app_package(&mut self) -> Result<String> {
        let path = self.app_path()?;
        self.package_name(&path)
    }

    /// Raw POST to the test server. Failures drop the pooled connection inside the
    /// transport; connection failures also get a hint in the log.
    pub fn send(&mut self, path: &str, body: &Value, options: &RequestOptions) -> Result<Vec<u8>> {
        self.transport.post(path, body, options).map_err(|err| {
            if err.is_connection_failure() {
                warn!(
                    trace_id = %self.trace_id,
                    path,
                    error = %err,
                    "It looks like your app is no longer running"
                );
            }
            err
        })
    }

    pub fn http(&mut self, path: &str, body: &Value, options: &RequestOptions) -> Result<String> {
        let raw = self.send(path, body, options)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    pub fn ping(&mut self) -> Result<String> {
        self.http("/ping", &json!({}), &RequestOptions::default())
    }

    pub fn is_app_running(&mut self) -> bool {
        matches!(self.ping(), Ok(body) if body.trim() == "pong")
    }

    pub fn wake_up(&mut self) -> Result<()> {
        let component = format!("{}/{BACKEND_PACKAGE}.WakeUp", self.test_server_package()?);
        info!(trace_id = %self.trace_id, serial = %self.serial(), "waking up device");
        self.bridge
            .start_activity(MAIN_ACTION, &component)
            .map_err(|err| AppError::tool(format!("Could not wake up the device: {err}")))?;

        let bridge = &self.bridge;
        let cleared = poll_until(self.timings.unlock_attempts, self.timings.unlock_interval, |attempt| {
            match bridge.is_keyguard_showing() {
                Ok(showing) => {
                    debug!(attempt, showing, "keyguard check");
                    !showing
                }
                Err(err) => {
                    debug!(attempt, error = %err, "keyguard check failed");
                    false
                }
            }
        });
        if cleared.is_none() {
            return Err(AppError::LockScreen);
        }
        Ok(())
    }

    pub fn current_activity(&self) -> Result<Option<String>> {
        self.bridge.current_activity()
    }

    /// Launches the instrumentation server and blocks until it is ready and its version
    /// matches the client. Any failure here aborts the run.
    pub fn start_test_server(&mut self, overrides: &[(String, String)]) -> Result<()> {
        self.ensure_not_aborted()?;
        let result = self.launch(overrides);
        if let Err(err) = &result {
            warn!(
                trace_id = %self.trace_id,
                serial = %self.serial(),
                code = err.code(),
                error = %err,
                "test server failed to start, aborting run"
            );
            self.run_guard.abort();
        }
        result
    }

    fn launch(&mut self, overrides: &[(String, String)]) -> Result<()> {
        let app_path = self.app_path()?;
        let target_package = self.package_name(&app_path)?;
        let main_activity = self.main_activity(&app_path)?;
        let test_package = self.test_server_package()?;

        self.state = SessionState::Launching;
        if self.bridge.is_keyguard_showing()? {
            info!(trace_id = %self.trace_id, "lock screen detected");
            self.wake_up()?;
        }

        let extras = instrumentation_extras(
            &target_package,
            &main_activity,
            self.test_server_port,
            overrides,
        );
        let component = format!("{test_package}/{BACKEND_PACKAGE}.CalabashInstrumentationTestRunner");
        info!(
            trace_id = %self.trace_id,
            serial = %self.serial(),
            component = %component,
            "starting test server"
        );
        self.bridge
            .instrument(&extras, &component, false)
            .map_err(|err| AppError::tool(format!("Could not execute command to start test server: {err}")))?;

        self.state = SessionState::ReadinessPolling;
        self.wait_for_app()?;
        self.wait_for_ready()?;
        self.verify_server_version()?;
        self.state = SessionState::Ready;
        Ok(())
    }

    fn wait_for_app(&mut self) -> Result<()> {
        let attempts = self.timings.liveness_attempts;
        let interval = self.timings.liveness_interval;
        match poll_until(attempts, interval, |_| self.is_app_running()) {
            Some(attempt) => {
                debug!(trace_id = %self.trace_id, attempt, "app is running");
                Ok(())
            }
            None => Err(AppError::AppNotStarted),
        }
    }

    fn wait_for_ready(&mut self) -> Result<()> {
        let attempts = self.timings.ready_attempts;
        let interval = self.timings.ready_interval;
        let options = RequestOptions::with_read_timeout(self.timings.ready_read_timeout);
        let trace_id = self.trace_id.clone();
        let ready = poll_until(attempts, interval, |attempt| {
            match self.http("/ready", &json!({}), &options) {
                Ok(body) if body.trim() == "true" => true,
                Ok(body) => {
                    debug!(trace_id = %trace_id, attempt, body = %body, "instrumentation backend not yet ready");
                    false
                }
                Err(err) => {
                    debug!(trace_id = %trace_id, attempt, error = %err, "instrumentation backend not reachable");
                    false
                }
            }
        });
        match ready {
            Some(attempt) => {
                info!(trace_id = %self.trace_id, attempt, "instrumentation backend is ready");
                Ok(())
            }
            None => Err(AppError::ReadinessTimeout {
                endpoint: self.endpoint.clone(),
            }),
        }
    }

    fn verify_server_version(&mut self) -> Result<()> {
        let server = self
            .server_version()
            .map_err(|err| AppError::VersionUnavailable {
                reason: err.to_string(),
            })?;
        check_versions(&self.client_version, &server)?;
        info!(
            trace_id = %self.trace_id,
            client = %self.client_version,
            server = %server,
            "client and server versions match"
        );
        self.state = SessionState::VersionChecked;
        Ok(())
    }

    pub fn server_version(&mut self) -> Result<String> {
        let result = self.perform_action(&Action::Version)?;
        result.message.ok_or_else(|| AppError::Protocol {
            message: "Version result carried no message".to_string(),
            retryable: false,
        })
    }

    /// Dispatches one action. The whole exchange is bounded by the action deadline.
    pub fn perform_action(&mut self, action: &Action) -> Result<ActionResult> {
        self.ensure_not_aborted()?;
        let request = action.to_request();
        let body = serde_json::to_value(&request)?;
        let deadline = self.timings.action_deadline;
        debug!(trace_id = %self.trace_id, action = %request.command, "perform action");

        let started = Instant::now();
        let raw = match self.send("/", &body, &RequestOptions::with_read_timeout(deadline)) {
            Ok(raw) => raw,
            Err(AppError::Transport {
                kind: TransportKind::Timeout,
                ..
            }) if started.elapsed() >= deadline => {
                return Err(AppError::ActionTimeout {
                    action: request.command,
                    deadline,
                })
            }
            Err(err) => return Err(err),
        };
        parse_action_result(&request.command, &String::from_utf8_lossy(&raw))
    }

    pub fn map(&mut self, query: &str, method_name: &str, arguments: Vec<Value>) -> Result<Vec<Value>> {
        self.ensure_not_aborted()?;
        let request = MapRequest {
            query: query.to_string(),
            operation: Operation {
                method_name: method_name.to_string(),
                arguments,
            },
        };
        let body = serde_json::to_value(&request)?;
        let raw = self.send("/map", &body, &RequestOptions::default())?;
        parse_map_response(query, method_name, &String::from_utf8_lossy(&raw))
    }

    pub fn query(&mut self, uiquery: &str, arguments: &[Value]) -> Result<Vec<Value>> {
        self.map(uiquery, "query", convert_query_args(arguments))
    }

    pub fn set_gps_coordinates(&mut self, latitude: f64, longitude: f64) -> Result<()> {
        self.perform_action(&Action::SetGpsCoordinates {
            latitude,
            longitude,
        })?;
        Ok(())
    }

    pub fn press_key(&mut self, key: &str) -> Result<()> {
        self.perform_action(&Action::PressKey {
            key: key.to_string(),
        })?;
        Ok(())
    }

    pub fn hide_soft_keyboard(&mut self) -> Result<()> {
        self.perform_action(&Action::HideSoftKeyboard)?;
        Ok(())
    }

    /// Calls an app-defined backdoor method; its return value is the first bonus item.
    pub fn backdoor(&mut self, selector: &str, argument: Value) -> Result<Value> {
        let result = self.perform_action(&Action::Backdoor {
            selector: selector.to_string(),
            argument,
        })?;
        Ok(result.bonus().first().cloned().unwrap_or(Value::Null))
    }

    /// Saves a screenshot to `<prefix><name>_<n>.png`, `n` counting per session.
    pub fn screenshot(&mut self, prefix: Option<&str>, name: Option<&str>) -> Result<PathBuf> {
        let prefix = prefix.unwrap_or(&self.screenshot_prefix).to_string();
        let name = match name {
            Some(name) if name.to_ascii_lowercase().ends_with(".png") => &name[..name.len() - 4],
            Some(name) => name,
            None => DEFAULT_SCREENSHOT_NAME,
        };
        let path = PathBuf::from(format!("{prefix}{name}_{}.png", self.screenshot_count));

        let image = self.send("/screenshot", &json!({}), &RequestOptions::default()).map_err(|err| {
            match err {
                AppError::Transport {
                    kind: TransportKind::EndOfStream,
                    message,
                } => AppError::transport(
                    TransportKind::EndOfStream,
                    format!("Could not take screenshot. App is most likely not running anymore. {message}"),
                ),
                other => other,
            }
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, image)?;
        self.screenshot_count += 1;
        info!(trace_id = %self.trace_id, path = %path.display(), "screenshot saved");
        Ok(path)
    }

    /// Best-effort stop. Any failure while asking the server to exit counts as stopped.
    pub fn shutdown_test_server(&mut self) {
        self.state = SessionState::ShuttingDown;
        match self.http("/kill", &json!({}), &RequestOptions::default()) {
            Ok(body) => debug!(trace_id = %self.trace_id, body = %body, "kill requested"),
            Err(err) => info!(
                trace_id = %self.trace_id,
                error = %err,
                "Server not responding. Moving on."
            ),
        }

        // Every ping is bounded by what is left of the wait, so a hung server cannot
        // stretch it.
        let wait_until = Instant::now() + self.timings.shutdown_wait;
        loop {
            let remaining = wait_until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    trace_id = %self.trace_id,
                    waited_ms = self.timings.shutdown_wait.as_millis() as u64,
                    "Could not kill app"
                );
                break;
            }
            let options = RequestOptions {
                connect_timeout: Some(remaining),
                read_timeout: Some(remaining),
                ..RequestOptions::default()
            };
            if !matches!(self.http("/ping", &json!({}), &options), Ok(body) if body.trim() == "pong") {
                break;
            }
            let remaining = wait_until.saturating_duration_since(Instant::now());
            thread::sleep(self.timings.shutdown_poll.min(remaining));
        }
        self.state = SessionState::Stopped;
    }
}

/// Instrumentation extras for the server runner. Caller overrides replace defaults with
/// the same key and are appended otherwise.
pub fn instrumentation_extras(
    target_package: &str,
    main_activity: &str,
    test_server_port: u16,
    overrides: &[(String, String)],
) -> Vec<(String, String)> {
    let mut extras = vec![
        ("target_package".to_string(), target_package.to_string()),
        ("main_activity".to_string(), main_activity.to_string()),
        ("test_server_port".to_string(), test_server_port.to_string()),
        ("class".to_string(), format!("{BACKEND_PACKAGE}.InstrumentationBackend")),
    ];
    for (key, value) in overrides {
        match extras.iter_mut().find(|(existing, _)| existing == key) {
            Some(slot) => slot.1 = value.clone(),
            None => extras.push((key.clone(), value.clone())),
        }
    }
    extras
}

pub fn check_versions(client: &str, server: &str) -> Result<()> {
    if client != server {
        return Err(AppError::VersionMismatch {
            client: client.to_string(),
            server: server.to_string(),
        });
    }
    Ok(())
}
