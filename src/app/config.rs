use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::adb::locator::ToolPaths;
use crate::app::error::{AppError, Result};

pub const DEFAULT_TEST_SERVER_PORT: u16 = 7102;
pub const SETTINGS_FILE_NAME: &str = ".calabash_settings";

/// Retry budgets and intervals for the session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    pub unlock_attempts: u32,
    pub unlock_interval: Duration,
    pub liveness_attempts: u32,
    pub liveness_interval: Duration,
    pub ready_attempts: u32,
    pub ready_interval: Duration,
    pub ready_read_timeout: Duration,
    pub shutdown_wait: Duration,
    pub shutdown_poll: Duration,
    pub action_deadline: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            unlock_attempts: 10,
            unlock_interval: Duration::from_secs(1),
            liveness_attempts: 10,
            liveness_interval: Duration::from_secs(1),
            ready_attempts: 10,
            ready_interval: Duration::from_secs(3),
            ready_read_timeout: Duration::from_secs(1),
            shutdown_wait: Duration::from_secs(3),
            shutdown_poll: Duration::from_millis(300),
            action_deadline: Duration::from_secs(300),
        }
    }
}

impl Timings {
    /// Same attempt budgets, no waiting. Used by tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            unlock_interval: Duration::ZERO,
            liveness_interval: Duration::ZERO,
            ready_interval: Duration::ZERO,
            shutdown_poll: Duration::ZERO,
            shutdown_wait: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub serial: Option<String>,
    pub server_port: Option<u16>,
    pub test_server_port: u16,
    pub app_path: Option<PathBuf>,
    pub test_server_path: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub screenshot_prefix: String,
    pub debug_http: bool,
    pub verbose: bool,
    pub ports_file: PathBuf,
    pub settings_file: PathBuf,
    pub tools: ToolPaths,
    pub timings: Timings,
}

impl DriverConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let server_port = match get("TEST_SERVER_PORT") {
            Some(raw) => Some(parse_port(&raw, "TEST_SERVER_PORT")?),
            None => None,
        };

        let ports_file = get("CALABASH_SERVER_PORTS")
            .map(|raw| expand_home(&raw))
            .unwrap_or_else(|| home_dir().join(".calabash.yaml"));

        Ok(Self {
            serial: get("ADB_DEVICE_ARG"),
            server_port,
            test_server_port: DEFAULT_TEST_SERVER_PORT,
            app_path: get("APP_PATH").map(|raw| expand_home(&raw)),
            test_server_path: get("TEST_APP_PATH").map(|raw| expand_home(&raw)),
            endpoint: get("DEVICE_ENDPOINT"),
            screenshot_prefix: get("SCREENSHOT_PATH").unwrap_or_default(),
            debug_http: is_flag_on(get("DEBUG_HTTP").as_deref()),
            verbose: is_flag_on(get("VERBOSE").as_deref()),
            ports_file,
            settings_file: PathBuf::from(SETTINGS_FILE_NAME),
            tools: ToolPaths::resolve(get("ANDROID_HOME").as_deref(), get("JAVA_HOME").as_deref()),
            timings: Timings::default(),
        })
    }

    pub fn require_app_path(&self) -> Result<&Path> {
        self.app_path
            .as_deref()
            .ok_or_else(|| AppError::Config("APP_PATH is not set".to_string()))
    }

    pub fn require_test_server_path(&self) -> Result<&Path> {
        self.test_server_path
            .as_deref()
            .ok_or_else(|| AppError::Config("TEST_APP_PATH is not set".to_string()))
    }
}

fn parse_port(raw: &str, field: &str) -> Result<u16> {
    match raw.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(AppError::Config(format!("{field} must be a TCP port, got '{raw}'"))),
    }
}

fn is_flag_on(value: Option<&str>) -> bool {
    matches!(value, Some(v) if v != "0" && !v.eq_ignore_ascii_case("false"))
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        return home_dir().join(rest);
    }
    PathBuf::from(path)
}

/// Signing identity settings, read from the JSON settings file in the working directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeystoreSettings {
    #[serde(default)]
    pub keystore_location: Option<String>,
    #[serde(default)]
    pub keystore_password: Option<String>,
    #[serde(default)]
    pub keystore_alias: Option<String>,
    #[serde(default)]
    pub keystore_alias_password: Option<String>,
}

pub fn load_keystore_settings(path: &Path) -> Result<Option<KeystoreSettings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::Config(format!("Failed to read {}: {err}", path.display())))?;
    let settings: KeystoreSettings = serde_json::from_str(&raw)
        .map_err(|err| AppError::Config(format!("Failed to parse {}: {err}", path.display())))?;
    Ok(Some(normalize_keystore_settings(settings)))
}

fn normalize_keystore_settings(settings: KeystoreSettings) -> KeystoreSettings {
    let clean = |value: Option<String>| value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    KeystoreSettings {
        keystore_location: clean(settings.keystore_location),
        keystore_password: clean(settings.keystore_password),
        keystore_alias: clean(settings.keystore_alias),
        keystore_alias_password: clean(settings.keystore_alias_password),
    }
}
