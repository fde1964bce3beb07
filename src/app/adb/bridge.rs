use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::app::adb::parse::{
    keyguard_showing, parse_adb_devices, parse_focused_activity, parse_pm_list_packages,
};
use crate::app::adb::runner::{CommandOutput, CommandRunner, DEFAULT_TOOL_TIMEOUT};
use crate::app::error::{AppError, Result};
use crate::app::models::DeviceSummary;

const INSTALL_TIMEOUT: Duration = Duration::from_secs(180);

/// `adb` bound to one device serial.
#[derive(Clone)]
pub struct AdbBridge {
    adb: String,
    serial: String,
    runner: Arc<dyn CommandRunner>,
}

impl AdbBridge {
    pub fn new(adb: impl Into<String>, serial: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            adb: adb.into(),
            serial: serial.into(),
            runner,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    fn args<I, S>(&self, rest: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = vec!["-s".to_string(), self.serial.clone()];
        args.extend(rest.into_iter().map(Into::into));
        args
    }

    fn run(&self, args: Vec<String>, timeout: Duration) -> Result<CommandOutput> {
        let output = self.runner.run(&self.adb, &args, timeout)?;
        debug!(serial = %self.serial, exit_code = ?output.exit_code, "adb {}", args[2..].join(" "));
        Ok(output)
    }

    fn run_checked(&self, args: Vec<String>, timeout: Duration) -> Result<CommandOutput> {
        self.runner.run_checked(&self.adb, &args, timeout)
    }

    pub fn forward(&self, local_port: u16, remote_port: u16) -> Result<()> {
        self.run_checked(
            self.args([
                "forward".to_string(),
                format!("tcp:{local_port}"),
                format!("tcp:{remote_port}"),
            ]),
            DEFAULT_TOOL_TIMEOUT,
        )?;
        Ok(())
    }

    pub fn install(&self, apk_path: &str, replace: bool) -> Result<CommandOutput> {
        let mut rest = vec!["install".to_string()];
        if replace {
            rest.push("-r".to_string());
        }
        rest.push(apk_path.to_string());
        self.run(self.args(rest), INSTALL_TIMEOUT)
    }

    pub fn uninstall(&self, package: &str) -> Result<CommandOutput> {
        self.run(self.args(["uninstall", package]), DEFAULT_TOOL_TIMEOUT)
    }

    pub fn shell<I, S>(&self, command: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut rest = vec!["shell".to_string()];
        rest.extend(command.into_iter().map(Into::into));
        self.run(self.args(rest), DEFAULT_TOOL_TIMEOUT)
    }

    pub fn list_packages(&self) -> Result<Vec<String>> {
        let output = self.shell(["pm", "list", "packages"])?;
        Ok(parse_pm_list_packages(&output.stdout))
    }

    pub fn is_keyguard_showing(&self) -> Result<bool> {
        let output = self.shell(["dumpsys", "window", "windows"])?;
        Ok(keyguard_showing(&output.stdout))
    }

    pub fn current_activity(&self) -> Result<Option<String>> {
        let output = self.shell(["dumpsys", "window", "windows"])?;
        Ok(parse_focused_activity(&output.stdout))
    }

    /// `am instrument` with `-e key value` extras. `wait` blocks until the instrumentation
    /// finishes.
    pub fn instrument(
        &self,
        extras: &[(String, String)],
        component: &str,
        wait: bool,
    ) -> Result<CommandOutput> {
        let mut command = vec!["am".to_string(), "instrument".to_string()];
        if wait {
            command.push("-w".to_string());
        }
        for (key, value) in extras {
            command.push("-e".to_string());
            command.push(shell_quote(key));
            command.push(shell_quote(value));
        }
        command.push(component.to_string());
        let mut rest = vec!["shell".to_string()];
        rest.extend(command);
        self.run_checked(self.args(rest), DEFAULT_TOOL_TIMEOUT)
    }

    pub fn start_activity(&self, action: &str, component: &str) -> Result<CommandOutput> {
        self.run_checked(
            self.args(["shell", "am", "start", "-a", action, "-n", component]),
            DEFAULT_TOOL_TIMEOUT,
        )
    }

    pub fn pull(&self, remote: &str, local: &str) -> Result<()> {
        self.run_checked(self.args(["pull", remote, local]), INSTALL_TIMEOUT)
            .map_err(|err| AppError::tool(format!("Could not pull {remote} to {local}: {err}")))?;
        Ok(())
    }

    pub fn push(&self, local: &str, remote: &str) -> Result<()> {
        self.run_checked(self.args(["push", local, remote]), INSTALL_TIMEOUT)
            .map_err(|err| AppError::tool(format!("Could not push {local} to {remote}: {err}")))?;
        Ok(())
    }

    /// Already-flushed log buffer for one tag, in `tag` format.
    pub fn logcat_dump(&self, tag: &str) -> Result<String> {
        let output = self.run_checked(
            self.args([
                "logcat".to_string(),
                "-d".to_string(),
                "-v".to_string(),
                "tag".to_string(),
                format!("{tag}:*"),
                "*:S".to_string(),
            ]),
            DEFAULT_TOOL_TIMEOUT,
        )?;
        Ok(output.stdout)
    }
}

pub fn connected_devices(adb: &str, runner: &dyn CommandRunner) -> Result<Vec<DeviceSummary>> {
    let output = runner.run_checked(adb, &["devices".to_string(), "-l".to_string()], DEFAULT_TOOL_TIMEOUT)?;
    Ok(parse_adb_devices(&output.stdout))
}

/// The single attached device, when no serial was configured.
pub fn default_serial(adb: &str, runner: &dyn CommandRunner) -> Result<String> {
    let attached = connected_devices(adb, runner)?;
    let devices: Vec<DeviceSummary> = attached.iter().filter(|d| d.is_online()).cloned().collect();
    debug!(attached = attached.len(), online = devices.len(), "connected devices");
    match devices.as_slice() {
        [] if !attached.is_empty() => Err(AppError::Config(format!(
            "No usable device. Attached: {}",
            attached
                .iter()
                .map(|d| format!("{} ({})", d.serial, d.state))
                .collect::<Vec<_>>()
                .join(", ")
        ))),
        [] => Err(AppError::Config("No connected devices".to_string())),
        [only] => Ok(only.serial.clone()),
        _ => Err(AppError::Config(
            "More than one device connected. Specify device serial using ADB_DEVICE_ARG"
                .to_string(),
        )),
    }
}

/// Quotes a value for the device-side shell that `adb shell` hands its arguments to.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-/:=,@".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}
