use std::path::Path;

use tracing::{info, warn};

use crate::app::device::session::BACKEND_PACKAGE;
use crate::app::device::Device;
use crate::app::error::{AppError, Result};
use crate::app::models::SessionState;

impl Device {
    /// Installs `apk` and confirms the package is listed afterwards. Any failure on the
    /// way aborts the whole run.
    pub fn install_app(&mut self, apk: &Path) -> Result<()> {
        let package = self.package_name(apk)?;
        info!(trace_id = %self.trace_id, serial = %self.serial(), package = %package, "installing");
        let outcome = self.bridge.install(&apk.to_string_lossy(), false).and_then(|output| {
            let installed = self.bridge.list_packages()?;
            Ok((output, installed.iter().any(|candidate| candidate == &package)))
        });
        match outcome {
            Ok((_, true)) => {
                self.mark_installed();
                Ok(())
            }
            Ok((output, false)) => Err(self.installation_failed(package, output.last_line())),
            Err(err) => Err(self.installation_failed(package, err.to_string())),
        }
    }

    /// `install -r` over an existing installation; the tool has to report `Success`.
    pub fn update_app(&mut self, apk: &Path) -> Result<()> {
        let package = self.package_name(apk)?;
        info!(trace_id = %self.trace_id, serial = %self.serial(), package = %package, "updating");
        match self.bridge.install(&apk.to_string_lossy(), true) {
            Ok(output) if output.stdout.contains("Success") || output.stderr.contains("Success") => {
                self.mark_installed();
                Ok(())
            }
            Ok(output) => Err(self.installation_failed(package, output.last_line())),
            Err(err) => Err(self.installation_failed(package, err.to_string())),
        }
    }

    fn installation_failed(&self, package: String, reason: String) -> AppError {
        warn!(trace_id = %self.trace_id, package = %package, reason = %reason, "installation failed");
        self.run_guard.abort();
        AppError::Installation { package, reason }
    }

    pub fn uninstall_app(&mut self, package: &str) -> Result<()> {
        let output = self.bridge.uninstall(package)?;
        info!(
            trace_id = %self.trace_id,
            serial = %self.serial(),
            package,
            result = %output.last_line(),
            "uninstalled"
        );
        Ok(())
    }

    /// Removes the test server first, then the app.
    pub fn uninstall_apps(&mut self) -> Result<()> {
        let test_package = self.test_server_package()?;
        let app_package = self.app_package()?;
        self.uninstall_app(&test_package)?;
        self.uninstall_app(&app_package)
    }

    pub fn reinstall_test_server(&mut self) -> Result<()> {
        let test_server = self.test_server_path()?;
        let test_package = self.package_name(&test_server)?;
        self.uninstall_app(&test_package)?;
        self.install_app(&test_server)
    }

    pub fn reinstall_apps(&mut self) -> Result<()> {
        let app = self.app_path()?;
        let app_package = self.package_name(&app)?;
        self.uninstall_app(&app_package)?;
        self.install_app(&app)?;
        self.reinstall_test_server()
    }

    /// Wipes the app's data through the server's one-shot instrumentation.
    pub fn clear_app_data(&mut self) -> Result<()> {
        let component = format!("{}/{BACKEND_PACKAGE}.ClearAppData", self.test_server_package()?);
        self.bridge
            .instrument(&[], &component, true)
            .map_err(|err| AppError::tool(format!("Could not clear data: {err}")))?;
        Ok(())
    }

    pub fn pull(&self, remote: &str, local: &str) -> Result<()> {
        self.bridge.pull(remote, local)
    }

    pub fn push(&self, local: &str, remote: &str) -> Result<()> {
        self.bridge.push(local, remote)
    }

    fn mark_installed(&mut self) {
        if self.state < SessionState::Installed {
            self.state = SessionState::Installed;
        }
    }
}
