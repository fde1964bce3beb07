use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
}

impl DeviceSummary {
    pub fn is_online(&self) -> bool {
        self.state == "device"
    }
}

/// Identity of an application package as read from its compiled manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageIdentity {
    pub package_name: String,
    pub launchable_activity: String,
}

/// Lifecycle of a device session, in order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    PortForwarded,
    Installed,
    Launching,
    ReadinessPolling,
    VersionChecked,
    Ready,
    ShuttingDown,
    Stopped,
}
