//! Persistent serial -> local port allocation shared by concurrent test runs.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::app::error::{AppError, Result};

pub const FIRST_SERVER_PORT: u16 = 34777;

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
struct PortState {
    #[serde(default)]
    server_ports: BTreeMap<String, u16>,
    #[serde(flatten)]
    other: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone)]
pub struct PortRegistry {
    path: PathBuf,
}

impl PortRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the port recorded for `serial`, allocating and persisting the lowest free one
    /// when the serial is unseen. The whole read-modify-write runs under an exclusive lock.
    pub fn port_for(&self, serial: &str) -> Result<u16> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| AppError::Config(format!("Failed to create {}: {err}", parent.display())))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|err| AppError::Config(format!("Failed to open {}: {err}", self.path.display())))?;
        file.lock_exclusive()
            .map_err(|err| AppError::Config(format!("Failed to lock {}: {err}", self.path.display())))?;

        let mut raw = String::new();
        file.read_to_string(&mut raw)?;
        let mut state: PortState = if raw.trim().is_empty() {
            PortState::default()
        } else {
            serde_yaml::from_str(&raw)
                .map_err(|err| AppError::Config(format!("Failed to parse {}: {err}", self.path.display())))?
        };

        if let Some(port) = state.server_ports.get(serial) {
            return Ok(*port);
        }

        let port = lowest_free_port(&state.server_ports)?;
        state.server_ports.insert(serial.to_string(), port);

        let payload = serde_yaml::to_string(&state)
            .map_err(|err| AppError::Config(format!("Failed to serialize port state: {err}")))?;
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;

        info!(serial = %serial, port, "persistently allocated port");
        Ok(port)
    }
}

fn lowest_free_port(ports: &BTreeMap<String, u16>) -> Result<u16> {
    let mut port = FIRST_SERVER_PORT;
    while ports.values().any(|used| *used == port) {
        port = port
            .checked_add(1)
            .ok_or_else(|| AppError::Config("No free local port left to allocate".to_string()))?;
    }
    Ok(port)
}
