use std::fs;
use std::path::{Path, PathBuf};

use crate::app::error::{AppError, Result};

/// Host binaries the driver shells out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub adb: String,
    pub aapt: String,
    pub zipalign: String,
    pub keytool: String,
    pub jarsigner: String,
}

impl ToolPaths {
    pub fn resolve(android_home: Option<&str>, java_home: Option<&str>) -> Self {
        let android_home = android_home
            .map(normalize_command_path)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        let java_home = java_home
            .map(normalize_command_path)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let build_tools = android_home
            .as_deref()
            .and_then(|home| latest_build_tools_dir(&home.join("build-tools")));

        let adb = android_home
            .as_deref()
            .map(|home| home.join("platform-tools").join(exe("adb")))
            .filter(|path| path.is_file());
        let aapt = build_tools.as_deref().map(|dir| dir.join(exe("aapt")));
        let zipalign = build_tools
            .as_deref()
            .map(|dir| dir.join(exe("zipalign")))
            .filter(|path| path.is_file())
            .or_else(|| {
                android_home
                    .as_deref()
                    .map(|home| home.join("tools").join(exe("zipalign")))
                    .filter(|path| path.is_file())
            });
        let keytool = java_home
            .as_deref()
            .map(|home| home.join("bin").join(exe("keytool")));
        let jarsigner = java_home
            .as_deref()
            .map(|home| home.join("bin").join(exe("jarsigner")));

        Self {
            adb: path_or(adb, "adb"),
            aapt: path_or(aapt, "aapt"),
            zipalign: path_or(zipalign, "zipalign"),
            keytool: path_or(keytool, "keytool"),
            jarsigner: path_or(jarsigner, "jarsigner"),
        }
    }
}

fn exe(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

fn path_or(path: Option<PathBuf>, fallback: &str) -> String {
    path.map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| fallback.to_string())
}

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

/// Picks the highest `major.minor.patch` directory, ignoring non-numeric names such as
/// `.temp`.
pub fn latest_build_tools_dir(build_tools: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(build_tools).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            version_key(&name).map(|key| (key, entry.path()))
        })
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, path)| path)
}

fn version_key(name: &str) -> Option<Vec<u32>> {
    let numeric = name.split('-').next()?;
    let parts = numeric
        .split('.')
        .map(|part| part.parse::<u32>().ok())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

pub fn validate_tool(program: &str, name: &str) -> Result<()> {
    if program.trim().is_empty() {
        return Err(AppError::Config(format!("{name} command is empty")));
    }
    let path = Path::new(program);
    if path.components().count() <= 1 {
        // Bare command name, resolved through PATH at spawn time.
        return Ok(());
    }
    if path.is_dir() {
        return Err(AppError::Config(format!(
            "{name} path must point to an executable file"
        )));
    }
    if !path.exists() {
        return Err(AppError::Config(format!(
            "{name} executable not found at {program}"
        )));
    }
    Ok(())
}
