use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info};

use crate::app::adb::runner::{CommandRunner, DEFAULT_TOOL_TIMEOUT};
use crate::app::error::{AppError, Result};
use crate::app::models::PackageIdentity;

const NAME_ATTR: &str = r"name='([^']+)'";
const LAUNCHER_CATEGORY: &str =
    r#"^\s*A:\s*android:name\(\w+\)="android\.intent\.category\.LAUNCHER""#;
const INTENT_FILTER: &str = r"^\s*E:\s*intent-filter";
const ACTIVITY_ALIAS: &str = r"^\s*E:\s*activity-alias";
const TARGET_ACTIVITY: &str = r#"^\s*A:\s*android:targetActivity\(\w*\)="([^"]+)"#;

fn regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|err| AppError::ManifestParse(format!("Invalid pattern: {err}")))
}

/// Lines of `aapt dump badging` starting with `key:`.
pub fn badging_lines<'a>(badging: &'a str, key: &str) -> Vec<&'a str> {
    let prefix = format!("{key}:");
    badging
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(&prefix))
        .collect()
}

pub fn parse_package_name(badging: &str) -> Result<String> {
    let line = badging_lines(badging, "package")
        .into_iter()
        .next()
        .ok_or_else(|| AppError::ManifestParse("'package' not found in aapt output".to_string()))?;
    regex(NAME_ATTR)?
        .captures(line)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| AppError::ManifestParse(format!("Unexpected output from aapt: {line}")))
}

pub fn parse_launchable_activity(badging: &str) -> Result<String> {
    let line = badging_lines(badging, "launchable-activity")
        .into_iter()
        .next()
        .ok_or_else(|| {
            AppError::ManifestParse("'launchable-activity' not found in aapt output".to_string())
        })?;
    regex(NAME_ATTR)?
        .captures(line)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| AppError::ManifestParse(format!("Unexpected output from aapt: {line}")))
}

/// Resolves the launcher entry of an `aapt dump xmltree` manifest through its activity alias.
///
/// Exactly one LAUNCHER category line must exist. From that line the scan walks upward:
/// first until the enclosing `intent-filter` element, then on to the alias'
/// `targetActivity` attribute. Reaching the `activity-alias` element before any
/// `targetActivity` means the alias target cannot be determined.
pub fn resolve_activity_from_xmltree(xmltree: &str) -> Result<String> {
    let launcher = regex(LAUNCHER_CATEGORY)?;
    let intent_filter = regex(INTENT_FILTER)?;
    let activity_alias = regex(ACTIVITY_ALIAS)?;
    let target_activity = regex(TARGET_ACTIVITY)?;
    let lines: Vec<&str> = xmltree.lines().map(str::trim).collect();

    let mut launcher_line = None;
    for (index, line) in lines.iter().enumerate() {
        if launcher.is_match(line) {
            if launcher_line.is_some() {
                return Err(AppError::ManifestParse(
                    "More than one launchable activity in AndroidManifest".to_string(),
                ));
            }
            launcher_line = Some(index);
        }
    }
    let launcher_line = launcher_line.ok_or_else(|| {
        AppError::ManifestParse("No launchable activity found in AndroidManifest".to_string())
    })?;

    let mut saw_intent_filter = false;
    for line in lines[..=launcher_line].iter().rev() {
        if !saw_intent_filter {
            if intent_filter.is_match(line) {
                debug!("read intent filter");
                saw_intent_filter = true;
            }
            continue;
        }
        if activity_alias.is_match(line) {
            return Err(AppError::ManifestParse(
                "Could not find target activity in activity alias".to_string(),
            ));
        }
        if let Some(caps) = target_activity.captures(line) {
            return Ok(caps[1].to_string());
        }
    }

    Err(AppError::ManifestParse(
        "Could not find launchable activity".to_string(),
    ))
}

/// Reads package metadata through `aapt`.
#[derive(Clone)]
pub struct ManifestResolver {
    aapt: String,
    runner: Arc<dyn CommandRunner>,
}

impl ManifestResolver {
    pub fn new(aapt: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            aapt: aapt.into(),
            runner,
        }
    }

    fn aapt(&self, args: &[&str], apk: &Path) -> Result<String> {
        let mut full: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        full.push(apk.to_string_lossy().to_string());
        let output = self.runner.run(&self.aapt, &full, DEFAULT_TOOL_TIMEOUT)?;
        Ok(output.stdout)
    }

    pub fn package_name(&self, apk: &Path) -> Result<String> {
        let badging = self.aapt(&["dump", "badging"], apk)?;
        parse_package_name(&badging)
    }

    pub fn launchable_activity(&self, apk: &Path) -> Result<String> {
        let badging = self.aapt(&["dump", "badging"], apk)?;
        match parse_launchable_activity(&badging) {
            Ok(activity) => {
                info!(activity = %activity, "found launchable activity");
                Ok(activity)
            }
            Err(err) => {
                info!(error = %err, "no launchable activity in badging, scanning raw manifest");
                let mut args: Vec<String> = vec!["dump".into(), "xmltree".into()];
                args.push(apk.to_string_lossy().to_string());
                args.push("AndroidManifest.xml".into());
                let output = self.runner.run(&self.aapt, &args, DEFAULT_TOOL_TIMEOUT)?;
                let activity = resolve_activity_from_xmltree(&output.stdout)?;
                info!(activity = %activity, "found launchable activity through alias");
                Ok(activity)
            }
        }
    }

    pub fn identity(&self, apk: &Path) -> Result<PackageIdentity> {
        Ok(PackageIdentity {
            package_name: self.package_name(apk)?,
            launchable_activity: self.launchable_activity(apk)?,
        })
    }
}

#[cfg(test)]
mod tests;
