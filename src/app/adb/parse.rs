use regex::Regex;
use serde_json::Value;

use crate::app::models::DeviceSummary;

pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let mut model = None;
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    model = Some(value.to_string());
                }
            }
            Some(DeviceSummary {
                serial: tokens[0].to_string(),
                state: tokens[1].to_string(),
                model,
            })
        })
        .collect()
}

/// Package names from `pm list packages`, with the `package:` prefix removed.
pub fn parse_pm_list_packages(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|line| line.strip_prefix("package:").unwrap_or(line))
        .map(|entry| match entry.rsplit_once('=') {
            // `pm list packages -f` form: package:/data/app/.../base.apk=com.example
            Some((_, pkg)) => pkg.trim().to_string(),
            None => entry.to_string(),
        })
        .filter(|pkg| !pkg.is_empty())
        .collect()
}

/// The keyguard is up when the focused window line names it.
pub fn keyguard_showing(dumpsys_window: &str) -> bool {
    dumpsys_window
        .lines()
        .any(|line| line.contains("mCurrentFocus") && line.contains("Keyguard"))
}

pub fn parse_focused_activity(dumpsys_window: &str) -> Option<String> {
    let re = Regex::new(r"mFocusedApp.+[./]([^.\s/}]+)").ok()?;
    dumpsys_window
        .lines()
        .find_map(|line| re.captures(line).map(|caps| caps[1].to_string()))
}

/// First JSON object logged under `tag` in `logcat -v tag` output. Lines from any other
/// tag are ignored even when they carry JSON.
pub fn find_tagged_json(logcat: &str, tag: &str) -> Option<Value> {
    let re = Regex::new(r"^[VDIWEFS]/(.+?)\s*(?:\(\s*\d+\))?\s*: (.*)$").ok()?;
    logcat
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| {
            let caps = re.captures(line)?;
            if caps[1].trim() != tag {
                return None;
            }
            serde_json::from_str::<Value>(caps[2].trim()).ok()
        })
        .find(|value| value.is_object())
}
