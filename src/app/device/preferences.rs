use chrono::Utc;
use rand::Rng;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::app::adb::parse::find_tagged_json;
use crate::app::device::session::BACKEND_PACKAGE;
use crate::app::device::Device;
use crate::app::error::{AppError, Result};
use crate::app::protocol::action::preferences_from_bonus;
use crate::app::protocol::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreferencesOp {
    Get,
    Set,
    Clear,
}

impl PreferencesOp {
    fn verb(self) -> &'static str {
        match self {
            PreferencesOp::Get => "get",
            PreferencesOp::Set => "set",
            PreferencesOp::Clear => "clear",
        }
    }

    fn instrumentation(self) -> &'static str {
        match self {
            PreferencesOp::Get => "GetPreferences",
            PreferencesOp::Set => "SetPreferences",
            PreferencesOp::Clear => "ClearPreferences",
        }
    }
}

/// Fresh log tag for one out-of-band instrumentation call.
pub fn correlation_tag() -> String {
    let random: u32 = rand::thread_rng().gen_range(0..=10_000);
    format!("{}_{random}", Utc::now().timestamp())
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

impl Device {
    /// Shared preferences of the app under test. Goes through the running server when
    /// there is one, otherwise through a one-shot instrumentation reporting via logcat.
    pub fn get_preferences(&mut self, name: &str) -> Result<Map<String, Value>> {
        let bonus = if self.is_app_running() {
            self.perform_action(&Action::GetPreferences {
                name: name.to_string(),
            })?
            .bonus()
            .to_vec()
        } else {
            let reply = self.preferences_via_instrumentation(PreferencesOp::Get, name, &Map::new())?;
            match reply.get("bonusInformation") {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            }
        };
        preferences_from_bonus(&bonus)
    }

    pub fn set_preferences(&mut self, name: &str, values: &Map<String, Value>) -> Result<()> {
        if self.is_app_running() {
            self.perform_action(&Action::SetPreferences {
                name: name.to_string(),
                values: values.clone(),
            })?;
        } else {
            self.preferences_via_instrumentation(PreferencesOp::Set, name, values)?;
        }
        Ok(())
    }

    pub fn clear_preferences(&mut self, name: &str) -> Result<()> {
        if self.is_app_running() {
            self.perform_action(&Action::ClearPreferences {
                name: name.to_string(),
            })?;
        } else {
            self.preferences_via_instrumentation(PreferencesOp::Clear, name, &Map::new())?;
        }
        Ok(())
    }

    /// Runs the instrumentation to completion, then reads the flushed log once and takes
    /// the first JSON reply logged under this call's own tag.
    fn preferences_via_instrumentation(
        &mut self,
        op: PreferencesOp,
        name: &str,
        values: &Map<String, Value>,
    ) -> Result<Value> {
        let failed = || AppError::Preferences {
            operation: op.verb().to_string(),
            name: name.to_string(),
        };
        let tag = correlation_tag();
        let component = format!(
            "{}/{BACKEND_PACKAGE}.{}",
            self.test_server_package()?,
            op.instrumentation()
        );
        let mut extras = vec![
            ("logcat".to_string(), tag.clone()),
            ("name".to_string(), name.to_string()),
        ];
        extras.extend(values.iter().map(|(key, value)| (key.clone(), render_value(value))));

        info!(
            trace_id = %self.trace_id,
            operation = op.verb(),
            name,
            tag = %tag,
            "app not running, using preferences instrumentation"
        );
        self.bridge.instrument(&extras, &component, true).map_err(|err| {
            debug!(error = %err, "preferences instrumentation failed");
            failed()
        })?;

        let logcat = self.bridge.logcat_dump(&tag)?;
        let reply = find_tagged_json(&logcat, &tag).ok_or_else(failed)?;
        if reply.get("success").and_then(Value::as_bool) != Some(true) {
            return Err(failed());
        }
        Ok(reply)
    }
}
