use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::app::error::{AppError, Result};

/// Remote actions the backend understands. `Custom` passes any other command through
/// untouched, so newer server actions need no client release.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Version,
    GetPreferences { name: String },
    SetPreferences { name: String, values: Map<String, Value> },
    ClearPreferences { name: String },
    SetGpsCoordinates { latitude: f64, longitude: f64 },
    PressKey { key: String },
    PressUserActionButton { name: Option<String> },
    HideSoftKeyboard,
    Backdoor { selector: String, argument: Value },
    Custom { command: String, arguments: Vec<Value> },
}

impl Action {
    pub fn custom(command: impl Into<String>, arguments: Vec<Value>) -> Self {
        Action::Custom {
            command: command.into(),
            arguments,
        }
    }

    pub fn command(&self) -> &str {
        match self {
            Action::Version => "version",
            Action::GetPreferences { .. } => "get_preferences",
            Action::SetPreferences { .. } => "set_preferences",
            Action::ClearPreferences { .. } => "clear_preferences",
            Action::SetGpsCoordinates { .. } => "set_gps_coordinates",
            Action::PressKey { .. } => "press_key",
            Action::PressUserActionButton { .. } => "press_user_action_button",
            Action::HideSoftKeyboard => "hide_soft_keyboard",
            Action::Backdoor { .. } => "backdoor",
            Action::Custom { command, .. } => command,
        }
    }

    pub fn arguments(&self) -> Vec<Value> {
        match self {
            Action::Version | Action::HideSoftKeyboard => Vec::new(),
            Action::GetPreferences { name } | Action::ClearPreferences { name } => {
                vec![json!(name)]
            }
            Action::SetPreferences { name, values } => {
                vec![json!(name), Value::Object(values.clone())]
            }
            Action::SetGpsCoordinates {
                latitude,
                longitude,
            } => vec![json!(latitude), json!(longitude)],
            Action::PressKey { key } => vec![json!(key)],
            Action::PressUserActionButton { name } => {
                name.iter().map(|n| json!(n)).collect()
            }
            Action::Backdoor { selector, argument } => vec![json!(selector), argument.clone()],
            Action::Custom { arguments, .. } => arguments.clone(),
        }
    }

    pub fn to_request(&self) -> ActionRequest {
        ActionRequest {
            command: self.command().to_string(),
            arguments: self.arguments(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub command: String,
    pub arguments: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "bonusInformation")]
    pub bonus_information: Option<Vec<Value>>,
}

impl ActionResult {
    pub fn bonus(&self) -> &[Value] {
        self.bonus_information.as_deref().unwrap_or(&[])
    }
}

/// Parses an action response body. An empty body, a body without the `success` flag, and
/// `success: false` are all errors.
pub fn parse_action_result(action: &str, body: &str) -> Result<ActionResult> {
    if body.trim().is_empty() {
        return Err(AppError::EmptyResponse);
    }
    let result: ActionResult = serde_json::from_str(body.trim()).map_err(|err| AppError::Protocol {
        message: format!("Malformed result for action '{action}': {err}"),
        retryable: false,
    })?;
    if !result.success {
        return Err(AppError::ActionFailure {
            action: action.to_string(),
            message: result.message.clone().unwrap_or_default(),
        });
    }
    Ok(result)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    pub method_name: String,
    pub arguments: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapRequest {
    pub query: String,
    pub operation: Operation,
}

#[derive(Debug, Clone, Deserialize)]
struct MapResponse {
    outcome: String,
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    details: Option<Value>,
}

pub fn parse_map_response(query: &str, method_name: &str, body: &str) -> Result<Vec<Value>> {
    if body.trim().is_empty() {
        return Err(AppError::EmptyResponse);
    }
    let response: MapResponse = serde_json::from_str(body.trim()).map_err(|err| AppError::Protocol {
        message: format!("Malformed map response for {query}: {err}"),
        retryable: false,
    })?;
    if response.outcome != "SUCCESS" {
        let details = match response.details {
            Some(Value::String(text)) => text,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        return Err(AppError::Protocol {
            message: format!(
                "map {query}, {method_name} failed because: {}\n{details}",
                response.reason.unwrap_or_default()
            ),
            retryable: false,
        });
    }
    Ok(response.results)
}

/// Turns single-key objects (`{"setText": "hi"}`) into query operations; everything
/// else passes through.
pub fn convert_query_args(args: &[Value]) -> Vec<Value> {
    args.iter()
        .map(|arg| match arg {
            Value::Object(map) if map.len() == 1 => {
                let Some((method_name, value)) = map.iter().next() else {
                    return arg.clone();
                };
                let mut arguments = Vec::new();
                flatten_into(value, &mut arguments);
                json!({ "method_name": method_name, "arguments": arguments })
            }
            other => other.clone(),
        })
        .collect()
}

fn flatten_into(value: &Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| flatten_into(item, out)),
        other => out.push(other.clone()),
    }
}

/// Preferences arrive as bonus items, each a JSON object (or JSON-encoded string) with
/// `key` and `value`.
pub fn preferences_from_bonus(bonus: &[Value]) -> Result<Map<String, Value>> {
    let mut preferences = Map::new();
    for item in bonus {
        let entry = match item {
            Value::String(raw) => serde_json::from_str::<Value>(raw)?,
            other => other.clone(),
        };
        let key = entry
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Protocol {
                message: format!("Preference entry without key: {entry}"),
                retryable: false,
            })?;
        let value = entry.get("value").cloned().unwrap_or(Value::Null);
        preferences.insert(key.to_string(), value);
    }
    Ok(preferences)
}
