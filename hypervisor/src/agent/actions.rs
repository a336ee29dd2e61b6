//! Translate structured agent actions into desktop commands (xdotool).

use std::time::Duration;

use shared_types::AgentAction;
use tracing::{debug, warn};

use super::StepError;
use crate::error::SandboxError;
use crate::sandbox::SandboxHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum DesktopCommand {
    Shell(String),
    Wait(Duration),
    /// Nothing to run on the desktop, e.g. `final_answer`.
    Noop,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ActionError {
    #[error("Action {action} is missing argument '{name}'")]
    MissingArgument { action: String, name: String },

    #[error("Action {action} has invalid argument '{name}': {value}")]
    InvalidArgument {
        action: String,
        name: String,
        value: String,
    },

    #[error("Unsupported action: {0}")]
    Unsupported(String),
}

pub fn command_for(action: &AgentAction) -> Result<DesktopCommand, ActionError> {
    let cmd = match action.function_name.as_str() {
        "click" => {
            let (x, y) = (int_arg(action, "x", 0)?, int_arg(action, "y", 1)?);
            format!("xdotool mousemove --sync {x} {y} click 1")
        }
        "right_click" => {
            let (x, y) = (int_arg(action, "x", 0)?, int_arg(action, "y", 1)?);
            format!("xdotool mousemove --sync {x} {y} click 3")
        }
        "double_click" => {
            let (x, y) = (int_arg(action, "x", 0)?, int_arg(action, "y", 1)?);
            format!("xdotool mousemove --sync {x} {y} click --repeat 2 1")
        }
        "move_mouse" => {
            let (x, y) = (int_arg(action, "x", 0)?, int_arg(action, "y", 1)?);
            format!("xdotool mousemove --sync {x} {y}")
        }
        "write" => {
            let text = str_arg(action, "text", 0)?;
            format!("xdotool type --delay 75 -- {}", shell_quote(&text))
        }
        "press" => {
            let combo = key_combo(action)?;
            format!("xdotool key -- {}", shell_quote(&combo))
        }
        "go_back" => "xdotool key alt+Left".to_string(),
        "drag" => {
            let x1 = int_arg(action, "x1", 0)?;
            let y1 = int_arg(action, "y1", 1)?;
            let x2 = int_arg(action, "x2", 2)?;
            let y2 = int_arg(action, "y2", 3)?;
            format!(
                "xdotool mousemove --sync {x1} {y1} mousedown 1 mousemove --sync {x2} {y2} mouseup 1"
            )
        }
        "scroll" => {
            let (x, y) = (int_arg(action, "x", 0)?, int_arg(action, "y", 1)?);
            let direction = opt_arg(action, "direction", 2).unwrap_or_else(|| "down".to_string());
            let amount = match opt_arg(action, "amount", 3) {
                Some(raw) => parse_int(action, "amount", &raw)?,
                None => 2,
            };
            let button = match direction.as_str() {
                "up" => 4,
                "down" => 5,
                "left" => 6,
                "right" => 7,
                other => {
                    return Err(ActionError::InvalidArgument {
                        action: action.function_name.clone(),
                        name: "direction".into(),
                        value: other.into(),
                    })
                }
            };
            format!("xdotool mousemove --sync {x} {y} click --repeat {amount} {button}")
        }
        "wait" => {
            let raw = str_arg(action, "seconds", 0)?;
            let seconds = raw
                .parse::<f64>()
                .ok()
                .filter(|s| s.is_finite())
                .ok_or_else(|| ActionError::InvalidArgument {
                    action: action.function_name.clone(),
                    name: "seconds".into(),
                    value: raw.clone(),
                })?;
            return Ok(DesktopCommand::Wait(Duration::from_secs_f64(seconds.clamp(0.0, 60.0))));
        }
        "open_url" => {
            let url = str_arg(action, "url", 0)?;
            format!("xdg-open {} >/dev/null 2>&1 &", shell_quote(&url))
        }
        "launch" => {
            let app = str_arg(action, "app", 0)?;
            format!("nohup {} >/dev/null 2>&1 &", shell_quote(&app))
        }
        "final_answer" => return Ok(DesktopCommand::Noop),
        other => return Err(ActionError::Unsupported(other.to_string())),
    };
    Ok(DesktopCommand::Shell(cmd))
}

/// Run `actions` in order on the desktop. The first action that fails stops
/// the sequence and its message is returned as the step's error; only an
/// unresponsive sandbox fails the step itself.
pub async fn execute(
    sandbox: &dyn SandboxHandle,
    actions: &[AgentAction],
) -> Result<Option<String>, StepError> {
    for action in actions {
        let command = match command_for(action) {
            Ok(command) => command,
            Err(e) => {
                warn!(sandbox_id = sandbox.id(), action = %action.function_name, "rejected action: {e}");
                return Ok(Some(e.to_string()));
            }
        };
        match command {
            DesktopCommand::Shell(cmd) => {
                debug!(sandbox_id = sandbox.id(), %cmd, "running desktop action");
                match sandbox.run_command(&cmd).await {
                    Ok(()) => {}
                    Err(SandboxError::Timeout(msg)) => return Err(StepError::SandboxTimeout(msg)),
                    Err(e) => {
                        warn!(sandbox_id = sandbox.id(), action = %action.function_name, "action failed: {e}");
                        return Ok(Some(e.to_string()));
                    }
                }
            }
            DesktopCommand::Wait(duration) => tokio::time::sleep(duration).await,
            DesktopCommand::Noop => {}
        }
    }
    Ok(None)
}

fn opt_arg(action: &AgentAction, name: &str, position: usize) -> Option<String> {
    let value = action
        .parameters
        .get(name)
        .or_else(|| action.parameters.get(&format!("arg_{position}")))?;
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn str_arg(action: &AgentAction, name: &str, position: usize) -> Result<String, ActionError> {
    opt_arg(action, name, position).ok_or_else(|| ActionError::MissingArgument {
        action: action.function_name.clone(),
        name: name.to_string(),
    })
}

fn int_arg(action: &AgentAction, name: &str, position: usize) -> Result<i64, ActionError> {
    let raw = str_arg(action, name, position)?;
    parse_int(action, name, &raw)
}

fn parse_int(action: &AgentAction, name: &str, raw: &str) -> Result<i64, ActionError> {
    raw.trim()
        .parse::<f64>()
        .map(|v| v.round() as i64)
        .map_err(|_| ActionError::InvalidArgument {
            action: action.function_name.clone(),
            name: name.to_string(),
            value: raw.to_string(),
        })
}

/// `press` accepts a list of keys pressed together or a single key.
fn key_combo(action: &AgentAction) -> Result<String, ActionError> {
    let value = action
        .parameters
        .get("keys")
        .or_else(|| action.parameters.get("key"))
        .or_else(|| action.parameters.get("arg_0"))
        .ok_or_else(|| ActionError::MissingArgument {
            action: action.function_name.clone(),
            name: "keys".into(),
        })?;
    let keys: Vec<String> = match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(xdotool_key))
            .collect(),
        serde_json::Value::String(s) => vec![xdotool_key(s)],
        other => vec![xdotool_key(&other.to_string())],
    };
    if keys.is_empty() {
        return Err(ActionError::MissingArgument {
            action: action.function_name.clone(),
            name: "keys".into(),
        });
    }
    Ok(keys.join("+"))
}

fn xdotool_key(key: &str) -> String {
    match key.to_ascii_lowercase().as_str() {
        "enter" | "return" => "Return".into(),
        "esc" | "escape" => "Escape".into(),
        "tab" => "Tab".into(),
        "backspace" => "BackSpace".into(),
        "delete" | "del" => "Delete".into(),
        "space" => "space".into(),
        "up" => "Up".into(),
        "down" => "Down".into(),
        "left" => "Left".into(),
        "right" => "Right".into(),
        "pageup" => "Page_Up".into(),
        "pagedown" => "Page_Down".into(),
        "home" => "Home".into(),
        "end" => "End".into(),
        "ctrl" | "control" => "ctrl".into(),
        "cmd" | "super" | "win" => "super".into(),
        _ => key.to_string(),
    }
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r#"'\''"#))
}
