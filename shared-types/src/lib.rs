//! Shared types between the hypervisor and its clients
//!
//! These types cross two boundaries:
//! - hypervisor → client connection (progress events)
//! - client connection → hypervisor (task submissions, stop, feedback)
//!
//! Serializable with serde for JSON over WebSocket/HTTP

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Core Types
// ============================================================================

/// Identifier correlating a client connection, a task record and at most
/// one sandbox slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TaskKey(pub String);

impl TaskKey {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Terminal state of an agent run. Exactly one is recorded per task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FinalState {
    Success,
    Stopped,
    MaxStepsReached,
    SandboxTimeout,
    Error,
}

impl FinalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalState::Success => "success",
            FinalState::Stopped => "stopped",
            FinalState::MaxStepsReached => "max_steps_reached",
            FinalState::SandboxTimeout => "sandbox_timeout",
            FinalState::Error => "error",
        }
    }
}

impl fmt::Display for FinalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step thumbs up/down from the user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepEvaluation {
    Like,
    Dislike,
    #[default]
    Neutral,
}

/// Whole-trace verdict from the user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserEvaluation {
    Success,
    Failed,
    #[default]
    NotEvaluated,
}

// ============================================================================
// Agent Trace
// ============================================================================

/// One desktop action emitted by the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentAction {
    pub function_name: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub description: String,
}

impl AgentAction {
    pub fn new(
        function_name: impl Into<String>,
        parameters: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let mut action = Self {
            function_name: function_name.into(),
            parameters,
            description: String::new(),
        };
        action.description = action.describe();
        action
    }

    /// Look up a parameter by name, falling back to its positional slot.
    fn arg(&self, name: &str, position: usize) -> String {
        let value = self
            .parameters
            .get(name)
            .or_else(|| self.parameters.get(&format!("arg_{position}")));
        match value {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "None".to_string(),
        }
    }

    /// Human-readable summary shown in the client timeline.
    pub fn describe(&self) -> String {
        match self.function_name.as_str() {
            "click" => format!("Click at coordinates ({}, {})", self.arg("x", 0), self.arg("y", 1)),
            "right_click" => format!(
                "Right click at coordinates ({}, {})",
                self.arg("x", 0),
                self.arg("y", 1)
            ),
            "double_click" => format!(
                "Double click at coordinates ({}, {})",
                self.arg("x", 0),
                self.arg("y", 1)
            ),
            "move_mouse" => format!(
                "Move mouse to coordinates ({}, {})",
                self.arg("x", 0),
                self.arg("y", 1)
            ),
            "write" => format!("Type text: '{}'", self.arg("text", 0)),
            "press" => format!("Press key: {}", self.arg("key", 0)),
            "go_back" => "Go back one page".to_string(),
            "drag" => format!(
                "Drag from ({}, {}) to ({}, {})",
                self.arg("x1", 0),
                self.arg("y1", 1),
                self.arg("x2", 2),
                self.arg("y2", 3)
            ),
            "scroll" => {
                let amount = match self.arg("amount", 3).as_str() {
                    "None" => "2".to_string(),
                    other => other.to_string(),
                };
                format!("Scroll {} by {}", self.arg("direction", 2), amount)
            }
            "wait" => format!("Wait for {} seconds", self.arg("seconds", 0)),
            "open_url" => format!("Open: {}", self.arg("url", 0)),
            "launch" => format!("Open: {}", self.arg("app", 0)),
            "final_answer" => format!("Final answer: {}", self.arg("answer", 0)),
            _ => "Unknown action".to_string(),
        }
    }
}

/// A completed agent step. `image` holds a `data:` URL on the wire and the
/// screenshot file name once persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStep {
    pub trace_id: TaskKey,
    /// 1-indexed, strictly increasing within a trace.
    pub step_id: u32,
    pub image: String,
    pub duration: f64,
    pub input_tokens_used: u64,
    pub output_tokens_used: u64,
    #[serde(rename = "step_evaluation", default)]
    pub step_evaluation: StepEvaluation,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub thought: Option<String>,
    #[serde(default)]
    pub actions: Vec<AgentAction>,
}

impl AgentStep {
    /// File name of this step's screenshot inside the trace directory.
    pub fn screenshot_file_name(&self) -> String {
        screenshot_file_name(&self.trace_id, self.step_id)
    }
}

pub fn screenshot_file_name(key: &TaskKey, step_id: u32) -> String {
    format!("{key}-{step_id}.png")
}

/// Aggregate metadata of an agent run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TraceMetadata {
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub input_tokens_used: u64,
    #[serde(default)]
    pub output_tokens_used: u64,
    /// Seconds.
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub number_of_steps: u32,
    #[serde(default)]
    pub max_steps: u32,
    #[serde(default)]
    pub completed: bool,
    #[serde(rename = "final_state", default)]
    pub final_state: Option<FinalState>,
    #[serde(rename = "user_evaluation", default)]
    pub user_evaluation: UserEvaluation,
}

/// A client-side view of an agent run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentTrace {
    pub id: TaskKey,
    pub timestamp: DateTime<Utc>,
    pub instruction: String,
    pub model_id: String,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub steps: Vec<AgentStep>,
    #[serde(default)]
    pub trace_metadata: TraceMetadata,
}

// ============================================================================
// Connection Events
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStartStatus {
    Success,
    MaxSandboxesReached,
}

/// Hypervisor → client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AgentStart {
        #[serde(rename = "agentTrace")]
        agent_trace: AgentTrace,
        status: AgentStartStatus,
    },
    AgentProgress {
        #[serde(rename = "agentStep")]
        agent_step: AgentStep,
        #[serde(rename = "traceMetadata")]
        trace_metadata: TraceMetadata,
    },
    AgentComplete {
        #[serde(rename = "traceMetadata")]
        trace_metadata: TraceMetadata,
        final_state: FinalState,
    },
    AgentError {
        error: String,
    },
    VncUrlSet {
        #[serde(rename = "vncUrl")]
        vnc_url: String,
    },
    VncUrlUnset,
    Heartbeat {
        uuid: String,
    },
}

impl ServerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::AgentStart { .. } => "agent_start",
            ServerEvent::AgentProgress { .. } => "agent_progress",
            ServerEvent::AgentComplete { .. } => "agent_complete",
            ServerEvent::AgentError { .. } => "agent_error",
            ServerEvent::VncUrlSet { .. } => "vnc_url_set",
            ServerEvent::VncUrlUnset => "vnc_url_unset",
            ServerEvent::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Client → hypervisor messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    UserTask {
        trace: AgentTrace,
    },
    StopTask {
        trace_id: TaskKey,
    },
    TraceEvaluation {
        #[serde(rename = "traceId")]
        trace_id: TaskKey,
        user_evaluation: UserEvaluation,
    },
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_keys_are_unique_uuids() {
        let a = TaskKey::new();
        let b = TaskKey::new();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn final_state_uses_snake_case_on_the_wire() {
        let value = serde_json::to_value(FinalState::MaxStepsReached).unwrap();
        assert_eq!(value, json!("max_steps_reached"));
        assert_eq!(FinalState::SandboxTimeout.to_string(), "sandbox_timeout");
    }

    #[test]
    fn agent_complete_event_shape() {
        let event = ServerEvent::AgentComplete {
            trace_metadata: TraceMetadata {
                trace_id: "t1".into(),
                number_of_steps: 2,
                completed: true,
                final_state: Some(FinalState::Success),
                ..Default::default()
            },
            final_state: FinalState::Success,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "agent_complete");
        assert_eq!(value["final_state"], "success");
        assert_eq!(value["traceMetadata"]["numberOfSteps"], 2);
        assert_eq!(value["traceMetadata"]["final_state"], "success");
        assert_eq!(value["traceMetadata"]["user_evaluation"], "not_evaluated");
    }

    #[test]
    fn unit_variant_events_serialize_with_type_only() {
        let value = serde_json::to_value(ServerEvent::VncUrlUnset).unwrap();
        assert_eq!(value, json!({ "type": "vnc_url_unset" }));
    }

    #[test]
    fn parses_user_task_message() {
        let raw = json!({
            "type": "user_task",
            "trace": {
                "id": "abc",
                "timestamp": "2025-01-01T00:00:00Z",
                "instruction": "open the browser",
                "modelId": "org/model",
                "isRunning": true
            }
        });
        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ClientMessage::UserTask { trace } => {
                assert_eq!(trace.id, TaskKey::from("abc"));
                assert_eq!(trace.model_id, "org/model");
                assert!(trace.steps.is_empty());
                assert_eq!(trace.trace_metadata, TraceMetadata::default());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parses_stop_and_evaluation_messages() {
        let stop: ClientMessage =
            serde_json::from_value(json!({ "type": "stop_task", "trace_id": "k1" })).unwrap();
        assert_eq!(
            stop,
            ClientMessage::StopTask {
                trace_id: TaskKey::from("k1")
            }
        );

        let eval: ClientMessage = serde_json::from_value(json!({
            "type": "trace_evaluation",
            "traceId": "k1",
            "user_evaluation": "failed"
        }))
        .unwrap();
        assert_eq!(
            eval,
            ClientMessage::TraceEvaluation {
                trace_id: TaskKey::from("k1"),
                user_evaluation: UserEvaluation::Failed,
            }
        );
    }

    #[test]
    fn action_descriptions_use_named_or_positional_args() {
        let mut params = serde_json::Map::new();
        params.insert("x".into(), json!(10));
        params.insert("arg_1".into(), json!(20));
        let click = AgentAction::new("click", params);
        assert_eq!(click.description, "Click at coordinates (10, 20)");

        let mut params = serde_json::Map::new();
        params.insert("direction".into(), json!("down"));
        let scroll = AgentAction::new("scroll", params);
        assert_eq!(scroll.description, "Scroll down by 2");

        let unknown = AgentAction::new("teleport", serde_json::Map::new());
        assert_eq!(unknown.description, "Unknown action");
    }

    #[test]
    fn step_screenshot_name_encodes_key_and_step() {
        let step = AgentStep {
            trace_id: TaskKey::from("k9"),
            step_id: 3,
            image: String::new(),
            duration: 0.5,
            input_tokens_used: 1,
            output_tokens_used: 2,
            step_evaluation: StepEvaluation::Neutral,
            error: None,
            thought: None,
            actions: vec![],
        };
        assert_eq!(step.screenshot_file_name(), "k9-3.png");
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["traceId"], "k9");
        assert_eq!(value["stepId"], 3);
        assert_eq!(value["step_evaluation"], "neutral");
    }
}
