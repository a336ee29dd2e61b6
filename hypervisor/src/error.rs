use shared_types::{FinalState, TaskKey};

use crate::agent::StepError;

/// Failures reported by the remote provisioning service.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Sandbox unresponsive: {0}")]
    Timeout(String),

    #[error("Sandbox command failed: {0}")]
    Command(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by orchestrator operations to the connection layer.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task capacity reached ({limit} live tasks)")]
    CapacityExceeded { limit: usize },

    #[error("Task already running for key {0}")]
    DuplicateTask(TaskKey),

    #[error("No session bound to key {0}")]
    UnknownSession(TaskKey),

    #[error("Key {0} is bound to a different connection")]
    ConnectionMismatch(TaskKey),

    #[error("Trace not found: {0}")]
    NotFound(TaskKey),

    #[error("Invalid step: {0}")]
    InvalidStep(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Connection layer send failures. Never fatal to a task.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Send failed: {0}")]
    Send(String),
}

/// Per-candidate archival failures. Never fatal to the sweep.
#[derive(Debug, thiserror::Error)]
pub enum ArchivalError {
    #[error("Compression failed: {0}")]
    Compress(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Verification failed: {0}")]
    Verify(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a run stopped cooperatively at a step boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The completed flag was set by a stop request or a closed connection.
    Requested,
    StepLimit,
}

/// How an execution loop ended short of success. Each variant maps to
/// exactly one terminal state.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Cooperative stop: {0:?}")]
    CooperativeStop(StopReason),

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Sandbox unresponsive: {0}")]
    ExternalTimeout(String),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl RunError {
    pub fn final_state(&self) -> FinalState {
        match self {
            RunError::CooperativeStop(StopReason::Requested) => FinalState::Stopped,
            RunError::CooperativeStop(StopReason::StepLimit) => FinalState::MaxStepsReached,
            RunError::ExternalTimeout(_) => FinalState::SandboxTimeout,
            RunError::Provisioning(_) | RunError::Unexpected(_) => FinalState::Error,
        }
    }
}

impl From<SandboxError> for RunError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::Timeout(msg) => RunError::ExternalTimeout(msg),
            other => RunError::Unexpected(anyhow::Error::new(other)),
        }
    }
}

impl From<StepError> for RunError {
    fn from(e: StepError) -> Self {
        match e {
            StepError::StepLimitExceeded => RunError::CooperativeStop(StopReason::StepLimit),
            StepError::SandboxTimeout(msg) => RunError::ExternalTimeout(msg),
            StepError::Failed(msg) => RunError::Unexpected(anyhow::anyhow!(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_errors_map_to_one_terminal_state() {
        assert_eq!(
            RunError::CooperativeStop(StopReason::Requested).final_state(),
            FinalState::Stopped
        );
        assert_eq!(
            RunError::from(StepError::StepLimitExceeded).final_state(),
            FinalState::MaxStepsReached
        );
        assert_eq!(
            RunError::from(SandboxError::Timeout("capture".into())).final_state(),
            FinalState::SandboxTimeout
        );
        assert_eq!(
            RunError::from(SandboxError::Command("exit 1".into())).final_state(),
            FinalState::Error
        );
        assert_eq!(
            RunError::Provisioning("pool full".into()).final_state(),
            FinalState::Error
        );
    }
}
