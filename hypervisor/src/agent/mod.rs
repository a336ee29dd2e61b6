//! The execution-step provider: given the instruction and the running state,
//! produce exactly one agent step per call.

pub mod actions;
pub mod http;

use async_trait::async_trait;
use shared_types::{AgentAction, AgentStep, TaskKey};

use crate::error::SandboxError;
use crate::sandbox::SandboxHandle;

pub use http::HttpStepProvider;

pub struct StepRequest<'a> {
    pub key: &'a TaskKey,
    pub instruction: &'a str,
    pub model_id: &'a str,
    /// 1-indexed.
    pub step_number: u32,
    pub max_steps: u32,
    /// PNG of the screen the step should act on.
    pub screenshot: &'a [u8],
    pub history: &'a [AgentStep],
    pub sandbox: &'a dyn SandboxHandle,
}

#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub thought: Option<String>,
    pub actions: Vec<AgentAction>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Seconds.
    pub duration: f64,
    /// Non-fatal error recorded on the step.
    pub error: Option<String>,
    /// The agent considers the task done.
    pub is_final: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("Step limit exceeded")]
    StepLimitExceeded,

    #[error("Sandbox unresponsive: {0}")]
    SandboxTimeout(String),

    #[error("Step failed: {0}")]
    Failed(String),
}

impl From<SandboxError> for StepError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::Timeout(msg) => StepError::SandboxTimeout(msg),
            other => StepError::Failed(other.to_string()),
        }
    }
}

#[async_trait]
pub trait StepProvider: Send + Sync {
    async fn next_step(&self, request: StepRequest<'_>) -> Result<StepOutput, StepError>;
}
