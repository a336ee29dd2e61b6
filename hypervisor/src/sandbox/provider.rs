use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Resolution;
use crate::error::SandboxError;

/// Options for the desktop stream URL handed to clients.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub auto_connect: bool,
    pub view_only: bool,
    pub resize: String,
}

impl StreamOptions {
    /// Watch-only stream used while the agent drives the desktop.
    pub fn view_only() -> Self {
        Self {
            auto_connect: true,
            view_only: true,
            resize: "scale".to_string(),
        }
    }
}

/// The remote provisioning service. Any error means the instance never
/// became usable.
#[async_trait]
pub trait SandboxProvider: Send + Sync + 'static {
    async fn create(
        &self,
        resolution: Resolution,
        timeout: Duration,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError>;
}

/// A provisioned virtual desktop.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    fn id(&self) -> &str;

    async fn run_command(&self, command: &str) -> Result<(), SandboxError>;

    /// PNG bytes of the current screen.
    async fn capture_screenshot(&self) -> Result<Vec<u8>, SandboxError>;

    async fn stream_url(&self, options: &StreamOptions) -> Result<String, SandboxError>;

    async fn teardown(&self) -> Result<(), SandboxError>;
}
