//! Local desktop provider: one launcher process per sandbox, reachable on a
//! stream port from a fixed range.

use std::{collections::BTreeSet, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    net::TcpStream,
    process::{Child, Command},
    sync::Mutex,
    time::sleep,
};
use tracing::{error, info, warn};

use super::provider::{SandboxHandle, SandboxProvider, StreamOptions};
use crate::config::{DesktopSettings, Resolution};
use crate::error::SandboxError;

/// Stream ports not currently held by a desktop.
struct PortAllocator {
    free: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    fn new(base: u16, count: u16) -> Self {
        let free = (0..count).filter_map(|i| base.checked_add(i)).collect();
        Self {
            free: Mutex::new(free),
        }
    }

    async fn take(&self) -> Option<u16> {
        self.free.lock().await.pop_first()
    }

    async fn give_back(&self, port: u16) {
        self.free.lock().await.insert(port);
    }
}

pub struct ProcessProvider {
    settings: DesktopSettings,
    ports: Arc<PortAllocator>,
}

impl ProcessProvider {
    pub fn new(settings: DesktopSettings) -> Arc<Self> {
        let ports = Arc::new(PortAllocator::new(settings.base_port, settings.port_count));
        Arc::new(Self { settings, ports })
    }

    fn display_for(&self, port: u16) -> String {
        format!(":{}", 100 + port.saturating_sub(self.settings.base_port))
    }

    async fn spawn_desktop(
        &self,
        port: u16,
        display_name: &str,
        resolution: Resolution,
        timeout: Duration,
    ) -> Result<Child, SandboxError> {
        let mut child = Command::new(&self.settings.binary)
            .env("DISPLAY", display_name)
            .env("STREAM_PORT", port.to_string())
            .env("RESOLUTION", format!("{}x{}", resolution.width, resolution.height))
            .env("SANDBOX_TIMEOUT_SECS", timeout.as_secs().to_string())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!(port, binary = %self.settings.binary, "failed to spawn desktop: {e}");
                SandboxError::Provisioning(format!("spawn {}: {e}", self.settings.binary))
            })?;

        // Readiness: poll until the stream port accepts connections or deadline.
        let deadline = tokio::time::Instant::now() + timeout;
        let addr = format!("{}:{port}", self.settings.stream_host);
        loop {
            if tokio::time::Instant::now() >= deadline {
                error!(port, "desktop did not become ready within {}s", timeout.as_secs());
                child.kill().await.ok();
                return Err(SandboxError::Timeout(format!(
                    "desktop readiness timeout on port {port}"
                )));
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(SandboxError::Provisioning(format!(
                    "desktop exited during startup: {status}"
                )));
            }
            match TcpStream::connect(&addr).await {
                Ok(_) => {
                    info!(port, display = display_name, "desktop stream port is ready");
                    break;
                }
                Err(_) => sleep(Duration::from_millis(100)).await,
            }
        }

        Ok(child)
    }
}

#[async_trait]
impl SandboxProvider for ProcessProvider {
    async fn create(
        &self,
        resolution: Resolution,
        timeout: Duration,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let port = self
            .ports
            .take()
            .await
            .ok_or_else(|| SandboxError::Provisioning("no free desktop ports".into()))?;
        let display = self.display_for(port);

        let child = match self.spawn_desktop(port, &display, resolution, timeout).await {
            Ok(child) => child,
            Err(e) => {
                self.ports.give_back(port).await;
                return Err(e);
            }
        };

        Ok(Arc::new(ProcessDesktop {
            id: format!("desktop-{port}"),
            display,
            port,
            host: self.settings.stream_host.clone(),
            auth_key: uuid::Uuid::new_v4().simple().to_string(),
            screenshot_command: self.settings.screenshot_command.clone(),
            screenshot_timeout: self.settings.screenshot_timeout,
            command_timeout: self.settings.command_timeout,
            child: Mutex::new(Some(child)),
            ports: Arc::clone(&self.ports),
        }))
    }
}

pub struct ProcessDesktop {
    id: String,
    display: String,
    port: u16,
    host: String,
    auth_key: String,
    screenshot_command: String,
    screenshot_timeout: Duration,
    command_timeout: Duration,
    child: Mutex<Option<Child>>,
    ports: Arc<PortAllocator>,
}

impl ProcessDesktop {
    async fn run_shell(&self, command: &str) -> Result<std::process::Output, SandboxError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("DISPLAY", &self.display)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::Command(format!(
                "`{command}` exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl SandboxHandle for ProcessDesktop {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run_command(&self, command: &str) -> Result<(), SandboxError> {
        tokio::time::timeout(self.command_timeout, self.run_shell(command))
            .await
            .map_err(|_| {
                SandboxError::Timeout(format!(
                    "`{command}` on {} took longer than {}s",
                    self.id,
                    self.command_timeout.as_secs_f64()
                ))
            })?
            .map(|_| ())
    }

    async fn capture_screenshot(&self) -> Result<Vec<u8>, SandboxError> {
        let output = tokio::time::timeout(
            self.screenshot_timeout,
            self.run_shell(&self.screenshot_command),
        )
        .await
        .map_err(|_| {
            SandboxError::Timeout(format!(
                "screenshot on {} took longer than {}s",
                self.id,
                self.screenshot_timeout.as_secs()
            ))
        })??;
        if output.stdout.is_empty() {
            return Err(SandboxError::Command("screenshot command produced no data".into()));
        }
        Ok(output.stdout)
    }

    async fn stream_url(&self, options: &StreamOptions) -> Result<String, SandboxError> {
        Ok(format!(
            "http://{}:{}/vnc.html?autoconnect={}&view_only={}&resize={}&password={}",
            self.host, self.port, options.auto_connect, options.view_only, options.resize, self.auth_key
        ))
    }

    async fn teardown(&self) -> Result<(), SandboxError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        if let Err(e) = child.kill().await {
            warn!(sandbox_id = %self.id, "desktop kill failed: {e}");
        }
        self.ports.give_back(self.port).await;
        info!(sandbox_id = %self.id, "desktop stopped");
        Ok(())
    }
}
