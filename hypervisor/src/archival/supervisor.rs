//! Host-side handle on the archival worker child process.
//!
//! Commands travel as JSON lines on the child's stdin. Stop escalates from
//! a shutdown command to SIGTERM to a hard kill.

use std::{collections::HashSet, path::Path, process::Stdio, time::Duration};

use async_trait::async_trait;
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::{
    process::{Child, ChildStdin, Command},
    sync::Mutex,
    time::timeout,
};
use tokio_util::codec::{FramedWrite, LinesCodec};
use tracing::{error, info, warn};

use super::LiveTaskSink;

pub const WORKER_SUBCOMMAND: &str = "archival-worker";
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Full replacement of the live task set.
    LiveTasks { keys: Vec<String> },
    Shutdown,
}

pub struct ArchivalSupervisor {
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<FramedWrite<ChildStdin, LinesCodec>>>,
    grace: Duration,
}

impl ArchivalSupervisor {
    /// Start `binary archival-worker`. The child inherits the environment
    /// and so reads the same configuration.
    pub fn spawn(binary: &Path, grace: Duration) -> std::io::Result<Self> {
        let mut command = Command::new(binary);
        command.arg(WORKER_SUBCOMMAND);
        Self::spawn_command(command, grace)
    }

    fn spawn_command(mut command: Command, grace: Duration) -> std::io::Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .map(|stdin| FramedWrite::new(stdin, LinesCodec::new()));
        info!(pid = child.id(), "archival worker spawned");
        Ok(Self {
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(stdin),
            grace,
        })
    }

    pub async fn is_alive(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn send(&self, command: &WorkerCommand) -> Result<(), String> {
        let line = serde_json::to_string(command).map_err(|e| e.to_string())?;
        let mut stdin = self.stdin.lock().await;
        let Some(writer) = stdin.as_mut() else {
            return Err("worker stdin closed".to_string());
        };
        writer.send(line).await.map_err(|e| e.to_string())
    }

    /// Ask the worker to exit, then escalate until it does.
    pub async fn stop(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        let pid = child.id();
        info!(pid, "stopping archival worker");

        if let Err(e) = self.send(&WorkerCommand::Shutdown).await {
            warn!(pid, error = %e, "shutdown command not delivered");
        }
        // Closing stdin is a shutdown signal on its own.
        self.stdin.lock().await.take();

        if let Ok(status) = timeout(self.grace, child.wait()).await {
            info!(pid, ?status, "archival worker exited");
            return;
        }

        warn!(pid, "archival worker did not stop gracefully; terminating");
        if let Some(pid) = pid {
            // SAFETY: plain kill(2) on the child's pid, which we have not reaped.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        if timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            info!(pid, "archival worker terminated");
            return;
        }

        error!(pid, "force killing archival worker");
        if let Err(e) = child.kill().await {
            error!(pid, error = %e, "kill failed");
        }
    }
}

#[async_trait]
impl LiveTaskSink for ArchivalSupervisor {
    async fn publish(&self, keys: HashSet<String>) {
        if !self.is_alive().await {
            return;
        }
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        if let Err(e) = self.send(&WorkerCommand::LiveTasks { keys }).await {
            warn!(error = %e, "live task set not delivered to archival worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_tagged_json_lines() {
        let line = serde_json::to_string(&WorkerCommand::LiveTasks {
            keys: vec!["a".into()],
        })
        .unwrap();
        assert_eq!(line, r#"{"command":"live_tasks","keys":["a"]}"#);
        let parsed: WorkerCommand = serde_json::from_str(r#"{"command":"shutdown"}"#).unwrap();
        assert_eq!(parsed, WorkerCommand::Shutdown);
    }

    #[tokio::test]
    async fn missing_worker_binary_is_a_spawn_error() {
        let result = ArchivalSupervisor::spawn(Path::new("/nonexistent/cua"), Duration::from_secs(1));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stop_escalates_past_a_worker_that_ignores_stdin() {
        let mut command = Command::new("sleep");
        command.arg("30");
        let supervisor =
            ArchivalSupervisor::spawn_command(command, Duration::from_millis(100)).unwrap();
        assert!(supervisor.is_alive().await);
        supervisor.stop().await;
        assert!(!supervisor.is_alive().await);
        supervisor.publish(HashSet::new()).await;
    }
}
