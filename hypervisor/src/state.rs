//! Host-mode wiring: the pool and its sweeper, the orchestrator, and the
//! archival worker when this process wins the singleton lock.

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{HttpStepProvider, StepProvider};
use crate::archival::{ArchivalSupervisor, LiveTaskSink, SingletonLock};
use crate::config::{ArchivalSettings, Config, SandboxRuntime};
use crate::orchestrator::Orchestrator;
use crate::sandbox::{process::ProcessProvider, SandboxPool, SandboxProvider};

struct ArchivalHost {
    supervisor: Arc<ArchivalSupervisor>,
    lock: SingletonLock,
}

pub struct AppState {
    pub pool: Arc<SandboxPool>,
    pub orchestrator: Arc<Orchestrator>,
    archival: Option<ArchivalHost>,
    sweeper: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl AppState {
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let step_url = config
            .agent_step_url
            .clone()
            .context("AGENT_STEP_URL must be set in host mode")?;
        let steps: Arc<dyn StepProvider> =
            Arc::new(HttpStepProvider::new(step_url, config.agent_step_timeout)?);

        let provider: Arc<dyn SandboxProvider> = match config.desktop.runtime {
            SandboxRuntime::Process => ProcessProvider::new(config.desktop.clone()),
        };
        let pool = SandboxPool::new(provider, config.pool.clone());

        let shutdown = CancellationToken::new();
        let sweeper = tokio::spawn(Arc::clone(&pool).run_stuck_sweeper(shutdown.child_token()));

        let archival = start_archival(&config.archival)?;
        let live_tasks = archival
            .as_ref()
            .map(|host| Arc::clone(&host.supervisor) as Arc<dyn LiveTaskSink>);

        let orchestrator = Orchestrator::new(
            Arc::clone(&pool),
            steps,
            config.orchestrator.clone(),
            live_tasks,
        );

        info!(
            capacity = pool.capacity(),
            admission_limit = config.orchestrator.admission_limit,
            archival = archival.is_some(),
            "hypervisor started"
        );
        Ok(Self {
            pool,
            orchestrator,
            archival,
            sweeper,
            shutdown,
        })
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.sweeper.await {
            warn!(error = %e, "stuck-slot sweeper ended abnormally");
        }
        if let Some(host) = self.archival {
            host.supervisor.stop().await;
            info!(lock = %host.lock.path().display(), "archival lock released");
            drop(host.lock);
        }
        let drained = self.pool.drain().await;
        info!(drained, "hypervisor stopped");
    }
}

/// `None` when archival is not configured or another process hosts it.
fn start_archival(settings: &ArchivalSettings) -> anyhow::Result<Option<ArchivalHost>> {
    if settings.store_url.is_none() {
        warn!("ARCHIVE_STORE_URL not set; data archival disabled");
        return Ok(None);
    }
    let lock = SingletonLock::try_acquire(&settings.lock_path)
        .with_context(|| format!("cannot open archival lock {}", settings.lock_path.display()))?;
    let Some(lock) = lock else {
        info!(pid = std::process::id(), "archival worker already hosted elsewhere; skipping");
        return Ok(None);
    };
    let binary = match &settings.worker_binary {
        Some(path) => path.clone(),
        None => std::env::current_exe().context("cannot locate current executable")?,
    };
    let supervisor = ArchivalSupervisor::spawn(&binary, settings.stop_grace)
        .with_context(|| format!("failed to spawn archival worker {}", binary.display()))?;
    Ok(Some(ArchivalHost {
        supervisor: Arc::new(supervisor),
        lock,
    }))
}
