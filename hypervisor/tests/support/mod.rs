//! Fakes shared by the integration tests: a provisioning service, a
//! scripted step provider and helpers for collecting connection events.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use cua_hypervisor::{
    agent::{StepError, StepOutput, StepProvider, StepRequest},
    config::{OrchestratorSettings, PoolSettings, Resolution},
    error::SandboxError,
    orchestrator::Orchestrator,
    sandbox::{SandboxHandle, SandboxPool, SandboxProvider, StreamOptions},
};
use shared_types::{AgentAction, ServerEvent, TaskKey};
use tokio::sync::{mpsc::UnboundedReceiver, Semaphore};

pub const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

// ─── Provisioning service ────────────────────────────────────────────────────

pub struct FakeDesktop {
    id: String,
    torn_down: Arc<AtomicUsize>,
}

#[async_trait]
impl SandboxHandle for FakeDesktop {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run_command(&self, _command: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn capture_screenshot(&self) -> Result<Vec<u8>, SandboxError> {
        Ok(PNG.to_vec())
    }

    async fn stream_url(&self, options: &StreamOptions) -> Result<String, SandboxError> {
        Ok(format!("http://desktop/{}?view_only={}", self.id, options.view_only))
    }

    async fn teardown(&self) -> Result<(), SandboxError> {
        self.torn_down.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Creation waits on `gate`; an open gate provisions immediately.
pub struct FakeProvider {
    pub gate: Arc<Semaphore>,
    pub created: AtomicUsize,
    pub torn_down: Arc<AtomicUsize>,
    pub fail: bool,
}

impl FakeProvider {
    pub fn open() -> Arc<Self> {
        Self::build(Semaphore::MAX_PERMITS, false)
    }

    pub fn closed() -> Arc<Self> {
        Self::build(0, false)
    }

    pub fn failing() -> Arc<Self> {
        Self::build(Semaphore::MAX_PERMITS, true)
    }

    fn build(permits: usize, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            gate: Arc::new(Semaphore::new(permits)),
            created: AtomicUsize::new(0),
            torn_down: Arc::new(AtomicUsize::new(0)),
            fail,
        })
    }

    pub fn open_gate(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn create(
        &self,
        _resolution: Resolution,
        _timeout: Duration,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| SandboxError::Provisioning("gate closed".into()))?;
        permit.forget();
        if self.fail {
            return Err(SandboxError::Provisioning("provider unavailable".into()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeDesktop {
            id: format!("desktop-{n}"),
            torn_down: Arc::clone(&self.torn_down),
        }))
    }
}

// ─── Step provider ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Scripted {
    Continue,
    Final,
    Fail(&'static str),
    StepLimit,
    Timeout,
}

/// Plays a fixed script, one entry per step; `Continue` once exhausted.
/// With a gate, every step waits for a permit first.
pub struct ScriptedSteps {
    script: StdMutex<VecDeque<Scripted>>,
    gate: Option<Arc<Semaphore>>,
    pub calls: AtomicUsize,
}

impl ScriptedSteps {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: StdMutex::new(script.into()),
            gate: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn gated(script: Vec<Scripted>, gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            script: StdMutex::new(script.into()),
            gate: Some(gate),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl StepProvider for ScriptedSteps {
    async fn next_step(&self, request: StepRequest<'_>) -> Result<StepOutput, StepError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| StepError::Failed("gate closed".into()))?
                .forget();
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(request.screenshot, PNG);
        assert_eq!(request.history.len() as u32, request.step_number - 1);

        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Scripted::Continue);
        let action = |name: &str| {
            let mut params = serde_json::Map::new();
            params.insert("answer".into(), "done".into());
            AgentAction::new(name, params)
        };
        match next {
            Scripted::Continue => Ok(StepOutput {
                thought: Some(format!("step {}", request.step_number)),
                actions: vec![AgentAction::new("go_back", serde_json::Map::new())],
                input_tokens: 100,
                output_tokens: 10,
                duration: 0.5,
                error: None,
                is_final: false,
            }),
            Scripted::Final => Ok(StepOutput {
                thought: Some("finished".into()),
                actions: vec![action("final_answer")],
                input_tokens: 100,
                output_tokens: 10,
                duration: 0.5,
                error: None,
                is_final: true,
            }),
            Scripted::Fail(msg) => Err(StepError::Failed(msg.to_string())),
            Scripted::StepLimit => Err(StepError::StepLimitExceeded),
            Scripted::Timeout => Err(StepError::SandboxTimeout("desktop not responding".into())),
        }
    }
}

// ─── Wiring ──────────────────────────────────────────────────────────────────

pub fn pool_settings(capacity: usize) -> PoolSettings {
    PoolSettings {
        capacity,
        reuse_window: Duration::from_secs(3600),
        setup_commands: vec!["true".into()],
        ..Default::default()
    }
}

pub fn orchestrator_settings(data_dir: &Path, max_steps: u32) -> OrchestratorSettings {
    OrchestratorSettings {
        admission_limit: 8,
        acquire_attempts: 100,
        acquire_delay: Duration::from_millis(10),
        acquire_deadline: Duration::from_secs(5),
        step_settle_delay: Duration::ZERO,
        max_steps,
        data_dir: data_dir.to_path_buf(),
    }
}

pub fn orchestrator(
    provider: Arc<FakeProvider>,
    steps: Arc<ScriptedSteps>,
    capacity: usize,
    settings: OrchestratorSettings,
) -> Arc<Orchestrator> {
    let pool = SandboxPool::new(provider, pool_settings(capacity));
    Orchestrator::new(pool, steps, settings, None)
}

// ─── Event helpers ───────────────────────────────────────────────────────────

/// Collect events up to and including `agent_complete`.
pub async fn until_complete(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for agent_complete")
            .expect("connection dropped");
        let done = matches!(event, ServerEvent::AgentComplete { .. });
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Wait until the task is gone from the registry and its slot released.
pub async fn settled(orchestrator: &Orchestrator, key: &TaskKey) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if !orchestrator.is_active(key).await
                && orchestrator.pool().status_of(key).await.is_none()
                && orchestrator.sessions().connection_for(key).await.is_none()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task did not finalize");
}

/// Poll `check` until it holds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

pub fn event_types(events: &[ServerEvent]) -> Vec<&'static str> {
    events.iter().map(ServerEvent::event_type).collect()
}

pub fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
