//! Capacity-bounded pool of desktop sandboxes keyed by task key.
//!
//! All bookkeeping happens under one mutex; provisioning and teardown run
//! outside it so a slow provider never blocks unrelated keys.

pub mod process;
pub mod provider;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures_util::future::join_all;
use shared_types::TaskKey;
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PoolSettings;
use crate::error::SandboxError;

pub use provider::{SandboxHandle, SandboxProvider, StreamOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Creating,
    Ready,
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotStatus::Creating => write!(f, "creating"),
            SlotStatus::Ready => write!(f, "ready"),
        }
    }
}

enum SlotState {
    Creating,
    Ready(Arc<dyn SandboxHandle>),
}

struct SandboxSlot {
    state: SlotState,
    /// Distinguishes this slot from an earlier one for the same key, so a
    /// late provisioning result never lands on a slot it did not start.
    generation: u64,
    created_at: Instant,
    last_accessed: Instant,
}

impl SandboxSlot {
    fn status(&self) -> SlotStatus {
        match self.state {
            SlotState::Creating => SlotStatus::Creating,
            SlotState::Ready(_) => SlotStatus::Ready,
        }
    }
}

/// Result of [`SandboxPool::acquire`]. Reflects the state at check time only;
/// callers re-poll while `Creating`.
#[derive(Clone)]
pub enum Acquire {
    Ready(Arc<dyn SandboxHandle>),
    Creating,
    CapacityExceeded,
}

impl std::fmt::Debug for Acquire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acquire::Ready(handle) => f.debug_tuple("Ready").field(&handle.id()).finish(),
            Acquire::Creating => write!(f, "Creating"),
            Acquire::CapacityExceeded => write!(f, "CapacityExceeded"),
        }
    }
}

impl Acquire {
    pub fn is_ready(&self) -> bool {
        matches!(self, Acquire::Ready(_))
    }
}

#[derive(Debug, serde::Serialize)]
pub struct SlotSnapshot {
    pub key: TaskKey,
    pub status: SlotStatus,
    pub age_secs: u64,
    pub idle_secs: u64,
}

pub struct SandboxPool {
    provider: Arc<dyn SandboxProvider>,
    settings: PoolSettings,
    slots: Mutex<HashMap<TaskKey, SandboxSlot>>,
    next_generation: AtomicU64,
}

impl SandboxPool {
    pub fn new(provider: Arc<dyn SandboxProvider>, settings: PoolSettings) -> Arc<Self> {
        Arc::new(Self {
            provider,
            settings,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    pub fn capacity(&self) -> usize {
        self.settings.capacity
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Get the sandbox for `key`, starting background provisioning if none
    /// exists. Never blocks on the provider.
    pub async fn acquire(self: &Arc<Self>, key: &TaskKey) -> Acquire {
        let now = Instant::now();
        let (generation, expired) = {
            let mut slots = self.slots.lock().await;

            if let Some(slot) = slots.get_mut(key) {
                match &slot.state {
                    SlotState::Ready(handle)
                        if now.duration_since(slot.created_at) < self.settings.reuse_window =>
                    {
                        slot.last_accessed = now;
                        debug!(task_key = %key, "reusing sandbox");
                        return Acquire::Ready(Arc::clone(handle));
                    }
                    SlotState::Creating => {
                        debug!(task_key = %key, "sandbox already being created");
                        return Acquire::Creating;
                    }
                    SlotState::Ready(_) => {}
                }
            }

            // Past its reuse window: detach before counting so it does not
            // hold the capacity it is about to give up.
            let expired = match slots.remove(key) {
                Some(SandboxSlot {
                    state: SlotState::Ready(handle),
                    ..
                }) => {
                    info!(task_key = %key, "detaching expired sandbox");
                    Some(handle)
                }
                _ => None,
            };

            if slots.len() >= self.settings.capacity {
                warn!(
                    task_key = %key,
                    capacity = self.settings.capacity,
                    "sandbox capacity reached"
                );
                drop(slots);
                if let Some(handle) = expired {
                    let key = key.clone();
                    tokio::spawn(async move { teardown_logged(&key, handle).await });
                }
                return Acquire::CapacityExceeded;
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            slots.insert(
                key.clone(),
                SandboxSlot {
                    state: SlotState::Creating,
                    generation,
                    created_at: now,
                    last_accessed: now,
                },
            );
            info!(task_key = %key, generation, "creating sandbox");
            (generation, expired)
        };

        tokio::spawn(Arc::clone(self).provision(key.clone(), generation, expired));

        // Give a fast provider the chance to finish before we answer.
        tokio::task::yield_now().await;
        match self.slots.lock().await.get(key) {
            Some(SandboxSlot {
                state: SlotState::Ready(handle),
                ..
            }) => Acquire::Ready(Arc::clone(handle)),
            _ => Acquire::Creating,
        }
    }

    async fn provision(
        self: Arc<Self>,
        key: TaskKey,
        generation: u64,
        expired: Option<Arc<dyn SandboxHandle>>,
    ) {
        if let Some(old) = expired {
            teardown_logged(&key, old).await;
        }

        match self.create_instance().await {
            Ok(handle) => {
                let orphan = {
                    let mut slots = self.slots.lock().await;
                    match slots.get_mut(&key) {
                        Some(slot)
                            if slot.generation == generation
                                && matches!(slot.state, SlotState::Creating) =>
                        {
                            slot.state = SlotState::Ready(Arc::clone(&handle));
                            slot.last_accessed = Instant::now();
                            None
                        }
                        _ => Some(handle),
                    }
                };
                match orphan {
                    None => info!(task_key = %key, generation, "sandbox ready"),
                    Some(handle) => {
                        warn!(task_key = %key, generation, "sandbox released during creation; tearing down");
                        teardown_logged(&key, handle).await;
                    }
                }
            }
            Err(e) => {
                error!(task_key = %key, generation, error = %e, "sandbox provisioning failed");
                let mut slots = self.slots.lock().await;
                if slots.get(&key).map(|s| s.generation) == Some(generation) {
                    slots.remove(&key);
                }
            }
        }
    }

    /// Provision one instance and run first-launch setup on it.
    async fn create_instance(&self) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let handle = self
            .provider
            .create(self.settings.resolution, self.settings.sandbox_timeout)
            .await?;

        for command in &self.settings.setup_commands {
            if let Err(e) = handle.run_command(command).await {
                if let Err(te) = handle.teardown().await {
                    warn!(sandbox_id = handle.id(), error = %te, "teardown after failed setup");
                }
                return Err(e);
            }
        }
        Ok(handle)
    }

    /// Detach and tear down whatever exists for `key`. Safe to call when
    /// nothing was ever acquired.
    pub async fn release(&self, key: &TaskKey) {
        let removed = self.slots.lock().await.remove(key);
        match removed {
            Some(SandboxSlot {
                state: SlotState::Ready(handle),
                ..
            }) => {
                info!(task_key = %key, "releasing sandbox");
                teardown_logged(key, handle).await;
            }
            Some(SandboxSlot {
                state: SlotState::Creating,
                ..
            }) => {
                // The provisioning task sees the slot is gone and tears down.
                info!(task_key = %key, "released sandbox while still creating");
            }
            None => debug!(task_key = %key, "release with no sandbox"),
        }
    }

    /// Remove slots stuck in Creating past the maximum creation time.
    pub async fn sweep_stuck(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock().await;
        let stuck: Vec<TaskKey> = slots
            .iter()
            .filter(|(_, slot)| {
                matches!(slot.state, SlotState::Creating)
                    && now.duration_since(slot.created_at) > self.settings.max_creation_time
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stuck {
            if let Some(slot) = slots.remove(key) {
                warn!(
                    task_key = %key,
                    stuck_secs = now.duration_since(slot.created_at).as_secs(),
                    "removing sandbox stuck in creating"
                );
            }
        }
        stuck.len()
    }

    /// Background task: sweep stuck slots on a fixed interval.
    pub async fn run_stuck_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.sweep_interval) => {
                    let removed = self.sweep_stuck().await;
                    if removed > 0 {
                        info!(removed, "stuck sandbox sweep");
                    }
                }
            }
        }
        debug!("stuck sandbox sweeper stopped");
    }

    /// Tear down every slot. Used at shutdown.
    pub async fn drain(&self) -> usize {
        let drained: Vec<(TaskKey, SandboxSlot)> = self.slots.lock().await.drain().collect();
        let count = drained.len();
        let teardowns = drained.into_iter().filter_map(|(key, slot)| match slot.state {
            SlotState::Ready(handle) => Some(async move { teardown_logged(&key, handle).await }),
            SlotState::Creating => None,
        });
        join_all(teardowns).await;
        info!(count, "sandbox pool drained");
        count
    }

    pub async fn status_of(&self, key: &TaskKey) -> Option<SlotStatus> {
        self.slots.lock().await.get(key).map(SandboxSlot::status)
    }

    /// Slots in Creating or Ready.
    pub async fn occupied(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn snapshot(&self) -> Vec<SlotSnapshot> {
        let now = Instant::now();
        let slots = self.slots.lock().await;
        let mut out: Vec<SlotSnapshot> = slots
            .iter()
            .map(|(key, slot)| SlotSnapshot {
                key: key.clone(),
                status: slot.status(),
                age_secs: now.duration_since(slot.created_at).as_secs(),
                idle_secs: now.duration_since(slot.last_accessed).as_secs(),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

async fn teardown_logged(key: &TaskKey, handle: Arc<dyn SandboxHandle>) {
    match handle.teardown().await {
        Ok(()) => debug!(task_key = %key, sandbox_id = handle.id(), "sandbox torn down"),
        Err(e) => error!(task_key = %key, sandbox_id = handle.id(), error = %e, "sandbox teardown failed"),
    }
}
