//! Task Registry & Orchestrator: admits tasks, runs one execution loop per
//! task key, and owns every sandbox release made on a task's behalf.

mod feedback;
pub mod record;
mod runner;

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;
use shared_types::{AgentStartStatus, ClientMessage, ServerEvent, TaskKey};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agent::StepProvider;
use crate::archival::LiveTaskSink;
use crate::config::OrchestratorSettings;
use crate::connection::{deliver, Connection, ConnectionId};
use crate::error::TaskError;
use crate::sandbox::{Acquire, SandboxPool};
use crate::session::SessionCoordinator;

pub use record::TaskRecord;

/// A task in the registry. The record lock covers bookkeeping only.
pub(crate) struct ActiveTask {
    key: TaskKey,
    connection: Arc<dyn Connection>,
    record: Mutex<TaskRecord>,
    /// Orders `tasks.json` writes; the record lock is never held across one.
    persist_lock: Mutex<()>,
}

impl ActiveTask {
    fn new(key: TaskKey, connection: Arc<dyn Connection>, record: TaskRecord) -> Self {
        Self {
            key,
            connection,
            record: Mutex::new(record),
            persist_lock: Mutex::new(()),
        }
    }

    /// Write the current record. Snapshots are taken and written in order,
    /// so a later write never carries older state.
    async fn persist(&self, data_dir: &Path) -> Result<PathBuf, TaskError> {
        let _order = self.persist_lock.lock().await;
        let snapshot = self.record.lock().await.clone();
        snapshot.persist(data_dir).await
    }

    async fn request_stop(&self) -> bool {
        let mut record = self.record.lock().await;
        let already = record.metadata.completed;
        record.metadata.completed = true;
        !already
    }

    async fn stop_requested(&self) -> bool {
        self.record.lock().await.metadata.completed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub key: TaskKey,
    pub instruction: String,
    pub model_id: String,
    pub steps: u32,
    pub completed: bool,
}

pub struct Orchestrator {
    pool: Arc<SandboxPool>,
    sessions: SessionCoordinator,
    tasks: Mutex<HashMap<TaskKey, Arc<ActiveTask>>>,
    steps: Arc<dyn StepProvider>,
    settings: OrchestratorSettings,
    live_tasks: Option<Arc<dyn LiveTaskSink>>,
    /// Serializes live-set publication so the worker never sees an older set
    /// after a newer one.
    publish_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<SandboxPool>,
        steps: Arc<dyn StepProvider>,
        settings: OrchestratorSettings,
        live_tasks: Option<Arc<dyn LiveTaskSink>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            sessions: SessionCoordinator::new(),
            tasks: Mutex::new(HashMap::new()),
            steps,
            settings,
            live_tasks,
            publish_lock: Mutex::new(()),
        })
    }

    pub fn pool(&self) -> &Arc<SandboxPool> {
        &self.pool
    }

    pub fn sessions(&self) -> &SessionCoordinator {
        &self.sessions
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Bind a new connection: issue its task key, start warming a sandbox
    /// for it and tell the client which key it got.
    pub async fn open_session(&self, connection: Arc<dyn Connection>) -> TaskKey {
        let key = self.sessions.bind(Arc::clone(&connection)).await;
        match self.pool.acquire(&key).await {
            Acquire::CapacityExceeded => {
                warn!(task_key = %key, "sandbox pool full at session open")
            }
            state => debug!(task_key = %key, ?state, "sandbox requested at session open"),
        }
        deliver(
            connection.as_ref(),
            ServerEvent::Heartbeat {
                uuid: key.to_string(),
            },
        )
        .await;
        info!(task_key = %key, connection = %connection.id(), "session opened");
        key
    }

    /// Stop every task bound to the connection and release every sandbox
    /// acquired for it, whether or not a task ever started.
    pub async fn on_connection_closed(&self, connection: ConnectionId) {
        let keys = self.sessions.unbind_connection(connection).await;
        for key in keys {
            let task = self.tasks.lock().await.get(&key).cloned();
            if let Some(task) = task {
                task.request_stop().await;
                info!(task_key = %key, "connection closed; stop requested");
            }
            self.pool.release(&key).await;
        }
    }

    // ========================================================================
    // Task admission and control
    // ========================================================================

    /// Admit a task for a key issued to `connection` and start its execution
    /// loop in the background.
    pub async fn begin_task(
        self: &Arc<Self>,
        connection: ConnectionId,
        key: TaskKey,
        instruction: String,
        model_id: String,
    ) -> Result<TaskKey, TaskError> {
        let conn = self.sessions.verify(&key, connection).await?;
        let record = TaskRecord::new(key.clone(), instruction, model_id, self.settings.max_steps);

        let task = {
            let mut tasks = self.tasks.lock().await;
            if tasks.contains_key(&key) {
                return Err(TaskError::DuplicateTask(key));
            }
            if tasks.len() >= self.settings.admission_limit {
                drop(tasks);
                warn!(task_key = %key, limit = self.settings.admission_limit, "task admission refused");
                deliver(
                    conn.as_ref(),
                    ServerEvent::AgentStart {
                        agent_trace: record.to_trace(false),
                        status: AgentStartStatus::MaxSandboxesReached,
                    },
                )
                .await;
                return Err(TaskError::CapacityExceeded {
                    limit: self.settings.admission_limit,
                });
            }
            let task = Arc::new(ActiveTask::new(key.clone(), conn, record));
            tasks.insert(key.clone(), Arc::clone(&task));
            task
        };

        // A close that unbound the key between `verify` and the insert above
        // found no task to stop; stop it here instead.
        if self.sessions.connection_for(&key).await.is_none() {
            task.request_stop().await;
            info!(task_key = %key, "connection closed during admission; stop requested");
        }

        info!(task_key = %key, "task admitted");
        self.publish_live_tasks().await;
        tokio::spawn(Arc::clone(self).run_task(task));
        Ok(key)
    }

    /// Ask the task to stop at its next step boundary. Returns false when no
    /// such task is running.
    pub async fn stop(&self, key: &TaskKey) -> bool {
        let task = self.tasks.lock().await.get(key).cloned();
        match task {
            Some(task) => {
                task.request_stop().await;
                info!(task_key = %key, "stop requested");
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, key: &TaskKey) -> bool {
        self.tasks.lock().await.contains_key(key)
    }

    pub async fn active_tasks(&self) -> Vec<TaskSummary> {
        let tasks: Vec<Arc<ActiveTask>> = self.tasks.lock().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(tasks.len());
        for task in tasks {
            let record = task.record.lock().await;
            summaries.push(TaskSummary {
                key: task.key.clone(),
                instruction: record.instruction.clone(),
                model_id: record.model_id.clone(),
                steps: record.metadata.number_of_steps,
                completed: record.metadata.completed,
            });
        }
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    /// Route one client message. Failures are also reported to the client as
    /// `agent_error`, except refused admissions which already got their
    /// `agent_start`.
    pub async fn dispatch(
        self: &Arc<Self>,
        connection: &Arc<dyn Connection>,
        message: ClientMessage,
    ) -> Result<(), TaskError> {
        let result = match message {
            ClientMessage::UserTask { trace } => self
                .begin_task(connection.id(), trace.id, trace.instruction, trace.model_id)
                .await
                .map(|_| ()),
            ClientMessage::StopTask { trace_id } => self.stop_for(connection.id(), &trace_id).await,
            ClientMessage::TraceEvaluation {
                trace_id,
                user_evaluation,
            } => self
                .update_trace_evaluation(&trace_id, user_evaluation)
                .await
                .map(|_| ()),
        };
        if let Err(e) = &result {
            if !matches!(e, TaskError::CapacityExceeded { .. }) {
                deliver(
                    connection.as_ref(),
                    ServerEvent::AgentError {
                        error: e.to_string(),
                    },
                )
                .await;
            }
        }
        result
    }

    async fn stop_for(&self, connection: ConnectionId, key: &TaskKey) -> Result<(), TaskError> {
        let task = self.tasks.lock().await.get(key).cloned();
        match task {
            Some(task) if task.connection.id() != connection => {
                Err(TaskError::ConnectionMismatch(key.clone()))
            }
            Some(task) => {
                task.request_stop().await;
                info!(task_key = %key, "stop requested");
                Ok(())
            }
            None => {
                debug!(task_key = %key, "stop for a task that is not running");
                Ok(())
            }
        }
    }

    /// Replace the archival worker's view of live tasks with the current set.
    async fn publish_live_tasks(&self) {
        let Some(sink) = &self.live_tasks else {
            return;
        };
        let _order = self.publish_lock.lock().await;
        let keys: HashSet<String> = self
            .tasks
            .lock()
            .await
            .keys()
            .map(|k| k.to_string())
            .collect();
        debug!(live = keys.len(), "publishing live task set");
        sink.publish(keys).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::connection::ChannelConnection;

    fn task(key: &TaskKey) -> Arc<ActiveTask> {
        let (conn, _rx) = ChannelConnection::new();
        let record = TaskRecord::new(key.clone(), "open the settings", "acme/vision-1", 10);
        Arc::new(ActiveTask::new(key.clone(), conn, record))
    }

    #[tokio::test]
    async fn stop_does_not_wait_for_an_in_flight_write() {
        let key = TaskKey::new();
        let task = task(&key);

        let _writing = task.persist_lock.lock().await;
        let stopped = tokio::time::timeout(Duration::from_secs(1), task.request_stop()).await;
        assert_eq!(stopped.ok(), Some(true));
        assert!(task.stop_requested().await);
    }

    #[tokio::test]
    async fn concurrent_writes_leave_the_latest_record_on_disk() {
        let data = tempfile::tempdir().unwrap();
        let key = TaskKey::new();
        let task = task(&key);

        let writers: Vec<_> = (0..16u32)
            .map(|i| {
                let task = Arc::clone(&task);
                let dir = data.path().to_path_buf();
                tokio::spawn(async move {
                    task.record.lock().await.metadata.input_tokens_used += u64::from(i);
                    task.persist(&dir).await.unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let dir = task.record.lock().await.trace_dir(data.path());
        let stored = record::read_record(&dir).await.unwrap();
        assert_eq!(stored, *task.record.lock().await);
        assert_eq!(stored.metadata.input_tokens_used, (0..16).sum::<u64>());
    }
}
