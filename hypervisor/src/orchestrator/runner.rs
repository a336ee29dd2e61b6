//! The per-task execution loop and its unconditional finalization.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use shared_types::{
    screenshot_file_name, AgentStartStatus, AgentStep, FinalState, ServerEvent, StepEvaluation,
};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::{record, ActiveTask, Orchestrator};
use crate::agent::StepRequest;
use crate::connection::deliver;
use crate::error::{RunError, StopReason};
use crate::sandbox::{Acquire, SandboxHandle, StreamOptions};

/// Per-run state that finalization needs regardless of where the loop ended.
#[derive(Default)]
struct RunProgress {
    stream_announced: bool,
}

impl Orchestrator {
    pub(super) async fn run_task(self: Arc<Self>, task: Arc<ActiveTask>) {
        let key = task.key.clone();
        let data_dir = self.settings.data_dir.clone();
        if let Err(e) = task.persist(&data_dir).await {
            warn!(task_key = %key, error = %e, "initial trace write failed");
        }

        let (progress_tx, progress_rx) = tokio::sync::oneshot::channel();
        let runner = {
            let this = Arc::clone(&self);
            let task = Arc::clone(&task);
            tokio::spawn(async move {
                let mut progress = RunProgress::default();
                let outcome = this.execute(&task, &mut progress).await;
                let _ = progress_tx.send(progress);
                outcome
            })
        };
        let outcome = match runner.await {
            Ok(outcome) => outcome,
            Err(join) => Err(RunError::Unexpected(anyhow::anyhow!(
                "execution loop aborted: {join}"
            ))),
        };
        let progress = progress_rx.await.unwrap_or_default();
        let stop_requested = task.stop_requested().await;

        let final_state = match outcome {
            Ok(()) => FinalState::Success,
            Err(RunError::CooperativeStop(reason)) => {
                info!(task_key = %key, ?reason, "run stopped at step boundary");
                RunError::CooperativeStop(reason).final_state()
            }
            Err(e) if stop_requested && !matches!(e, RunError::ExternalTimeout(_)) => {
                debug!(task_key = %key, error = %e, "failure after stop request");
                FinalState::Stopped
            }
            Err(e) => {
                let state = e.final_state();
                error!(task_key = %key, error = ?e, final_state = %state, "run failed");
                if state == FinalState::Error {
                    deliver(
                        task.connection.as_ref(),
                        ServerEvent::AgentError {
                            error: "Error processing task".to_string(),
                        },
                    )
                    .await;
                }
                state
            }
        };

        self.finalize(&task, final_state, progress).await;
    }

    async fn execute(&self, task: &ActiveTask, progress: &mut RunProgress) -> Result<(), RunError> {
        let key = &task.key;
        let conn = task.connection.as_ref();
        let (instruction, model_id, start_trace) = {
            let record = task.record.lock().await;
            (
                record.instruction.clone(),
                record.model_id.clone(),
                record.to_trace(true),
            )
        };
        deliver(
            conn,
            ServerEvent::AgentStart {
                agent_trace: start_trace,
                status: AgentStartStatus::Success,
            },
        )
        .await;

        let sandbox = self.acquire_ready(task).await?;

        let vnc_url = sandbox.stream_url(&StreamOptions::view_only()).await?;
        deliver(conn, ServerEvent::VncUrlSet { vnc_url }).await;
        progress.stream_announced = true;

        let trace_dir = task.record.lock().await.trace_dir(&self.settings.data_dir);
        let max_steps = self.settings.max_steps;
        let mut screenshot = sandbox.capture_screenshot().await?;

        for step_number in 1u32.. {
            self.checkpoint(task, step_number).await?;

            let history = task.record.lock().await.steps.clone();
            let output = self
                .steps
                .next_step(StepRequest {
                    key,
                    instruction: &instruction,
                    model_id: &model_id,
                    step_number,
                    max_steps,
                    screenshot: &screenshot,
                    history: &history,
                    sandbox: sandbox.as_ref(),
                })
                .await?;

            sleep(self.settings.step_settle_delay).await;

            let file_name = screenshot_file_name(key, step_number);
            if let Err(e) = record::save_screenshot(&trace_dir, &file_name, &screenshot).await {
                warn!(task_key = %key, step = step_number, error = %e, "screenshot save failed");
            }

            let step = AgentStep {
                trace_id: key.clone(),
                step_id: step_number,
                image: file_name,
                duration: output.duration,
                input_tokens_used: output.input_tokens,
                output_tokens_used: output.output_tokens,
                step_evaluation: StepEvaluation::Neutral,
                error: output.error.clone(),
                thought: output.thought.clone(),
                actions: output.actions.clone(),
            };

            let metadata = {
                let mut record = task.record.lock().await;
                if record.push_step(step.clone()).is_err() {
                    return Err(RunError::CooperativeStop(StopReason::Requested));
                }
                record.metadata.clone()
            };
            if let Err(e) = task.persist(&self.settings.data_dir).await {
                warn!(task_key = %key, step = step_number, error = %e, "trace write failed");
            }
            info!(
                task_key = %key,
                step = step_number,
                actions = step.actions.len(),
                is_final = output.is_final,
                "step completed"
            );

            let mut wire_step = step;
            wire_step.image = format!("data:image/png;base64,{}", BASE64.encode(&screenshot));
            deliver(
                conn,
                ServerEvent::AgentProgress {
                    agent_step: wire_step,
                    trace_metadata: metadata,
                },
            )
            .await;

            if task.stop_requested().await {
                return Err(RunError::CooperativeStop(StopReason::Requested));
            }
            if output.is_final {
                return Ok(());
            }
            if step_number >= max_steps {
                return Err(RunError::CooperativeStop(StopReason::StepLimit));
            }

            // Only the latest screenshot is kept in memory.
            screenshot = sandbox.capture_screenshot().await?;
        }
        Ok(())
    }

    /// Step-boundary check: the step ceiling and the completed flag.
    async fn checkpoint(&self, task: &ActiveTask, step_number: u32) -> Result<(), RunError> {
        if step_number > self.settings.max_steps {
            return Err(RunError::CooperativeStop(StopReason::StepLimit));
        }
        if task.stop_requested().await {
            return Err(RunError::CooperativeStop(StopReason::Requested));
        }
        Ok(())
    }

    /// Poll the pool until the task's sandbox is Ready. Bounded by the
    /// attempt count and by the acquisition deadline, whichever comes first.
    async fn acquire_ready(&self, task: &ActiveTask) -> Result<Arc<dyn SandboxHandle>, RunError> {
        let key = &task.key;
        let attempts = self.settings.acquire_attempts.max(1);
        let deadline = Instant::now() + self.settings.acquire_deadline;
        for attempt in 1..=attempts {
            if task.stop_requested().await {
                return Err(RunError::CooperativeStop(StopReason::Requested));
            }
            match self.pool.acquire(key).await {
                Acquire::Ready(handle) => {
                    info!(task_key = %key, attempt, sandbox_id = handle.id(), "sandbox ready");
                    return Ok(handle);
                }
                Acquire::CapacityExceeded => {
                    return Err(RunError::Provisioning(
                        "No sandbox available: pool limit reached".to_string(),
                    ));
                }
                Acquire::Creating => {
                    debug!(task_key = %key, attempt, "sandbox still creating");
                }
            }
            if attempt == attempts || Instant::now() + self.settings.acquire_delay > deadline {
                break;
            }
            sleep(self.settings.acquire_delay).await;
        }
        Err(RunError::Provisioning(format!(
            "sandbox for {key} not ready after {attempts} attempts"
        )))
    }

    /// Runs however the loop ended: report, persist, deregister, release.
    async fn finalize(&self, task: &ActiveTask, final_state: FinalState, progress: RunProgress) {
        let key = &task.key;
        let metadata = {
            let mut record = task.record.lock().await;
            record.metadata.final_state = Some(final_state);
            record.metadata.completed = true;
            record.metadata.clone()
        };

        let conn = task.connection.as_ref();
        if conn.is_open() {
            deliver(
                conn,
                ServerEvent::AgentComplete {
                    trace_metadata: metadata,
                    final_state,
                },
            )
            .await;
            if progress.stream_announced {
                deliver(conn, ServerEvent::VncUrlUnset).await;
            }
        }

        if let Err(e) = task.persist(&self.settings.data_dir).await {
            error!(task_key = %key, error = %e, "final trace write failed");
        }

        self.tasks.lock().await.remove(key);
        self.sessions.unbind(key).await;
        self.publish_live_tasks().await;
        self.pool.release(key).await;
        info!(task_key = %key, final_state = %final_state, "task finalized");
    }
}
