//! User feedback on steps and whole traces, applied to the live record when
//! the task is running and to its `tasks.json` otherwise.

use shared_types::{AgentStep, StepEvaluation, TaskKey, TraceMetadata, UserEvaluation};
use tracing::info;

use super::{record, Orchestrator};
use crate::error::TaskError;

impl Orchestrator {
    pub async fn update_step_evaluation(
        &self,
        key: &TaskKey,
        step_id: u32,
        evaluation: StepEvaluation,
    ) -> Result<AgentStep, TaskError> {
        let data_dir = &self.settings.data_dir;
        let active = self.tasks.lock().await.get(key).cloned();
        let step = match active {
            Some(task) => {
                let step = {
                    let mut record = task.record.lock().await;
                    let step = record.step_mut(step_id)?;
                    step.step_evaluation = evaluation;
                    step.clone()
                };
                task.persist(data_dir).await?;
                step
            }
            None => {
                let dir = record::find_trace_dir(data_dir, key).await?;
                let mut stored = record::read_record(&dir).await?;
                let step = stored.step_mut(step_id)?;
                step.step_evaluation = evaluation;
                let step = step.clone();
                record::write_record(&dir, &stored).await?;
                step
            }
        };
        info!(task_key = %key, step = step_id, ?evaluation, "step evaluation updated");
        Ok(step)
    }

    pub async fn update_trace_evaluation(
        &self,
        key: &TaskKey,
        evaluation: UserEvaluation,
    ) -> Result<TraceMetadata, TaskError> {
        let data_dir = &self.settings.data_dir;
        let active = self.tasks.lock().await.get(key).cloned();
        let metadata = match active {
            Some(task) => {
                let metadata = {
                    let mut record = task.record.lock().await;
                    record.metadata.user_evaluation = evaluation;
                    record.metadata.clone()
                };
                task.persist(data_dir).await?;
                metadata
            }
            None => {
                let dir = record::find_trace_dir(data_dir, key).await?;
                let mut stored = record::read_record(&dir).await?;
                stored.metadata.user_evaluation = evaluation;
                record::write_record(&dir, &stored).await?;
                stored.metadata
            }
        };
        info!(task_key = %key, ?evaluation, "trace evaluation updated");
        Ok(metadata)
    }
}
