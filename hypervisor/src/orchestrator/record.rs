//! In-memory task record and its on-disk trace directory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::{AgentStep, AgentTrace, TaskKey, TraceMetadata};
use tokio::fs;

use crate::error::TaskError;

pub const TASKS_FILE: &str = "tasks.json";

/// Directory name for a task's artifacts. Model ids may contain `/`.
pub fn trace_dir_name(key: &TaskKey, model_id: &str) -> String {
    format!("trace-{key}-{}", model_id.replace('/', "-"))
}

/// The persisted form is the record itself; step images hold the screenshot
/// file name, never pixel data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    #[serde(rename = "message_id")]
    pub key: TaskKey,
    pub instruction: String,
    pub model_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub steps: Vec<AgentStep>,
    #[serde(rename = "traceMetadata", default)]
    pub metadata: TraceMetadata,
}

impl TaskRecord {
    pub fn new(
        key: TaskKey,
        instruction: impl Into<String>,
        model_id: impl Into<String>,
        max_steps: u32,
    ) -> Self {
        let metadata = TraceMetadata {
            trace_id: key.to_string(),
            max_steps,
            ..Default::default()
        };
        Self {
            key,
            instruction: instruction.into(),
            model_id: model_id.into(),
            timestamp: Utc::now(),
            steps: Vec::new(),
            metadata,
        }
    }

    pub fn trace_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(trace_dir_name(&self.key, &self.model_id))
    }

    /// Append the next step and fold its usage into the aggregate metadata.
    /// Refused once the record is completed.
    pub fn push_step(&mut self, step: AgentStep) -> Result<(), TaskError> {
        if self.metadata.completed {
            return Err(TaskError::InvalidStep(format!(
                "task {} is completed; step {} dropped",
                self.key, step.step_id
            )));
        }
        let expected = self.steps.len() as u32 + 1;
        if step.step_id != expected {
            return Err(TaskError::InvalidStep(format!(
                "expected step {expected}, got {}",
                step.step_id
            )));
        }
        self.metadata.input_tokens_used += step.input_tokens_used;
        self.metadata.output_tokens_used += step.output_tokens_used;
        self.metadata.duration += step.duration;
        self.steps.push(step);
        self.metadata.number_of_steps = self.steps.len() as u32;
        Ok(())
    }

    /// Mutable access to a step by its 1-indexed id.
    pub fn step_mut(&mut self, step_id: u32) -> Result<&mut AgentStep, TaskError> {
        let index = step_id
            .checked_sub(1)
            .ok_or_else(|| TaskError::InvalidStep(format!("step {step_id} not found")))?;
        self.steps
            .get_mut(index as usize)
            .ok_or_else(|| TaskError::InvalidStep(format!("step {step_id} not found")))
    }

    pub fn to_trace(&self, is_running: bool) -> AgentTrace {
        AgentTrace {
            id: self.key.clone(),
            timestamp: self.timestamp,
            instruction: self.instruction.clone(),
            model_id: self.model_id.clone(),
            is_running,
            steps: self.steps.clone(),
            trace_metadata: self.metadata.clone(),
        }
    }

    /// Write `tasks.json`, replacing the previous copy atomically.
    pub async fn persist(&self, data_dir: &Path) -> Result<PathBuf, TaskError> {
        let dir = self.trace_dir(data_dir);
        write_record(&dir, self).await?;
        Ok(dir)
    }
}

pub async fn write_record(dir: &Path, record: &TaskRecord) -> Result<(), TaskError> {
    fs::create_dir_all(dir).await?;
    let body = serde_json::to_vec_pretty(record)?;
    let tmp = dir.join(format!("{TASKS_FILE}.tmp"));
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, dir.join(TASKS_FILE)).await?;
    Ok(())
}

pub async fn read_record(dir: &Path) -> Result<TaskRecord, TaskError> {
    let path = dir.join(TASKS_FILE);
    let body = match fs::read(&path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TaskError::NotFound(key_from_dir(dir)))
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&body)?)
}

fn key_from_dir(dir: &Path) -> TaskKey {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    TaskKey::from(name.trim_start_matches("trace-"))
}

/// The trace directory for `key` under `data_dir`, whatever its model suffix.
pub async fn find_trace_dir(data_dir: &Path, key: &TaskKey) -> Result<PathBuf, TaskError> {
    let prefix = format!("trace-{key}-");
    let mut entries = match fs::read_dir(data_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TaskError::NotFound(key.clone()))
        }
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with(&prefix) && entry.file_type().await?.is_dir() {
            return Ok(entry.path());
        }
    }
    Err(TaskError::NotFound(key.clone()))
}

pub async fn save_screenshot(dir: &Path, file_name: &str, png: &[u8]) -> Result<(), TaskError> {
    fs::create_dir_all(dir).await?;
    fs::write(dir.join(file_name), png).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::StepEvaluation;

    fn step(key: &TaskKey, step_id: u32) -> AgentStep {
        AgentStep {
            trace_id: key.clone(),
            step_id,
            image: shared_types::screenshot_file_name(key, step_id),
            duration: 1.5,
            input_tokens_used: 100,
            output_tokens_used: 10,
            step_evaluation: StepEvaluation::Neutral,
            error: None,
            thought: Some("look".into()),
            actions: Vec::new(),
        }
    }

    #[test]
    fn dir_name_flattens_model_path() {
        let key = TaskKey::from("abc");
        assert_eq!(
            trace_dir_name(&key, "Qwen/Qwen2.5-VL-72B"),
            "trace-abc-Qwen-Qwen2.5-VL-72B"
        );
    }

    #[test]
    fn steps_are_sequential_and_aggregate_usage() {
        let key = TaskKey::from("k");
        let mut record = TaskRecord::new(key.clone(), "do it", "m", 5);
        record.push_step(step(&key, 1)).unwrap();
        assert!(matches!(record.push_step(step(&key, 3)), Err(TaskError::InvalidStep(_))));
        record.push_step(step(&key, 2)).unwrap();
        assert_eq!(record.metadata.number_of_steps, 2);
        assert_eq!(record.metadata.input_tokens_used, 200);
        assert_eq!(record.metadata.duration, 3.0);

        record.metadata.completed = true;
        assert!(record.push_step(step(&key, 3)).is_err());
        assert!(record.step_mut(0).is_err());
        assert!(record.step_mut(2).is_ok());
    }

    #[tokio::test]
    async fn persisted_record_can_be_found_and_reloaded() {
        let data = tempfile::tempdir().unwrap();
        let key = TaskKey::new();
        let mut record = TaskRecord::new(key.clone(), "find flights", "org/model", 30);
        record.push_step(step(&key, 1)).unwrap();
        let dir = record.persist(data.path()).await.unwrap();

        assert_eq!(find_trace_dir(data.path(), &key).await.unwrap(), dir);
        let loaded = read_record(&dir).await.unwrap();
        assert_eq!(loaded, record);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join(TASKS_FILE)).unwrap()).unwrap();
        assert_eq!(raw["message_id"], key.as_str());
        assert_eq!(raw["traceMetadata"]["maxSteps"], 30);
        assert_eq!(raw["steps"][0]["image"], format!("{key}-1.png"));
    }

    #[tokio::test]
    async fn missing_trace_is_not_found() {
        let data = tempfile::tempdir().unwrap();
        let key = TaskKey::new();
        assert!(matches!(
            find_trace_dir(data.path(), &key).await,
            Err(TaskError::NotFound(_))
        ));
        assert!(matches!(
            find_trace_dir(&data.path().join("absent"), &key).await,
            Err(TaskError::NotFound(_))
        ));
    }
}
