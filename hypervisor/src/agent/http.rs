//! Step provider backed by a remote model endpoint. The endpoint chooses the
//! actions; this side executes them on the sandbox.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use shared_types::AgentAction;
use tracing::{debug, warn};

use super::{actions, StepError, StepOutput, StepProvider, StepRequest};

const STEP_LIMIT_STATUS: &str = "step_limit_exceeded";

pub struct HttpStepProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpStepProvider {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StepPayload<'a> {
    trace_id: &'a str,
    instruction: &'a str,
    model_id: &'a str,
    step_number: u32,
    max_steps: u32,
    /// Base64 PNG.
    screenshot: String,
    history: Vec<HistoryEntry<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry<'a> {
    step_id: u32,
    thought: Option<&'a str>,
    actions: Vec<&'a str>,
    error: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepReply {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    thought: Option<String>,
    #[serde(default)]
    actions: Vec<ReplyAction>,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ReplyAction {
    function_name: String,
    #[serde(default)]
    parameters: serde_json::Map<String, serde_json::Value>,
}

impl StepReply {
    fn into_actions(self) -> (StepMeta, Vec<AgentAction>) {
        let actions = self
            .actions
            .into_iter()
            .map(|a| AgentAction::new(a.function_name, a.parameters))
            .collect();
        (
            StepMeta {
                thought: self.thought,
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
                done: self.done,
                error: self.error,
            },
            actions,
        )
    }
}

struct StepMeta {
    thought: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
    done: bool,
    error: Option<String>,
}

#[async_trait]
impl StepProvider for HttpStepProvider {
    async fn next_step(&self, request: StepRequest<'_>) -> Result<StepOutput, StepError> {
        let started = Instant::now();
        let payload = StepPayload {
            trace_id: request.key.as_str(),
            instruction: request.instruction,
            model_id: request.model_id,
            step_number: request.step_number,
            max_steps: request.max_steps,
            screenshot: BASE64.encode(request.screenshot),
            history: request
                .history
                .iter()
                .map(|step| HistoryEntry {
                    step_id: step.step_id,
                    thought: step.thought.as_deref(),
                    actions: step.actions.iter().map(|a| a.description.as_str()).collect(),
                    error: step.error.as_deref(),
                })
                .collect(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| StepError::Failed(format!("step request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(StepError::StepLimitExceeded);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(trace_id = %request.key, %status, "step endpoint returned an error");
            return Err(StepError::Failed(format!("step endpoint returned {status}: {body}")));
        }

        let reply: StepReply = response
            .json()
            .await
            .map_err(|e| StepError::Failed(format!("invalid step reply: {e}")))?;
        if reply.status.as_deref() == Some(STEP_LIMIT_STATUS) {
            return Err(StepError::StepLimitExceeded);
        }

        let (meta, actions) = reply.into_actions();
        debug!(
            trace_id = %request.key,
            step = request.step_number,
            actions = actions.len(),
            "executing step actions"
        );
        let action_error = actions::execute(request.sandbox, &actions).await?;
        let is_final = meta.done || actions.iter().any(|a| a.function_name == "final_answer");

        Ok(StepOutput {
            thought: meta.thought,
            actions,
            input_tokens: meta.input_tokens,
            output_tokens: meta.output_tokens,
            duration: started.elapsed().as_secs_f64(),
            error: meta.error.or(action_error),
            is_final,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_parses_step_limit_and_actions() {
        let reply: StepReply = serde_json::from_str(
            r#"{"status":"step_limit_exceeded"}"#,
        )
        .unwrap();
        assert_eq!(reply.status.as_deref(), Some(STEP_LIMIT_STATUS));

        let reply: StepReply = serde_json::from_str(
            r#"{"thought":"open the site","inputTokens":120,"outputTokens":8,
                "actions":[{"function_name":"open_url","parameters":{"url":"https://example.com"}}]}"#,
        )
        .unwrap();
        let (meta, actions) = reply.into_actions();
        assert_eq!(meta.input_tokens, 120);
        assert!(!meta.done);
        assert_eq!(actions[0].description, "Open: https://example.com");
    }
}
