//! Deterministic provider used by tests: replays a fixed list of responses.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{CallFormat, ModelProvider, ModelRequest, ModelResponse, ToolCall};
use crate::core::error::ProviderError;

pub enum Step {
    Respond(ModelResponse),
    Fail(ProviderError),
    /// Sleep before answering, to exercise timeouts and cancellation.
    Delay(Duration, ModelResponse),
    /// Cancel the token, then answer anyway: cancellation lands while the reply is in flight.
    CancelThen(CancellationToken, ModelResponse),
}

pub struct ScriptedProvider {
    id: String,
    format: CallFormat,
    steps: Mutex<VecDeque<Step>>,
    /// Used once the script runs out.
    fallback: Option<ModelResponse>,
    pub requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedProvider {
    pub fn new(format: CallFormat, steps: Vec<Step>) -> Self {
        Self {
            id: "scripted".to_string(),
            format,
            steps: Mutex::new(steps.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, response: ModelResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

pub fn text(body: &str) -> ModelResponse {
    ModelResponse {
        text: body.to_string(),
        tool_calls: Vec::new(),
        usage: None,
    }
}

pub fn calls(calls: Vec<(&str, &str, serde_json::Value)>) -> ModelResponse {
    ModelResponse {
        text: String::new(),
        tool_calls: calls
            .into_iter()
            .map(|(id, name, arguments)| ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
                format: CallFormat::Function,
                turn: 0,
            })
            .collect(),
        usage: None,
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn call_format(&self) -> CallFormat {
        self.format
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request.clone());
        }
        let step = self.steps.lock().ok().and_then(|mut s| s.pop_front());
        match step {
            Some(Step::Respond(r)) => Ok(r),
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Delay(d, r)) => {
                tokio::time::sleep(d).await;
                Ok(r)
            }
            Some(Step::CancelThen(token, r)) => {
                token.cancel();
                Ok(r)
            }
            None => self
                .fallback
                .clone()
                .ok_or_else(|| ProviderError::Fatal("script exhausted".into())),
        }
    }
}
