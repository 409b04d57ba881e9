pub mod markup;
pub mod openai;
#[cfg(test)]
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::ProviderEndpoint;
use crate::core::error::ProviderError;

/// How tool calls travel between us and the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallFormat {
    /// Native function calling with JSON-schema tool definitions.
    Function,
    /// `<invoke name="...">...</invoke>` blocks embedded in the response text.
    Markup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub format: CallFormat,
    #[serde(default)]
    pub turn: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// Tool definition handed to function-calling providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionTool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub temperature: Option<f32>,
    pub messages: Vec<ChatMessage>,
    /// Empty for markup providers; their schemas live in the system prompt.
    pub tools: Vec<FunctionTool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub text: String,
    /// Native tool calls. Markup providers leave this empty and embed calls in `text`.
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn id(&self) -> &str;

    fn call_format(&self) -> CallFormat;

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError>;
}

fn estimate_tokens_from_chars(char_count: usize) -> u64 {
    (char_count as u64).div_ceil(4)
}

/// Rough usage for providers that do not report it: one token per four characters.
pub fn estimate_usage(messages: &[ChatMessage], response_text: &str) -> TokenUsage {
    let input_chars = messages.iter().map(|m| m.content.chars().count()).sum();
    TokenUsage {
        input_tokens: estimate_tokens_from_chars(input_chars),
        output_tokens: estimate_tokens_from_chars(response_text.chars().count()),
        estimated: true,
    }
}

/// Split a response into prose and tool calls according to the provider's call format.
pub fn extract_tool_calls(
    format: CallFormat,
    response: &ModelResponse,
    turn: u32,
) -> (String, Vec<ToolCall>) {
    let (text, mut calls) = match format {
        CallFormat::Function => (response.text.clone(), response.tool_calls.clone()),
        CallFormat::Markup => markup::parse_invocations(&response.text, turn),
    };

    // Call ids must be unique within the turn; providers occasionally repeat or omit them.
    let mut seen = std::collections::HashSet::new();
    for (idx, call) in calls.iter_mut().enumerate() {
        call.turn = turn;
        call.format = format;
        if call.id.trim().is_empty() || !seen.insert(call.id.clone()) {
            let mut fresh = format!("call_{}_{}", turn, idx);
            let mut bump = 0;
            while seen.contains(&fresh) {
                bump += 1;
                fresh = format!("call_{}_{}_{}", turn, idx, bump);
            }
            seen.insert(fresh.clone());
            call.id = fresh;
        }
    }
    (text, calls)
}

/// Name-keyed set of model providers. A version's `model.provider` selects the entry.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        info!(
            "Registered model provider: {} ({:?})",
            provider.id(),
            provider.call_format()
        );
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn from_endpoints(endpoints: &[ProviderEndpoint]) -> Self {
        let mut registry = Self::new();
        for endpoint in endpoints {
            registry.register(Arc::new(openai::OpenAiCompatProvider::from_endpoint(endpoint)));
        }
        registry
    }
}
