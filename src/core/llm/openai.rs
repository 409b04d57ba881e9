use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use super::{
    CallFormat, ChatMessage, FunctionTool, ModelProvider, ModelRequest, ModelResponse, TokenUsage,
    ToolCall,
};
use crate::config::ProviderEndpoint;
use crate::core::error::ProviderError;

// ── OpenAI-compatible request/response ──

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Serialize)]
struct WireTool<'a> {
    r#type: &'static str,
    function: WireFunctionDef<'a>,
}

#[derive(Serialize)]
struct WireFunctionDef<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Provider speaking the OpenAI chat-completions dialect (OpenAI, OpenRouter, vLLM, Ollama...).
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    native_tools: bool,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new(id: &str, base_url: &str, api_key: Option<String>, native_tools: bool) -> Self {
        Self {
            id: id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            native_tools,
            client: Client::new(),
        }
    }

    pub fn from_endpoint(endpoint: &ProviderEndpoint) -> Self {
        let api_key = endpoint
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.trim().is_empty());
        if endpoint.api_key_env.is_some() && api_key.is_none() {
            warn!(
                "Provider [{}]: API key variable {:?} is unset",
                endpoint.id, endpoint.api_key_env
            );
        }
        Self::new(
            &endpoint.id,
            &endpoint.base_url,
            api_key,
            endpoint.native_tools,
        )
    }

    fn build_body<'a>(&self, request: &'a ModelRequest) -> ChatRequest<'a> {
        let messages = request.messages.iter().map(wire_message).collect();
        let tools = if self.native_tools {
            request.tools.iter().map(wire_tool).collect()
        } else {
            Vec::new()
        };
        ChatRequest {
            model: &request.model,
            messages,
            tools,
            temperature: request.temperature,
        }
    }
}

fn wire_message(m: &ChatMessage) -> WireMessage<'_> {
    WireMessage {
        role: &m.role,
        content: &m.content,
        tool_calls: m
            .tool_calls
            .iter()
            .filter(|c| c.format == CallFormat::Function)
            .map(|c| WireToolCall {
                id: c.id.clone(),
                r#type: function_type(),
                function: WireFunctionCall {
                    name: c.name.clone(),
                    arguments: c.arguments.to_string(),
                },
            })
            .collect(),
        tool_call_id: m.tool_call_id.as_deref(),
    }
}

fn wire_tool(t: &FunctionTool) -> WireTool<'_> {
    WireTool {
        r#type: "function",
        function: WireFunctionDef {
            name: &t.name,
            description: &t.description,
            parameters: &t.parameters,
        },
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn classify_status(status: StatusCode, body: String, retry_after: Option<Duration>) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::RateLimited { retry_after }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ProviderError::Transient(format!("{}: {}", status, body))
    } else {
        ProviderError::Fatal(format!("{}: {}", status, body))
    }
}

fn into_response(parsed: ChatResponse) -> ModelResponse {
    let usage = parsed.usage.map(|u| TokenUsage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        estimated: false,
    });
    let Some(choice) = parsed.choices.into_iter().next() else {
        return ModelResponse {
            usage,
            ..Default::default()
        };
    };
    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|c| ToolCall {
            id: c.id,
            arguments: serde_json::from_str(&c.function.arguments)
                .unwrap_or(serde_json::Value::String(c.function.arguments)),
            name: c.function.name,
            format: CallFormat::Function,
            turn: 0,
        })
        .collect();
    ModelResponse {
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage,
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn call_format(&self) -> CallFormat {
        if self.native_tools {
            CallFormat::Function
        } else {
            CallFormat::Markup
        }
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        let body = self.build_body(request);
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let res = req
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(res.headers());
            let body = res.text().await.unwrap_or_default();
            return Err(classify_status(status, body, retry_after));
        }
        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("malformed response: {}", e)))?;
        Ok(into_response(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn native_tools_are_serialized_and_markup_mode_omits_them() {
        let request = ModelRequest {
            model: "gpt-test".into(),
            temperature: Some(0.2),
            messages: vec![
                ChatMessage::system("sys"),
                ChatMessage::assistant(
                    "",
                    vec![ToolCall {
                        id: "c1".into(),
                        name: "search".into(),
                        arguments: json!({"q": "x"}),
                        format: CallFormat::Function,
                        turn: 0,
                    }],
                ),
                ChatMessage::tool("c1", "{\"hits\":1}"),
            ],
            tools: vec![FunctionTool {
                name: "search".into(),
                description: "Search".into(),
                parameters: json!({"type": "object"}),
            }],
        };

        let native = OpenAiCompatProvider::new("p", "http://localhost/v1/", None, true);
        let body = serde_json::to_value(native.build_body(&request)).unwrap();
        assert_eq!(body["tools"][0]["function"]["name"], "search");
        assert_eq!(body["messages"][1]["tool_calls"][0]["function"]["arguments"], "{\"q\":\"x\"}");
        assert_eq!(body["messages"][2]["tool_call_id"], "c1");
        assert_eq!(native.base_url, "http://localhost/v1");

        let markup = OpenAiCompatProvider::new("p", "http://localhost/v1", None, false);
        let body = serde_json::to_value(markup.build_body(&request)).unwrap();
        assert!(body.get("tools").is_none());
        assert_eq!(markup.call_format(), CallFormat::Markup);
    }

    #[test]
    fn response_tool_calls_and_usage_are_decoded() {
        let parsed: ChatResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        {"id": "a", "type": "function", "function": {"name": "search", "arguments": "{\"q\":\"rust\"}"}},
                        {"id": "b", "type": "function", "function": {"name": "broken", "arguments": "{not json"}}
                    ]
                }
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        }))
        .unwrap();
        let resp = into_response(parsed);
        assert_eq!(resp.text, "");
        assert_eq!(resp.tool_calls[0].arguments, json!({"q": "rust"}));
        assert_eq!(resp.tool_calls[1].arguments, json!("{not json"));
        assert_eq!(resp.usage.unwrap().input_tokens, 12);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new(), Some(Duration::from_secs(2))),
            ProviderError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(2)
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new(), None).is_retryable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, String::new(), None).is_retryable());
    }
}
