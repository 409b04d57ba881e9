use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::llm::markup::sanitize_invoke_tags;
use crate::core::llm::{CallFormat, ChatMessage, TokenUsage, ToolCall};
use crate::core::tools::ToolResult;
use crate::core::version::AgentVersion;

/// Everything one run carries through the loop. Nothing about a run lives outside this.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    pub job_id: Option<String>,
    pub version: Arc<AgentVersion>,
    pub input: Value,
    pub trigger: Option<Value>,
    pub cancel: CancellationToken,
}

/// One persisted round: what the model said and what its tool calls returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub index: u32,
    pub format: CallFormat,
    /// Raw response text. For markup providers this still contains the invoke blocks.
    pub assistant_text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Same order as `tool_calls`.
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,
    pub usage: TokenUsage,
}

fn render_input(input: &Value) -> String {
    match input {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn render_markup_results(results: &[ToolResult]) -> String {
    let mut out = String::from("Tool results:\n");
    for r in results {
        let status = if r.success { "ok" } else { "error" };
        out.push_str(&format!(
            "[{}] {} ({}): {}\n",
            r.call_id,
            r.tool_name,
            status,
            sanitize_invoke_tags(&r.content())
        ));
    }
    out
}

/// Rebuild the model context from the pinned version, the run input and completed turns.
pub fn build_messages(
    version: &AgentVersion,
    format: CallFormat,
    markup_catalog: &str,
    input: &Value,
    turns: &[Turn],
) -> Vec<ChatMessage> {
    let mut system = version.config.instructions.clone();
    if format == CallFormat::Markup && !markup_catalog.is_empty() {
        system.push_str("\n\n");
        system.push_str(markup_catalog);
    }

    let mut user = render_input(input);
    if format == CallFormat::Markup {
        user = sanitize_invoke_tags(&user);
    }

    let mut messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
    for turn in turns {
        match turn.format {
            CallFormat::Function => {
                messages.push(ChatMessage::assistant(
                    turn.assistant_text.clone(),
                    turn.tool_calls.clone(),
                ));
                for result in &turn.tool_results {
                    messages.push(ChatMessage::tool(result.call_id.clone(), result.content()));
                }
            }
            CallFormat::Markup => {
                messages.push(ChatMessage::assistant(turn.assistant_text.clone(), Vec::new()));
                if !turn.tool_results.is_empty() {
                    messages.push(ChatMessage::user(render_markup_results(&turn.tool_results)));
                }
            }
        }
    }
    messages
}
