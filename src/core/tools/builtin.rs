use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

use super::{ParamKind, ToolContext, ToolHandler, ToolParam, ToolRegistry, ToolSpec};
use crate::core::error::ToolError;
use crate::core::sandbox::ExecRequest;

pub const EXECUTE_CODE: &str = "execute_code";

const LANGUAGES: &[&str] = &["python", "sh", "bash", "node"];

fn interpreter(language: &str) -> Option<&'static [&'static str]> {
    match language {
        "python" => Some(&["python3", "-"]),
        "sh" => Some(&["sh", "-s"]),
        "bash" => Some(&["bash", "-s"]),
        "node" => Some(&["node", "-"]),
        _ => None,
    }
}

/// Feeds source code to an interpreter inside the leased session. A non-zero exit is still a
/// successful call; the model reads the exit code and stderr.
pub struct ExecuteCode;

#[async_trait]
impl ToolHandler for ExecuteCode {
    async fn call(&self, args: Value, ctx: ToolContext<'_>) -> Result<Value, ToolError> {
        let language = args["language"].as_str().unwrap_or("python");
        let code = args["code"].as_str().unwrap_or_default();
        let Some(argv) = interpreter(language) else {
            return Err(ToolError::Validation {
                tool: EXECUTE_CODE.to_string(),
                reason: format!("unsupported language '{}'", language),
            });
        };

        let out = ctx
            .exec(ExecRequest::new(argv.iter().copied()).stdin(code.as_bytes()))
            .await?;
        Ok(json!({
            "exit_code": out.exit_code,
            "stdout": out.stdout,
            "stderr": out.stderr,
            "truncated": out.truncated,
        }))
    }
}

pub fn execute_code_spec() -> Result<ToolSpec> {
    ToolSpec::builder(
        EXECUTE_CODE,
        "Run a snippet of code in an isolated scratch environment and return its output.",
    )
    .param(
        ToolParam::required("language", ParamKind::String, "Interpreter to use").one_of(LANGUAGES),
    )
    .param(ToolParam::required("code", ParamKind::String, "Source code to run"))
    .sandboxed()
    .build(Arc::new(ExecuteCode))
}

pub fn register_builtins(registry: &mut ToolRegistry) -> Result<()> {
    registry.register(execute_code_spec()?);
    Ok(())
}
