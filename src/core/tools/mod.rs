pub mod builtin;
pub mod dispatcher;
pub mod schema;
pub mod script;

pub use dispatcher::{DispatchPolicy, DispatchScope, ToolDispatcher};
pub use schema::{MarkupSchema, ParamKind, ToolParam};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::error::{SandboxError, ToolError, ToolErrorKind};
use crate::core::llm::{CallFormat, FunctionTool, ToolCall};
use crate::core::sandbox::{ExecOutput, ExecRequest, SandboxLease, SandboxLimits};

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// What a handler sees of the run it serves.
pub struct ToolContext<'a> {
    pub run_id: &'a str,
    pub call_id: &'a str,
    /// Present iff the tool was registered as needing a sandbox.
    pub sandbox: Option<&'a SandboxLease>,
    pub cancel: &'a CancellationToken,
}

impl ToolContext<'_> {
    pub fn lease(&self) -> Result<&SandboxLease, ToolError> {
        self.sandbox
            .ok_or_else(|| ToolError::Handler("tool requires a sandbox but none was leased".into()))
    }

    /// Run a command in the leased session. Cancelling the run abandons the command, which kills
    /// its process; the dispatcher then destroys the session.
    pub async fn exec(&self, request: ExecRequest) -> Result<ExecOutput, ToolError> {
        let lease = self.lease()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ToolError::Sandbox(SandboxError::Cancelled)),
            out = lease.exec(request) => Ok(out?),
        }
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// `args` has already been validated against the tool's schema.
    async fn call(&self, args: Value, ctx: ToolContext<'_>) -> Result<Value, ToolError>;
}

/// A registered tool: both schema forms plus the handler that executes it.
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
    pub function_schema: Value,
    pub markup: MarkupSchema,
    validator: jsonschema::Validator,
    pub handler: Arc<dyn ToolHandler>,
    pub needs_sandbox: bool,
    /// Overrides the manager's default limits for this tool's sessions.
    pub limits: Option<SandboxLimits>,
    pub timeout: Duration,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("needs_sandbox", &self.needs_sandbox)
            .field("timeout", &self.timeout)
            .finish()
    }
}

pub struct ToolSpecBuilder {
    name: String,
    description: String,
    params: Vec<ToolParam>,
    needs_sandbox: bool,
    limits: Option<SandboxLimits>,
    timeout: Duration,
}

impl ToolSpecBuilder {
    pub fn param(mut self, param: ToolParam) -> Self {
        self.params.push(param);
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = ToolParam>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn sandboxed(mut self) -> Self {
        self.needs_sandbox = true;
        self
    }

    pub fn limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self, handler: Arc<dyn ToolHandler>) -> Result<ToolSpec> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("tool name is required"));
        }
        let function_schema = schema::function_schema(&self.params);
        let validator = jsonschema::Validator::new(&function_schema)
            .map_err(|e| anyhow!("invalid schema for tool '{}': {}", self.name, e))?;
        let markup = MarkupSchema::new(&self.name, &self.description, &self.params);
        Ok(ToolSpec {
            name: self.name,
            description: self.description,
            params: self.params,
            function_schema,
            markup,
            validator,
            handler,
            needs_sandbox: self.needs_sandbox,
            limits: self.limits,
            timeout: self.timeout,
        })
    }
}

impl ToolSpec {
    pub fn builder(name: &str, description: &str) -> ToolSpecBuilder {
        ToolSpecBuilder {
            name: name.to_string(),
            description: description.to_string(),
            params: Vec::new(),
            needs_sandbox: false,
            limits: None,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn function_tool(&self) -> FunctionTool {
        FunctionTool {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.function_schema.clone(),
        }
    }

    /// Validate a call's arguments against the schema form matching the call's encoding and
    /// return them as a named-argument object.
    pub fn prepare_args(&self, call: &ToolCall) -> Result<Value, ToolError> {
        let invalid = |reason: String| ToolError::Validation {
            tool: self.name.clone(),
            reason,
        };
        let args = match call.format {
            CallFormat::Markup => self.markup.bind(&call.arguments).map_err(invalid)?,
            CallFormat::Function => match &call.arguments {
                Value::Null => Value::Object(Default::default()),
                Value::Object(_) => call.arguments.clone(),
                Value::String(raw) => {
                    return Err(invalid(format!("arguments are not valid JSON: {}", raw)));
                }
                other => return Err(invalid(format!("arguments must be an object, got {}", other))),
            },
        };
        if !self.validator.is_valid(&args) {
            let errors: Vec<String> = self
                .validator
                .iter_errors(&args)
                .map(|e| e.to_string())
                .collect();
            return Err(invalid(errors.join("; ")));
        }
        Ok(args)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMeta {
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    pub attempts: u32,
}

/// Outcome of one tool call. Exactly one per dispatched call, success or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
    #[serde(default)]
    pub metadata: ToolResultMeta,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, output: Value, metadata: ToolResultMeta) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: true,
            output,
            error: None,
            error_kind: None,
            metadata,
        }
    }

    pub fn failed(call: &ToolCall, error: &ToolError, metadata: ToolResultMeta) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: false,
            output: Value::Null,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            metadata,
        }
    }

    /// Text placed in the tool message returned to the model.
    pub fn content(&self) -> String {
        if self.success {
            match &self.output {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }
        } else {
            serde_json::json!({
                "error": self.error,
                "kind": self.error_kind,
            })
            .to_string()
        }
    }
}

/// Name-keyed tool set built at startup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolSpec>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ToolSpec) {
        if self.tools.contains_key(&spec.name) {
            warn!("Tool '{}' registered twice; keeping the later one", spec.name);
        } else {
            info!("Registering tool: {}", spec.name);
        }
        self.tools.insert(spec.name.clone(), Arc::new(spec));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolSpec>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Function definitions for the enabled tools, in the version's order.
    pub fn function_tools(&self, enabled: &[String]) -> Vec<FunctionTool> {
        enabled
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|spec| spec.function_tool())
            .collect()
    }

    /// Markup catalog for the enabled tools, in the version's order.
    pub fn markup_catalog(&self, enabled: &[String]) -> String {
        let schemas: Vec<&MarkupSchema> = enabled
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|spec| &spec.markup)
            .collect();
        schema::render_catalog(&schemas)
    }

    /// Names in `enabled` with no registered tool.
    pub fn missing(&self, enabled: &[String]) -> Vec<String> {
        enabled
            .iter()
            .filter(|name| !self.tools.contains_key(*name))
            .cloned()
            .collect()
    }
}
