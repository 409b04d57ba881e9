use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use super::{ToolContext, ToolHandler, ToolParam, ToolSpec};
use crate::core::error::ToolError;
use crate::core::sandbox::ExecRequest;

/// `manifest.toml` of a script tool directory.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptManifest {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub params: Vec<ToolParam>,
    /// Interpreter; ignored for `.wasm` entrypoints.
    #[serde(default = "default_run_command")]
    pub run_command: String,
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(skip)]
    pub tool_dir: PathBuf,
}

fn default_run_command() -> String {
    "sh".to_string()
}

fn default_entrypoint() -> String {
    "run.sh".to_string()
}

impl ScriptManifest {
    pub fn parse(content: &str, tool_dir: &Path) -> Result<Self> {
        let mut manifest: ScriptManifest = toml::from_str(content)?;
        if manifest.name.trim().is_empty() {
            return Err(anyhow!("manifest name is empty"));
        }
        manifest.tool_dir = tool_dir.to_path_buf();
        Ok(manifest)
    }

    fn entrypoint_path(&self) -> PathBuf {
        self.tool_dir.join(&self.entrypoint)
    }

    fn argv(&self) -> Vec<String> {
        let script = self.entrypoint_path().to_string_lossy().to_string();
        if self.entrypoint.ends_with(".wasm") {
            vec![script]
        } else {
            vec![self.run_command.clone(), script]
        }
    }

    pub fn into_spec(self) -> Result<ToolSpec> {
        if !self.entrypoint_path().exists() {
            return Err(anyhow!(
                "entrypoint not found at {:?}",
                self.entrypoint_path()
            ));
        }
        let mut builder = ToolSpec::builder(&self.name, &self.description)
            .params(self.params.clone())
            .sandboxed();
        if let Some(secs) = self.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        builder.build(Arc::new(ScriptTool { manifest: self }))
    }
}

/// Runs a script inside the leased session. Arguments arrive as JSON on stdin; stdout is the
/// result, parsed as JSON when it is JSON.
pub struct ScriptTool {
    manifest: ScriptManifest,
}

#[async_trait]
impl ToolHandler for ScriptTool {
    async fn call(&self, args: Value, ctx: ToolContext<'_>) -> Result<Value, ToolError> {
        let request = ExecRequest {
            argv: self.manifest.argv(),
            stdin: Some(args.to_string().into_bytes()),
            ..Default::default()
        }
        .env("RUNLOOM_TOOL", &self.manifest.name)
        .env("RUNLOOM_RUN_ID", ctx.run_id)
        .env("RUNLOOM_CALL_ID", ctx.call_id);

        let out = ctx.exec(request).await?;
        if !out.success() {
            let detail = if out.stderr.trim().is_empty() {
                out.stdout.trim()
            } else {
                out.stderr.trim()
            };
            return Err(ToolError::Handler(format!(
                "{} exited with code {}: {}",
                self.manifest.name, out.exit_code, detail
            )));
        }
        let trimmed = out.stdout.trim();
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
    }
}

/// Load every `<dir>/<tool>/manifest.toml`. Broken manifests are logged and skipped.
pub async fn load_tools_from_dir<P: AsRef<Path>>(dir_path: P) -> Result<Vec<ToolSpec>> {
    let dir = dir_path.as_ref();
    let mut specs = Vec::new();
    if !dir.exists() {
        return Ok(specs);
    }

    let mut entries = fs::read_dir(dir).await?;
    let mut tool_dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.is_dir() {
            tool_dirs.push(path);
        }
    }
    tool_dirs.sort();

    for tool_dir in tool_dirs {
        let manifest_path = tool_dir.join("manifest.toml");
        if !manifest_path.exists() {
            continue;
        }
        let content = match fs::read_to_string(&manifest_path).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read manifest at {:?}: {}", manifest_path, e);
                continue;
            }
        };
        match ScriptManifest::parse(&content, &tool_dir).and_then(ScriptManifest::into_spec) {
            Ok(spec) => specs.push(spec),
            Err(e) => warn!("Skipping tool at {:?}: {}", tool_dir, e),
        }
    }
    info!("Loaded {} script tool(s) from {:?}", specs.len(), dir);
    Ok(specs)
}
