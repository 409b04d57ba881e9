use anyhow::{Result, anyhow};
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

use crate::core::orchestrator::is_terminal_status;
use crate::core::terminal::{GuideSection, print_error, print_info, print_success, status_style};
use crate::core::version::AgentConfig;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:17890";

/// Run a `version|run|trigger|event` command against a running `runloom serve`.
pub async fn run_client_command(args: &[String]) -> Result<()> {
    let api_url = parse_string_flag(args, "--api-url").unwrap_or_else(|| DEFAULT_API_URL.into());
    let plan = build_request_plan(args)?;
    let client = Client::new();
    let base = api_url.trim_end_matches('/');

    let body = send(&client, base, &plan).await?;
    if !report(&body) {
        return Ok(());
    }

    if plan.wait
        && let Some(run_id) = body.get("run_id").and_then(|v| v.as_str())
    {
        print_info(&format!("Waiting for run {} ...", run_id));
        let status_plan = RequestPlan::get(format!("/api/runs/{}", run_id));
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let view = send(&client, base, &status_plan).await?;
            let status = view["run"]["run"]["status"].as_str().unwrap_or("unknown");
            if is_terminal_status(status) {
                GuideSection::new("Run finished")
                    .status("Status", &status_style(status).to_string())
                    .text(&serde_json::to_string_pretty(&view["run"]["run"])?)
                    .print();
                println!();
                break;
            }
        }
        return Ok(());
    }

    GuideSection::new("Response")
        .text(&serde_json::to_string_pretty(&body)?)
        .print();
    println!();
    Ok(())
}

async fn send(client: &Client, base: &str, plan: &RequestPlan) -> Result<Value> {
    let url = format!("{}{}", base, plan.path);
    let request = match plan.method {
        HttpMethod::Get => client.get(&url),
        HttpMethod::Post => client.post(&url),
        HttpMethod::Delete => client.delete(&url),
    };
    let request = match &plan.body {
        Some(body) => request.json(body),
        None => request,
    };
    let resp = request
        .send()
        .await
        .map_err(|e| anyhow!("cannot reach runloom at {} ({}). Is `runloom serve` running?", base, e))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(anyhow!("request failed with status {}", status));
    }
    Ok(resp.json::<Value>().await?)
}

fn report(body: &Value) -> bool {
    let ok = body.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
    if ok {
        print_success("request completed");
    } else {
        print_error(
            body.get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("request failed"),
        );
    }
    ok
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpMethod {
    Get,
    Post,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
struct RequestPlan {
    method: HttpMethod,
    path: String,
    body: Option<Value>,
    wait: bool,
}

impl RequestPlan {
    fn get(path: String) -> Self {
        Self {
            method: HttpMethod::Get,
            path,
            body: None,
            wait: false,
        }
    }

    fn post(path: String, body: Option<Value>) -> Self {
        Self {
            method: HttpMethod::Post,
            path,
            body,
            wait: false,
        }
    }

    fn delete(path: String) -> Self {
        Self {
            method: HttpMethod::Delete,
            path,
            body: None,
            wait: false,
        }
    }
}

const VALUE_FLAGS: &[&str] = &["--api-url", "--json", "--input", "--limit"];

fn parse_string_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Arguments after `<group>` (and `<action>` when the group has one), minus flags.
fn positional_args(args: &[String], start: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut i = start;
    while i < args.len() {
        let arg = args[i].as_str();
        if VALUE_FLAGS.contains(&arg) {
            i += 2;
        } else if arg.starts_with("--") {
            i += 1;
        } else {
            out.push(args[i].clone());
            i += 1;
        }
    }
    out
}

fn parse_json_flag(args: &[String]) -> Result<Option<Value>> {
    match parse_string_flag(args, "--json") {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| anyhow!("invalid JSON for --json payload: {}", e)),
        None => Ok(None),
    }
}

/// `--input` accepts JSON; anything that does not parse is sent as a plain string.
fn parse_input(args: &[String]) -> Value {
    match parse_string_flag(args, "--input") {
        Some(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        None => Value::Null,
    }
}

fn required(positional: &[String], index: usize, usage: &str) -> Result<String> {
    positional
        .get(index)
        .cloned()
        .ok_or_else(|| anyhow!("Usage: runloom {}", usage))
}

fn build_request_plan(args: &[String]) -> Result<RequestPlan> {
    let group = args
        .get(1)
        .map(|s| s.to_lowercase())
        .ok_or_else(|| anyhow!("missing command"))?;

    if group == "event" {
        let positional = positional_args(args, 2);
        let source = required(&positional, 0, "event <source> --json <payload>")?;
        let payload = parse_json_flag(args)?.unwrap_or_else(|| json!({}));
        return Ok(RequestPlan::post(format!("/api/events/{}", source), Some(payload)));
    }

    let action = args
        .get(2)
        .map(|s| s.to_lowercase())
        .ok_or_else(|| anyhow!("Usage: runloom {} <action>", group))?;
    let positional = positional_args(args, 3);

    match group.as_str() {
        "version" | "versions" => match action.as_str() {
            "publish" => {
                let agent_id = required(&positional, 0, "version publish <agent_id> <config.toml>")?;
                let path = required(&positional, 1, "version publish <agent_id> <config.toml>")?;
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow!("cannot read {}: {}", path, e))?;
                let config = AgentConfig::from_toml_str(&content)?;
                config.validate()?;
                Ok(RequestPlan::post(
                    "/api/versions".into(),
                    Some(json!({ "agent_id": agent_id, "config": config })),
                ))
            }
            "get" | "show" => {
                let version_id = required(&positional, 0, "version get <version_id>")?;
                Ok(RequestPlan::get(format!("/api/versions/{}", version_id)))
            }
            "list" | "ls" => {
                let agent_id = required(&positional, 0, "version list <agent_id>")?;
                Ok(RequestPlan::get(format!("/api/agents/{}/versions", agent_id)))
            }
            "latest" => {
                let agent_id = required(&positional, 0, "version latest <agent_id>")?;
                Ok(RequestPlan::get(format!("/api/agents/{}/versions/latest", agent_id)))
            }
            _ => Err(anyhow!("Unsupported version action '{}'", action)),
        },
        "run" | "runs" => match action.as_str() {
            "submit" | "start" => {
                let version_id = required(&positional, 0, "run submit <version_id> [--input <json>] [--wait]")?;
                let mut plan = RequestPlan::post(
                    "/api/runs".into(),
                    Some(json!({ "version_id": version_id, "input": parse_input(args) })),
                );
                plan.wait = has_flag(args, "--wait");
                Ok(plan)
            }
            "status" | "get" => {
                let run_id = required(&positional, 0, "run status <run_id>")?;
                Ok(RequestPlan::get(format!("/api/runs/{}", run_id)))
            }
            "list" | "ls" => {
                let limit = parse_string_flag(args, "--limit")
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(20);
                Ok(RequestPlan::get(format!("/api/runs?limit={}", limit)))
            }
            "cancel" => {
                let run_id = required(&positional, 0, "run cancel <run_id>")?;
                Ok(RequestPlan::post(format!("/api/runs/{}/cancel", run_id), None))
            }
            _ => Err(anyhow!("Unsupported run action '{}'", action)),
        },
        "trigger" | "triggers" => match action.as_str() {
            "list" | "ls" => Ok(RequestPlan::get("/api/triggers".into())),
            "create" | "add" => {
                let body = parse_json_flag(args)?
                    .ok_or_else(|| anyhow!("trigger create requires --json payload"))?;
                if !body.is_object() {
                    return Err(anyhow!("--json payload must be a JSON object"));
                }
                Ok(RequestPlan::post("/api/triggers".into(), Some(body)))
            }
            "delete" | "remove" | "rm" => {
                let trigger_id = required(&positional, 0, "trigger delete <trigger_id>")?;
                Ok(RequestPlan::delete(format!("/api/triggers/{}", trigger_id)))
            }
            "fire" => {
                let trigger_id = required(&positional, 0, "trigger fire <trigger_id>")?;
                Ok(RequestPlan::post(format!("/api/triggers/{}/fire", trigger_id), None))
            }
            "fires" | "history" => {
                let trigger_id = required(&positional, 0, "trigger fires <trigger_id>")?;
                Ok(RequestPlan::get(format!("/api/triggers/{}/fires", trigger_id)))
            }
            _ => Err(anyhow!("Unsupported trigger action '{}'", action)),
        },
        _ => Err(anyhow!("Unknown command '{}'", group)),
    }
}
