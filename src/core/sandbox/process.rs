use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ExecOutput, ExecRequest, SandboxBackend, SandboxLimits, SessionEnv, cap_output};
use crate::config::ProcessNetwork;
use crate::core::error::SandboxError;

/// Applies the session's rlimits, then replaces itself with the requested program.
const LIMIT_WRAPPER: &str = r#"ulimit -t "$RUNLOOM_CPU_SECS" 2>/dev/null
ulimit -v "$RUNLOOM_MEM_KB" 2>/dev/null
ulimit -f "$RUNLOOM_FILE_BLOCKS" 2>/dev/null
exec "$@""#;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Prefix that moves the child into fresh user and network namespaces.
const UNSHARE_NET: &[&str] = &["unshare", "--user", "--map-root-user", "--net", "--"];

/// Host-process sandbox: each session is a scratch directory, each exec a child process with a
/// cleared environment, rlimits, and a wall-clock timeout. In isolated mode the child also gets
/// a private network namespace, so sessions have no network at all.
pub struct ProcessBackend {
    root: PathBuf,
    network: ProcessNetwork,
    can_isolate: bool,
    _temp: Option<tempfile::TempDir>,
}

impl ProcessBackend {
    pub fn new(root: Option<PathBuf>, network: ProcessNetwork) -> Result<Self> {
        let can_isolate = network == ProcessNetwork::Isolated && unshare_available();
        match network {
            ProcessNetwork::Isolated if !can_isolate => warn!(
                "Process sandbox: `unshare --net` is unusable here; sessions will be refused"
            ),
            ProcessNetwork::Isolated => debug!("Process sandbox: sessions get a private network namespace"),
            ProcessNetwork::Host => {
                warn!("Process sandbox: sessions share the host network; allowlists are not enforced")
            }
        }
        let (root, temp) = match root {
            Some(root) => {
                std::fs::create_dir_all(&root)?;
                (root, None)
            }
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("runloom-sandbox-")
                    .tempdir()?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };
        Ok(Self {
            root,
            network,
            can_isolate,
            _temp: temp,
        })
    }

    /// Refuse sessions whose network policy this host cannot honour.
    fn check_network(&self, limits: &SandboxLimits) -> Result<(), SandboxError> {
        if self.network == ProcessNetwork::Host {
            return Ok(());
        }
        if !limits.network_allowlist.is_empty() {
            return Err(SandboxError::Unsupported {
                backend: "process",
                what: format!(
                    "per-host network allowlist ({})",
                    limits.network_allowlist.join(", ")
                ),
            });
        }
        if !self.can_isolate {
            return Err(SandboxError::Unsupported {
                backend: "process",
                what: "network isolation (`unshare --net` is unavailable)".into(),
            });
        }
        Ok(())
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }
}

fn unshare_available() -> bool {
    std::process::Command::new(UNSHARE_NET[0])
        .args(&UNSHARE_NET[1..])
        .arg("true")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn limit_env(limits: &SandboxLimits) -> [(&'static str, String); 3] {
    [
        ("RUNLOOM_CPU_SECS", limits.cpu_secs.max(1).to_string()),
        ("RUNLOOM_MEM_KB", (limits.memory_mb.max(1) * 1024).to_string()),
        // ulimit -f counts 512-byte blocks.
        ("RUNLOOM_FILE_BLOCKS", (limits.disk_mb.max(1) * 2048).to_string()),
    ]
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn provision(
        &self,
        session_id: &str,
        limits: &SandboxLimits,
    ) -> Result<SessionEnv, SandboxError> {
        self.check_network(limits)?;
        let workdir = self.session_dir(session_id);
        tokio::fs::create_dir_all(workdir.join("tmp"))
            .await
            .map_err(|e| SandboxError::Provisioning(format!("{}: {}", workdir.display(), e)))?;
        Ok(SessionEnv {
            id: session_id.to_string(),
            workdir,
            limits: limits.clone(),
        })
    }

    async fn exec(&self, env: &SessionEnv, request: ExecRequest) -> Result<ExecOutput, SandboxError> {
        if request.argv.is_empty() {
            return Err(SandboxError::Crashed("empty command".into()));
        }
        if !env.workdir.exists() {
            return Err(SandboxError::Terminated(env.id.clone()));
        }

        let mut cmd = if self.network == ProcessNetwork::Isolated {
            let mut cmd = Command::new(UNSHARE_NET[0]);
            cmd.args(&UNSHARE_NET[1..]).arg("sh");
            cmd
        } else {
            Command::new("sh")
        };
        cmd.arg("-c")
            .arg(LIMIT_WRAPPER)
            .arg("runloom-sandbox")
            .args(&request.argv)
            .current_dir(&env.workdir)
            .env_clear()
            .env(
                "PATH",
                std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
            )
            .env("HOME", &env.workdir)
            .env("TMPDIR", env.workdir.join("tmp"))
            .env("LANG", "C.UTF-8");
        for (key, value) in limit_env(&env.limits) {
            cmd.env(key, value);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        cmd.stdin(if request.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Crashed(format!("spawn failed: {}", e)))?;

        if let Some(input) = request.stdin
            && let Some(mut stdin) = child.stdin.take()
        {
            if let Err(e) = stdin.write_all(&input).await {
                warn!("Sandbox [{}]: failed writing stdin: {}", env.id, e);
            }
            drop(stdin);
        }

        let output = match tokio::time::timeout(env.limits.timeout, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(SandboxError::Crashed(e.to_string())),
            // Dropping the future drops the child, which kills it.
            Err(_) => return Err(SandboxError::Timeout(env.limits.timeout)),
        };

        let Some(exit_code) = output.status.code() else {
            return Err(SandboxError::Crashed(format!(
                "process terminated by signal ({})",
                output.status
            )));
        };
        let cap = env.limits.max_output_bytes;
        let (stdout, out_cut) = cap_output(&output.stdout, cap);
        let (stderr, err_cut) = cap_output(&output.stderr, cap);
        debug!(
            "Sandbox [{}]: {} exited {} in {}ms",
            env.id,
            request.argv[0],
            exit_code,
            started.elapsed().as_millis()
        );
        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
            truncated: out_cut || err_cut,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn reset(&self, env: &SessionEnv) -> Result<(), SandboxError> {
        let _ = tokio::fs::remove_dir_all(&env.workdir).await;
        tokio::fs::create_dir_all(env.workdir.join("tmp"))
            .await
            .map_err(|e| SandboxError::Provisioning(e.to_string()))
    }

    async fn destroy(&self, env: &SessionEnv) {
        if let Err(e) = tokio::fs::remove_dir_all(&env.workdir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Sandbox [{}]: failed to remove scratch dir: {}", env.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits(timeout_ms: u64) -> SandboxLimits {
        SandboxLimits {
            timeout: Duration::from_millis(timeout_ms),
            max_output_bytes: 16,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn exec_runs_in_scratch_dir_with_cleared_env() {
        let root = tempfile::tempdir().unwrap();
        let backend =
            ProcessBackend::new(Some(root.path().to_path_buf()), ProcessNetwork::Host).unwrap();
        let env = backend.provision("s1", &limits(5_000)).await.unwrap();

        let out = backend
            .exec(
                &env,
                ExecRequest::new(["sh", "-c", "echo hi > f.txt; cat; echo ${SECRET:-unset}"])
                    .stdin("in|"),
            )
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "in|unset\n");
        assert!(env.workdir.join("f.txt").exists());

        backend.reset(&env).await.unwrap();
        assert!(!env.workdir.join("f.txt").exists());

        backend.destroy(&env).await;
        assert!(!env.workdir.exists());
    }

    #[tokio::test]
    async fn output_is_capped_and_timeouts_reported() {
        let backend = ProcessBackend::new(None, ProcessNetwork::Host).unwrap();
        let env = backend.provision("s2", &limits(300)).await.unwrap();

        let out = backend
            .exec(&env, ExecRequest::new(["sh", "-c", "printf 'aaaaaaaaaaaaaaaaaaaaaaaa'; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.len(), 16);
        assert!(out.truncated);

        let err = backend
            .exec(&env, ExecRequest::new(["sleep", "5"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }

    #[tokio::test]
    async fn isolated_mode_never_grants_more_network_than_asked() {
        let backend = ProcessBackend::new(None, ProcessNetwork::Isolated).unwrap();

        let allowlisted = SandboxLimits {
            network_allowlist: vec!["api.example.com".into()],
            ..limits(5_000)
        };
        let err = backend.provision("s3", &allowlisted).await.unwrap_err();
        assert!(matches!(err, SandboxError::Unsupported { backend: "process", .. }));

        match backend.provision("s4", &limits(5_000)).await {
            Ok(env) => {
                assert!(backend.can_isolate);
                let out = backend
                    .exec(
                        &env,
                        ExecRequest::new(["sh", "-c", "grep -c : /proc/net/dev; grep -q eth /proc/net/dev && echo leak"]),
                    )
                    .await
                    .unwrap();
                // Only loopback is visible inside the namespace.
                assert_eq!(out.stdout.lines().next(), Some("1"), "{}", out.stdout);
                assert!(!out.stdout.contains("leak"));
                backend.destroy(&env).await;
            }
            Err(err) => {
                assert!(!backend.can_isolate);
                assert!(matches!(err, SandboxError::Unsupported { backend: "process", .. }));
            }
        }
    }

    #[tokio::test]
    async fn host_mode_accepts_any_policy() {
        let backend = ProcessBackend::new(None, ProcessNetwork::Host).unwrap();
        let allowlisted = SandboxLimits {
            network_allowlist: vec!["api.example.com".into()],
            ..limits(5_000)
        };
        let env = backend.provision("s5", &allowlisted).await.unwrap();
        backend.destroy(&env).await;
    }
}
