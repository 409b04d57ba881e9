use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Instant;
use tracing::{debug, warn};
use wasmtime::*;
use wasmtime_wasi::p1::{self, WasiP1Ctx};
use wasmtime_wasi::p2::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use super::{ExecOutput, ExecRequest, SandboxBackend, SandboxLimits, SessionEnv, cap_output};
use crate::core::error::SandboxError;

/// Guest path the session scratch directory is mounted at.
pub const GUEST_WORKDIR: &str = "/work";

struct HostState {
    wasi: WasiP1Ctx,
    limiter: StoreLimits,
}

/// WASI preview1 sandbox. `argv[0]` of an exec request names the `.wasm` module; the session
/// scratch directory is preopened at `/work`. Guests get no sockets.
pub struct WasmBackend {
    root: PathBuf,
    _temp: Option<tempfile::TempDir>,
}

impl WasmBackend {
    pub fn new(root: Option<PathBuf>) -> Result<Self> {
        match root {
            Some(root) => {
                std::fs::create_dir_all(&root)?;
                Ok(Self { root, _temp: None })
            }
            None => {
                let temp = tempfile::Builder::new().prefix("runloom-wasm-").tempdir()?;
                Ok(Self {
                    root: temp.path().to_path_buf(),
                    _temp: Some(temp),
                })
            }
        }
    }
}

enum GuestOutcome {
    Exited(i32),
    Interrupted,
}

/// Instantiate and run `_start`. Each exec gets its own engine so the epoch deadline of one
/// call cannot interrupt another.
fn run_module(
    module_path: &Path,
    request: &ExecRequest,
    env: &SessionEnv,
    stdout: MemoryOutputPipe,
    stderr: MemoryOutputPipe,
) -> Result<GuestOutcome> {
    let mut engine_config = Config::new();
    engine_config.epoch_interruption(true);
    let engine = Engine::new(&engine_config)?;

    let mut wasi_builder = WasiCtxBuilder::new();
    wasi_builder.args(&request.argv[..]);
    for (key, value) in &request.env {
        wasi_builder.env(key, value);
    }
    wasi_builder.stdin(MemoryInputPipe::new(request.stdin.clone().unwrap_or_default()));
    wasi_builder.stdout(stdout);
    wasi_builder.stderr(stderr);
    wasi_builder.preopened_dir(&env.workdir, GUEST_WORKDIR, DirPerms::all(), FilePerms::all())?;

    let limiter = StoreLimitsBuilder::new()
        .memory_size(env.limits.memory_mb.max(1) as usize * 1024 * 1024)
        .build();
    let host_state = HostState {
        wasi: wasi_builder.build_p1(),
        limiter,
    };

    let mut linker: Linker<HostState> = Linker::new(&engine);
    p1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)?;

    let module = Module::from_file(&engine, module_path)?;
    let mut store = Store::new(&engine, host_state);
    store.limiter(|state| &mut state.limiter);
    store.set_epoch_deadline(1);

    // Bump the epoch once the wall-clock budget is spent; a finished run hangs up first.
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let ticker_engine = engine.clone();
    let timeout = env.limits.timeout;
    std::thread::spawn(move || {
        if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(timeout) {
            ticker_engine.increment_epoch();
        }
    });

    let instance = linker.instantiate(&mut store, &module)?;
    let start = instance.get_typed_func::<(), ()>(&mut store, "_start")?;
    let result = start.call(&mut store, ());
    drop(done_tx);

    match result {
        Ok(()) => Ok(GuestOutcome::Exited(0)),
        Err(e) => {
            if let Some(exit) = e.downcast_ref::<wasmtime_wasi::I32Exit>() {
                Ok(GuestOutcome::Exited(exit.0))
            } else if e.downcast_ref::<Trap>() == Some(&Trap::Interrupt) {
                Ok(GuestOutcome::Interrupted)
            } else {
                Err(e)
            }
        }
    }
}

#[async_trait]
impl SandboxBackend for WasmBackend {
    fn name(&self) -> &'static str {
        "wasm"
    }

    async fn provision(
        &self,
        session_id: &str,
        limits: &SandboxLimits,
    ) -> Result<SessionEnv, SandboxError> {
        if !limits.network_allowlist.is_empty() {
            warn!(
                "Sandbox [{}]: wasm guests have no network access; allowlist ignored",
                session_id
            );
        }
        let workdir = self.root.join(session_id);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| SandboxError::Provisioning(format!("{}: {}", workdir.display(), e)))?;
        Ok(SessionEnv {
            id: session_id.to_string(),
            workdir,
            limits: limits.clone(),
        })
    }

    async fn exec(&self, env: &SessionEnv, request: ExecRequest) -> Result<ExecOutput, SandboxError> {
        let Some(module) = request.argv.first() else {
            return Err(SandboxError::Crashed("empty command".into()));
        };
        let module_path = PathBuf::from(module);
        if module_path.extension().and_then(|e| e.to_str()) != Some("wasm") {
            return Err(SandboxError::Unsupported {
                backend: "wasm",
                what: format!("'{}' is not a .wasm module", module),
            });
        }
        if !env.workdir.exists() {
            return Err(SandboxError::Terminated(env.id.clone()));
        }

        // One spare byte tells us the guest wrote past the cap.
        let cap = env.limits.max_output_bytes;
        let stdout = MemoryOutputPipe::new(cap + 1);
        let stderr = MemoryOutputPipe::new(cap + 1);
        let (out_pipe, err_pipe) = (stdout.clone(), stderr.clone());
        let env_owned = env.clone();
        let started = Instant::now();

        let joined = tokio::task::spawn_blocking(move || {
            run_module(&module_path, &request, &env_owned, out_pipe, err_pipe)
        })
        .await
        .map_err(|e| SandboxError::Crashed(format!("wasm worker panicked: {}", e)))?;

        let exit_code = match joined {
            Ok(GuestOutcome::Exited(code)) => code,
            Ok(GuestOutcome::Interrupted) => return Err(SandboxError::Timeout(env.limits.timeout)),
            Err(e) => return Err(SandboxError::Crashed(format!("wasm execution failed: {}", e))),
        };

        let (stdout, out_cut) = cap_output(&stdout.contents(), cap);
        let (stderr, err_cut) = cap_output(&stderr.contents(), cap);
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            "Sandbox [{}]: wasm exited {} in {}ms",
            env.id, exit_code, duration_ms
        );
        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
            truncated: out_cut || err_cut,
            duration_ms,
        })
    }

    async fn reset(&self, env: &SessionEnv) -> Result<(), SandboxError> {
        let _ = tokio::fs::remove_dir_all(&env.workdir).await;
        tokio::fs::create_dir_all(&env.workdir)
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
