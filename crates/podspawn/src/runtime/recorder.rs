//! In-memory runtime that records calls for test assertions.
//!
//! All methods are safe for concurrent use. Failures can be injected per
//! operation, and an exec can be held in flight until released so callers
//! can exercise resize handling against a live exec.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{
    ExecHandle, ExecRequest, ExecStreams, Runtime, RuntimeError, RuntimeResult, SandboxSpec,
    WindowSize, cancellable,
};

/// One recorded runtime call, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Exists(String),
    Create(SandboxSpec),
    Start(String),
    Exec(RecordedExec),
    Resize(ExecHandle, WindowSize),
    Stop(String),
    Remove(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedExec {
    pub sandbox: String,
    pub command: Vec<String>,
    pub tty: bool,
}

#[derive(Default)]
struct State {
    /// name -> running
    sandboxes: HashMap<String, bool>,
    calls: Vec<RuntimeCall>,
    exit_code: i32,
    stdout: Vec<u8>,
    exists_err: Option<String>,
    create_err: Option<String>,
    start_err: Option<String>,
    exec_err: Option<String>,
    remove_err: Option<String>,
    exec_gate: Option<Arc<Notify>>,
    remove_gate: Option<Arc<Notify>>,
    exec_seq: usize,
}

#[derive(Default)]
pub struct RecordingRuntime {
    state: Mutex<State>,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the calls recorded so far
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pretend a sandbox already exists (and is running).
    pub fn with_sandbox(self, name: impl Into<String>) -> Self {
        self.state().sandboxes.insert(name.into(), true);
        self
    }

    /// Exit code returned by every exec.
    pub fn with_exit_code(self, code: i32) -> Self {
        self.state().exit_code = code;
        self
    }

    /// Bytes written to the exec's stdout before it returns.
    pub fn with_stdout(self, bytes: impl Into<Vec<u8>>) -> Self {
        self.state().stdout = bytes.into();
        self
    }

    pub fn fail_exists(self, message: impl Into<String>) -> Self {
        self.state().exists_err = Some(message.into());
        self
    }

    pub fn fail_create(self, message: impl Into<String>) -> Self {
        self.state().create_err = Some(message.into());
        self
    }

    pub fn fail_start(self, message: impl Into<String>) -> Self {
        self.state().start_err = Some(message.into());
        self
    }

    pub fn fail_exec(self, message: impl Into<String>) -> Self {
        self.state().exec_err = Some(message.into());
        self
    }

    pub fn fail_remove(self, message: impl Into<String>) -> Self {
        self.state().remove_err = Some(message.into());
        self
    }

    /// Hold every exec in flight (after its started callback) until the
    /// returned notifier is signalled.
    pub fn hold_exec(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().exec_gate = Some(gate.clone());
        gate
    }

    /// Hold every remove (after it is recorded) until the returned notifier
    /// is signalled.
    pub fn hold_remove(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().remove_gate = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state().calls.clone()
    }

    pub fn exec_calls(&self) -> Vec<RecordedExec> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                RuntimeCall::Exec(exec) => Some(exec.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn resizes(&self) -> Vec<(ExecHandle, WindowSize)> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                RuntimeCall::Resize(handle, size) => Some((handle.clone(), *size)),
                _ => None,
            })
            .collect()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&RuntimeCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn sandbox_exists(&self, name: &str) -> bool {
        self.state().sandboxes.contains_key(name)
    }

    pub fn sandbox_running(&self, name: &str) -> bool {
        self.state().sandboxes.get(name).copied().unwrap_or(false)
    }

    fn record(&self, call: RuntimeCall) {
        self.state().calls.push(call);
    }
}

#[async_trait]
impl Runtime for RecordingRuntime {
    async fn exists(&self, cancel: &CancellationToken, name: &str) -> RuntimeResult<bool> {
        cancellable(cancel, "exists", async {
            let mut state = self.state();
            state.calls.push(RuntimeCall::Exists(name.to_string()));
            if let Some(message) = state.exists_err.clone() {
                return Err(RuntimeError::transport("inspect", message));
            }
            Ok(state.sandboxes.contains_key(name))
        })
        .await
    }

    async fn create(&self, cancel: &CancellationToken, spec: &SandboxSpec) -> RuntimeResult<String> {
        cancellable(cancel, "create", async {
            let mut state = self.state();
            state.calls.push(RuntimeCall::Create(spec.clone()));
            if let Some(message) = state.create_err.clone() {
                return Err(RuntimeError::provision(&spec.name, message));
            }
            state.sandboxes.insert(spec.name.clone(), false);
            Ok(spec.name.clone())
        })
        .await
    }

    async fn start(&self, cancel: &CancellationToken, id: &str) -> RuntimeResult<()> {
        cancellable(cancel, "start", async {
            let mut state = self.state();
            state.calls.push(RuntimeCall::Start(id.to_string()));
            if let Some(message) = state.start_err.clone() {
                return Err(RuntimeError::provision(id, message));
            }
            match state.sandboxes.get_mut(id) {
                Some(running) => {
                    *running = true;
                    Ok(())
                }
                None => Err(RuntimeError::provision(id, "no such sandbox")),
            }
        })
        .await
    }

    async fn exec(
        &self,
        cancel: &CancellationToken,
        id: &str,
        mut request: ExecRequest,
        mut streams: ExecStreams,
    ) -> RuntimeResult<i32> {
        cancellable(cancel, "exec", async move {
            let (exit_code, stdout, exec_err, gate, handle) = {
                let mut state = self.state();
                state.calls.push(RuntimeCall::Exec(RecordedExec {
                    sandbox: id.to_string(),
                    command: request.command.clone(),
                    tty: request.tty,
                }));
                state.exec_seq += 1;
                (
                    state.exit_code,
                    state.stdout.clone(),
                    state.exec_err.clone(),
                    state.exec_gate.clone(),
                    ExecHandle::new(format!("recorded-exec-{}", state.exec_seq)),
                )
            };

            if let Some(message) = exec_err {
                return Err(RuntimeError::exec(id, message));
            }

            request.notify_started(handle);

            if let Some(gate) = gate {
                gate.notified().await;
            }

            if !stdout.is_empty() {
                streams.stdout.write_all(&stdout).await?;
                streams.stdout.flush().await?;
            }

            Ok(exit_code)
        })
        .await
    }

    async fn resize(
        &self,
        cancel: &CancellationToken,
        handle: &ExecHandle,
        size: WindowSize,
    ) -> RuntimeResult<()> {
        cancellable(cancel, "resize", async {
            self.record(RuntimeCall::Resize(handle.clone(), size));
            Ok(())
        })
        .await
    }

    async fn stop(
        &self,
        cancel: &CancellationToken,
        id: &str,
        _timeout: Duration,
    ) -> RuntimeResult<()> {
        cancellable(cancel, "stop", async {
            let mut state = self.state();
            state.calls.push(RuntimeCall::Stop(id.to_string()));
            if let Some(running) = state.sandboxes.get_mut(id) {
                *running = false;
            }
            Ok(())
        })
        .await
    }

    async fn remove(&self, cancel: &CancellationToken, id: &str) -> RuntimeResult<()> {
        cancellable(cancel, "remove", async {
            let (remove_err, gate) = {
                let mut state = self.state();
                state.calls.push(RuntimeCall::Remove(id.to_string()));
                (state.remove_err.clone(), state.remove_gate.clone())
            };

            if let Some(gate) = gate {
                gate.notified().await;
            }
            if let Some(message) = remove_err {
                return Err(RuntimeError::Api {
                    operation: "remove".to_string(),
                    status: 500,
                    message,
                });
            }
            self.state().sandboxes.remove(id);
            Ok(())
        })
        .await
    }
}
