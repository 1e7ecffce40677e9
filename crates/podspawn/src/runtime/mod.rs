//! Container runtime abstraction.
//!
//! The session orchestrator only touches compute infrastructure through the
//! [`Runtime`] trait. [`DockerRuntime`] drives the Docker Engine through
//! `bollard` over its local unix socket; [`RecordingRuntime`] is an in-memory recorder for
//! tests.
//!
//! Every operation takes a [`CancellationToken`] and returns
//! [`RuntimeError::Cancelled`] promptly once it fires.

mod docker;
mod error;
pub mod recorder;

pub use docker::{DEFAULT_SOCKET, DockerRuntime, IDENTITY_LABEL};
pub use error::{RuntimeError, RuntimeResult};
pub use recorder::{RecordedExec, RecordingRuntime, RuntimeCall};

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// What to materialize for a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    /// Container name.
    pub name: String,
    /// Image reference, pulled on demand.
    pub image: String,
    /// Long-lived command that keeps the sandbox alive.
    pub command: Vec<String>,
    /// Labels attached to the container.
    pub labels: Vec<(String, String)>,
}

impl SandboxSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command,
            labels: Vec::new(),
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }
}

/// Opaque identifier of one in-flight exec, used only to address resizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecHandle(String);

impl ExecHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

/// Invoked once with the exec handle, before any stream relay is awaited.
pub type ExecStarted = Box<dyn FnOnce(ExecHandle) + Send + Sync>;

/// A command to run inside a running sandbox.
pub struct ExecRequest {
    pub command: Vec<String>,
    /// Allocate a TTY. Output is then one raw stream instead of separate
    /// stdout and stderr.
    pub tty: bool,
    pub on_started: Option<ExecStarted>,
}

impl ExecRequest {
    pub fn new(command: Vec<String>, tty: bool) -> Self {
        Self {
            command,
            tty,
            on_started: None,
        }
    }

    pub fn on_started(mut self, callback: impl FnOnce(ExecHandle) + Send + Sync + 'static) -> Self {
        self.on_started = Some(Box::new(callback));
        self
    }

    /// Fire the started callback, if any. Runtimes call this exactly once.
    pub fn notify_started(&mut self, handle: ExecHandle) {
        if let Some(callback) = self.on_started.take() {
            callback(handle);
        }
    }
}

impl fmt::Debug for ExecRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecRequest")
            .field("command", &self.command)
            .field("tty", &self.tty)
            .field("on_started", &self.on_started.is_some())
            .finish()
    }
}

/// Byte streams relayed to and from an exec.
pub struct ExecStreams {
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

impl ExecStreams {
    pub fn new(
        stdin: impl AsyncRead + Send + Unpin + 'static,
        stdout: impl AsyncWrite + Send + Unpin + 'static,
        stderr: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }

    /// The process's own standard streams.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), tokio::io::stderr())
    }

    /// Empty input, discarded output.
    pub fn null() -> Self {
        Self::new(tokio::io::empty(), tokio::io::sink(), tokio::io::sink())
    }
}

impl fmt::Debug for ExecStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecStreams").finish_non_exhaustive()
    }
}

/// Container runtime abstraction.
///
/// Implementations must be safe to call concurrently from the session task
/// and the resize watcher without external locking.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Whether a sandbox with this name exists, running or not.
    async fn exists(&self, cancel: &CancellationToken, name: &str) -> RuntimeResult<bool>;

    /// Create a sandbox, pulling its image first if it is not present.
    /// Returns the sandbox id.
    async fn create(&self, cancel: &CancellationToken, spec: &SandboxSpec) -> RuntimeResult<String>;

    async fn start(&self, cancel: &CancellationToken, id: &str) -> RuntimeResult<()>;

    /// Run a command to completion and return its exit code. A nonzero exit
    /// code is a successful result.
    async fn exec(
        &self,
        cancel: &CancellationToken,
        id: &str,
        request: ExecRequest,
        streams: ExecStreams,
    ) -> RuntimeResult<i32>;

    /// Resize an in-flight exec's TTY. Best-effort.
    async fn resize(
        &self,
        cancel: &CancellationToken,
        handle: &ExecHandle,
        size: WindowSize,
    ) -> RuntimeResult<()>;

    /// Graceful stop, forced after `timeout`.
    async fn stop(
        &self,
        cancel: &CancellationToken,
        id: &str,
        timeout: Duration,
    ) -> RuntimeResult<()>;

    /// Destroy a sandbox. Succeeds when it is already stopped or gone.
    async fn remove(&self, cancel: &CancellationToken, id: &str) -> RuntimeResult<()>;
}

/// Run `fut` unless `cancel` fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, operation: &str, fut: F) -> RuntimeResult<T>
where
    F: Future<Output = RuntimeResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(RuntimeError::cancelled(operation));
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RuntimeError::cancelled(operation)),
        result = fut => result,
    }
}
