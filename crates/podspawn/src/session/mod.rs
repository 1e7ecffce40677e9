//! Session orchestration.
//!
//! One [`Session`] per sshd connection: make sure the identity's sandbox is
//! running (create or reattach), run the requested command or an interactive
//! shell inside it, then remove the sandbox no matter how the run ended.

mod lock;
mod resize;
mod terminal;

pub use lock::ProvisionLock;
pub use resize::watch_resize;
pub use terminal::{HostTerminal, RawModeGuard, ResizeEvents, Terminal};

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::identity::{DEFAULT_SANDBOX_PREFIX, Identity};
use crate::runtime::{
    ExecRequest, ExecStreams, IDENTITY_LABEL, Runtime, RuntimeError, SandboxSpec,
};

/// Exit code reported for any orchestration failure.
pub const FAILURE_EXIT_CODE: i32 = 1;

/// Tunables for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Image for newly created sandboxes.
    pub image: String,
    /// Interactive shell.
    pub shell: String,
    /// Keeps a sandbox alive with no workload.
    pub placeholder: Vec<String>,
    pub sandbox_prefix: String,
    /// Ceiling on sandbox removal at session end.
    pub cleanup_timeout: Duration,
    /// Grace period for `stop` before the engine kills the sandbox.
    pub stop_timeout: Duration,
    /// Where provisioning locks live. `None` disables locking.
    pub lock_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            image: "ubuntu:24.04".to_string(),
            shell: "/bin/bash".to_string(),
            placeholder: vec!["sleep".to_string(), "infinity".to_string()],
            sandbox_prefix: DEFAULT_SANDBOX_PREFIX.to_string(),
            cleanup_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(10),
            lock_dir: None,
        }
    }
}

/// Why a session failed. Every variant maps to exit code 1.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("looking up sandbox {sandbox}: {source}")]
    Lookup {
        sandbox: String,
        #[source]
        source: RuntimeError,
    },

    #[error("provisioning sandbox {sandbox}: {source}")]
    Provision {
        sandbox: String,
        #[source]
        source: RuntimeError,
    },

    #[error("exec in sandbox {sandbox}: {source}")]
    Exec {
        sandbox: String,
        #[source]
        source: RuntimeError,
    },

    #[error("terminal setup failed: {0}")]
    Terminal(#[source] io::Error),
}

impl SessionError {
    /// Session stage the failure happened in, for log context.
    pub fn stage(&self) -> &'static str {
        match self {
            SessionError::Lookup { .. } => "lookup",
            SessionError::Provision { .. } => "provision",
            SessionError::Exec { .. } => "exec",
            SessionError::Terminal(_) => "terminal",
        }
    }

    pub fn exit_code(&self) -> i32 {
        FAILURE_EXIT_CODE
    }
}

/// One sshd connection's worth of work.
pub struct Session {
    identity: Identity,
    sandbox: String,
    runtime: Arc<dyn Runtime>,
    config: SessionConfig,
    command: Option<String>,
    terminal: Arc<dyn Terminal>,
    streams: Mutex<Option<ExecStreams>>,
}

impl Session {
    pub fn new(identity: Identity, runtime: Arc<dyn Runtime>, config: SessionConfig) -> Self {
        let sandbox = identity.sandbox_name(&config.sandbox_prefix);
        Self {
            identity,
            sandbox,
            runtime,
            config,
            command: None,
            terminal: Arc::new(HostTerminal),
            streams: Mutex::new(None),
        }
    }

    /// Run `command` with `sh -c` instead of an interactive shell. An empty
    /// command means interactive.
    pub fn with_command(mut self, command: Option<String>) -> Self {
        self.command = command.filter(|c| !c.is_empty());
        self
    }

    pub fn with_terminal(mut self, terminal: Arc<dyn Terminal>) -> Self {
        self.terminal = terminal;
        self
    }

    /// Streams to relay instead of the process's stdio.
    pub fn with_streams(mut self, streams: ExecStreams) -> Self {
        self.streams = Mutex::new(Some(streams));
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn sandbox_name(&self) -> &str {
        &self.sandbox
    }

    pub fn is_interactive(&self) -> bool {
        self.command.is_none()
    }

    /// Provision and execute. Does not clean up; see [`Session::cleanup`].
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<i32, SessionError> {
        let target = self.provision(cancel).await?;
        let streams = self
            .streams
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_else(ExecStreams::stdio);

        let code = match self.command.clone() {
            Some(command) => self.run_one_shot(cancel, &target, command, streams).await?,
            None => self.run_interactive(cancel, &target, streams).await?,
        };

        info!(
            identity = %self.identity,
            sandbox = %self.sandbox,
            exit_code = code,
            "session finished"
        );
        Ok(code)
    }

    /// Remove the sandbox. Uses its own bounded context so an already
    /// cancelled session still tears down. Failures are only logged.
    pub async fn cleanup(&self) {
        let cancel = CancellationToken::new();
        let removal = self.runtime.remove(&cancel, &self.sandbox);
        match tokio::time::timeout(self.config.cleanup_timeout, removal).await {
            Ok(Ok(())) => debug!(sandbox = %self.sandbox, "sandbox removed"),
            Ok(Err(e)) => warn!(
                identity = %self.identity,
                sandbox = %self.sandbox,
                stage = "cleanup",
                "failed to remove sandbox: {e}"
            ),
            Err(_) => warn!(
                identity = %self.identity,
                sandbox = %self.sandbox,
                stage = "cleanup",
                timeout_secs = self.config.cleanup_timeout.as_secs(),
                "sandbox removal timed out"
            ),
        }
    }

    /// Run, always clean up, and return the process exit code.
    pub async fn run_and_cleanup(&mut self, cancel: &CancellationToken) -> i32 {
        let result = self.run(cancel).await;
        let code = match result {
            Ok(code) => code,
            Err(e) => {
                error!(
                    identity = %self.identity,
                    sandbox = %self.sandbox,
                    stage = e.stage(),
                    "session failed: {e}"
                );
                e.exit_code()
            }
        };
        self.cleanup().await;
        code
    }

    /// Ensure the sandbox is running. Returns the id to exec against.
    async fn provision(&self, cancel: &CancellationToken) -> Result<String, SessionError> {
        let _lock = self.lock_provisioning(cancel).await?;

        let exists = self
            .runtime
            .exists(cancel, &self.sandbox)
            .await
            .map_err(|source| SessionError::Lookup {
                sandbox: self.sandbox.clone(),
                source,
            })?;

        if exists {
            info!(identity = %self.identity, sandbox = %self.sandbox, "reattaching to sandbox");
            return Ok(self.sandbox.clone());
        }

        info!(
            identity = %self.identity,
            sandbox = %self.sandbox,
            image = %self.config.image,
            "creating sandbox"
        );
        let spec = SandboxSpec::new(
            &self.sandbox,
            &self.config.image,
            self.config.placeholder.clone(),
        )
        .label(IDENTITY_LABEL, self.identity.as_str());

        let provision_err = |source| SessionError::Provision {
            sandbox: self.sandbox.clone(),
            source,
        };
        let id = self
            .runtime
            .create(cancel, &spec)
            .await
            .map_err(provision_err)?;
        self.runtime
            .start(cancel, &id)
            .await
            .map_err(provision_err)?;
        Ok(id)
    }

    /// Take the per-sandbox lock if a lock directory is configured. Failing
    /// to lock only costs the race protection, so it is not fatal.
    async fn lock_provisioning(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<ProvisionLock>, SessionError> {
        let Some(dir) = self.config.lock_dir.as_deref() else {
            return Ok(None);
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Provision {
                sandbox: self.sandbox.clone(),
                source: RuntimeError::cancelled("provision lock"),
            }),
            lock = ProvisionLock::acquire(dir, &self.sandbox) => match lock {
                Ok(lock) => Ok(Some(lock)),
                Err(e) => {
                    warn!(
                        sandbox = %self.sandbox,
                        lock_dir = %dir.display(),
                        "provisioning without lock: {e}"
                    );
                    Ok(None)
                }
            },
        }
    }

    async fn run_one_shot(
        &self,
        cancel: &CancellationToken,
        target: &str,
        command: String,
        streams: ExecStreams,
    ) -> Result<i32, SessionError> {
        debug!(sandbox = %self.sandbox, command = %command, "running command");
        let request = ExecRequest::new(vec!["sh".to_string(), "-c".to_string(), command], false);
        self.exec(cancel, target, request, streams).await
    }

    async fn run_interactive(
        &self,
        cancel: &CancellationToken,
        target: &str,
        streams: ExecStreams,
    ) -> Result<i32, SessionError> {
        let attached = self.terminal.is_terminal();
        let _raw_mode = if attached {
            Some(
                self.terminal
                    .enter_raw_mode()
                    .map_err(SessionError::Terminal)?,
            )
        } else {
            None
        };

        // Stops the resize watcher on every exit path
        let watcher_cancel = cancel.child_token();
        let _stop_watcher = watcher_cancel.clone().drop_guard();

        let mut request = ExecRequest::new(vec![self.config.shell.clone()], true);
        if attached {
            let runtime = self.runtime.clone();
            let terminal = self.terminal.clone();
            request = request.on_started(move |handle| {
                tokio::spawn(watch_resize(runtime, handle, terminal, watcher_cancel));
            });
        }

        debug!(sandbox = %self.sandbox, shell = %self.config.shell, tty = attached, "starting shell");
        self.exec(cancel, target, request, streams).await
    }

    async fn exec(
        &self,
        cancel: &CancellationToken,
        target: &str,
        request: ExecRequest,
        streams: ExecStreams,
    ) -> Result<i32, SessionError> {
        self.runtime
            .exec(cancel, target, request, streams)
            .await
            .map_err(|source| SessionError::Exec {
                sandbox: self.sandbox.clone(),
                source,
            })
    }
}
