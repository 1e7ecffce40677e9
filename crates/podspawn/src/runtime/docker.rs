//! Docker Engine runtime, backed by `bollard` over the local unix socket.
//!
//! Exec streams are attached in-process so they can be resized while they
//! run. Non-TTY output arrives already split into stdout and stderr.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::{API_DEFAULT_VERSION, Docker};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    ExecHandle, ExecRequest, ExecStreams, Runtime, RuntimeError, RuntimeResult, SandboxSpec,
    WindowSize, cancellable,
};

/// Engine socket used when nothing else is configured.
pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// Label carrying the identity a sandbox belongs to.
pub const IDENTITY_LABEL: &str = "podspawn.identity";

/// Per-request timeout handed to the engine client.
const ENGINE_TIMEOUT_SECS: u64 = 120;

/// Interval between exec status polls once the output stream has closed.
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Polls before giving up on reading an exit code.
const EXEC_POLL_ATTEMPTS: u32 = 100;

/// Engine HTTP status of a failed call, if the engine answered at all.
fn status_of(error: &BollardError) -> Option<u16> {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// Map an engine failure that has no more specific meaning.
fn engine_error(operation: &str, error: BollardError) -> RuntimeError {
    match error {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api {
            operation: operation.to_string(),
            status: status_code,
            message,
        },
        other => RuntimeError::transport(operation, other),
    }
}

/// Split an image reference into `fromImage` and `tag` pull parameters.
///
/// A colon only starts a tag when it comes after the last slash, so
/// `registry:5000/team/img` is untagged and pulls `latest`. Digest
/// references are passed whole with no tag.
fn split_image_ref(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    let last_slash = image.rfind('/').map_or(0, |i| i + 1);
    match image[last_slash..].rfind(':') {
        Some(i) => {
            let at = last_slash + i;
            (&image[..at], &image[at + 1..])
        }
        None => (image, "latest"),
    }
}

/// Socket path named by a `DOCKER_HOST` value, if it is a unix endpoint.
fn socket_from_docker_host(value: &str) -> Option<PathBuf> {
    value
        .trim()
        .strip_prefix("unix://")
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

/// Aborts the wrapped task when dropped, so a cancelled exec does not leave
/// its stdin pump running.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Docker Engine runtime.
#[derive(Clone)]
pub struct DockerRuntime {
    socket: PathBuf,
    docker: Docker,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

impl DockerRuntime {
    /// Client for the engine listening on `socket`. Nothing is sent until
    /// the first operation.
    pub fn new(socket: impl Into<PathBuf>) -> RuntimeResult<Self> {
        let socket = socket.into();
        let docker = Docker::connect_with_socket(
            &socket.to_string_lossy(),
            ENGINE_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )
        .map_err(|e| {
            RuntimeError::transport("connect", format!("{e} ({})", socket.display()))
        })?;
        Ok(Self { socket, docker })
    }

    /// Pick the engine socket: explicit setting, then `DOCKER_HOST`, then
    /// [`DEFAULT_SOCKET`].
    pub fn resolve_socket(configured: Option<&Path>) -> PathBuf {
        if let Some(path) = configured {
            return path.to_path_buf();
        }
        std::env::var("DOCKER_HOST")
            .ok()
            .and_then(|host| socket_from_docker_host(&host))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET))
    }

    pub fn from_config(configured: Option<&Path>) -> RuntimeResult<Self> {
        Self::new(Self::resolve_socket(configured))
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn pull_if_missing(&self, image: &str) -> RuntimeResult<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) if status_of(&e) == Some(404) => {}
            Err(e) => return Err(engine_error("image inspect", e)),
        }

        info!(image, "pulling image");
        let (from_image, tag) = split_image_ref(image);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };
        let mut progress = std::pin::pin!(self.docker.create_image(Some(options), None, None));
        while let Some(update) = progress.next().await {
            let update = update
                .map_err(|e| RuntimeError::provision(image, format!("image pull failed: {e}")))?;
            // Registry failures can arrive as an error entry in a 200 stream
            if let Some(err) = update.error {
                return Err(RuntimeError::provision(
                    image,
                    format!("image pull failed: {err}"),
                ));
            }
        }
        Ok(())
    }

    async fn exit_code(&self, id: &str, exec_id: &str) -> RuntimeResult<i32> {
        for _ in 0..EXEC_POLL_ATTEMPTS {
            let inspect = self
                .docker
                .inspect_exec(exec_id)
                .await
                .map_err(|e| RuntimeError::exec(id, e))?;
            if !inspect.running.unwrap_or(false) {
                return inspect
                    .exit_code
                    .map(|code| code as i32)
                    .ok_or_else(|| RuntimeError::exec(id, "exec finished without an exit code"));
            }
            tokio::time::sleep(EXEC_POLL_INTERVAL).await;
        }
        Err(RuntimeError::exec(id, "exec still running after its streams closed"))
    }

    async fn run_exec(
        &self,
        id: &str,
        mut request: ExecRequest,
        streams: ExecStreams,
    ) -> RuntimeResult<i32> {
        let created = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(request.tty),
                    cmd: Some(request.command.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RuntimeError::exec(id, e))?;
        debug!(sandbox = id, exec = %created.id, tty = request.tty, "exec created");

        let started = self
            .docker
            .start_exec(
                &created.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: request.tty,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| RuntimeError::exec(id, format!("attach failed: {e}")))?;
        let StartExecResults::Attached {
            mut output,
            mut input,
        } = started
        else {
            return Err(RuntimeError::exec(id, "exec started detached"));
        };
        request.notify_started(ExecHandle::new(created.id.as_str()));

        let ExecStreams {
            mut stdin,
            mut stdout,
            mut stderr,
        } = streams;

        let _stdin_pump = AbortOnDrop(tokio::spawn(async move {
            let copied = tokio::io::copy(&mut stdin, &mut input).await;
            // Half-close so the process sees EOF on its stdin
            let _ = input.shutdown().await;
            if let Err(e) = copied {
                debug!("stdin relay ended: {e}");
            }
        }));

        while let Some(chunk) = output.next().await {
            let chunk =
                chunk.map_err(|e| RuntimeError::exec(id, format!("stream relay failed: {e}")))?;
            let written = match chunk {
                LogOutput::StdErr { message } => stderr.write_all(&message).await,
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.write_all(&message).await
                }
                LogOutput::StdIn { .. } => Ok(()),
            };
            written.map_err(|e| RuntimeError::exec(id, format!("stream relay failed: {e}")))?;
        }
        let _ = stdout.flush().await;
        let _ = stderr.flush().await;

        self.exit_code(id, &created.id).await
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn exists(&self, cancel: &CancellationToken, name: &str) -> RuntimeResult<bool> {
        cancellable(cancel, "exists", async {
            match self
                .docker
                .inspect_container(name, None::<InspectContainerOptions>)
                .await
            {
                Ok(_) => Ok(true),
                Err(e) if status_of(&e) == Some(404) => Ok(false),
                Err(e) => Err(engine_error("inspect", e)),
            }
        })
        .await
    }

    async fn create(&self, cancel: &CancellationToken, spec: &SandboxSpec) -> RuntimeResult<String> {
        cancellable(cancel, "create", async {
            self.pull_if_missing(&spec.image).await?;

            let labels: HashMap<String, String> = spec.labels.iter().cloned().collect();
            let config = Config {
                image: Some(spec.image.clone()),
                cmd: Some(spec.command.clone()),
                labels: Some(labels),
                tty: Some(false),
                open_stdin: Some(false),
                ..Default::default()
            };
            let options = CreateContainerOptions {
                name: spec.name.as_str(),
                ..Default::default()
            };

            let created = self
                .docker
                .create_container(Some(options), config)
                .await
                .map_err(|e| RuntimeError::provision(&spec.name, e))?;
            info!(sandbox = %spec.name, id = %created.id, image = %spec.image, "sandbox created");
            Ok(created.id)
        })
        .await
    }

    async fn start(&self, cancel: &CancellationToken, id: &str) -> RuntimeResult<()> {
        cancellable(cancel, "start", async {
            match self
                .docker
                .start_container(id, None::<StartContainerOptions<String>>)
                .await
            {
                Ok(()) => Ok(()),
                // Already running
                Err(e) if status_of(&e) == Some(304) => Ok(()),
                Err(e) => Err(RuntimeError::provision(id, e)),
            }
        })
        .await
    }

    async fn exec(
        &self,
        cancel: &CancellationToken,
        id: &str,
        request: ExecRequest,
        streams: ExecStreams,
    ) -> RuntimeResult<i32> {
        cancellable(cancel, "exec", self.run_exec(id, request, streams)).await
    }

    async fn resize(
        &self,
        cancel: &CancellationToken,
        handle: &ExecHandle,
        size: WindowSize,
    ) -> RuntimeResult<()> {
        cancellable(cancel, "resize", async {
            self.docker
                .resize_exec(
                    handle.as_str(),
                    ResizeExecOptions {
                        height: size.rows,
                        width: size.cols,
                    },
                )
                .await
                .map_err(|e| engine_error("resize", e))
        })
        .await
    }

    async fn stop(
        &self,
        cancel: &CancellationToken,
        id: &str,
        timeout: Duration,
    ) -> RuntimeResult<()> {
        cancellable(cancel, "stop", async {
            let options = StopContainerOptions {
                t: i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX),
            };
            match self.docker.stop_container(id, Some(options)).await {
                Ok(()) => Ok(()),
                Err(e) if status_of(&e) == Some(304) => Ok(()),
                Err(e) => Err(engine_error("stop", e)),
            }
        })
        .await
    }

    async fn remove(&self, cancel: &CancellationToken, id: &str) -> RuntimeResult<()> {
        cancellable(cancel, "remove", async {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match self.docker.remove_container(id, Some(options)).await {
                Ok(()) => Ok(()),
                Err(e) if status_of(&e) == Some(404) => Ok(()),
                Err(e) => Err(engine_error("remove", e)),
            }
        })
        .await
    }
}
