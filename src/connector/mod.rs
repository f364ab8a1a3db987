//! Connector strategies: how a provisioned container becomes a reachable
//! worker.
//!
//! A [`Connector`] gets hooks at fixed points of the provision sequence
//! (before create, after create, after start) and finally [`launch`]es the
//! worker runtime, producing a [`Transport`] the coordinator talks over.
//! Three strategies ship here:
//!
//! * [`attach`] — run the runtime via an attached exec and demultiplex its
//!   stdio; no network path into the container is needed.
//! * [`ssh`] — wait for the container's sshd, either injecting a freshly
//!   generated key or deferring to a configured credential.
//! * [`callback`] — start the runtime with coordinates of this process and
//!   let the worker dial back in.
//!
//! [`launch`]: Connector::launch

pub mod attach;
pub mod callback;
pub mod ssh;

use std::pin::Pin;

use async_trait::async_trait;

use crate::config::RuntimeSpec;
use crate::demux::PumpError;
use crate::engine::{ContainerEngine, ContainerInfo, ContainerSpec, EngineError};

pub use self::attach::AttachConnector;
pub use self::callback::CallbackConnector;
pub use self::ssh::{SshAuth, SshConnector, SshKeyPair};

/// Error from a connector hook or launch.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// The container died (or never started) before the connector could
    /// reach it.
    #[error("container {id} is not running")]
    NotRunning { id: String },
    /// A bounded connectivity wait gave up. The provision attempt as a
    /// whole may be retried.
    #[error("timed out waiting for {operation} after {attempts} attempts ({delay_ms}ms apart)")]
    Timeout {
        operation: &'static str,
        attempts: u32,
        delay_ms: u64,
    },
    /// The engine published no host binding for the expected container port.
    #[error("no published host binding for container port {port}")]
    MissingBinding { port: u16 },
    /// Key injection was expected but no key was recorded for the container.
    #[error("no injected key recorded for container {id}")]
    KeyNotInjected { id: String },
    /// The runtime binary on the coordinator host could not be read.
    #[error("runtime binary at {path} could not be read: {source}")]
    Runtime {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ConnectorError {
    /// Timeouts are transient; everything else needs attention first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// The established channel between coordinator and worker runtime.
pub enum Transport {
    /// Stdio of an attached exec. `from_worker` carries the runtime's
    /// stdout already separated from stderr; the pump task doing that
    /// separation is handed over so the owner can observe demux failures.
    Attached {
        to_worker: Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
        from_worker: Pin<Box<dyn tokio::io::AsyncRead + Send>>,
        pump: tokio::task::JoinHandle<Result<u64, PumpError>>,
    },
    /// An sshd reachable at `host:port`; the caller opens the session.
    Ssh {
        host: String,
        port: u16,
        auth: SshAuth,
    },
    /// The worker dials back to `coordinator_url`, authenticating with the
    /// single-use `secret`.
    Callback {
        coordinator_url: String,
        secret: String,
    },
}

impl Transport {
    /// Best-effort release of transport-held resources. Idempotent with
    /// container teardown: the container may already be gone.
    pub fn disconnect(self) {
        if let Self::Attached { pump, .. } = self {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attached { .. } => f.debug_struct("Transport::Attached").finish_non_exhaustive(),
            Self::Ssh { host, port, .. } => f
                .debug_struct("Transport::Ssh")
                .field("host", host)
                .field("port", port)
                .finish_non_exhaustive(),
            Self::Callback {
                coordinator_url, ..
            } => f
                .debug_struct("Transport::Callback")
                .field("coordinator_url", coordinator_url)
                .finish_non_exhaustive(),
        }
    }
}

/// Strategy hooks around a worker container's provision sequence.
///
/// Hooks run in order: `before_container_created` (spec still mutable),
/// `after_container_created` (container exists, not started),
/// `after_container_started`, then [`launch`](Self::launch) once the fleet
/// is ready to hand the worker its first task.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Short name used in logs and worker labels.
    fn name(&self) -> &'static str;

    /// Adjust the container spec before creation. The default substitutes a
    /// blocking command when the template provides none, so the container
    /// does not exit before the connector gets to it.
    async fn before_container_created(
        &self,
        spec: &mut ContainerSpec,
    ) -> Result<(), ConnectorError> {
        ensure_waiting_command(spec);
        Ok(())
    }

    /// Runs after the container exists but before it starts.
    async fn after_container_created(
        &self,
        _engine: &dyn ContainerEngine,
        _container_id: &str,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Runs once the container is started. The default copies the worker
    /// runtime binary into the container.
    async fn after_container_started(
        &self,
        engine: &dyn ContainerEngine,
        container_id: &str,
        runtime: &RuntimeSpec,
    ) -> Result<(), ConnectorError> {
        inject_runtime(engine, container_id, runtime).await
    }

    /// Establish the transport the worker runtime will speak over.
    ///
    /// Implementations must verify the container is still running and fail
    /// with [`ConnectorError::NotRunning`] otherwise.
    async fn launch(
        &self,
        engine: &dyn ContainerEngine,
        container_id: &str,
        runtime: &RuntimeSpec,
    ) -> Result<Transport, ConnectorError>;
}

/// Substitute a command that blocks forever when the spec has none.
///
/// `sleep infinity` in a shell with a signal trap keeps PID 1 parked while
/// still dying promptly on engine stop.
pub fn ensure_waiting_command(spec: &mut ContainerSpec) {
    if spec.cmd.is_empty() {
        spec.cmd = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "trap : TERM INT; sleep infinity & wait".to_string(),
        ];
    }
}

/// Inspect the container and insist it is running.
pub(crate) async fn require_running(
    engine: &dyn ContainerEngine,
    id: &str,
) -> Result<ContainerInfo, ConnectorError> {
    let info = engine.inspect_container(id).await?;
    if !info.running {
        return Err(ConnectorError::NotRunning { id: id.to_string() });
    }
    Ok(info)
}

/// Copy the runtime binary into the container, if the template names one.
pub(crate) async fn inject_runtime(
    engine: &dyn ContainerEngine,
    container_id: &str,
    runtime: &RuntimeSpec,
) -> Result<(), ConnectorError> {
    let Some(path) = &runtime.local_binary else {
        return Ok(());
    };
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| ConnectorError::Runtime {
            path: path.clone(),
            source,
        })?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("kindling-agent");
    let archive = archive_single_file(file_name, 0o755, &bytes).map_err(EngineError::from)?;
    engine
        .put_archive(container_id, &runtime.remote_dir, archive)
        .await?;
    tracing::debug!(
        container_id = %container_id,
        binary = %file_name,
        dest = %runtime.remote_dir,
        size = bytes.len(),
        "injected worker runtime"
    );
    Ok(())
}

/// Build an in-memory tar archive holding one file.
pub(crate) fn archive_single_file(
    name: &str,
    mode: u32,
    contents: &[u8],
) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder.append_data(&mut header, name, contents)?;
    builder.into_inner()
}
