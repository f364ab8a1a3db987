//! Container engine interface.
//!
//! The fleet, connectors and watchdog only ever talk to a container engine
//! through [`ContainerEngine`]; the bollard-backed implementation lives in
//! [`docker`]. Keeping the seam here lets tests script an engine and keeps
//! the wire-level REST details out of the core, with one exception: the
//! attach stream framing, which is specified bit-exactly in
//! [`crate::demux`].

pub mod docker;
pub mod pool;

#[cfg(test)]
pub(crate) mod mock;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};

pub use self::docker::DockerEngine;
pub use self::pool::{EngineHandle, EnginePool};

/// Error from a container engine operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The container or image does not exist. Teardown paths treat this as
    /// success (idempotent stop/remove).
    #[error("not found: {0}")]
    NotFound(String),
    /// The engine rejected the request.
    #[error("engine API error (status {status}): {message}")]
    Api { status: u16, message: String },
    /// Could not reach the engine at all.
    #[error("engine connection failed: {0}")]
    Connection(String),
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Request to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    /// Container command; connectors may substitute a blocking default.
    pub cmd: Vec<String>,
    /// `NAME=value` environment entries.
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub memory_limit_mb: Option<u64>,
    pub cpu_shares: Option<u32>,
    pub network_mode: Option<String>,
    /// TCP container ports published to ephemeral host ports.
    pub exposed_tcp_ports: Vec<u16>,
}

/// One published port mapping, as reported by inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub protocol: String,
    pub host_ip: String,
    pub host_port: u16,
}

/// Inspect result for a single container.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub running: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub ports: Vec<PortBinding>,
}

/// One row of a container listing.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
}

/// Bidirectional pipes of an attached exec.
///
/// `output` carries the raw multiplexed stdout/stderr stream in the framing
/// decoded by [`crate::demux::FrameDecoder`], regardless of which engine
/// implementation produced it.
pub struct AttachedExec {
    pub stdin: Pin<Box<dyn AsyncWrite + Send>>,
    pub output: Pin<Box<dyn AsyncRead + Send>>,
}

impl std::fmt::Debug for AttachedExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedExec").finish_non_exhaustive()
    }
}

/// Minimal engine surface the core needs: lifecycle, inspection, archive
/// copy and exec. Everything is asynchronous and cancel-safe at the call
/// boundary.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;
    async fn image_present(&self, image: &str) -> Result<bool, EngineError>;

    /// Create a container and return its engine-assigned id.
    async fn create_container(&self, name: &str, spec: &ContainerSpec)
    -> Result<String, EngineError>;
    async fn start_container(&self, id: &str) -> Result<(), EngineError>;
    /// Stop with a grace period before the engine kills the process.
    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), EngineError>;
    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), EngineError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, EngineError>;
    /// List containers matching every `key=value` label filter.
    async fn list_containers(
        &self,
        label_filters: &[String],
        all: bool,
    ) -> Result<Vec<ContainerSummary>, EngineError>;

    /// Unpack a tar archive at `path` inside the container.
    async fn put_archive(&self, id: &str, path: &str, tar: Vec<u8>) -> Result<(), EngineError>;

    /// Run a command without attaching to its streams.
    async fn exec_detached(&self, id: &str, cmd: &[String]) -> Result<(), EngineError>;
    /// Run a command with stdin/stdout/stderr attached.
    async fn exec_attached(&self, id: &str, cmd: &[String]) -> Result<AttachedExec, EngineError>;
}
