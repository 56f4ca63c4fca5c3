// ABOUTME: Container runtime trait and the plain data exchanged across it
// ABOUTME: Abstracts the container control plane so the engine can run against Docker or a test double

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod docker;

pub use docker::DockerRuntime;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Object already in requested state")]
    NotModified,

    #[error("Runtime API error: {0}")]
    Api(String),

    #[error("Runtime unavailable: {0}")]
    Unavailable(String),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Raw port binding `{port}/{proto}` -> host port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: String,
    pub host_port: u16,
}

/// Named volume mounted into a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
}

/// Everything the runtime needs to create a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub environment: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// Ports exposed inside the container network, e.g. `3000/tcp`
    pub exposed_ports: Vec<String>,
    pub port_bindings: Vec<PortBinding>,
    pub mounts: Vec<MountSpec>,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub memory_bytes: i64,
    pub pids_limit: i64,
    pub read_only_root_fs: bool,
    pub network_mode: String,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub privileged: bool,
    pub auto_remove: bool,
}

/// Changes applied when a container has to be re-created
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerPatch {
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    /// Full replacement of the environment
    pub environment: Option<HashMap<String, String>>,
    pub add_mounts: Vec<MountSpec>,
    /// Mount targets to drop
    pub remove_mounts: Vec<String>,
    /// Merged over the existing labels
    pub labels: HashMap<String, String>,
}

/// Inspection result of one container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Runtime state string (created, running, exited, ...)
    pub state: String,
    pub exit_code: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
    pub environment: HashMap<String, String>,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub mounts: Vec<MountSpec>,
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeConfig {
    pub name: String,
    pub driver: String,
    pub driver_opts: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub timestamp: DateTime<Utc>,
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Pull-based output of a log follow or streamed exec.
/// Dropping it closes the channel, which ends the pump task and its runtime session.
pub struct OutputStream {
    receiver: mpsc::Receiver<OutputChunk>,
}

/// Chunks buffered between the pump task and the consumer
const OUTPUT_BUFFER: usize = 64;

impl OutputStream {
    pub fn channel() -> (mpsc::Sender<OutputChunk>, Self) {
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        (tx, Self { receiver: rx })
    }

    pub async fn next_chunk(&mut self) -> Option<OutputChunk> {
        self.receiver.recv().await
    }

    /// Drain the stream into one string; only sensible for finite output
    pub async fn collect_text(mut self) -> String {
        let mut out = String::new();
        while let Some(chunk) = self.receiver.recv().await {
            out.push_str(&chunk.text());
        }
        out
    }
}

impl Stream for OutputStream {
    type Item = OutputChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Container control plane used by the gateway
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> RuntimeResult<()>;

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool>;

    async fn pull_image(&self, image: &str) -> RuntimeResult<()>;

    /// Build `tag` from a tar archive of the build context
    async fn build_image(&self, tag: &str, dockerfile: &str, context: Vec<u8>) -> RuntimeResult<()>;

    /// Create (but do not start) a container, returning its id
    async fn create_container(&self, name: &str, config: &ContainerConfig) -> RuntimeResult<String>;

    async fn start_container(&self, id: &str) -> RuntimeResult<()>;

    async fn stop_container(&self, id: &str, timeout_secs: u64) -> RuntimeResult<()>;

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()>;

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails>;

    /// Ids of all containers (any state) carrying every `key=value` label filter
    async fn list_containers(&self, label_filters: &[String]) -> RuntimeResult<Vec<String>>;

    /// Merge `labels` into the container's label set
    async fn update_labels(&self, id: &str, labels: &HashMap<String, String>) -> RuntimeResult<()>;

    /// Replace the container with one built from its current configuration plus `patch`.
    /// Returns the new container id; the name and labels carry over.
    async fn recreate_container(&self, id: &str, patch: &ContainerPatch) -> RuntimeResult<String>;

    /// One-shot raw stats snapshot as reported by the runtime
    async fn stats(&self, id: &str) -> RuntimeResult<serde_json::Value>;

    async fn create_volume(&self, config: &VolumeConfig) -> RuntimeResult<String>;

    async fn remove_volume(&self, name: &str) -> RuntimeResult<()>;

    /// Id of the named network
    async fn inspect_network(&self, name: &str) -> RuntimeResult<String>;

    async fn create_network(
        &self,
        name: &str,
        driver: &str,
        labels: &HashMap<String, String>,
    ) -> RuntimeResult<String>;

    async fn connect_network(&self, network: &str, container_id: &str) -> RuntimeResult<()>;

    async fn disconnect_network(&self, network: &str, container_id: &str) -> RuntimeResult<()>;

    async fn exec(&self, id: &str, argv: Vec<String>) -> RuntimeResult<ExecOutput>;

    async fn exec_stream(&self, id: &str, argv: Vec<String>) -> RuntimeResult<OutputStream>;

    async fn logs(&self, id: &str, follow: bool) -> RuntimeResult<OutputStream>;

    /// Tar archive of a path inside the container
    async fn download_archive(&self, id: &str, path: &str) -> RuntimeResult<Vec<u8>>;
}

/// Parse a runtime RFC 3339 timestamp; the zero time Docker reports for "never" maps to `None`
pub fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .filter(|dt| dt.timestamp() > 0)
}
