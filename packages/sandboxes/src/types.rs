// ABOUTME: Core type definitions for sandbox orchestration
// ABOUTME: Declarative sandbox specs, runtime-bound sandbox views, volumes, routes and metric samples

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Port exposure protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// Routed through the reverse proxy rather than bound on the host
    pub fn is_http_family(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }

    /// Transport protocol as understood by the container runtime
    pub fn transport(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            _ => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

/// Resource request for a sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequest {
    /// CPU cores, fractional allowed (0.5 = half a core)
    pub cpu_cores: f64,
    /// Memory limit with k/m/g suffix (e.g. "512m")
    pub memory: String,
    /// Maximum number of processes
    pub pids_limit: i64,
    pub network_enabled: bool,
    pub read_only_root_fs: bool,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory: corral_config::DEFAULT_MEMORY.to_string(),
            pids_limit: 100,
            network_enabled: true,
            read_only_root_fs: true,
        }
    }
}

/// Named volume request, mounted at `/mnt/{name}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub size: String,
    #[serde(default = "default_driver")]
    pub driver: String,
}

fn default_driver() -> String {
    "local".to_string()
}

impl VolumeRequest {
    pub fn new(size: impl Into<String>) -> Self {
        Self {
            size: size.into(),
            driver: default_driver(),
        }
    }
}

/// Port exposure request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRequest {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub external: Option<u16>,
    #[serde(default)]
    pub subdomain: Option<String>,
}

impl PortRequest {
    pub fn http(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Http,
            external: None,
            subdomain: None,
        }
    }

    pub fn with_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }
}

/// Source for building an image instead of pulling it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildContext {
    /// Inline Dockerfile content; the context's own Dockerfile is used when absent
    pub dockerfile: Option<String>,
    pub context_path: PathBuf,
}

/// Declarative sandbox specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub image: String,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeRequest>,
    #[serde(default)]
    pub ports: Vec<PortRequest>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub auto_remove: bool,
    /// Seconds of runtime before the sandbox is stopped; 0 or absent = unlimited
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub force_build: bool,
    #[serde(default)]
    pub build_context: Option<BuildContext>,
}

impl SandboxSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: None,
            entrypoint: None,
            resources: ResourceRequest::default(),
            volumes: BTreeMap::new(),
            ports: Vec::new(),
            environment: HashMap::new(),
            auto_remove: false,
            timeout_seconds: None,
            force_build: false,
            build_context: None,
        }
    }
}

/// Sandbox lifecycle status, derived from the runtime's view of the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Pending,
    Running,
    Stopped,
    Failed,
    Terminated,
}

/// Lifecycle events that move a sandbox between statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    Stop,
    Remove,
    CreateFailed,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Pending => "pending",
            SandboxStatus::Running => "running",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Failed => "failed",
            SandboxStatus::Terminated => "terminated",
        }
    }

    /// Terminated and failed sandboxes never leave their status
    pub fn is_absorbing(&self) -> bool {
        matches!(self, SandboxStatus::Terminated | SandboxStatus::Failed)
    }

    /// Status after applying `event`, or `None` when the transition is not allowed.
    /// Starting a running sandbox and stopping a stopped one are no-ops.
    pub fn apply(self, event: LifecycleEvent) -> Option<SandboxStatus> {
        use LifecycleEvent::*;
        use SandboxStatus::*;

        match (self, event) {
            (Pending | Stopped | Running, Start) => Some(Running),
            (Running | Stopped, Stop) => Some(Stopped),
            (Pending, Stop) => Some(Pending),
            (Pending | Running | Stopped, Remove) => Some(Terminated),
            (Pending, CreateFailed) => Some(Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SandboxStatus::Pending),
            "running" => Ok(SandboxStatus::Running),
            "stopped" => Ok(SandboxStatus::Stopped),
            "failed" => Ok(SandboxStatus::Failed),
            "terminated" => Ok(SandboxStatus::Terminated),
            other => Err(format!("unknown sandbox status: {}", other)),
        }
    }
}

/// Volume attached to a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Runtime volume name
    pub id: String,
    /// Name from the spec; the mount lives at `/mnt/{name}`
    pub name: String,
    pub size: Option<String>,
    pub driver: String,
    pub mount_path: String,
    /// Shareable network-class volume, never removed together with a sandbox
    pub network: bool,
}

/// Reverse-proxy route or raw port binding of a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub internal_port: u16,
    pub external_port: u16,
    pub protocol: Protocol,
    pub subdomain: Option<String>,
    /// Public URL, present only for http-family routes
    pub url: Option<String>,
}

impl Route {
    pub fn from_request(request: &PortRequest, domain: &str) -> Self {
        let (subdomain, url) = if request.protocol.is_http_family() {
            let subdomain = route_subdomain(request);
            let url = format!("https://{}.{}", subdomain, domain);
            (Some(subdomain), Some(url))
        } else {
            (None, None)
        };

        Self {
            internal_port: request.port,
            external_port: request.external.unwrap_or(request.port),
            protocol: request.protocol,
            subdomain,
            url,
        }
    }
}

/// Subdomain used for an http-family port: the caller's choice or `s-{port}`
pub fn route_subdomain(request: &PortRequest) -> String {
    request
        .subdomain
        .clone()
        .unwrap_or_else(|| format!("s-{}", request.port))
}

/// Runtime-bound sandbox instance, reconstructed from the runtime on demand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    /// Runtime container identifier
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub last_active_at: DateTime<Utc>,
    pub exit_code: Option<i64>,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub environment: HashMap<String, String>,
    pub timeout_seconds: u64,
    pub auto_remove: bool,
    pub volumes: Vec<Volume>,
    pub routes: Vec<Route>,
    /// Internal port -> public URL
    pub urls: BTreeMap<u16, String>,
}

/// Point-in-time resource usage of one sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub sandbox_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    /// Cumulative totals, not deltas
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
}

/// Kind of a directory entry inside a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}
