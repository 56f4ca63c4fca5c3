// ABOUTME: Runtime gateway owning the container runtime connection
// ABOUTME: Lifecycle, volumes, networks and streams, normalized into the engine's sandbox model

use crate::error::{Result, SandboxError};
use crate::labels::{self, SandboxTags};
use crate::runtime::{
    ContainerDetails, ContainerPatch, ContainerRuntime, ExecOutput, MountSpec, OutputStream,
    RuntimeError, VolumeConfig,
};
use crate::stats::RawStats;
use crate::translator::{mount_path, RoutingSettings, RuntimeConfig};
use crate::types::{Sandbox, SandboxStatus, Volume};
use crate::validation::validate_env_key;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

const NAME_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// How long a confirmed image is trusted before the runtime is asked again
const IMAGE_CACHE_TTL_SECS: i64 = 300;

/// Fresh container name for a new sandbox
pub fn new_sandbox_name() -> String {
    format!("sandbox-{}", nanoid::nanoid!(12, &NAME_ALPHABET))
}

/// Derive the sandbox status from the runtime's container state
pub fn status_from_state(
    state: &str,
    exit_code: Option<i64>,
    started_at: Option<DateTime<Utc>>,
) -> SandboxStatus {
    let failed_before_start = started_at.is_none() && exit_code.unwrap_or(0) != 0;

    match state.to_lowercase().as_str() {
        "created" if failed_before_start => SandboxStatus::Failed,
        "created" => SandboxStatus::Pending,
        "running" | "restarting" | "paused" => SandboxStatus::Running,
        "exited" if failed_before_start => SandboxStatus::Failed,
        "exited" => SandboxStatus::Stopped,
        "removing" => SandboxStatus::Terminated,
        _ => SandboxStatus::Failed,
    }
}

fn sandbox_from_details(details: ContainerDetails) -> Sandbox {
    let tags = SandboxTags::from_labels(&details.labels);
    let status = status_from_state(&details.state, details.exit_code, details.started_at);
    let urls = labels::urls_from_labels(&details.labels);

    let terminated_at = match status {
        SandboxStatus::Stopped | SandboxStatus::Failed | SandboxStatus::Terminated => {
            details.finished_at
        }
        _ => None,
    };
    let last_active_at = [Some(details.created_at), details.started_at, details.finished_at]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(details.created_at);

    Sandbox {
        id: details.id,
        name: details.name,
        image: details.image,
        status,
        created_at: details.created_at,
        started_at: details.started_at,
        terminated_at,
        last_active_at,
        exit_code: details.exit_code,
        command: details.command,
        entrypoint: details.entrypoint,
        environment: details.environment,
        timeout_seconds: tags.timeout_seconds,
        auto_remove: tags.auto_remove,
        volumes: tags.volumes,
        routes: tags.routes,
        urls,
    }
}

pub struct RuntimeGateway {
    runtime: Arc<dyn ContainerRuntime>,
    routing: RoutingSettings,
    volumes_root: PathBuf,
    stop_timeout_secs: u64,
    /// Images known to exist locally, with the time they were confirmed
    image_cache: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl RuntimeGateway {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        routing: RoutingSettings,
        volumes_root: PathBuf,
        stop_timeout_secs: u64,
    ) -> Self {
        Self {
            runtime,
            routing,
            volumes_root,
            stop_timeout_secs,
            image_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn routing(&self) -> &RoutingSettings {
        &self.routing
    }

    pub fn volumes_root(&self) -> &Path {
        &self.volumes_root
    }

    pub fn stop_timeout_secs(&self) -> u64 {
        self.stop_timeout_secs
    }

    pub async fn ping(&self) -> Result<()> {
        self.runtime
            .ping()
            .await
            .map_err(|source| SandboxError::RuntimeOperation {
                operation: "ping",
                source,
            })
    }

    /// Make sure `image` is available locally, pulling it if needed.
    /// Failures are logged and reported as `false`.
    pub async fn ensure_image(&self, image: &str) -> bool {
        let cached_at = self.image_cache.read().await.get(image).copied();
        if let Some(cached_at) = cached_at {
            if Utc::now() - cached_at < chrono::Duration::seconds(IMAGE_CACHE_TTL_SECS) {
                debug!("Image {} confirmed recently, skipping lookup", image);
                return true;
            }
            match self.runtime.image_exists(image).await {
                Ok(true) => {
                    debug!("Image {} still present, skipping pull", image);
                    self.image_cache
                        .write()
                        .await
                        .insert(image.to_string(), Utc::now());
                    return true;
                }
                _ => {
                    info!("Image {} was removed, dropping it from the cache", image);
                    self.image_cache.write().await.remove(image);
                }
            }
        }

        let available = match self.runtime.image_exists(image).await {
            Ok(true) => true,
            Ok(false) => match self.runtime.pull_image(image).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to pull image {}: {}", image, e);
                    false
                }
            },
            Err(e) => {
                warn!("Failed to inspect image {}: {}", image, e);
                false
            }
        };

        if available {
            self.image_cache
                .write()
                .await
                .insert(image.to_string(), Utc::now());
        }
        available
    }

    /// Build `tag` from a context directory. Inline Dockerfile content is injected into
    /// the context archive under a generated name. Failures are logged and reported as `false`.
    pub async fn build_image(&self, tag: &str, dockerfile: Option<&str>, context_path: &Path) -> bool {
        let dockerfile_name = match dockerfile {
            Some(_) => format!("Dockerfile.corral-{}", nanoid::nanoid!(8, &NAME_ALPHABET)),
            None => "Dockerfile".to_string(),
        };

        let context_dir = context_path.to_path_buf();
        let inline = dockerfile.map(|content| (dockerfile_name.clone(), content.to_string()));
        let archive =
            tokio::task::spawn_blocking(move || build_context_archive(&context_dir, inline)).await;

        let archive = match archive {
            Ok(Ok(archive)) => archive,
            Ok(Err(e)) => {
                warn!(
                    "Failed to archive build context {}: {}",
                    context_path.display(),
                    e
                );
                return false;
            }
            Err(e) => {
                error!("Build context task failed: {}", e);
                return false;
            }
        };

        match self.runtime.build_image(tag, &dockerfile_name, archive).await {
            Ok(()) => {
                info!("Built image {}", tag);
                self.image_cache
                    .write()
                    .await
                    .insert(tag.to_string(), Utc::now());
                true
            }
            Err(e) => {
                warn!("Failed to build image {}: {}", tag, e);
                false
            }
        }
    }

    /// Create volumes and the container (not started). Any volume created here is removed
    /// again if a later step fails.
    pub async fn create_sandbox(&self, name: &str, config: RuntimeConfig) -> Result<Sandbox> {
        let mut created: Vec<Volume> = Vec::new();

        for planned in &config.volumes {
            let volume_id = format!("{}-{}", name, planned.name);
            match self
                .create_volume(&volume_id, &planned.driver, Some(&planned.size), name, false)
                .await
            {
                Ok(()) => created.push(Volume {
                    id: volume_id,
                    name: planned.name.clone(),
                    size: Some(planned.size.clone()),
                    driver: planned.driver.clone(),
                    mount_path: planned.mount_path.clone(),
                    network: false,
                }),
                Err(e) => {
                    self.remove_volumes(&created).await;
                    return Err(e);
                }
            }
        }

        let mut container = config.container;
        container.mounts = created
            .iter()
            .map(|v| MountSpec {
                source: v.id.clone(),
                target: v.mount_path.clone(),
            })
            .collect();
        container.labels.extend(labels::volume_labels(&created));

        let id = match self.runtime.create_container(name, &container).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to create sandbox {}: {}", name, e);
                self.remove_volumes(&created).await;
                return Err(SandboxError::runtime("create_container", "Sandbox", name, e));
            }
        };

        match self.get_sandbox(&id).await {
            Ok(sandbox) => Ok(sandbox),
            Err(e) => {
                warn!("Sandbox {} vanished right after creation: {}", id, e);
                if let Err(remove) = self.runtime.remove_container(&id, true).await {
                    warn!("Failed to remove sandbox {}: {}", id, remove);
                }
                self.remove_volumes(&created).await;
                Err(e)
            }
        }
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        match self.runtime.start_container(id).await {
            Ok(()) | Err(RuntimeError::NotModified) => Ok(()),
            Err(e) => Err(SandboxError::runtime("start_container", "Sandbox", id, e)),
        }
    }

    /// Stop with a grace period (the configured default when `None`) before killing
    pub async fn stop(&self, id: &str, timeout_secs: Option<u64>) -> Result<()> {
        let timeout = timeout_secs.unwrap_or(self.stop_timeout_secs);
        match self.runtime.stop_container(id, timeout).await {
            Ok(()) | Err(RuntimeError::NotModified) => Ok(()),
            Err(e) => Err(SandboxError::runtime("stop_container", "Sandbox", id, e)),
        }
    }

    pub async fn remove(&self, id: &str, force: bool) -> Result<()> {
        match self.runtime.remove_container(id, force).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(SandboxError::runtime("remove_container", "Sandbox", id, e)),
        }
    }

    /// Force-remove a sandbox together with its non-network volumes
    pub async fn reclaim(&self, sandbox: &Sandbox) -> Result<()> {
        self.remove(&sandbox.id, true).await?;
        self.remove_volumes(&sandbox.volumes).await;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails> {
        let details = self
            .runtime
            .inspect_container(id)
            .await
            .map_err(|e| SandboxError::runtime("inspect_container", "Sandbox", id, e))?;

        if labels::is_managed(&details.labels) {
            Ok(details)
        } else {
            Err(SandboxError::sandbox_not_found(id))
        }
    }

    pub async fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        Ok(sandbox_from_details(self.inspect(id).await?))
    }

    pub async fn get_status(&self, id: &str) -> Result<SandboxStatus> {
        Ok(self.get_sandbox(id).await?.status)
    }

    pub async fn get_raw_stats(&self, id: &str) -> Result<RawStats> {
        let value = self
            .runtime
            .stats(id)
            .await
            .map_err(|e| SandboxError::runtime("stats", "Sandbox", id, e))?;
        Ok(RawStats::from_value(&value))
    }

    /// Managed sandboxes, optionally only those in `status`. Sandboxes that disappear
    /// while listing are skipped.
    pub async fn list_sandboxes(&self, status: Option<SandboxStatus>) -> Result<Vec<Sandbox>> {
        let ids = self
            .runtime
            .list_containers(&[labels::managed_filter()])
            .await
            .map_err(|e| SandboxError::RuntimeOperation {
                operation: "list_containers",
                source: e,
            })?;

        let mut sandboxes = Vec::new();
        for id in ids {
            match self.get_sandbox(&id).await {
                Ok(sandbox) if status.map_or(true, |s| s == sandbox.status) => {
                    sandboxes.push(sandbox)
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to get info for sandbox {}: {}", id, e),
            }
        }

        Ok(sandboxes)
    }

    pub async fn get_volumes_of(&self, id: &str) -> Result<Vec<Volume>> {
        Ok(self.get_sandbox(id).await?.volumes)
    }

    pub async fn get_urls(&self, id: &str) -> Result<BTreeMap<u16, String>> {
        Ok(self.get_sandbox(id).await?.urls)
    }

    pub async fn get_environment(&self, id: &str) -> Result<HashMap<String, String>> {
        Ok(self.get_sandbox(id).await?.environment)
    }

    async fn require_running(&self, id: &str) -> Result<()> {
        match self.get_status(id).await? {
            SandboxStatus::Running => Ok(()),
            _ => Err(SandboxError::NotRunning(id.to_string())),
        }
    }

    /// Run a command to completion; `wait` bounds how long the caller is willing to block
    pub async fn exec_command(
        &self,
        id: &str,
        argv: Vec<String>,
        wait: Option<Duration>,
    ) -> Result<ExecOutput> {
        if argv.is_empty() {
            return Err(SandboxError::Validation("Command must not be empty".to_string()));
        }
        self.require_running(id).await?;

        let exec = self.runtime.exec(id, argv);
        let output = match wait {
            Some(limit) => tokio::time::timeout(limit, exec).await.map_err(|_| {
                SandboxError::Timeout {
                    seconds: limit.as_secs(),
                }
            })?,
            None => exec.await,
        };

        output.map_err(|e| SandboxError::runtime("exec", "Sandbox", id, e))
    }

    /// Start a command and hand back its live output
    pub async fn stream_output(&self, id: &str, argv: Vec<String>) -> Result<OutputStream> {
        if argv.is_empty() {
            return Err(SandboxError::Validation("Command must not be empty".to_string()));
        }
        self.require_running(id).await?;

        self.runtime
            .exec_stream(id, argv)
            .await
            .map_err(|e| SandboxError::runtime("exec_stream", "Sandbox", id, e))
    }

    pub async fn stream_logs(&self, id: &str, follow: bool) -> Result<OutputStream> {
        self.inspect(id).await?;
        self.runtime
            .logs(id, follow)
            .await
            .map_err(|e| SandboxError::runtime("logs", "Sandbox", id, e))
    }

    /// Tar archive of `path` inside the sandbox
    pub async fn export_archive(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        self.inspect(id).await?;
        self.runtime
            .download_archive(id, path)
            .await
            .map_err(|e| SandboxError::runtime("download_archive", "Path", path, e))
    }

    pub async fn update_labels(&self, id: &str, labels: &HashMap<String, String>) -> Result<()> {
        self.inspect(id).await?;
        self.runtime
            .update_labels(id, labels)
            .await
            .map_err(|e| SandboxError::runtime("update_labels", "Sandbox", id, e))
    }

    async fn recreate(&self, id: &str, patch: &ContainerPatch) -> Result<Sandbox> {
        let new_id = self
            .runtime
            .recreate_container(id, patch)
            .await
            .map_err(|e| SandboxError::runtime("recreate_container", "Sandbox", id, e))?;
        self.get_sandbox(&new_id).await
    }

    /// Replace the entrypoint and/or command; the sandbox is re-created and restarted
    pub async fn update_command(
        &self,
        id: &str,
        entrypoint: Option<Vec<String>>,
        command: Option<Vec<String>>,
    ) -> Result<Sandbox> {
        if entrypoint.is_none() && command.is_none() {
            return Err(SandboxError::Validation(
                "Either entrypoint or command must be provided".to_string(),
            ));
        }
        self.inspect(id).await?;

        let patch = ContainerPatch {
            entrypoint,
            command,
            ..Default::default()
        };
        let sandbox = self.recreate(id, &patch).await?;
        info!("Updated command of sandbox {} (now {})", sandbox.name, sandbox.id);
        Ok(sandbox)
    }

    /// Merge `vars` into (or replace) the environment; the sandbox is re-created and restarted
    pub async fn update_environment(
        &self,
        id: &str,
        vars: HashMap<String, String>,
        merge: bool,
    ) -> Result<Sandbox> {
        for key in vars.keys() {
            validate_env_key(key)?;
        }

        let current = self.inspect(id).await?;
        let environment = if merge {
            let mut environment = current.environment;
            environment.extend(vars);
            environment
        } else {
            vars
        };

        let patch = ContainerPatch {
            environment: Some(environment),
            ..Default::default()
        };
        let sandbox = self.recreate(id, &patch).await?;
        info!("Updated environment of sandbox {} (now {})", sandbox.name, sandbox.id);
        Ok(sandbox)
    }

    /// Return the id of `name`, creating the network if it does not exist yet
    pub async fn ensure_network(
        &self,
        name: &str,
        driver: &str,
        labels: &HashMap<String, String>,
    ) -> Result<String> {
        match self.runtime.inspect_network(name).await {
            Ok(id) => return Ok(id),
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(SandboxError::runtime("inspect_network", "Network", name, e)),
        }

        match self.runtime.create_network(name, driver, labels).await {
            Ok(id) => Ok(id),
            // Created concurrently by someone else
            Err(RuntimeError::Conflict(_)) => self
                .runtime
                .inspect_network(name)
                .await
                .map_err(|e| SandboxError::runtime("inspect_network", "Network", name, e)),
            Err(e) => Err(SandboxError::runtime("create_network", "Network", name, e)),
        }
    }

    pub async fn connect_network(&self, network: &str, id: &str) -> Result<()> {
        self.inspect(id).await?;
        self.runtime
            .connect_network(network, id)
            .await
            .map_err(|e| SandboxError::runtime("connect_network", "Network", network, e))
    }

    pub async fn disconnect_network(&self, network: &str, id: &str) -> Result<()> {
        self.inspect(id).await?;
        self.runtime
            .disconnect_network(network, id)
            .await
            .map_err(|e| SandboxError::runtime("disconnect_network", "Network", network, e))
    }

    /// Create a shareable volume that outlives the sandboxes it is mounted into
    pub async fn create_network_volume(
        &self,
        name: &str,
        driver: &str,
        size: Option<&str>,
    ) -> Result<Volume> {
        self.create_volume(name, driver, size, "", true).await?;
        Ok(Volume {
            id: name.to_string(),
            name: name.to_string(),
            size: size.map(str::to_string),
            driver: driver.to_string(),
            mount_path: mount_path(name),
            network: true,
        })
    }

    /// Attach a network volume at `target` (`/mnt/{name}` by default); the container is
    /// re-created with the extra mount
    pub async fn mount_network_volume(
        &self,
        id: &str,
        volume_name: &str,
        target: Option<&str>,
    ) -> Result<Sandbox> {
        let sandbox = self.get_sandbox(id).await?;
        if sandbox.volumes.iter().any(|v| v.id == volume_name) {
            debug!("Volume {} already mounted in {}", volume_name, sandbox.name);
            return Ok(sandbox);
        }

        let volume = Volume {
            id: volume_name.to_string(),
            name: volume_name.to_string(),
            size: None,
            driver: "local".to_string(),
            mount_path: target
                .map(str::to_string)
                .unwrap_or_else(|| mount_path(volume_name)),
            network: true,
        };
        if !volume.mount_path.starts_with('/') {
            return Err(SandboxError::Validation(format!(
                "Mount path must be absolute: {}",
                volume.mount_path
            )));
        }
        let mut volumes = sandbox.volumes.clone();
        volumes.push(volume.clone());

        let patch = ContainerPatch {
            add_mounts: vec![MountSpec {
                source: volume.id.clone(),
                target: volume.mount_path.clone(),
            }],
            labels: labels::volume_labels(&volumes),
            ..Default::default()
        };
        let sandbox = self.recreate(id, &patch).await?;
        info!("Mounted network volume {} into {}", volume_name, sandbox.name);
        Ok(sandbox)
    }

    /// Detach a network volume; the container is re-created without the mount
    pub async fn unmount_network_volume(&self, id: &str, volume_name: &str) -> Result<Sandbox> {
        let sandbox = self.get_sandbox(id).await?;
        let Some(volume) = sandbox
            .volumes
            .iter()
            .find(|v| v.network && v.id == volume_name)
            .cloned()
        else {
            return Err(SandboxError::NotFound {
                kind: "Volume",
                id: volume_name.to_string(),
            });
        };

        let volumes: Vec<Volume> = sandbox
            .volumes
            .iter()
            .filter(|v| v.id != volume.id)
            .cloned()
            .collect();
        let patch = ContainerPatch {
            remove_mounts: vec![volume.mount_path.clone()],
            labels: labels::volume_labels(&volumes),
            ..Default::default()
        };
        let sandbox = self.recreate(id, &patch).await?;
        info!("Unmounted network volume {} from {}", volume_name, sandbox.name);
        Ok(sandbox)
    }

    /// Host directory backing a volume
    pub fn volume_host_path(&self, volume_id: &str) -> PathBuf {
        self.volumes_root.join(volume_id)
    }

    async fn create_volume(
        &self,
        volume_id: &str,
        driver: &str,
        size: Option<&str>,
        sandbox_name: &str,
        network: bool,
    ) -> Result<()> {
        let mut labels = HashMap::from([(
            labels::VOLUME_NETWORK_LABEL.to_string(),
            network.to_string(),
        )]);
        if !sandbox_name.is_empty() {
            labels.insert(labels::VOLUME_SANDBOX_LABEL.to_string(), sandbox_name.to_string());
        }
        if let Some(size) = size {
            labels.insert(labels::VOLUME_SIZE_LABEL.to_string(), size.to_string());
        }

        // Local volumes are bind-backed so their files are reachable from the host
        let mut driver_opts = HashMap::new();
        if driver == "local" {
            let host_path = self.volume_host_path(volume_id);
            tokio::fs::create_dir_all(&host_path).await?;
            driver_opts.insert("type".to_string(), "none".to_string());
            driver_opts.insert("o".to_string(), "bind".to_string());
            driver_opts.insert("device".to_string(), host_path.display().to_string());
        }

        let config = VolumeConfig {
            name: volume_id.to_string(),
            driver: driver.to_string(),
            driver_opts,
            labels,
        };
        self.runtime
            .create_volume(&config)
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::runtime("create_volume", "Volume", volume_id, e))
    }

    /// Best-effort removal of sandbox-owned volumes; network volumes are left alone
    pub async fn remove_volumes(&self, volumes: &[Volume]) {
        for volume in volumes.iter().filter(|v| !v.network) {
            if let Err(e) = self.runtime.remove_volume(&volume.id).await {
                warn!("Failed to remove volume {}: {}", volume.id, e);
                continue;
            }
            if volume.driver == "local" {
                let host_path = self.volume_host_path(&volume.id);
                if let Err(e) = tokio::fs::remove_dir_all(&host_path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove {}: {}", host_path.display(), e);
                    }
                }
            }
        }
    }
}

fn build_context_archive(
    context_dir: &Path,
    inline_dockerfile: Option<(String, String)>,
) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    archive.append_dir_all(".", context_dir)?;

    if let Some((name, content)) = inline_dockerfile {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(Utc::now().timestamp().max(0) as u64);
        header.set_cksum();
        archive.append_data(&mut header, name, content.as_bytes())?;
    }

    archive.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_status_mapping() {
        let started = Some(Utc::now());

        assert_eq!(status_from_state("created", None, None), SandboxStatus::Pending);
        assert_eq!(status_from_state("running", Some(0), started), SandboxStatus::Running);
        assert_eq!(status_from_state("restarting", Some(1), started), SandboxStatus::Running);
        assert_eq!(status_from_state("paused", Some(0), started), SandboxStatus::Running);
        assert_eq!(status_from_state("exited", Some(0), started), SandboxStatus::Stopped);
        assert_eq!(status_from_state("exited", Some(137), started), SandboxStatus::Stopped);
        assert_eq!(status_from_state("exited", Some(127), None), SandboxStatus::Failed);
        assert_eq!(status_from_state("created", Some(127), None), SandboxStatus::Failed);
        assert_eq!(status_from_state("dead", Some(0), started), SandboxStatus::Failed);
        assert_eq!(status_from_state("removing", Some(0), started), SandboxStatus::Terminated);
    }

    #[test]
    fn test_last_active_never_precedes_start() {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let started = Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap();
        let details = ContainerDetails {
            id: "abc".to_string(),
            name: "sandbox-abc".to_string(),
            image: "alpine:3.19".to_string(),
            state: "running".to_string(),
            exit_code: Some(0),
            created_at: created,
            started_at: Some(started),
            finished_at: None,
            labels: SandboxTags::default().to_labels(),
            environment: HashMap::new(),
            command: None,
            entrypoint: None,
            mounts: Vec::new(),
            networks: Vec::new(),
        };

        let sandbox = sandbox_from_details(details);
        assert_eq!(sandbox.last_active_at, started);
        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert!(sandbox.terminated_at.is_none());
    }

    #[test]
    fn test_context_archive_contains_inline_dockerfile() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("app.py"), "print('hi')").unwrap();

        let archive = build_context_archive(
            dir.path(),
            Some(("Dockerfile.inline".to_string(), "FROM python:3.12\n".to_string())),
        )
        .unwrap();

        let mut names: Vec<String> = tar::Archive::new(archive.as_slice())
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().display().to_string())
            .collect();
        names.sort();

        assert!(names.iter().any(|n| n.ends_with("app.py")));
        assert!(names.contains(&"Dockerfile.inline".to_string()));
    }

    #[test]
    fn test_sandbox_names_are_unique() {
        let a = new_sandbox_name();
        let b = new_sandbox_name();
        assert!(a.starts_with("sandbox-"));
        assert_eq!(a.len(), "sandbox-".len() + 12);
        assert_ne!(a, b);
    }
}
