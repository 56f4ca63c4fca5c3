// ABOUTME: Docker implementation of the container runtime via bollard
// ABOUTME: Maps runtime configs to Docker API calls, keeps a persistent label overlay and pumps output streams

use super::{
    parse_timestamp, ContainerConfig, ContainerDetails, ContainerPatch, ContainerRuntime,
    ExecOutput, MountSpec, OutputChunk, OutputStream, RuntimeError, RuntimeResult, StreamKind,
    VolumeConfig,
};
use async_stream::stream;
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
        LogOutput, LogsOptions, RemoveContainerOptions, RenameContainerOptions,
        StartContainerOptions, StatsOptions, StopContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::{BuildImageOptions, CreateImageOptions},
    models::{ContainerInspectResponse, HostConfig, Mount, MountTypeEnum},
    network::{ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions},
    volume::{CreateVolumeOptions, RemoveVolumeOptions},
    Docker, API_DEFAULT_VERSION,
};
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// File holding label overrides, relative to the state directory
const LABEL_OVERLAY_FILE: &str = "labels.json";

const PARKED_SUFFIX_ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

pub struct DockerRuntime {
    client: Docker,
    /// Timeout for image pull and build operations
    pull_timeout: Duration,
    overlay: LabelOverlay,
}

impl DockerRuntime {
    /// Connect to the Docker daemon and verify it answers a ping.
    ///
    /// `docker_host` accepts `unix://` socket paths and `tcp://`/`http://` addresses;
    /// without one the platform defaults are used.
    pub async fn connect(
        docker_host: Option<&str>,
        request_timeout: Duration,
        pull_timeout: Duration,
        state_dir: &Path,
    ) -> RuntimeResult<Self> {
        let timeout_secs = request_timeout.as_secs();
        let client = match docker_host {
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_socket(host, timeout_secs, API_DEFAULT_VERSION)
            }
            Some(host) => Docker::connect_with_http(host, timeout_secs, API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        client.ping().await.map_err(|e| {
            error!("Failed to connect to Docker daemon: {}", e);
            RuntimeError::Unavailable(e.to_string())
        })?;

        info!("Successfully connected to Docker daemon");
        Ok(Self::with_client(client, pull_timeout, state_dir).await)
    }

    /// Wrap an existing client without pinging it
    pub async fn with_client(client: Docker, pull_timeout: Duration, state_dir: &Path) -> Self {
        Self {
            client,
            pull_timeout,
            overlay: LabelOverlay::load(state_dir.join(LABEL_OVERLAY_FILE)).await,
        }
    }

    /// Convert a runtime config to the bollard representation
    fn to_bollard_config(config: &ContainerConfig) -> Config<String> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = config
            .exposed_ports
            .iter()
            .map(|port| (port.clone(), HashMap::new()))
            .collect();

        let mut port_bindings = HashMap::new();
        for binding in &config.port_bindings {
            exposed_ports.insert(binding.container_port.clone(), HashMap::new());
            port_bindings.insert(
                binding.container_port.clone(),
                Some(vec![bollard::models::PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(binding.host_port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            cpu_quota: Some(config.cpu_quota),
            cpu_period: Some(config.cpu_period),
            memory: Some(config.memory_bytes),
            pids_limit: Some(config.pids_limit),
            readonly_rootfs: Some(config.read_only_root_fs),
            network_mode: Some(config.network_mode.clone()),
            cap_drop: (!config.cap_drop.is_empty()).then(|| config.cap_drop.clone()),
            security_opt: (!config.security_opt.is_empty()).then(|| config.security_opt.clone()),
            privileged: Some(config.privileged),
            auto_remove: Some(config.auto_remove),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            mounts: Some(config.mounts.iter().map(to_bollard_mount).collect()),
            ..Default::default()
        };

        Config {
            image: Some(config.image.clone()),
            cmd: config.command.clone(),
            entrypoint: config.entrypoint.clone(),
            env: Some(env_vec(&config.environment)),
            labels: Some(config.labels.clone()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn inspect_raw(&self, id: &str) -> RuntimeResult<ContainerInspectResponse> {
        self.client
            .inspect_container(id, None)
            .await
            .map_err(map_bollard_error)
    }

    async fn rename(&self, id: &str, name: &str) -> RuntimeResult<()> {
        self.client
            .rename_container(
                id,
                RenameContainerOptions {
                    name: name.to_string(),
                },
            )
            .await
            .map_err(map_bollard_error)
    }

    fn spawn_pump<S>(chunks: S) -> OutputStream
    where
        S: Stream<Item = OutputChunk> + Send + 'static,
    {
        let (tx, output) = OutputStream::channel();

        tokio::spawn(async move {
            let mut chunks = Box::pin(chunks);
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!("Output consumer dropped, closing runtime session");
                        break;
                    }
                    next = chunks.next() => match next {
                        Some(chunk) => {
                            if tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        output
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_bollard_error(e)),
        }
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut last_status = String::new();
            while let Some(progress) = stream.next().await {
                let progress = progress.map_err(map_bollard_error)?;
                if let Some(error) = progress.error {
                    return Err(RuntimeError::Api(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = progress.status {
                    if status != last_status {
                        debug!("Pull status: {}", status);
                        last_status = status;
                    }
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::Api(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn build_image(&self, tag: &str, dockerfile: &str, context: Vec<u8>) -> RuntimeResult<()> {
        info!("Building image {} from {} byte context", tag, context.len());

        let options = BuildImageOptions {
            dockerfile: dockerfile.to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };
        let mut stream = self.client.build_image(options, None, Some(context.into()));

        let result = tokio::time::timeout(self.pull_timeout, async {
            while let Some(step) = stream.next().await {
                let step = step.map_err(map_bollard_error)?;
                if let Some(error) = step.error {
                    return Err(RuntimeError::Api(format!(
                        "Failed to build image {}: {}",
                        tag, error
                    )));
                }
                if let Some(output) = step.stream {
                    let line = output.trim();
                    if !line.is_empty() {
                        debug!("Build: {}", line);
                    }
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(RuntimeError::Api(format!(
                "Timeout building image {} after {:?}",
                tag, self.pull_timeout
            ))),
        }
    }

    async fn create_container(&self, name: &str, config: &ContainerConfig) -> RuntimeResult<String> {
        debug!("Creating container {} with image {}", name, config.image);

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let response = self
            .client
            .create_container(Some(options), Self::to_bollard_config(config))
            .await
            .map_err(|e| {
                error!("Failed to create container {}: {}", name, e);
                map_bollard_error(e)
            })?;

        // A reused name must not inherit overrides from an earlier container
        self.overlay.forget(name).await?;

        info!("Created container {} ({})", name, response.id);
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        debug!("Starting container {}", id);

        match self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {}
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!("Container {} already running", id),
            Err(e) => {
                error!("Failed to start container {}: {}", id, e);
                return Err(map_bollard_error(e));
            }
        }

        info!("Started container {}", id);
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout_secs: u64) -> RuntimeResult<()> {
        debug!("Stopping container {} (timeout: {}s)", id, timeout_secs);

        let options = StopContainerOptions {
            t: timeout_secs as i64,
        };
        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => {}
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!("Container {} already stopped", id),
            Err(e) => {
                error!("Failed to stop container {}: {}", id, e);
                return Err(map_bollard_error(e));
            }
        }

        info!("Stopped container {}", id);
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()> {
        debug!("Removing container {} (force={})", id, force);

        let name = match self.inspect_raw(id).await {
            Ok(inspect) => Some(container_name(&inspect, id)),
            Err(RuntimeError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        match self.client.remove_container(id, Some(options)).await {
            Ok(_) => {}
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => debug!("Container {} already removed", id),
            Err(e) => {
                error!("Failed to remove container {}: {}", id, e);
                return Err(map_bollard_error(e));
            }
        }

        if let Some(name) = name {
            self.overlay.forget(&name).await?;
        }

        info!("Removed container {}", id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails> {
        let inspect = self.inspect_raw(id).await?;
        let name = container_name(&inspect, id);
        let config = inspect.config.clone().unwrap_or_default();
        let state = inspect.state.clone().unwrap_or_default();

        let mut labels = config.labels.clone().unwrap_or_default();
        labels.extend(self.overlay.get(&name).await);

        let mounts = inspect
            .mounts
            .as_ref()
            .map(|mounts| {
                mounts
                    .iter()
                    .filter_map(|m| match (&m.name, &m.destination) {
                        (Some(source), Some(target)) => Some(MountSpec {
                            source: source.clone(),
                            target: target.clone(),
                        }),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let networks = inspect
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .map(|networks| networks.keys().cloned().collect())
            .unwrap_or_default();

        Ok(ContainerDetails {
            id: inspect.id.clone().unwrap_or_else(|| id.to_string()),
            name,
            image: config
                .image
                .clone()
                .or_else(|| inspect.image.clone())
                .unwrap_or_default(),
            state: state
                .status
                .as_ref()
                .map(|s| s.as_ref().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            exit_code: state.exit_code,
            created_at: parse_timestamp(inspect.created.as_deref()).unwrap_or_else(Utc::now),
            started_at: parse_timestamp(state.started_at.as_deref()),
            finished_at: parse_timestamp(state.finished_at.as_deref()),
            labels,
            environment: parse_env(config.env.as_deref().unwrap_or_default()),
            command: config.cmd.clone(),
            entrypoint: config.entrypoint.clone(),
            mounts,
            networks,
        })
    }

    async fn list_containers(&self, label_filters: &[String]) -> RuntimeResult<Vec<String>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(map_bollard_error)?;

        let overrides = self.overlay.snapshot().await;
        let mut ids = Vec::new();
        for container in containers {
            let Some(id) = container.id else { continue };
            let name = container
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();

            let mut labels = container.labels.unwrap_or_default();
            if let Some(extra) = overrides.get(&name) {
                labels.extend(extra.clone());
            }

            let matches = label_filters.iter().all(|filter| match filter.split_once('=') {
                Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
                None => labels.contains_key(filter.as_str()),
            });
            if matches {
                ids.push(id);
            }
        }

        Ok(ids)
    }

    async fn update_labels(&self, id: &str, labels: &HashMap<String, String>) -> RuntimeResult<()> {
        let inspect = self.inspect_raw(id).await?;
        let name = container_name(&inspect, id);
        self.overlay.merge(&name, labels).await?;
        debug!("Updated {} labels on container {}", labels.len(), name);
        Ok(())
    }

    async fn recreate_container(&self, id: &str, patch: &ContainerPatch) -> RuntimeResult<String> {
        let inspect = self.inspect_raw(id).await?;
        let name = container_name(&inspect, id);
        let config = inspect.config.clone().unwrap_or_default();
        let mut host_config = inspect.host_config.clone().unwrap_or_default();

        let mut mounts = host_config.mounts.take().unwrap_or_default();
        mounts.retain(|m| {
            m.target
                .as_ref()
                .map(|target| !patch.remove_mounts.contains(target))
                .unwrap_or(true)
        });
        mounts.extend(patch.add_mounts.iter().map(to_bollard_mount));
        host_config.mounts = Some(mounts);

        // Overrides are folded into the real labels of the replacement
        let mut labels = config.labels.clone().unwrap_or_default();
        labels.extend(self.overlay.get(&name).await);
        labels.extend(patch.labels.clone());

        let primary_network = host_config.network_mode.clone().unwrap_or_default();
        let extra_networks: Vec<String> = inspect
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .map(|networks| {
                networks
                    .keys()
                    .filter(|n| **n != primary_network)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let replacement = Config {
            image: config.image.clone(),
            cmd: patch.command.clone().or_else(|| config.cmd.clone()),
            entrypoint: patch.entrypoint.clone().or_else(|| config.entrypoint.clone()),
            env: patch
                .environment
                .as_ref()
                .map(env_vec)
                .or_else(|| config.env.clone()),
            labels: Some(labels),
            exposed_ports: config.exposed_ports.clone(),
            working_dir: config.working_dir.clone(),
            user: config.user.clone(),
            host_config: Some(host_config),
            ..Default::default()
        };

        let parked = format!("{}-old-{}", name, nanoid::nanoid!(8, &PARKED_SUFFIX_ALPHABET));
        self.rename(id, &parked).await?;

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let new_id = match self.client.create_container(Some(options), replacement).await {
            Ok(response) => response.id,
            Err(e) => {
                error!("Failed to re-create container {}: {}", name, e);
                if let Err(restore) = self.rename(id, &name).await {
                    warn!("Failed to restore name of container {}: {}", id, restore);
                }
                return Err(map_bollard_error(e));
            }
        };
        self.overlay.forget(&name).await?;

        for network in &extra_networks {
            if let Err(e) = self.connect_network(network, &new_id).await {
                warn!("Failed to reconnect {} to network {}: {}", name, network, e);
            }
        }

        self.stop_container(id, 10).await?;
        match self.remove_container(id, true).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => warn!("Failed to remove replaced container {}: {}", id, e),
        }

        self.start_container(&new_id).await?;
        info!("Re-created container {} ({} -> {})", name, id, new_id);
        Ok(new_id)
    }

    async fn stats(&self, id: &str) -> RuntimeResult<serde_json::Value> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stats_stream = self.client.stats(id, Some(options));

        match stats_stream.next().await {
            Some(Ok(stats)) => {
                serde_json::to_value(&stats).map_err(|e| RuntimeError::Api(e.to_string()))
            }
            Some(Err(e)) => Err(map_bollard_error(e)),
            None => Err(RuntimeError::Api(format!("No stats returned for {}", id))),
        }
    }

    async fn create_volume(&self, config: &VolumeConfig) -> RuntimeResult<String> {
        debug!("Creating volume {} (driver: {})", config.name, config.driver);

        let options = CreateVolumeOptions {
            name: config.name.clone(),
            driver: config.driver.clone(),
            driver_opts: config.driver_opts.clone(),
            labels: config.labels.clone(),
        };
        let volume = self
            .client
            .create_volume(options)
            .await
            .map_err(map_bollard_error)?;

        info!("Created volume {}", volume.name);
        Ok(volume.name)
    }

    async fn remove_volume(&self, name: &str) -> RuntimeResult<()> {
        match self
            .client
            .remove_volume(name, Some(RemoveVolumeOptions { force: false }))
            .await
        {
            Ok(()) => {
                info!("Removed volume {}", name);
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Volume {} already removed", name);
                Ok(())
            }
            Err(e) => Err(map_bollard_error(e)),
        }
    }

    async fn inspect_network(&self, name: &str) -> RuntimeResult<String> {
        let network = self
            .client
            .inspect_network::<String>(name, None)
            .await
            .map_err(map_bollard_error)?;
        Ok(network.id.unwrap_or_else(|| name.to_string()))
    }

    async fn create_network(
        &self,
        name: &str,
        driver: &str,
        labels: &HashMap<String, String>,
    ) -> RuntimeResult<String> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: driver.to_string(),
            labels: labels.clone(),
            ..Default::default()
        };
        self.client
            .create_network(options)
            .await
            .map_err(map_bollard_error)?;

        info!("Created network {} (driver: {})", name, driver);
        self.inspect_network(name).await
    }

    async fn connect_network(&self, network: &str, container_id: &str) -> RuntimeResult<()> {
        let options = ConnectNetworkOptions {
            container: container_id.to_string(),
            ..Default::default()
        };
        self.client
            .connect_network(network, options)
            .await
            .map_err(map_bollard_error)
    }

    async fn disconnect_network(&self, network: &str, container_id: &str) -> RuntimeResult<()> {
        let options = DisconnectNetworkOptions {
            container: container_id.to_string(),
            force: true,
        };
        self.client
            .disconnect_network(network, options)
            .await
            .map_err(map_bollard_error)
    }

    async fn exec(&self, id: &str, argv: Vec<String>) -> RuntimeResult<ExecOutput> {
        info!("Executing command in container {}: {:?}", id, argv);

        let exec = self
            .client
            .create_exec(id, exec_options(argv))
            .await
            .map_err(map_bollard_error)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(map_bollard_error)?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg.map_err(map_bollard_error)? {
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            stdout.extend_from_slice(&message)
                        }
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Api(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(map_bollard_error)?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(0),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn exec_stream(&self, id: &str, argv: Vec<String>) -> RuntimeResult<OutputStream> {
        info!("Streaming command in container {}: {:?}", id, argv);

        let exec = self
            .client
            .create_exec(id, exec_options(argv))
            .await
            .map_err(map_bollard_error)?;

        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(map_bollard_error)?
        {
            StartExecResults::Attached { output, .. } => Ok(Self::spawn_pump(output_chunks(output))),
            StartExecResults::Detached => Err(RuntimeError::Api(
                "Exec was detached unexpectedly".to_string(),
            )),
        }
    }

    async fn logs(&self, id: &str, follow: bool) -> RuntimeResult<OutputStream> {
        // Surface a missing container now rather than as an empty stream
        self.inspect_raw(id).await?;

        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        let logs = self.client.logs(id, Some(options));
        Ok(Self::spawn_pump(output_chunks(logs)))
    }

    async fn download_archive(&self, id: &str, path: &str) -> RuntimeResult<Vec<u8>> {
        debug!("Downloading {}:{}", id, path);

        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.client.download_from_container(id, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk.map_err(map_bollard_error)?);
        }
        Ok(data)
    }
}

/// Persistent label overrides keyed by container name.
///
/// Docker labels are fixed at creation, so tag rewrites land here and are merged
/// over the real labels on every inspect and list.
struct LabelOverlay {
    path: PathBuf,
    entries: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl LabelOverlay {
    async fn load(path: PathBuf) -> Self {
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Ignoring unreadable label overlay {}: {}", path.display(), e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    async fn get(&self, name: &str) -> HashMap<String, String> {
        self.entries
            .lock()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    async fn snapshot(&self) -> HashMap<String, HashMap<String, String>> {
        self.entries.lock().await.clone()
    }

    async fn merge(&self, name: &str, labels: &HashMap<String, String>) -> RuntimeResult<()> {
        let mut entries = self.entries.lock().await;
        entries
            .entry(name.to_string())
            .or_default()
            .extend(labels.clone());
        self.persist(&entries).await
    }

    async fn forget(&self, name: &str) -> RuntimeResult<()> {
        let mut entries = self.entries.lock().await;
        if entries.remove(name).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    async fn persist(&self, entries: &HashMap<String, HashMap<String, String>>) -> RuntimeResult<()> {
        let bytes = serde_json::to_vec_pretty(entries)
            .map_err(|e| RuntimeError::Api(format!("Failed to encode label overlay: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RuntimeError::Api(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        tokio::fs::write(&self.path, bytes).await.map_err(|e| {
            RuntimeError::Api(format!("Failed to write {}: {}", self.path.display(), e))
        })
    }
}

fn map_bollard_error(error: BollardError) -> RuntimeError {
    match error {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict(message),
        BollardError::DockerResponseServerError {
            status_code: 304, ..
        } => RuntimeError::NotModified,
        BollardError::RequestTimeoutError => {
            RuntimeError::Unavailable("request to Docker timed out".to_string())
        }
        BollardError::SocketNotFoundError(path) => {
            RuntimeError::Unavailable(format!("Docker socket not found: {}", path))
        }
        other => RuntimeError::Api(other.to_string()),
    }
}

fn container_name(inspect: &ContainerInspectResponse, fallback: &str) -> String {
    inspect
        .name
        .as_deref()
        .unwrap_or(fallback)
        .trim_start_matches('/')
        .to_string()
}

fn to_bollard_mount(mount: &MountSpec) -> Mount {
    Mount {
        source: Some(mount.source.clone()),
        target: Some(mount.target.clone()),
        typ: Some(MountTypeEnum::VOLUME),
        read_only: Some(false),
        ..Default::default()
    }
}

fn env_vec(environment: &HashMap<String, String>) -> Vec<String> {
    let mut vars: Vec<String> = environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    vars.sort();
    vars
}

fn parse_env(vars: &[String]) -> HashMap<String, String> {
    vars.iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn exec_options(argv: Vec<String>) -> CreateExecOptions<String> {
    CreateExecOptions {
        cmd: Some(argv),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    }
}

/// Adapt raw Docker output frames into timestamped chunks, ending at the first error
fn output_chunks<S>(source: S) -> impl Stream<Item = OutputChunk> + Send + 'static
where
    S: Stream<Item = Result<LogOutput, BollardError>> + Send + 'static,
{
    stream! {
        let mut source = Box::pin(source);
        while let Some(frame) = source.next().await {
            let (stream, data) = match frame {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    (StreamKind::Stdout, message.to_vec())
                }
                Ok(LogOutput::StdErr { message }) => (StreamKind::Stderr, message.to_vec()),
                Ok(LogOutput::StdIn { .. }) => continue,
                Err(e) => {
                    error!("Error reading container output: {}", e);
                    break;
                }
            };
            yield OutputChunk {
                timestamp: Utc::now(),
                stream,
                data,
            };
        }
    }
}
