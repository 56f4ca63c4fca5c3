// ABOUTME: SandboxEngine facade composing validation, translation, gateway and background loops
// ABOUTME: The single entry point a front door (HTTP API, CLI) drives

use crate::error::{Result, SandboxError};
use crate::gateway::{new_sandbox_name, RuntimeGateway};
use crate::history::{HistorySink, LifecycleKind, LifecycleRecord, NoopHistory};
use crate::labels;
use crate::metrics::MetricsPublisher;
use crate::runtime::{ContainerRuntime, DockerRuntime, ExecOutput, OutputStream};
use crate::scheduler::{ActivityTracker, CleanupReport, ReconciliationScheduler, Reconciler};
use crate::settings::EngineSettings;
use crate::stats;
use crate::translator::translate;
use crate::types::{DirEntry, LifecycleEvent, MetricSample, Sandbox, SandboxSpec, SandboxStatus, Volume};
use crate::validation::validate_spec;
use crate::volumes::VolumeFiles;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const NETWORK_DRIVER: &str = "bridge";

pub struct SandboxEngine {
    settings: EngineSettings,
    gateway: Arc<RuntimeGateway>,
    files: VolumeFiles,
    scheduler: ReconciliationScheduler,
    publisher: Arc<MetricsPublisher>,
    history: Arc<dyn HistorySink>,
}

impl SandboxEngine {
    /// Connect to Docker as configured and assemble the engine
    pub async fn connect(settings: EngineSettings) -> Result<Self> {
        let runtime = DockerRuntime::connect(
            settings.docker_host.as_deref(),
            settings.docker_timeout,
            settings.image_pull_timeout,
            &settings.state_dir,
        )
        .await
        .map_err(|source| SandboxError::RuntimeOperation {
            operation: "connect",
            source,
        })?;

        Self::with_runtime(Arc::new(runtime), settings, Arc::new(NoopHistory))
    }

    /// Assemble the engine over any runtime implementation
    pub fn with_runtime(
        runtime: Arc<dyn ContainerRuntime>,
        settings: EngineSettings,
        history: Arc<dyn HistorySink>,
    ) -> Result<Self> {
        let gateway = Arc::new(RuntimeGateway::new(
            runtime,
            settings.routing.clone(),
            settings.volumes_root.clone(),
            settings.stop_timeout_secs,
        ));
        let activity = Arc::new(ActivityTracker::new(settings.scheduler.activity_cpu_floor));

        let reconciler = Arc::new(Reconciler::new(
            gateway.clone(),
            settings.scheduler.clone(),
            activity.clone(),
            history.clone(),
        ));
        let publisher = Arc::new(MetricsPublisher::new(
            gateway.clone(),
            settings.monitor.clone(),
            activity,
            history.clone(),
        )?);

        Ok(Self {
            files: VolumeFiles::new(gateway.clone()),
            scheduler: ReconciliationScheduler::new(reconciler),
            settings,
            gateway,
            publisher,
            history,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Start the reconciliation and metrics loops
    pub async fn start(&self) {
        self.scheduler.start().await;
        self.publisher.start().await;
        info!("Sandbox engine started");
    }

    /// Stop the background loops, waiting for in-flight passes
    pub async fn stop(&self) {
        self.scheduler.stop().await;
        self.publisher.stop().await;
        info!("Sandbox engine stopped");
    }

    pub async fn run_cleanup_pass(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        self.scheduler.reconciler().run_cleanup_pass(now).await
    }

    pub async fn run_timeout_pass(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.scheduler.reconciler().run_timeout_pass(now).await
    }

    /// Validate, provision and start a sandbox. A sandbox that fails to start is removed
    /// together with its volumes and the start error is returned.
    pub async fn create_sandbox(&self, mut spec: SandboxSpec) -> Result<Sandbox> {
        validate_spec(&spec, &self.settings.limits)?;
        self.prepare_image(&spec).await?;

        if spec.timeout_seconds.is_none() && self.settings.default_timeout_secs > 0 {
            spec.timeout_seconds = Some(self.settings.default_timeout_secs);
        }

        if spec.resources.network_enabled {
            let network_labels =
                HashMap::from([(labels::MANAGED_LABEL.to_string(), "true".to_string())]);
            self.gateway
                .ensure_network(&self.settings.routing.network, NETWORK_DRIVER, &network_labels)
                .await?;
        }

        let name = new_sandbox_name();
        let config = translate(&spec, &self.settings.routing);
        let sandbox = match self.gateway.create_sandbox(&name, config).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                self.record(LifecycleRecord::now(&name, LifecycleKind::Failed).because(e.to_string()))
                    .await;
                return Err(e);
            }
        };
        self.record(LifecycleRecord::now(&sandbox.id, LifecycleKind::Created))
            .await;

        if let Err(e) = self.gateway.start(&sandbox.id).await {
            warn!("Sandbox {} failed to start, removing it: {}", sandbox.name, e);
            if let Err(cleanup) = self.gateway.reclaim(&sandbox).await {
                warn!("Failed to remove sandbox {}: {}", sandbox.id, cleanup);
            }
            self.record(
                LifecycleRecord::now(&sandbox.id, LifecycleKind::Failed).because(e.to_string()),
            )
            .await;
            return Err(e);
        }
        self.record(LifecycleRecord::now(&sandbox.id, LifecycleKind::Started))
            .await;

        info!("Created sandbox {} ({})", sandbox.name, sandbox.id);
        self.gateway.get_sandbox(&sandbox.id).await
    }

    async fn prepare_image(&self, spec: &SandboxSpec) -> Result<()> {
        let available = match &spec.build_context {
            Some(build) if spec.force_build => {
                self.gateway
                    .build_image(&spec.image, build.dockerfile.as_deref(), &build.context_path)
                    .await
            }
            Some(build) => {
                self.gateway.ensure_image(&spec.image).await
                    || self
                        .gateway
                        .build_image(&spec.image, build.dockerfile.as_deref(), &build.context_path)
                        .await
            }
            None => self.gateway.ensure_image(&spec.image).await,
        };

        if available {
            Ok(())
        } else {
            Err(SandboxError::ImageUnavailable(spec.image.clone()))
        }
    }

    /// Stop, force-remove and drop the sandbox's own volumes; network volumes survive
    pub async fn delete_sandbox(&self, id: &str) -> Result<()> {
        let sandbox = self.gateway.get_sandbox(id).await?;

        if sandbox.status == SandboxStatus::Running {
            if let Err(e) = self.gateway.stop(id, None).await {
                warn!("Failed to stop sandbox {} before removal: {}", id, e);
            }
        }
        self.gateway.reclaim(&sandbox).await?;
        self.record(LifecycleRecord::now(&sandbox.id, LifecycleKind::Deleted))
            .await;

        info!("Deleted sandbox {} ({})", sandbox.name, sandbox.id);
        Ok(())
    }

    pub async fn start_sandbox(&self, id: &str) -> Result<Sandbox> {
        let status = self.gateway.get_status(id).await?;
        if status.apply(LifecycleEvent::Start).is_none() {
            return Err(SandboxError::Validation(format!(
                "Sandbox {} is {} and cannot be started",
                id, status
            )));
        }

        if status != SandboxStatus::Running {
            self.gateway.start(id).await?;
            self.record(LifecycleRecord::now(id, LifecycleKind::Started))
                .await;
        }
        self.gateway.get_sandbox(id).await
    }

    /// Stop with a grace period (configured default when `None`); stopping a stopped
    /// or finished sandbox is a no-op
    pub async fn stop_sandbox(&self, id: &str, timeout_secs: Option<u64>) -> Result<Sandbox> {
        let status = self.gateway.get_status(id).await?;

        if status == SandboxStatus::Running {
            self.gateway.stop(id, timeout_secs).await?;
            self.record(LifecycleRecord::now(id, LifecycleKind::Stopped))
                .await;
        }
        self.gateway.get_sandbox(id).await
    }

    pub async fn restart_sandbox(&self, id: &str, timeout_secs: Option<u64>) -> Result<Sandbox> {
        self.stop_sandbox(id, timeout_secs).await?;
        self.start_sandbox(id).await
    }

    pub async fn get_status(&self, id: &str) -> Result<SandboxStatus> {
        self.gateway.get_status(id).await
    }

    pub async fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        self.gateway.get_sandbox(id).await
    }

    pub async fn list_sandboxes(&self, status: Option<SandboxStatus>) -> Result<Vec<Sandbox>> {
        self.gateway.list_sandboxes(status).await
    }

    /// Point-in-time usage, normalized against the runtime's own previous CPU reading
    pub async fn get_stats(&self, id: &str) -> Result<MetricSample> {
        let raw = self.gateway.get_raw_stats(id).await?;
        Ok(stats::normalize(id, &raw, None, Utc::now()))
    }

    pub async fn get_urls(&self, id: &str) -> Result<BTreeMap<u16, String>> {
        self.gateway.get_urls(id).await
    }

    pub async fn get_environment(&self, id: &str) -> Result<HashMap<String, String>> {
        self.gateway.get_environment(id).await
    }

    pub async fn exec_command(
        &self,
        id: &str,
        argv: Vec<String>,
        wait: Option<Duration>,
    ) -> Result<ExecOutput> {
        self.gateway.exec_command(id, argv, wait).await
    }

    pub async fn stream_command(&self, id: &str, argv: Vec<String>) -> Result<OutputStream> {
        self.gateway.stream_output(id, argv).await
    }

    pub async fn stream_logs(&self, id: &str, follow: bool) -> Result<OutputStream> {
        self.gateway.stream_logs(id, follow).await
    }

    /// New runtime limit in seconds (0 = unlimited), effective without a restart
    pub async fn update_timeout(&self, id: &str, timeout_seconds: u64) -> Result<()> {
        self.scheduler
            .reconciler()
            .update_timeout(id, timeout_seconds)
            .await
    }

    pub async fn update_entrypoint_or_command(
        &self,
        id: &str,
        entrypoint: Option<Vec<String>>,
        command: Option<Vec<String>>,
    ) -> Result<Sandbox> {
        self.gateway.update_command(id, entrypoint, command).await
    }

    pub async fn update_environment(
        &self,
        id: &str,
        vars: HashMap<String, String>,
        merge: bool,
    ) -> Result<Sandbox> {
        self.gateway.update_environment(id, vars, merge).await
    }

    pub async fn list_volume_dir(&self, id: &str, volume: &str, path: &str) -> Result<Vec<DirEntry>> {
        self.files.list_dir(id, volume, path).await
    }

    pub async fn make_volume_dir(&self, id: &str, volume: &str, path: &str) -> Result<()> {
        self.files.make_dir(id, volume, path).await
    }

    pub async fn read_volume_file(&self, id: &str, volume: &str, path: &str) -> Result<String> {
        self.files.read_file(id, volume, path).await
    }

    pub async fn read_volume_bytes(&self, id: &str, volume: &str, path: &str) -> Result<Vec<u8>> {
        self.files.read_bytes(id, volume, path).await
    }

    pub async fn write_volume_file(
        &self,
        id: &str,
        volume: &str,
        path: &str,
        content: &str,
    ) -> Result<()> {
        self.files.write_file(id, volume, path, content).await
    }

    pub async fn upload_volume_file(
        &self,
        id: &str,
        volume: &str,
        path: &str,
        content: &[u8],
    ) -> Result<()> {
        self.files.upload_file(id, volume, path, content).await
    }

    pub async fn export_volume_path(&self, id: &str, volume: &str, path: &str) -> Result<Vec<u8>> {
        self.files.export_archive(id, volume, path).await
    }

    /// Tar archive of a path inside the running or stopped container
    pub async fn export_container_path(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        self.gateway.export_archive(id, path).await
    }

    pub async fn create_network(
        &self,
        name: &str,
        driver: Option<&str>,
        labels: HashMap<String, String>,
    ) -> Result<String> {
        self.gateway
            .ensure_network(name, driver.unwrap_or(NETWORK_DRIVER), &labels)
            .await
    }

    pub async fn connect_network(&self, network: &str, id: &str) -> Result<()> {
        self.gateway.connect_network(network, id).await
    }

    pub async fn disconnect_network(&self, network: &str, id: &str) -> Result<()> {
        self.gateway.disconnect_network(network, id).await
    }

    pub async fn create_network_volume(
        &self,
        name: &str,
        driver: Option<&str>,
        size: Option<&str>,
    ) -> Result<Volume> {
        crate::validation::validate_volume_name(name)?;
        if let Some(size) = size {
            crate::validation::validate_size("Volume size", size)?;
        }
        self.gateway
            .create_network_volume(name, driver.unwrap_or("local"), size)
            .await
    }

    pub async fn mount_network_volume(
        &self,
        id: &str,
        volume: &str,
        mount_path: Option<&str>,
    ) -> Result<Sandbox> {
        self.gateway.mount_network_volume(id, volume, mount_path).await
    }

    pub async fn unmount_network_volume(&self, id: &str, volume: &str) -> Result<Sandbox> {
        self.gateway.unmount_network_volume(id, volume).await
    }

    /// Prometheus text exposition for a scraper
    pub fn metrics_text(&self) -> Result<String> {
        self.publisher.encode_text()
    }

    /// Sample host and sandboxes once outside the background loop
    pub async fn collect_metrics(&self) -> Result<()> {
        self.publisher.collect_once(Utc::now()).await.map(|_| ())
    }

    /// Whether the runtime answers
    pub async fn health_check(&self) -> bool {
        self.gateway.ping().await.is_ok()
    }

    async fn record(&self, record: LifecycleRecord) {
        if let Err(e) = self.history.record_event(&record).await {
            warn!("Failed to record lifecycle event for {}: {}", record.sandbox_id, e);
        }
    }
}
