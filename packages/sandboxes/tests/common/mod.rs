// ABOUTME: Common test utilities for integration tests
// ABOUTME: In-memory container runtime with a controllable clock, plus engine and history helpers

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use corral_sandboxes::runtime::{
    ContainerConfig, ContainerDetails, ContainerPatch, ContainerRuntime, ExecOutput, OutputChunk,
    OutputStream, RuntimeError, RuntimeResult, StreamKind, VolumeConfig,
};
use corral_sandboxes::{
    EngineSettings, HistorySink, LifecycleRecord, MetricSample, SandboxEngine,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fixed start of the fake clock
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::seconds(seconds)
}

#[derive(Default)]
struct FakeState {
    now: Option<DateTime<Utc>>,
    containers: HashMap<String, ContainerDetails>,
    volumes: HashMap<String, VolumeConfig>,
    networks: HashMap<String, String>,
    images: HashSet<String>,
    unpullable: HashSet<String>,
    stats: HashMap<String, Value>,
    next_id: u64,
    create_calls: usize,
    fail_create_container: bool,
    fail_start: bool,
    failing_removals: HashSet<String>,
    failing_stops: HashSet<String>,
}

/// In-memory stand-in for the Docker control plane
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        let runtime = Self::default();
        runtime.set_clock(t0());
        Arc::new(runtime)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn now(state: &FakeState) -> DateTime<Utc> {
        state.now.unwrap_or_else(Utc::now)
    }

    pub fn set_clock(&self, now: DateTime<Utc>) {
        self.state().now = Some(now);
    }

    pub fn fail_create_container(&self, fail: bool) {
        self.state().fail_create_container = fail;
    }

    pub fn fail_start(&self, fail: bool) {
        self.state().fail_start = fail;
    }

    /// Make removal of one container fail with an API error
    pub fn fail_removal_of(&self, id: &str) {
        self.state().failing_removals.insert(id.to_string());
    }

    /// Make stopping one container fail with an API error
    pub fn fail_stop_of(&self, id: &str) {
        self.state().failing_stops.insert(id.to_string());
    }

    pub fn make_unpullable(&self, image: &str) {
        self.state().unpullable.insert(image.to_string());
    }

    pub fn set_stats(&self, id: &str, stats: Value) {
        self.state().stats.insert(id.to_string(), stats);
    }

    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }

    pub fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().volumes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.state().networks.contains_key(name)
    }

    pub fn details(&self, id: &str) -> Option<ContainerDetails> {
        self.state().containers.get(id).cloned()
    }

    fn next_id(state: &mut FakeState) -> String {
        state.next_id += 1;
        format!("c{:04}", state.next_id)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        Ok(self.state().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        let mut state = self.state();
        if state.unpullable.contains(image) {
            return Err(RuntimeError::Api(format!("pull access denied for {}", image)));
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn build_image(&self, tag: &str, _dockerfile: &str, _context: Vec<u8>) -> RuntimeResult<()> {
        self.state().images.insert(tag.to_string());
        Ok(())
    }

    async fn create_container(&self, name: &str, config: &ContainerConfig) -> RuntimeResult<String> {
        let mut state = self.state();
        state.create_calls += 1;
        if state.fail_create_container {
            return Err(RuntimeError::Api("no space left on device".to_string()));
        }
        if state.containers.values().any(|c| c.name == name) {
            return Err(RuntimeError::Conflict(name.to_string()));
        }

        let id = Self::next_id(&mut state);
        let details = ContainerDetails {
            id: id.clone(),
            name: name.to_string(),
            image: config.image.clone(),
            state: "created".to_string(),
            exit_code: Some(0),
            created_at: Self::now(&state),
            started_at: None,
            finished_at: None,
            labels: config.labels.clone(),
            environment: config.environment.clone(),
            command: config.command.clone(),
            entrypoint: config.entrypoint.clone(),
            mounts: config.mounts.clone(),
            networks: vec![config.network_mode.clone()],
        };
        state.containers.insert(id.clone(), details);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.state();
        let now = Self::now(&state);
        let fail = state.fail_start;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        if fail {
            return Err(RuntimeError::Api("executable file not found".to_string()));
        }
        if container.state == "running" {
            return Err(RuntimeError::NotModified);
        }
        container.state = "running".to_string();
        container.started_at = Some(now);
        container.finished_at = None;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout_secs: u64) -> RuntimeResult<()> {
        let mut state = self.state();
        let now = Self::now(&state);
        if state.failing_stops.contains(id) {
            return Err(RuntimeError::Api(format!("cannot stop {}", id)));
        }
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        if container.state != "running" {
            return Err(RuntimeError::NotModified);
        }
        container.state = "exited".to_string();
        container.exit_code = Some(0);
        container.finished_at = Some(now);
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()> {
        let mut state = self.state();
        if state.failing_removals.contains(id) {
            return Err(RuntimeError::Api(format!("cannot remove {}", id)));
        }
        match state.containers.get(id) {
            None => Err(RuntimeError::NotFound(id.to_string())),
            Some(c) if c.state == "running" && !force => {
                Err(RuntimeError::Conflict(format!("container {} is running", id)))
            }
            Some(_) => {
                state.containers.remove(id);
                Ok(())
            }
        }
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails> {
        self.state()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn list_containers(&self, label_filters: &[String]) -> RuntimeResult<Vec<String>> {
        let state = self.state();
        let mut ids: Vec<String> = state
            .containers
            .values()
            .filter(|c| {
                label_filters.iter().all(|filter| {
                    let (key, value) = filter.split_once('=').unwrap_or((filter.as_str(), ""));
                    c.labels.get(key).map(String::as_str) == Some(value)
                })
            })
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn update_labels(&self, id: &str, labels: &HashMap<String, String>) -> RuntimeResult<()> {
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.labels.extend(labels.clone());
        Ok(())
    }

    async fn recreate_container(&self, id: &str, patch: &ContainerPatch) -> RuntimeResult<String> {
        let mut state = self.state();
        let now = Self::now(&state);
        let mut details = state
            .containers
            .remove(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        details.id = Self::next_id(&mut state);
        if patch.command.is_some() {
            details.command = patch.command.clone();
        }
        if patch.entrypoint.is_some() {
            details.entrypoint = patch.entrypoint.clone();
        }
        if let Some(environment) = &patch.environment {
            details.environment = environment.clone();
        }
        details
            .mounts
            .retain(|m| !patch.remove_mounts.contains(&m.target));
        details.mounts.extend(patch.add_mounts.iter().cloned());
        details.labels.extend(patch.labels.clone());
        details.created_at = now;
        details.state = "running".to_string();
        details.started_at = Some(now);
        details.finished_at = None;

        let new_id = details.id.clone();
        state.containers.insert(new_id.clone(), details);
        Ok(new_id)
    }

    async fn stats(&self, id: &str) -> RuntimeResult<Value> {
        let state = self.state();
        if !state.containers.contains_key(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        Ok(state.stats.get(id).cloned().unwrap_or_else(|| json!({})))
    }

    async fn create_volume(&self, config: &VolumeConfig) -> RuntimeResult<String> {
        self.state()
            .volumes
            .insert(config.name.clone(), config.clone());
        Ok(config.name.clone())
    }

    async fn remove_volume(&self, name: &str) -> RuntimeResult<()> {
        self.state().volumes.remove(name);
        Ok(())
    }

    async fn inspect_network(&self, name: &str) -> RuntimeResult<String> {
        self.state()
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }

    async fn create_network(
        &self,
        name: &str,
        _driver: &str,
        _labels: &HashMap<String, String>,
    ) -> RuntimeResult<String> {
        let mut state = self.state();
        if state.networks.contains_key(name) {
            return Err(RuntimeError::Conflict(name.to_string()));
        }
        let id = format!("net-{}", name);
        state.networks.insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn connect_network(&self, network: &str, container_id: &str) -> RuntimeResult<()> {
        let mut state = self.state();
        if !state.networks.contains_key(network) {
            return Err(RuntimeError::NotFound(network.to_string()));
        }
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.networks.push(network.to_string());
        Ok(())
    }

    async fn disconnect_network(&self, network: &str, container_id: &str) -> RuntimeResult<()> {
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.networks.retain(|n| n != network);
        Ok(())
    }

    async fn exec(&self, _id: &str, argv: Vec<String>) -> RuntimeResult<ExecOutput> {
        if argv.first().map(String::as_str) == Some("sleep") {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(ExecOutput {
            exit_code: 0,
            stdout: format!("{}\n", argv.join(" ")),
            stderr: String::new(),
        })
    }

    async fn exec_stream(&self, _id: &str, argv: Vec<String>) -> RuntimeResult<OutputStream> {
        let (tx, stream) = OutputStream::channel();
        tokio::spawn(async move {
            for arg in argv {
                let chunk = OutputChunk {
                    timestamp: Utc::now(),
                    stream: StreamKind::Stdout,
                    data: format!("{}\n", arg).into_bytes(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        Ok(stream)
    }

    async fn logs(&self, id: &str, _follow: bool) -> RuntimeResult<OutputStream> {
        let (tx, stream) = OutputStream::channel();
        let line = format!("started {}\n", id);
        tokio::spawn(async move {
            let _ = tx
                .send(OutputChunk {
                    timestamp: Utc::now(),
                    stream: StreamKind::Stderr,
                    data: line.into_bytes(),
                })
                .await;
        });
        Ok(stream)
    }

    async fn download_archive(&self, id: &str, path: &str) -> RuntimeResult<Vec<u8>> {
        if !self.state().containers.contains_key(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        Ok(format!("archive of {}", path).into_bytes())
    }
}

/// History sink remembering every lifecycle event
#[derive(Default)]
pub struct RecordingHistory {
    events: Mutex<Vec<LifecycleRecord>>,
    samples: Mutex<Vec<MetricSample>>,
}

impl RecordingHistory {
    pub fn events(&self) -> Vec<LifecycleRecord> {
        self.events.lock().unwrap().clone()
    }

    pub fn samples(&self) -> Vec<MetricSample> {
        self.samples.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistorySink for RecordingHistory {
    async fn record_sample(&self, sample: &MetricSample) -> corral_sandboxes::Result<()> {
        self.samples.lock().unwrap().push(sample.clone());
        Ok(())
    }

    async fn record_event(&self, record: &LifecycleRecord) -> corral_sandboxes::Result<()> {
        self.events.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Settings pointing the engine at a temporary volume root
pub fn test_settings(volumes_root: &Path) -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.volumes_root = volumes_root.to_path_buf();
    settings.state_dir = volumes_root.join("state");
    settings.routing.domain = "example.com".to_string();
    settings.scheduler.max_container_age = Duration::from_secs(100);
    settings.scheduler.inactive_timeout = Duration::from_secs(3_600);
    settings
}

pub fn engine_with(
    runtime: Arc<FakeRuntime>,
    settings: EngineSettings,
) -> (SandboxEngine, Arc<RecordingHistory>) {
    let history = Arc::new(RecordingHistory::default());
    let engine = SandboxEngine::with_runtime(runtime, settings, history.clone()).unwrap();
    (engine, history)
}
