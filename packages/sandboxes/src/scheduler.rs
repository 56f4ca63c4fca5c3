// ABOUTME: Reconciliation scheduler enforcing sandbox age, inactivity and runtime timeouts
// ABOUTME: Two background loops over the gateway; single passes are callable directly with an explicit clock

use crate::error::Result;
use crate::gateway::RuntimeGateway;
use crate::history::{HistorySink, LifecycleKind, LifecycleRecord};
use crate::labels;
use crate::settings::SchedulerSettings;
use crate::stats;
use crate::types::{MetricSample, Sandbox, SandboxStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
struct ActivityMark {
    last_active: DateTime<Utc>,
    network_rx: u64,
    network_tx: u64,
}

/// Last observed activity per sandbox. A sandbox is active in a sample when its CPU is above
/// the floor or its network counters moved since the previous sample.
pub struct ActivityTracker {
    cpu_floor: f64,
    marks: Mutex<HashMap<String, ActivityMark>>,
}

impl ActivityTracker {
    pub fn new(cpu_floor: f64) -> Self {
        Self {
            cpu_floor,
            marks: Mutex::new(HashMap::new()),
        }
    }

    /// Record a sample; `seed` becomes the last-active time of a sandbox seen for the first time.
    /// Returns the updated last-active time.
    pub fn observe(&self, sample: &MetricSample, seed: DateTime<Utc>) -> DateTime<Utc> {
        let mut marks = self.marks.lock().unwrap_or_else(|p| p.into_inner());

        let mark = marks
            .entry(sample.sandbox_id.clone())
            .or_insert(ActivityMark {
                last_active: seed,
                network_rx: sample.network_rx_bytes,
                network_tx: sample.network_tx_bytes,
            });

        let network_moved =
            sample.network_rx_bytes != mark.network_rx || sample.network_tx_bytes != mark.network_tx;
        if sample.cpu_percent > self.cpu_floor || network_moved {
            mark.last_active = mark.last_active.max(sample.timestamp);
        }
        mark.network_rx = sample.network_rx_bytes;
        mark.network_tx = sample.network_tx_bytes;

        mark.last_active
    }

    pub fn last_active(&self, sandbox_id: &str) -> Option<DateTime<Utc>> {
        self.marks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(sandbox_id)
            .map(|m| m.last_active)
    }

    pub fn forget(&self, sandbox_id: &str) {
        self.marks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(sandbox_id);
    }

    pub fn retain(&self, live: &HashSet<String>) {
        self.marks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|id, _| live.contains(id));
    }
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Removed for exceeding the maximum age
    pub removed: Vec<String>,
    /// Stopped for inactivity
    pub stopped: Vec<String>,
}

fn exceeds(now: DateTime<Utc>, since: DateTime<Utc>, limit: Duration) -> bool {
    match ChronoDuration::from_std(limit) {
        Ok(limit) => now - since > limit,
        Err(_) => false,
    }
}

/// Single reconciliation passes against the runtime
pub struct Reconciler {
    gateway: Arc<RuntimeGateway>,
    settings: SchedulerSettings,
    activity: Arc<ActivityTracker>,
    history: Arc<dyn HistorySink>,
}

impl Reconciler {
    pub fn new(
        gateway: Arc<RuntimeGateway>,
        settings: SchedulerSettings,
        activity: Arc<ActivityTracker>,
        history: Arc<dyn HistorySink>,
    ) -> Self {
        Self {
            gateway,
            settings,
            activity,
            history,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Remove sandboxes older than the maximum age (any status), then stop running
    /// sandboxes that have been inactive for too long
    pub async fn run_cleanup_pass(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let sandboxes = self.gateway.list_sandboxes(None).await?;
        let mut report = CleanupReport::default();

        let live: HashSet<String> = sandboxes.iter().map(|s| s.id.clone()).collect();
        self.activity.retain(&live);

        for sandbox in sandboxes {
            if exceeds(now, sandbox.created_at, self.settings.max_container_age) {
                info!("Removing sandbox {} (exceeded max age)", sandbox.name);
                match self.gateway.reclaim(&sandbox).await {
                    Ok(()) => {
                        self.activity.forget(&sandbox.id);
                        self.record(&sandbox.id, LifecycleKind::Reclaimed, "max age exceeded")
                            .await;
                        report.removed.push(sandbox.id);
                    }
                    Err(e) => error!("Failed to remove sandbox {}: {}", sandbox.id, e),
                }
                continue;
            }

            if sandbox.status != SandboxStatus::Running {
                continue;
            }

            let last_active = self.last_active(&sandbox, now).await;
            if exceeds(now, last_active, self.settings.inactive_timeout) {
                info!("Stopping sandbox {} (inactive since {})", sandbox.name, last_active);
                match self.gateway.stop(&sandbox.id, None).await {
                    Ok(()) => {
                        self.record(&sandbox.id, LifecycleKind::Reclaimed, "inactive timeout")
                            .await;
                        report.stopped.push(sandbox.id);
                    }
                    Err(e) => error!("Failed to stop sandbox {}: {}", sandbox.id, e),
                }
            }
        }

        if !report.removed.is_empty() || !report.stopped.is_empty() {
            info!(
                "Cleanup pass removed {} and stopped {} sandboxes",
                report.removed.len(),
                report.stopped.len()
            );
        }
        Ok(report)
    }

    /// Stop running sandboxes whose runtime exceeds their timeout tag (0 = unlimited)
    pub async fn run_timeout_pass(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let sandboxes = self
            .gateway
            .list_sandboxes(Some(SandboxStatus::Running))
            .await?;
        let mut stopped = Vec::new();

        for sandbox in sandboxes {
            if sandbox.timeout_seconds == 0 {
                continue;
            }
            let Some(started_at) = sandbox.started_at else {
                continue;
            };

            if exceeds(now, started_at, Duration::from_secs(sandbox.timeout_seconds)) {
                info!(
                    "Stopping sandbox {} (timeout of {}s exceeded)",
                    sandbox.name, sandbox.timeout_seconds
                );
                match self.gateway.stop(&sandbox.id, None).await {
                    Ok(()) => {
                        self.record(&sandbox.id, LifecycleKind::Reclaimed, "timeout exceeded")
                            .await;
                        stopped.push(sandbox.id);
                    }
                    Err(e) => error!("Failed to stop sandbox {}: {}", sandbox.id, e),
                }
            }
        }

        Ok(stopped)
    }

    /// Rewrite the timeout tag; takes effect on the next timeout pass
    pub async fn update_timeout(&self, sandbox_id: &str, timeout_seconds: u64) -> Result<()> {
        self.gateway
            .update_labels(sandbox_id, &labels::timeout_labels(timeout_seconds))
            .await?;
        info!("Updated timeout of sandbox {} to {}s", sandbox_id, timeout_seconds);
        Ok(())
    }

    /// First sight counts as activity, so a restarted engine never evicts right away.
    /// Never earlier than the current start, so marks from a previous run do not carry over.
    async fn last_active(&self, sandbox: &Sandbox, now: DateTime<Utc>) -> DateTime<Utc> {
        let observed = match self.gateway.get_raw_stats(&sandbox.id).await {
            Ok(raw) => {
                let sample = stats::normalize(&sandbox.id, &raw, None, now);
                self.activity.observe(&sample, now)
            }
            Err(e) => {
                debug!("No stats for sandbox {}: {}", sandbox.id, e);
                self.activity.last_active(&sandbox.id).unwrap_or(now)
            }
        };

        match sandbox.started_at {
            Some(started_at) => observed.max(started_at),
            None => observed,
        }
    }

    async fn record(&self, sandbox_id: &str, kind: LifecycleKind, reason: &str) {
        let record = LifecycleRecord::now(sandbox_id, kind).because(reason);
        if let Err(e) = self.history.record_event(&record).await {
            warn!("Failed to record lifecycle event for {}: {}", sandbox_id, e);
        }
    }
}

/// Runs the cleanup and timeout loops in the background
pub struct ReconciliationScheduler {
    reconciler: Arc<Reconciler>,
    running: Arc<RwLock<bool>>,
    wake: Arc<Notify>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ReconciliationScheduler {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            running: Arc::new(RwLock::new(false)),
            wake: Arc::new(Notify::new()),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Start the loops; calling it again while running is a no-op
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let settings = self.reconciler.settings().clone();
        let mut tasks = self.tasks.lock().await;

        if settings.auto_cleanup_enabled {
            let reconciler = self.reconciler.clone();
            tasks.push(self.spawn_loop("cleanup", settings.cleanup_interval, move || {
                let reconciler = reconciler.clone();
                async move {
                    if let Err(e) = reconciler.run_cleanup_pass(Utc::now()).await {
                        warn!("Cleanup pass failed: {}", e);
                    }
                }
            }));
        } else {
            info!("Automatic cleanup disabled");
        }

        let reconciler = self.reconciler.clone();
        tasks.push(self.spawn_loop("timeout", settings.timeout_check_interval, move || {
            let reconciler = reconciler.clone();
            async move {
                if let Err(e) = reconciler.run_timeout_pass(Utc::now()).await {
                    warn!("Timeout pass failed: {}", e);
                }
            }
        }));
    }

    /// Stop the loops and wait for an in-flight pass to finish
    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.wake.notify_waiters();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Scheduler task ended abnormally: {}", e);
            }
        }
    }

    fn spawn_loop<F, Fut>(&self, name: &'static str, interval: Duration, pass: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let running = self.running.clone();
        let wake = self.wake.clone();

        tokio::spawn(async move {
            info!("Scheduler {} loop started ({}s interval)", name, interval.as_secs());

            loop {
                // Registered before the flag check so a stop during the pass is not missed
                let notified = wake.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if !*running.read().await {
                    info!("Scheduler {} loop stopped", name);
                    break;
                }

                pass().await;

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = &mut notified => {}
                }
            }
        })
    }
}
