// ABOUTME: Sandbox orchestration engine for Corral
// ABOUTME: Runs isolated sandboxes on Docker with proxy routing, reconciliation loops and Prometheus metrics

pub mod alerts;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod history;
pub mod labels;
pub mod metrics;
pub mod runtime;
pub mod scheduler;
pub mod settings;
pub mod stats;
pub mod translator;
pub mod types;
pub mod validation;
pub mod volumes;

// Re-export commonly used types
pub use alerts::{AlertEvaluator, AlertMessage, Thresholds, UsageSnapshot};
pub use engine::SandboxEngine;
pub use error::{Result, SandboxError};
pub use gateway::RuntimeGateway;
pub use history::{HistorySink, LifecycleKind, LifecycleRecord, NoopHistory};
pub use metrics::{MetricsPublisher, SandboxMetrics};
pub use runtime::{
    ContainerRuntime, DockerRuntime, ExecOutput, OutputChunk, OutputStream, RuntimeError,
    StreamKind,
};
pub use scheduler::{ActivityTracker, CleanupReport, ReconciliationScheduler, Reconciler};
pub use settings::{EngineSettings, MonitorSettings, SchedulerSettings, SettingsError};
pub use translator::{translate, RoutingSettings, RuntimeConfig};
pub use types::{
    BuildContext, DirEntry, EntryKind, MetricSample, PortRequest, Protocol, ResourceRequest, Route,
    Sandbox, SandboxSpec, SandboxStatus, Volume, VolumeRequest,
};
pub use validation::ValidationLimits;
pub use volumes::{VolumeFiles, VolumeRoot};
