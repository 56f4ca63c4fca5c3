// ABOUTME: Persistence seam for metric samples and lifecycle events
// ABOUTME: The engine writes through HistorySink; storage belongs to the embedding service

use crate::error::Result;
use crate::types::MetricSample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    Created,
    Started,
    Stopped,
    Deleted,
    Failed,
    /// Stopped or removed by the reconciliation scheduler
    Reclaimed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub sandbox_id: String,
    pub at: DateTime<Utc>,
    pub kind: LifecycleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl LifecycleRecord {
    pub fn now(sandbox_id: &str, kind: LifecycleKind) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            at: Utc::now(),
            kind,
            reason: None,
        }
    }

    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Receives telemetry and lifecycle history. Failures are logged by the caller and never
/// interrupt engine operations.
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record_sample(&self, sample: &MetricSample) -> Result<()>;

    async fn record_event(&self, record: &LifecycleRecord) -> Result<()>;
}

/// Sink that discards everything
pub struct NoopHistory;

#[async_trait]
impl HistorySink for NoopHistory {
    async fn record_sample(&self, _sample: &MetricSample) -> Result<()> {
        Ok(())
    }

    async fn record_event(&self, _record: &LifecycleRecord) -> Result<()> {
        Ok(())
    }
}
