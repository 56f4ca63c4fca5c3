// ABOUTME: Threshold alert evaluation with per-target cooldown
// ABOUTME: Emits one combined message per target and suppresses repeats inside the cooldown window

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Target id used for host-wide metrics
pub const SYSTEM_TARGET: &str = "system";

/// Percent thresholds; a value strictly above its threshold is a violation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu: 90.0,
            memory: 90.0,
            disk: 90.0,
        }
    }
}

/// Measured percentages for one target; disk is optional for sandboxes
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UsageSnapshot {
    pub cpu: f64,
    pub memory: f64,
    pub disk: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Cpu,
    Memory,
    Disk,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Cpu => "cpu",
            Resource::Memory => "memory",
            Resource::Disk => "disk",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub resource: Resource,
    pub measured: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertMessage {
    pub target: String,
    pub raised_at: DateTime<Utc>,
    pub violations: Vec<Violation>,
    pub message: String,
}

/// Violations of `thresholds`, in cpu, memory, disk order
pub fn violations(usage: &UsageSnapshot, thresholds: &Thresholds) -> Vec<Violation> {
    let mut found = Vec::new();
    let mut check = |resource, measured: f64, threshold: f64| {
        if measured > threshold {
            found.push(Violation {
                resource,
                measured,
                threshold,
            });
        }
    };

    check(Resource::Cpu, usage.cpu, thresholds.cpu);
    check(Resource::Memory, usage.memory, thresholds.memory);
    if let Some(disk) = usage.disk {
        check(Resource::Disk, disk, thresholds.disk);
    }

    found
}

/// Cooldown-suppressed threshold alerts. State is per target and only touched on emission.
pub struct AlertEvaluator {
    cooldown: Duration,
    last_alert: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AlertEvaluator {
    pub fn new(cooldown: std::time::Duration) -> Self {
        Self {
            cooldown: Duration::from_std(cooldown).unwrap_or_else(|_| Duration::seconds(300)),
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    pub fn evaluate(
        &self,
        target: &str,
        usage: &UsageSnapshot,
        thresholds: &Thresholds,
        now: DateTime<Utc>,
    ) -> Option<AlertMessage> {
        let mut last_alert = self
            .last_alert
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(last) = last_alert.get(target) {
            if now - *last < self.cooldown {
                return None;
            }
        }

        let violations = violations(usage, thresholds);
        if violations.is_empty() {
            return None;
        }

        last_alert.insert(target.to_string(), now);

        let details: Vec<String> = violations
            .iter()
            .map(|v| {
                format!(
                    "{} usage at {:.1}% (threshold: {}%)",
                    match v.resource {
                        Resource::Cpu => "CPU",
                        Resource::Memory => "Memory",
                        Resource::Disk => "Disk",
                    },
                    v.measured,
                    v.threshold
                )
            })
            .collect();
        let subject = if target == SYSTEM_TARGET {
            "System".to_string()
        } else {
            format!("Sandbox {}", target)
        };

        Some(AlertMessage {
            target: target.to_string(),
            raised_at: now,
            message: format!("{} resource alert: {}", subject, details.join(", ")),
            violations,
        })
    }

    /// Drop cooldown state for targets that are no longer enumerated; `system` is always kept
    pub fn retain(&self, live_targets: &HashSet<String>) {
        let mut last_alert = self
            .last_alert
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        last_alert.retain(|target, _| target == SYSTEM_TARGET || live_targets.contains(target));
    }

    pub fn tracked_targets(&self) -> usize {
        self.last_alert
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hot() -> UsageSnapshot {
        UsageSnapshot {
            cpu: 97.5,
            memory: 40.0,
            disk: None,
        }
    }

    fn evaluator() -> AlertEvaluator {
        AlertEvaluator::new(std::time::Duration::from_secs(300))
    }

    #[test]
    fn test_cooldown_suppresses_repeat() {
        let alerts = evaluator();
        let t0 = Utc::now();

        let first = alerts.evaluate("sbx-1", &hot(), &Thresholds::default(), t0);
        assert!(first.is_some());
        assert!(alerts
            .evaluate("sbx-1", &hot(), &Thresholds::default(), t0 + Duration::seconds(120))
            .is_none());
        assert!(alerts
            .evaluate("sbx-1", &hot(), &Thresholds::default(), t0 + Duration::seconds(300))
            .is_some());
    }

    #[test]
    fn test_targets_are_independent() {
        let alerts = evaluator();
        let now = Utc::now();

        assert!(alerts.evaluate("sbx-1", &hot(), &Thresholds::default(), now).is_some());
        assert!(alerts.evaluate("sbx-2", &hot(), &Thresholds::default(), now).is_some());
        assert!(alerts.evaluate(SYSTEM_TARGET, &hot(), &Thresholds::default(), now).is_some());
    }

    #[test]
    fn test_quiet_evaluation_does_not_start_cooldown() {
        let alerts = evaluator();
        let now = Utc::now();
        let calm = UsageSnapshot {
            cpu: 10.0,
            memory: 10.0,
            disk: Some(10.0),
        };

        assert!(alerts.evaluate("sbx-1", &calm, &Thresholds::default(), now).is_none());
        assert_eq!(alerts.tracked_targets(), 0);
        assert!(alerts.evaluate("sbx-1", &hot(), &Thresholds::default(), now).is_some());
    }

    #[test]
    fn test_combined_message_lists_every_violation() {
        let alerts = evaluator();
        let usage = UsageSnapshot {
            cpu: 95.0,
            memory: 91.3,
            disk: Some(99.0),
        };

        let alert = alerts
            .evaluate(SYSTEM_TARGET, &usage, &Thresholds::default(), Utc::now())
            .unwrap();
        assert_eq!(alert.violations.len(), 3);
        assert_eq!(
            alert.message,
            "System resource alert: CPU usage at 95.0% (threshold: 90%), \
             Memory usage at 91.3% (threshold: 90%), Disk usage at 99.0% (threshold: 90%)"
        );
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let at_limit = UsageSnapshot {
            cpu: 90.0,
            memory: 90.0,
            disk: Some(90.0),
        };
        assert!(violations(&at_limit, &Thresholds::default()).is_empty());
    }

    #[test]
    fn test_retain_keeps_system_and_live_targets() {
        let alerts = evaluator();
        let now = Utc::now();
        for target in ["sbx-1", "sbx-2", SYSTEM_TARGET] {
            alerts.evaluate(target, &hot(), &Thresholds::default(), now);
        }

        alerts.retain(&HashSet::from(["sbx-2".to_string()]));
        assert_eq!(alerts.tracked_targets(), 2);
        assert!(alerts.evaluate("sbx-1", &hot(), &Thresholds::default(), now).is_some());
        assert!(alerts.evaluate("sbx-2", &hot(), &Thresholds::default(), now).is_none());
    }
}
