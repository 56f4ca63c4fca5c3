// ABOUTME: Stats normalizer turning raw runtime snapshots into metric samples
// ABOUTME: Lenient JSON parsing plus CPU/memory percentage math that never fails

use crate::types::MetricSample;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Counters extracted from one raw runtime stats snapshot; missing fields are 0
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawStats {
    pub cpu_total: u64,
    pub system_cpu: u64,
    pub online_cpus: u64,
    pub precpu_total: u64,
    pub presystem_cpu: u64,
    pub memory_usage: u64,
    pub memory_cache: u64,
    pub memory_limit: u64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
}

impl RawStats {
    pub fn from_value(value: &Value) -> Self {
        let u = |pointer: &str| value.pointer(pointer).and_then(Value::as_u64).unwrap_or(0);

        let online_cpus = match u("/cpu_stats/online_cpus") {
            0 => value
                .pointer("/cpu_stats/cpu_usage/percpu_usage")
                .and_then(Value::as_array)
                .map(|cpus| cpus.len() as u64)
                .unwrap_or(0),
            n => n,
        };

        // cgroup v1 reports page cache as `cache`, v2 as `inactive_file`
        let memory_cache = match u("/memory_stats/stats/cache") {
            0 => u("/memory_stats/stats/inactive_file"),
            n => n,
        };

        let (network_rx, network_tx) = value
            .get("networks")
            .and_then(Value::as_object)
            .map(|networks| {
                networks.values().fold((0u64, 0u64), |(rx, tx), iface| {
                    (
                        rx.saturating_add(iface.get("rx_bytes").and_then(Value::as_u64).unwrap_or(0)),
                        tx.saturating_add(iface.get("tx_bytes").and_then(Value::as_u64).unwrap_or(0)),
                    )
                })
            })
            .unwrap_or((0, 0));

        let (block_read, block_write) = value
            .pointer("/blkio_stats/io_service_bytes_recursive")
            .and_then(Value::as_array)
            .map(|entries| {
                entries.iter().fold((0u64, 0u64), |(read, write), entry| {
                    let bytes = entry.get("value").and_then(Value::as_u64).unwrap_or(0);
                    match entry.get("op").and_then(Value::as_str).map(str::to_lowercase) {
                        Some(op) if op == "read" => (read.saturating_add(bytes), write),
                        Some(op) if op == "write" => (read, write.saturating_add(bytes)),
                        _ => (read, write),
                    }
                })
            })
            .unwrap_or((0, 0));

        Self {
            cpu_total: u("/cpu_stats/cpu_usage/total_usage"),
            system_cpu: u("/cpu_stats/system_cpu_usage"),
            online_cpus,
            precpu_total: u("/precpu_stats/cpu_usage/total_usage"),
            presystem_cpu: u("/precpu_stats/system_cpu_usage"),
            memory_usage: u("/memory_stats/usage"),
            memory_cache,
            memory_limit: u("/memory_stats/limit"),
            network_rx,
            network_tx,
            block_read,
            block_write,
        }
    }

    /// Snapshot standing in for the previous one when nothing has been kept yet
    pub fn from_precpu(&self) -> Self {
        Self {
            cpu_total: self.precpu_total,
            system_cpu: self.presystem_cpu,
            ..self.clone()
        }
    }
}

/// CPU percentage across all online CPUs between two snapshots
pub fn cpu_percent(current: &RawStats, previous: &RawStats) -> f64 {
    let cpu_delta = current.cpu_total as f64 - previous.cpu_total as f64;
    let system_delta = current.system_cpu as f64 - previous.system_cpu as f64;

    if system_delta <= 0.0 || cpu_delta <= 0.0 || current.online_cpus == 0 {
        return 0.0;
    }
    (cpu_delta / system_delta) * current.online_cpus as f64 * 100.0
}

/// Normalize a snapshot against the previous one (or its own pre-CPU counters)
pub fn normalize(
    sandbox_id: &str,
    current: &RawStats,
    previous: Option<&RawStats>,
    timestamp: DateTime<Utc>,
) -> MetricSample {
    let fallback;
    let previous = match previous {
        Some(previous) => previous,
        None => {
            fallback = current.from_precpu();
            &fallback
        }
    };

    let memory_usage = current.memory_usage.saturating_sub(current.memory_cache);
    let memory_percent = if current.memory_limit > 0 {
        memory_usage as f64 / current.memory_limit as f64 * 100.0
    } else {
        0.0
    };

    MetricSample {
        sandbox_id: sandbox_id.to_string(),
        timestamp,
        cpu_percent: cpu_percent(current, previous),
        memory_usage_bytes: memory_usage,
        memory_limit_bytes: current.memory_limit,
        memory_percent,
        network_rx_bytes: current.network_rx,
        network_tx_bytes: current.network_tx,
        block_read_bytes: current.block_read,
        block_write_bytes: current.block_write,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docker_snapshot() -> Value {
        json!({
            "read": "2024-03-01T12:00:10Z",
            "cpu_stats": {
                "cpu_usage": {"total_usage": 400_000_000u64, "percpu_usage": [1, 2]},
                "system_cpu_usage": 20_000_000_000u64,
                "online_cpus": 4
            },
            "precpu_stats": {
                "cpu_usage": {"total_usage": 200_000_000u64},
                "system_cpu_usage": 18_000_000_000u64
            },
            "memory_stats": {
                "usage": 150u64 * 1024 * 1024,
                "limit": 512u64 * 1024 * 1024,
                "stats": {"cache": 22u64 * 1024 * 1024}
            },
            "networks": {
                "eth0": {"rx_bytes": 1000, "tx_bytes": 500},
                "eth1": {"rx_bytes": 24, "tx_bytes": 12}
            },
            "blkio_stats": {
                "io_service_bytes_recursive": [
                    {"major": 8, "minor": 0, "op": "Read", "value": 4096},
                    {"major": 8, "minor": 0, "op": "Write", "value": 8192},
                    {"major": 8, "minor": 0, "op": "Total", "value": 12288},
                    {"major": 8, "minor": 16, "op": "read", "value": 4096}
                ]
            }
        })
    }

    #[test]
    fn test_parse_docker_snapshot() {
        let raw = RawStats::from_value(&docker_snapshot());

        assert_eq!(raw.online_cpus, 4);
        assert_eq!(raw.memory_cache, 22 * 1024 * 1024);
        assert_eq!(raw.network_rx, 1024);
        assert_eq!(raw.network_tx, 512);
        assert_eq!(raw.block_read, 8192);
        assert_eq!(raw.block_write, 8192);
    }

    #[test]
    fn test_normalize_first_sight_uses_precpu() {
        let raw = RawStats::from_value(&docker_snapshot());
        let sample = normalize("sbx", &raw, None, Utc::now());

        // (200M / 2000M) * 4 * 100
        assert!((sample.cpu_percent - 40.0).abs() < 1e-9);
        assert_eq!(sample.memory_usage_bytes, 128 * 1024 * 1024);
        assert!((sample.memory_percent - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_against_kept_snapshot() {
        let previous = RawStats {
            cpu_total: 100,
            system_cpu: 1_000,
            online_cpus: 2,
            ..Default::default()
        };
        let current = RawStats {
            cpu_total: 200,
            system_cpu: 2_000,
            online_cpus: 2,
            ..Default::default()
        };

        let sample = normalize("sbx", &current, Some(&previous), Utc::now());
        assert!((sample.cpu_percent - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_system_delta_and_zero_limit() {
        let snapshot = RawStats {
            cpu_total: 500,
            system_cpu: 1_000,
            online_cpus: 1,
            memory_usage: 4096,
            ..Default::default()
        };

        let sample = normalize("sbx", &snapshot, Some(&snapshot), Utc::now());
        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.memory_percent, 0.0);
    }

    #[test]
    fn test_counter_reset_does_not_go_negative() {
        let previous = RawStats {
            cpu_total: 900,
            system_cpu: 1_000,
            online_cpus: 1,
            ..Default::default()
        };
        let current = RawStats {
            cpu_total: 100,
            system_cpu: 2_000,
            online_cpus: 1,
            ..Default::default()
        };

        assert_eq!(cpu_percent(&current, &previous), 0.0);
    }

    #[test]
    fn test_malformed_snapshot_normalizes_to_zero() {
        for value in [json!(null), json!({}), json!({"cpu_stats": "nope", "networks": [1, 2]})] {
            let raw = RawStats::from_value(&value);
            assert_eq!(raw, RawStats::default());

            let sample = normalize("sbx", &raw, None, Utc::now());
            assert_eq!(sample.cpu_percent, 0.0);
            assert_eq!(sample.memory_percent, 0.0);
            assert_eq!(sample.network_rx_bytes, 0);
        }
    }

    #[test]
    fn test_online_cpus_falls_back_to_percpu_length() {
        let value = json!({
            "cpu_stats": {"cpu_usage": {"total_usage": 10, "percpu_usage": [5, 5, 0]}}
        });
        assert_eq!(RawStats::from_value(&value).online_cpus, 3);
    }
}
