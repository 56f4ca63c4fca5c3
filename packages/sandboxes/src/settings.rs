// ABOUTME: Engine settings loaded from CORRAL_* environment variables
// ABOUTME: Out-of-range numeric knobs fall back to defaults; values that cannot fall back are errors

use crate::alerts::Thresholds;
use crate::translator::{parse_size_bytes, RoutingSettings};
use crate::validation::ValidationLimits;
use corral_config as cfg;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, PartialEq)]
pub enum SettingsError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Reconciliation scheduler knobs
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub auto_cleanup_enabled: bool,
    pub cleanup_interval: Duration,
    pub timeout_check_interval: Duration,
    pub max_container_age: Duration,
    pub inactive_timeout: Duration,
    /// CPU percent above which a sandbox counts as active
    pub activity_cpu_floor: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            auto_cleanup_enabled: true,
            cleanup_interval: Duration::from_secs(300),
            timeout_check_interval: Duration::from_secs(10),
            max_container_age: Duration::from_secs(86_400),
            inactive_timeout: Duration::from_secs(3_600),
            activity_cpu_floor: 1.0,
        }
    }
}

/// Metrics publisher knobs
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub metrics_enabled: bool,
    pub interval: Duration,
    pub thresholds: Thresholds,
    pub alert_cooldown: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            interval: Duration::from_secs(10),
            thresholds: Thresholds::default(),
            alert_cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Docker endpoint; platform defaults when unset
    pub docker_host: Option<String>,
    pub docker_timeout: Duration,
    pub image_pull_timeout: Duration,
    /// Directory for engine-owned state such as label overrides
    pub state_dir: PathBuf,
    /// Host directory backing sandbox volumes
    pub volumes_root: PathBuf,
    pub routing: RoutingSettings,
    pub limits: ValidationLimits,
    /// Timeout applied when a spec does not set one; 0 = unlimited
    pub default_timeout_secs: u64,
    /// Grace period before a stopping container is killed
    pub stop_timeout_secs: u64,
    pub scheduler: SchedulerSettings,
    pub monitor: MonitorSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            docker_host: None,
            docker_timeout: Duration::from_secs(120),
            image_pull_timeout: Duration::from_secs(600),
            state_dir: PathBuf::from(cfg::DEFAULT_STATE_DIR),
            volumes_root: PathBuf::from(cfg::DEFAULT_VOLUMES_ROOT),
            routing: RoutingSettings::default(),
            limits: ValidationLimits::default(),
            default_timeout_secs: 0,
            stop_timeout_secs: 10,
            scheduler: SchedulerSettings::default(),
            monitor: MonitorSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Load `.env` (if present) and read settings from the environment
    pub fn load() -> Result<Self, SettingsError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`, which returns the raw value of a variable if set
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |var: &str, default: &str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let secs = |var: &'static str, range: RangeInclusive<u64>, default: Duration| {
            Duration::from_secs(ranged(&lookup, var, range, default.as_secs()))
        };

        let max_memory_raw = text(cfg::CORRAL_MAX_MEMORY, cfg::DEFAULT_MAX_MEMORY);
        let max_memory_bytes =
            parse_size_bytes(&max_memory_raw).ok_or_else(|| SettingsError::InvalidValue {
                var: cfg::CORRAL_MAX_MEMORY,
                value: max_memory_raw.clone(),
                reason: "expected a size ending with k, m or g".to_string(),
            })?;

        let reserved_ports = match lookup(cfg::CORRAL_RESERVED_PORTS) {
            Some(raw) => parse_port_list(&raw)?,
            None => defaults.limits.reserved_ports.clone(),
        };

        let scheduler = SchedulerSettings {
            auto_cleanup_enabled: flag(
                &lookup,
                cfg::CORRAL_AUTO_CLEANUP_ENABLED,
                defaults.scheduler.auto_cleanup_enabled,
            )?,
            cleanup_interval: secs(
                cfg::CORRAL_CLEANUP_INTERVAL_SECS,
                1..=86_400,
                defaults.scheduler.cleanup_interval,
            ),
            timeout_check_interval: secs(
                cfg::CORRAL_TIMEOUT_CHECK_INTERVAL_SECS,
                1..=3_600,
                defaults.scheduler.timeout_check_interval,
            ),
            max_container_age: secs(
                cfg::CORRAL_MAX_CONTAINER_AGE_SECS,
                60..=31_536_000,
                defaults.scheduler.max_container_age,
            ),
            inactive_timeout: secs(
                cfg::CORRAL_INACTIVE_TIMEOUT_SECS,
                60..=31_536_000,
                defaults.scheduler.inactive_timeout,
            ),
            activity_cpu_floor: ranged(
                &lookup,
                cfg::CORRAL_ACTIVITY_CPU_FLOOR,
                0.0..=100.0,
                defaults.scheduler.activity_cpu_floor,
            ),
        };

        let monitor = MonitorSettings {
            metrics_enabled: flag(
                &lookup,
                cfg::CORRAL_METRICS_ENABLED,
                defaults.monitor.metrics_enabled,
            )?,
            interval: secs(
                cfg::CORRAL_MONITOR_INTERVAL_SECS,
                1..=3_600,
                defaults.monitor.interval,
            ),
            thresholds: Thresholds {
                cpu: ranged(
                    &lookup,
                    cfg::CORRAL_MONITOR_CPU_THRESHOLD,
                    0.0..=100.0,
                    defaults.monitor.thresholds.cpu,
                ),
                memory: ranged(
                    &lookup,
                    cfg::CORRAL_MONITOR_MEMORY_THRESHOLD,
                    0.0..=100.0,
                    defaults.monitor.thresholds.memory,
                ),
                disk: ranged(
                    &lookup,
                    cfg::CORRAL_MONITOR_DISK_THRESHOLD,
                    0.0..=100.0,
                    defaults.monitor.thresholds.disk,
                ),
            },
            alert_cooldown: secs(
                cfg::CORRAL_ALERT_COOLDOWN_SECS,
                0..=86_400,
                defaults.monitor.alert_cooldown,
            ),
        };

        Ok(Self {
            docker_host: lookup(cfg::CORRAL_DOCKER_HOST).filter(|v| !v.trim().is_empty()),
            docker_timeout: secs(cfg::CORRAL_DOCKER_TIMEOUT_SECS, 1..=3_600, defaults.docker_timeout),
            image_pull_timeout: secs(
                cfg::CORRAL_IMAGE_PULL_TIMEOUT_SECS,
                10..=7_200,
                defaults.image_pull_timeout,
            ),
            state_dir: PathBuf::from(text(cfg::CORRAL_STATE_DIR, cfg::DEFAULT_STATE_DIR)),
            volumes_root: PathBuf::from(text(cfg::CORRAL_VOLUMES_ROOT, cfg::DEFAULT_VOLUMES_ROOT)),
            routing: RoutingSettings {
                domain: text(cfg::CORRAL_DOMAIN, cfg::DEFAULT_DOMAIN),
                network: text(cfg::CORRAL_NETWORK, cfg::DEFAULT_NETWORK),
                entrypoint: text(cfg::CORRAL_TRAEFIK_ENTRYPOINT, cfg::DEFAULT_TRAEFIK_ENTRYPOINT),
                http_entrypoint: text(
                    cfg::CORRAL_TRAEFIK_HTTP_ENTRYPOINT,
                    cfg::DEFAULT_TRAEFIK_HTTP_ENTRYPOINT,
                ),
                cert_resolver: text(
                    cfg::CORRAL_TRAEFIK_CERT_RESOLVER,
                    cfg::DEFAULT_TRAEFIK_CERT_RESOLVER,
                ),
            },
            limits: ValidationLimits {
                max_cpu: ranged(&lookup, cfg::CORRAL_MAX_CPU, 0.1..=256.0, defaults.limits.max_cpu),
                max_memory_bytes,
                reserved_ports,
            },
            default_timeout_secs: ranged(
                &lookup,
                cfg::CORRAL_DEFAULT_TIMEOUT_SECS,
                0..=31_536_000,
                defaults.default_timeout_secs,
            ),
            stop_timeout_secs: ranged(
                &lookup,
                cfg::CORRAL_STOP_TIMEOUT_SECS,
                0..=600,
                defaults.stop_timeout_secs,
            ),
            scheduler,
            monitor,
        })
    }
}

/// Parse a numeric variable, falling back to `default` when unset, malformed or out of range
fn ranged<F, T>(lookup: &F, var: &str, range: RangeInclusive<T>, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Copy + std::fmt::Debug,
{
    let Some(raw) = lookup(var) else {
        return default;
    };

    match raw.trim().parse::<T>() {
        Ok(value) if range.contains(&value) => value,
        _ => {
            warn!(
                "Ignoring {}={:?}: expected a value in {:?}, using {:?}",
                var, raw, range, default
            );
            default
        }
    }
}

fn flag<F>(lookup: &F, var: &'static str, default: bool) -> Result<bool, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };

    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidValue {
            var,
            value: raw,
            reason: "expected true or false".to_string(),
        }),
    }
}

fn parse_port_list(raw: &str) -> Result<Vec<u16>, SettingsError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>()
                .ok()
                .filter(|port| *port > 0)
                .ok_or_else(|| SettingsError::InvalidValue {
                    var: cfg::CORRAL_RESERVED_PORTS,
                    value: raw.to_string(),
                    reason: format!("'{}' is not a port number", s),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(vars: &[(&str, &str)]) -> Result<EngineSettings, SettingsError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineSettings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_without_environment() {
        let settings = settings_from(&[]).unwrap();
        assert_eq!(settings, EngineSettings::default());
        assert_eq!(settings.routing.network, "traefik-net");
        assert_eq!(settings.scheduler.cleanup_interval, Duration::from_secs(300));
        assert_eq!(settings.monitor.alert_cooldown, Duration::from_secs(300));
        assert_eq!(settings.default_timeout_secs, 0);
    }

    #[test]
    fn test_values_are_read() {
        let settings = settings_from(&[
            (cfg::CORRAL_DOMAIN, "example.com"),
            (cfg::CORRAL_MAX_CONTAINER_AGE_SECS, "7200"),
            (cfg::CORRAL_MONITOR_CPU_THRESHOLD, "75.5"),
            (cfg::CORRAL_AUTO_CLEANUP_ENABLED, "false"),
            (cfg::CORRAL_RESERVED_PORTS, "22, 8080"),
            (cfg::CORRAL_MAX_MEMORY, "4g"),
        ])
        .unwrap();

        assert_eq!(settings.routing.domain, "example.com");
        assert_eq!(settings.scheduler.max_container_age, Duration::from_secs(7200));
        assert_eq!(settings.monitor.thresholds.cpu, 75.5);
        assert!(!settings.scheduler.auto_cleanup_enabled);
        assert_eq!(settings.limits.reserved_ports, vec![22, 8080]);
        assert_eq!(settings.limits.max_memory_bytes, 4 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_out_of_range_numbers_fall_back() {
        let settings = settings_from(&[
            (cfg::CORRAL_CLEANUP_INTERVAL_SECS, "0"),
            (cfg::CORRAL_MONITOR_MEMORY_THRESHOLD, "150"),
            (cfg::CORRAL_TIMEOUT_CHECK_INTERVAL_SECS, "soon"),
        ])
        .unwrap();

        assert_eq!(settings.scheduler.cleanup_interval, Duration::from_secs(300));
        assert_eq!(settings.monitor.thresholds.memory, 90.0);
        assert_eq!(settings.scheduler.timeout_check_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_unrecoverable_values_are_errors() {
        assert!(matches!(
            settings_from(&[(cfg::CORRAL_METRICS_ENABLED, "maybe")]),
            Err(SettingsError::InvalidValue { var, .. }) if var == cfg::CORRAL_METRICS_ENABLED
        ));
        assert!(settings_from(&[(cfg::CORRAL_RESERVED_PORTS, "22,ssh")]).is_err());
        assert!(settings_from(&[(cfg::CORRAL_MAX_MEMORY, "lots")]).is_err());
    }
}
