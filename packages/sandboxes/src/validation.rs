// ABOUTME: Sandbox spec validation performed before any runtime call
// ABOUTME: Checks image references, resource bounds, port/subdomain uniqueness, env keys and volume sizes

use crate::error::{Result, SandboxError};
use crate::translator::parse_size_bytes;
use crate::types::SandboxSpec;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static IMAGE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]+(/[a-zA-Z0-9_.-]+)*:[a-zA-Z0-9_.-]+$")
        .expect("valid image pattern")
});

static SUBDOMAIN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9-]{3,63}$").expect("valid subdomain pattern"));

static ENV_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid env key pattern"));

static VOLUME_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("valid volume name pattern"));

/// Upper bounds applied to every spec
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationLimits {
    pub max_cpu: f64,
    pub max_memory_bytes: u64,
    /// Host ports raw bindings may not claim
    pub reserved_ports: Vec<u16>,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_cpu: 8.0,
            max_memory_bytes: parse_size_bytes(corral_config::DEFAULT_MAX_MEMORY).unwrap_or(u64::MAX),
            reserved_ports: corral_config::DEFAULT_RESERVED_PORTS.to_vec(),
        }
    }
}

pub fn validate_image(image: &str) -> Result<()> {
    if IMAGE_PATTERN.is_match(image) {
        Ok(())
    } else {
        Err(SandboxError::Validation(format!(
            "Invalid image reference '{}': expected name:tag",
            image
        )))
    }
}

pub fn validate_size(what: &str, value: &str) -> Result<u64> {
    match parse_size_bytes(value) {
        Some(bytes) if bytes > 0 => Ok(bytes),
        _ => Err(SandboxError::Validation(format!(
            "Invalid {} '{}': must be a positive integer ending with k, m or g",
            what, value
        ))),
    }
}

pub fn validate_env_key(key: &str) -> Result<()> {
    if ENV_KEY_PATTERN.is_match(key) {
        Ok(())
    } else {
        Err(SandboxError::Validation(format!(
            "Invalid environment variable name '{}': only letters, digits and '_' allowed",
            key
        )))
    }
}

pub fn validate_volume_name(name: &str) -> Result<()> {
    if VOLUME_NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(SandboxError::Validation(format!("Invalid volume name '{}'", name)))
    }
}

/// Validate a spec as a whole; nothing reaches the runtime unless this passes
pub fn validate_spec(spec: &SandboxSpec, limits: &ValidationLimits) -> Result<()> {
    validate_image(&spec.image)?;

    let resources = &spec.resources;
    if !(resources.cpu_cores > 0.0 && resources.cpu_cores <= limits.max_cpu) {
        return Err(SandboxError::Validation(format!(
            "CPU cores must be greater than 0 and at most {}, got {}",
            limits.max_cpu, resources.cpu_cores
        )));
    }

    let memory = validate_size("memory", &resources.memory)?;
    if memory > limits.max_memory_bytes {
        return Err(SandboxError::Validation(format!(
            "Memory {} exceeds the maximum of {} bytes",
            resources.memory, limits.max_memory_bytes
        )));
    }

    if resources.pids_limit <= 0 {
        return Err(SandboxError::Validation(format!(
            "PIDs limit must be positive, got {}",
            resources.pids_limit
        )));
    }

    for (name, volume) in &spec.volumes {
        validate_volume_name(name)?;
        validate_size("volume size", &volume.size)?;
    }

    // Internal and external ports share one namespace
    let mut used_ports = HashSet::new();
    let mut subdomains = HashSet::new();
    for port in &spec.ports {
        if port.port == 0 {
            return Err(SandboxError::Validation("Port must be between 1 and 65535".to_string()));
        }
        if used_ports.contains(&port.port) {
            return Err(SandboxError::Validation(format!("Duplicate port: {}", port.port)));
        }
        if let Some(external) = port.external {
            if external == 0 {
                return Err(SandboxError::Validation(
                    "External port must be between 1 and 65535".to_string(),
                ));
            }
            if used_ports.contains(&external) {
                return Err(SandboxError::Validation(format!(
                    "Duplicate external port: {}",
                    external
                )));
            }
        }

        if !port.protocol.is_http_family() {
            let host_port = port.external.unwrap_or(port.port);
            if limits.reserved_ports.contains(&host_port) {
                return Err(SandboxError::Validation(format!(
                    "Port {} is reserved",
                    host_port
                )));
            }
        }

        if let Some(subdomain) = &port.subdomain {
            if !SUBDOMAIN_PATTERN.is_match(subdomain) {
                return Err(SandboxError::Validation(format!(
                    "Invalid subdomain '{}': 3-63 characters of a-z, 0-9 and '-'",
                    subdomain
                )));
            }
            if !subdomains.insert(subdomain.clone()) {
                return Err(SandboxError::Validation(format!(
                    "Duplicate subdomain: {}",
                    subdomain
                )));
            }
        }

        used_ports.insert(port.port);
        if let Some(external) = port.external {
            used_ports.insert(external);
        }
    }

    for key in spec.environment.keys() {
        validate_env_key(key)?;
    }

    if let Some(context) = &spec.build_context {
        if context.context_path.as_os_str().is_empty() {
            return Err(SandboxError::Validation(
                "Build context path must not be empty".to_string(),
            ));
        }
    }

    Ok(())
}
