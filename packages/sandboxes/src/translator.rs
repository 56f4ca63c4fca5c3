// ABOUTME: Resource translator from declarative sandbox specs to runtime configuration
// ABOUTME: Computes CPU/memory limits, hardening, port bindings and Traefik routing labels without side effects

use crate::labels::{middleware_key, router_key, service_key, SandboxTags};
use crate::runtime::{ContainerConfig, PortBinding};
use crate::types::{route_subdomain, PortRequest, Route, SandboxSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// CFS period used for CPU quotas (100ms)
pub const CPU_PERIOD: i64 = 100_000;

const CATCHALL_ROUTER: &str = "http-catchall";
const REDIRECT_MIDDLEWARE: &str = "redirect-to-https";
const HEADERS_MIDDLEWARE: &str = "security-headers";
const HSTS_SECONDS: u64 = 31_536_000;

/// Reverse-proxy and network settings shared by every sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSettings {
    pub domain: String,
    pub network: String,
    /// TLS entrypoint for sandbox routes
    pub entrypoint: String,
    /// Plain HTTP entrypoint redirected to TLS
    pub http_entrypoint: String,
    pub cert_resolver: String,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            domain: corral_config::DEFAULT_DOMAIN.to_string(),
            network: corral_config::DEFAULT_NETWORK.to_string(),
            entrypoint: corral_config::DEFAULT_TRAEFIK_ENTRYPOINT.to_string(),
            http_entrypoint: corral_config::DEFAULT_TRAEFIK_HTTP_ENTRYPOINT.to_string(),
            cert_resolver: corral_config::DEFAULT_TRAEFIK_CERT_RESOLVER.to_string(),
        }
    }
}

/// Volume the gateway has to create before the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedVolume {
    pub name: String,
    pub size: String,
    pub driver: String,
    pub mount_path: String,
}

/// Translated runtime configuration of one sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Container settings; mounts are filled in once volumes exist
    pub container: ContainerConfig,
    pub volumes: Vec<PlannedVolume>,
    pub routes: Vec<Route>,
}

/// Parse a size string with a k/m/g suffix (case-insensitive) into bytes
pub fn parse_size_bytes(value: &str) -> Option<u64> {
    let value = value.trim().to_lowercase();
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => return None,
    };
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

pub fn mount_path(volume_name: &str) -> String {
    format!("/mnt/{}", volume_name)
}

/// Translate a validated spec into runtime configuration
pub fn translate(spec: &SandboxSpec, routing: &RoutingSettings) -> RuntimeConfig {
    let resources = &spec.resources;

    let routes: Vec<Route> = spec
        .ports
        .iter()
        .map(|port| Route::from_request(port, &routing.domain))
        .collect();

    let tags = SandboxTags {
        timeout_seconds: spec.timeout_seconds.unwrap_or(0),
        auto_remove: spec.auto_remove,
        routes: routes.clone(),
        volumes: Vec::new(),
    };
    let mut labels = tags.to_labels();
    labels.extend(proxy_labels(&spec.ports, routing));

    let mut exposed_ports = Vec::new();
    let mut port_bindings = Vec::new();
    for port in &spec.ports {
        let container_port = format!("{}/{}", port.port, port.protocol.transport());
        if port.protocol.is_http_family() {
            exposed_ports.push(container_port);
        } else {
            port_bindings.push(PortBinding {
                container_port,
                host_port: port.external.unwrap_or(port.port),
            });
        }
    }

    let volumes = spec
        .volumes
        .iter()
        .map(|(name, request)| PlannedVolume {
            name: name.clone(),
            size: request.size.clone(),
            driver: request.driver.clone(),
            mount_path: mount_path(name),
        })
        .collect();

    let container = ContainerConfig {
        image: spec.image.clone(),
        command: spec.command.clone(),
        entrypoint: spec.entrypoint.clone(),
        environment: spec.environment.clone(),
        labels,
        exposed_ports,
        port_bindings,
        mounts: Vec::new(),
        cpu_quota: (resources.cpu_cores * CPU_PERIOD as f64).round() as i64,
        cpu_period: CPU_PERIOD,
        memory_bytes: parse_size_bytes(&resources.memory).unwrap_or(0) as i64,
        pids_limit: resources.pids_limit,
        read_only_root_fs: resources.read_only_root_fs,
        network_mode: if resources.network_enabled {
            routing.network.clone()
        } else {
            "none".to_string()
        },
        cap_drop: vec!["ALL".to_string()],
        security_opt: vec!["no-new-privileges".to_string()],
        privileged: false,
        auto_remove: spec.auto_remove,
    };

    RuntimeConfig {
        container,
        volumes,
        routes,
    }
}

/// Traefik labels: the shared catch-all redirect, baseline middlewares and one router per http port
fn proxy_labels(ports: &[PortRequest], routing: &RoutingSettings) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    let mut set = |key: String, value: String| {
        labels.insert(key, value);
    };

    set("traefik.enable".to_string(), "true".to_string());
    set("traefik.docker.network".to_string(), routing.network.clone());

    set(
        router_key(CATCHALL_ROUTER, "rule"),
        "hostregexp(`{host:.+}`)".to_string(),
    );
    set(
        router_key(CATCHALL_ROUTER, "entrypoints"),
        routing.http_entrypoint.clone(),
    );
    set(
        router_key(CATCHALL_ROUTER, "middlewares"),
        REDIRECT_MIDDLEWARE.to_string(),
    );
    set(
        middleware_key(REDIRECT_MIDDLEWARE, "redirectscheme.scheme"),
        "https".to_string(),
    );

    for (field, value) in [
        ("forcestsheader", "true".to_string()),
        ("sslredirect", "true".to_string()),
        ("stsincludesubdomains", "true".to_string()),
        ("stsseconds", HSTS_SECONDS.to_string()),
        ("stspreload", "true".to_string()),
        ("customframeoptionsvalue", "SAMEORIGIN".to_string()),
    ] {
        set(middleware_key(HEADERS_MIDDLEWARE, &format!("headers.{}", field)), value);
    }

    for port in ports.iter().filter(|p| p.protocol.is_http_family()) {
        let router = format!("sandbox-{}", port.port);
        let host = format!("{}.{}", route_subdomain(port), routing.domain);

        set(router_key(&router, "rule"), format!("Host(`{}`)", host));
        set(router_key(&router, "entrypoints"), routing.entrypoint.clone());
        set(router_key(&router, "tls"), "true".to_string());
        set(
            router_key(&router, "tls.certresolver"),
            routing.cert_resolver.clone(),
        );
        set(
            router_key(&router, "middlewares"),
            format!("{},{}", REDIRECT_MIDDLEWARE, HEADERS_MIDDLEWARE),
        );
        set(router_key(&router, "service"), router.clone());
        set(service_key(&router, "port"), port.port.to_string());
        set(service_key(&router, "scheme"), "http".to_string());
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{urls_from_labels, TIMEOUT_LABEL};
    use crate::types::{Protocol, VolumeRequest};
    use pretty_assertions::assert_eq;

    fn routing() -> RoutingSettings {
        RoutingSettings {
            domain: "example.com".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_cpu_quota_follows_cores() {
        for (cores, quota) in [(1.0, 100_000), (0.5, 50_000), (2.25, 225_000)] {
            let mut spec = SandboxSpec::new("alpine:3.19");
            spec.resources.cpu_cores = cores;

            let config = translate(&spec, &routing());
            assert_eq!(config.container.cpu_quota, quota);
            assert_eq!(config.container.cpu_period, 100_000);
        }
    }

    #[test]
    fn test_parse_size_bytes() {
        assert_eq!(parse_size_bytes("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_size_bytes("2G"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size_bytes("64k"), Some(64 * 1024));
        assert_eq!(parse_size_bytes("512"), None);
        assert_eq!(parse_size_bytes("m"), None);
        assert_eq!(parse_size_bytes("1.5g"), None);
        assert_eq!(parse_size_bytes(""), None);
    }

    #[test]
    fn test_network_and_hardening() {
        let mut spec = SandboxSpec::new("alpine:3.19");
        let config = translate(&spec, &routing());
        assert_eq!(config.container.network_mode, "traefik-net");
        assert!(config.container.read_only_root_fs);
        assert_eq!(config.container.cap_drop, vec!["ALL".to_string()]);
        assert!(!config.container.privileged);
        assert_eq!(config.container.memory_bytes, 512 * 1024 * 1024);

        spec.resources.network_enabled = false;
        spec.resources.read_only_root_fs = false;
        let config = translate(&spec, &routing());
        assert_eq!(config.container.network_mode, "none");
        assert!(!config.container.read_only_root_fs);
    }

    #[test]
    fn test_http_port_becomes_route() {
        let mut spec = SandboxSpec::new("node:20");
        spec.ports.push(PortRequest::http(3000).with_subdomain("app"));

        let config = translate(&spec, &routing());
        let labels = &config.container.labels;

        assert_eq!(
            labels[&router_key("sandbox-3000", "rule")],
            "Host(`app.example.com`)"
        );
        assert_eq!(labels[&router_key("sandbox-3000", "tls")], "true");
        assert_eq!(
            labels[&router_key("sandbox-3000", "tls.certresolver")],
            "letsencrypt"
        );
        assert_eq!(labels[&service_key("sandbox-3000", "port")], "3000");
        assert_eq!(config.container.exposed_ports, vec!["3000/tcp".to_string()]);
        assert!(config.container.port_bindings.is_empty());

        assert_eq!(
            config.routes[0].url.as_deref(),
            Some("https://app.example.com")
        );
        assert_eq!(urls_from_labels(labels)[&3000], "https://app.example.com");
    }

    #[test]
    fn test_raw_ports_bind_on_host() {
        let mut spec = SandboxSpec::new("postgres:16");
        spec.ports.push(PortRequest {
            port: 5432,
            protocol: Protocol::Tcp,
            external: Some(15432),
            subdomain: None,
        });
        spec.ports.push(PortRequest {
            port: 53,
            protocol: Protocol::Udp,
            external: None,
            subdomain: None,
        });

        let config = translate(&spec, &routing());
        assert_eq!(
            config.container.port_bindings,
            vec![
                PortBinding {
                    container_port: "5432/tcp".to_string(),
                    host_port: 15432,
                },
                PortBinding {
                    container_port: "53/udp".to_string(),
                    host_port: 53,
                },
            ]
        );
        assert!(config.routes.iter().all(|r| r.url.is_none()));
        assert!(!config
            .container
            .labels
            .contains_key(&router_key("sandbox-5432", "rule")));
    }

    #[test]
    fn test_catchall_emitted_once_and_translation_is_idempotent() {
        let mut spec = SandboxSpec::new("node:20");
        spec.ports.push(PortRequest::http(3000));
        spec.ports.push(PortRequest::http(4000));

        let first = translate(&spec, &routing());
        let second = translate(&spec, &routing());
        assert_eq!(first, second);

        let catchall_rules = first
            .container
            .labels
            .keys()
            .filter(|k| k.starts_with("traefik.http.routers.http-catchall.rule"))
            .count();
        assert_eq!(catchall_rules, 1);
        assert_eq!(
            first.container.labels[&middleware_key(HEADERS_MIDDLEWARE, "headers.stsseconds")],
            "31536000"
        );
    }

    #[test]
    fn test_volumes_and_tags() {
        let mut spec = SandboxSpec::new("python:3.12");
        spec.volumes
            .insert("data".to_string(), VolumeRequest::new("1g"));
        spec.timeout_seconds = Some(30);

        let config = translate(&spec, &routing());
        assert_eq!(
            config.volumes,
            vec![PlannedVolume {
                name: "data".to_string(),
                size: "1g".to_string(),
                driver: "local".to_string(),
                mount_path: "/mnt/data".to_string(),
            }]
        );
        assert_eq!(config.container.labels[TIMEOUT_LABEL], "30");
    }
}
