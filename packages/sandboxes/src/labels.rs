// ABOUTME: Typed tag store over runtime labels
// ABOUTME: Formats and parses engine metadata (managed marker, timeout, volumes, routes) and Traefik router keys

use crate::types::{Route, Volume};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Labels applied to all Corral containers for tracking
pub const MANAGED_LABEL: &str = "corral.managed";
pub const TIMEOUT_LABEL: &str = "corral.timeout";
pub const AUTO_REMOVE_LABEL: &str = "corral.auto_remove";
pub const ROUTES_LABEL: &str = "corral.routes";
pub const VOLUMES_LABEL: &str = "corral.volumes";

/// Labels applied to Corral volumes
pub const VOLUME_SANDBOX_LABEL: &str = "corral.sandbox";
pub const VOLUME_SIZE_LABEL: &str = "corral.volume.size";
pub const VOLUME_NETWORK_LABEL: &str = "corral.volume.network";

static ROUTER_RULE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^traefik\.http\.routers\.(sandbox-\d+)\.rule$").expect("valid router key pattern")
});

static HOST_RULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Host\(`([^`]+)`\)").expect("valid host rule pattern"));

/// Label filter selecting managed containers
pub fn managed_filter() -> String {
    format!("{}=true", MANAGED_LABEL)
}

pub fn is_managed(labels: &HashMap<String, String>) -> bool {
    labels.get(MANAGED_LABEL).map(String::as_str) == Some("true")
}

pub fn router_key(router: &str, field: &str) -> String {
    format!("traefik.http.routers.{}.{}", router, field)
}

pub fn service_key(service: &str, field: &str) -> String {
    format!("traefik.http.services.{}.loadbalancer.server.{}", service, field)
}

pub fn middleware_key(middleware: &str, field: &str) -> String {
    format!("traefik.http.middlewares.{}.{}", middleware, field)
}

/// Engine metadata carried on a container's labels
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxTags {
    /// Seconds of runtime allowed; 0 = unlimited
    pub timeout_seconds: u64,
    pub auto_remove: bool,
    pub routes: Vec<Route>,
    pub volumes: Vec<Volume>,
}

impl SandboxTags {
    pub fn to_labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(TIMEOUT_LABEL.to_string(), self.timeout_seconds.to_string());
        labels.insert(AUTO_REMOVE_LABEL.to_string(), self.auto_remove.to_string());
        labels.insert(ROUTES_LABEL.to_string(), encode_list(&self.routes));
        labels.insert(VOLUMES_LABEL.to_string(), encode_list(&self.volumes));
        labels
    }

    /// Parse tags leniently: anything missing or malformed falls back to its default
    pub fn from_labels(labels: &HashMap<String, String>) -> Self {
        Self {
            timeout_seconds: parse_timeout(labels),
            auto_remove: labels
                .get(AUTO_REMOVE_LABEL)
                .map(|v| v == "true")
                .unwrap_or(false),
            routes: decode_list(labels, ROUTES_LABEL),
            volumes: decode_list(labels, VOLUMES_LABEL),
        }
    }
}

/// Label update rewriting only the timeout tag
pub fn timeout_labels(timeout_seconds: u64) -> HashMap<String, String> {
    HashMap::from([(TIMEOUT_LABEL.to_string(), timeout_seconds.to_string())])
}

/// Label update rewriting only the volume metadata
pub fn volume_labels(volumes: &[Volume]) -> HashMap<String, String> {
    HashMap::from([(VOLUMES_LABEL.to_string(), encode_list(volumes))])
}

pub fn parse_timeout(labels: &HashMap<String, String>) -> u64 {
    match labels.get(TIMEOUT_LABEL) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring malformed {} label: {:?}", TIMEOUT_LABEL, raw);
            0
        }),
        None => 0,
    }
}

/// Recover `{internal port -> url}` from Traefik router rules
pub fn urls_from_labels(labels: &HashMap<String, String>) -> BTreeMap<u16, String> {
    let mut urls = BTreeMap::new();

    for (key, rule) in labels {
        let Some(router) = ROUTER_RULE_KEY.captures(key).and_then(|c| c.get(1)) else {
            continue;
        };
        let router = router.as_str();

        let port = labels
            .get(&service_key(router, "port"))
            .and_then(|p| p.parse::<u16>().ok())
            .or_else(|| router.trim_start_matches("sandbox-").parse().ok());
        let host = HOST_RULE
            .captures(rule)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());

        if let (Some(port), Some(host)) = (port, host) {
            urls.insert(port, format!("https://{}", host));
        }
    }

    urls
}

fn encode_list<T: serde::Serialize>(items: &[T]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

fn decode_list<T: serde::de::DeserializeOwned>(labels: &HashMap<String, String>, key: &str) -> Vec<T> {
    match labels.get(key) {
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!("Ignoring malformed {} label: {}", key, e);
            Vec::new()
        }),
        None => Vec::new(),
    }
}
