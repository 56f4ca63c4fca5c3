// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names and defaults used by Corral

// Runtime Connection
pub const CORRAL_DOCKER_HOST: &str = "CORRAL_DOCKER_HOST";
pub const CORRAL_DOCKER_TIMEOUT_SECS: &str = "CORRAL_DOCKER_TIMEOUT_SECS";
pub const CORRAL_IMAGE_PULL_TIMEOUT_SECS: &str = "CORRAL_IMAGE_PULL_TIMEOUT_SECS";
pub const CORRAL_STATE_DIR: &str = "CORRAL_STATE_DIR";

// Domain & Routing
pub const CORRAL_DOMAIN: &str = "CORRAL_DOMAIN";
pub const CORRAL_NETWORK: &str = "CORRAL_NETWORK";
pub const CORRAL_TRAEFIK_ENTRYPOINT: &str = "CORRAL_TRAEFIK_ENTRYPOINT";
pub const CORRAL_TRAEFIK_HTTP_ENTRYPOINT: &str = "CORRAL_TRAEFIK_HTTP_ENTRYPOINT";
pub const CORRAL_TRAEFIK_CERT_RESOLVER: &str = "CORRAL_TRAEFIK_CERT_RESOLVER";

// Volumes
pub const CORRAL_VOLUMES_ROOT: &str = "CORRAL_VOLUMES_ROOT";

// Sandbox Defaults & Limits
pub const CORRAL_DEFAULT_TIMEOUT_SECS: &str = "CORRAL_DEFAULT_TIMEOUT_SECS";
pub const CORRAL_MAX_CPU: &str = "CORRAL_MAX_CPU";
pub const CORRAL_MAX_MEMORY: &str = "CORRAL_MAX_MEMORY";
pub const CORRAL_RESERVED_PORTS: &str = "CORRAL_RESERVED_PORTS";
pub const CORRAL_STOP_TIMEOUT_SECS: &str = "CORRAL_STOP_TIMEOUT_SECS";

// Lifecycle Scheduler
pub const CORRAL_AUTO_CLEANUP_ENABLED: &str = "CORRAL_AUTO_CLEANUP_ENABLED";
pub const CORRAL_CLEANUP_INTERVAL_SECS: &str = "CORRAL_CLEANUP_INTERVAL_SECS";
pub const CORRAL_TIMEOUT_CHECK_INTERVAL_SECS: &str = "CORRAL_TIMEOUT_CHECK_INTERVAL_SECS";
pub const CORRAL_MAX_CONTAINER_AGE_SECS: &str = "CORRAL_MAX_CONTAINER_AGE_SECS";
pub const CORRAL_INACTIVE_TIMEOUT_SECS: &str = "CORRAL_INACTIVE_TIMEOUT_SECS";
pub const CORRAL_ACTIVITY_CPU_FLOOR: &str = "CORRAL_ACTIVITY_CPU_FLOOR";

// Monitoring & Alerts
pub const CORRAL_METRICS_ENABLED: &str = "CORRAL_METRICS_ENABLED";
pub const CORRAL_MONITOR_INTERVAL_SECS: &str = "CORRAL_MONITOR_INTERVAL_SECS";
pub const CORRAL_MONITOR_CPU_THRESHOLD: &str = "CORRAL_MONITOR_CPU_THRESHOLD";
pub const CORRAL_MONITOR_MEMORY_THRESHOLD: &str = "CORRAL_MONITOR_MEMORY_THRESHOLD";
pub const CORRAL_MONITOR_DISK_THRESHOLD: &str = "CORRAL_MONITOR_DISK_THRESHOLD";
pub const CORRAL_ALERT_COOLDOWN_SECS: &str = "CORRAL_ALERT_COOLDOWN_SECS";

// Defaults
pub const DEFAULT_DOMAIN: &str = "sandbox.local";
pub const DEFAULT_NETWORK: &str = "traefik-net";
pub const DEFAULT_TRAEFIK_ENTRYPOINT: &str = "websecure";
pub const DEFAULT_TRAEFIK_HTTP_ENTRYPOINT: &str = "web";
pub const DEFAULT_TRAEFIK_CERT_RESOLVER: &str = "letsencrypt";
pub const DEFAULT_VOLUMES_ROOT: &str = "/var/lib/corral/volumes";
pub const DEFAULT_STATE_DIR: &str = "/var/lib/corral/state";
pub const DEFAULT_MEMORY: &str = "512m";
pub const DEFAULT_MAX_MEMORY: &str = "16g";
pub const DEFAULT_RESERVED_PORTS: &[u16] = &[22, 80, 443, 2375, 2376, 2377, 2378, 2379, 2380, 3375];
