use crate::error::{Error, Result};
use crate::types::{LoadBalancingPolicy, Protocol, StreamingKind, validate_cluster_name};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Top-level bridge configuration. Loaded from TOML or JSON (by file
/// extension), then overridden by `BRIDGE_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub frontend: FrontendConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub schemas: SchemaConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    /// When set, unknown top-level keys in the config file abort startup.
    #[serde(default)]
    pub strict_config: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request bodies above this are rejected with 413 before dispatch.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Total in-flight requests before the gateway sheds with 429.
    #[serde(default = "default_max_inflight")]
    pub max_inflight_requests: usize,
    #[serde(default = "default_true")]
    pub enable_gzip: bool,
    /// Also serve `/{cluster}/{path}` without the `/api` prefix.
    #[serde(default = "default_true")]
    pub shortcut_routes: bool,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
            max_inflight_requests: default_max_inflight(),
            enable_gzip: true,
            shortcut_routes: true,
            grace_period_secs: default_grace_period(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegistryBackendKind {
    #[default]
    Memory,
    Etcd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Registry capacity cap. Raising it beyond the default is an explicit
    /// operator decision.
    #[serde(default = "default_max_services")]
    pub max_services: usize,
    #[serde(default)]
    pub registry_backend: RegistryBackendKind,
    #[serde(default = "default_registry_endpoints")]
    pub registry_endpoints: Vec<String>,
    #[serde(default)]
    pub registry_username: Option<String>,
    #[serde(default)]
    pub registry_password: Option<String>,
    #[serde(default = "default_registry_ttl")]
    pub registry_ttl_secs: u64,
    /// Startup proceeds on an unreachable backend only when this is set;
    /// the registry then runs from memory and reports itself degraded.
    #[serde(default)]
    pub allow_memory_fallback: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Upper bound on pool channel acquisition.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_re_cooldown")]
    pub resource_exhausted_cooldown_ms: u64,
    #[serde(default = "default_max_stream_items")]
    pub max_stream_items: usize,
    #[serde(default)]
    pub enable_response_caching: bool,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_entries")]
    pub cache_max_entries: usize,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            max_services: default_max_services(),
            registry_backend: RegistryBackendKind::Memory,
            registry_endpoints: default_registry_endpoints(),
            registry_username: None,
            registry_password: None,
            registry_ttl_secs: default_registry_ttl(),
            allow_memory_fallback: false,
            heartbeat_interval_secs: default_heartbeat_interval(),
            probe_timeout_secs: default_probe_timeout(),
            connection_timeout_ms: default_connection_timeout(),
            default_timeout_ms: default_request_timeout(),
            max_retry_attempts: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff(),
            resource_exhausted_cooldown_ms: default_re_cooldown(),
            max_stream_items: default_max_stream_items(),
            enable_response_caching: false,
            cache_ttl_secs: default_cache_ttl(),
            cache_max_entries: default_cache_entries(),
        }
    }
}

/// A named backend cluster: routing rules, resilience settings, and any
/// statically-known instances registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub load_balancing: LoadBalancingPolicy,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub instances: Vec<StaticInstanceConfig>,
    /// Per-cluster override of `mcp.default_timeout_ms`.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retry_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticInstanceConfig {
    #[serde(default)]
    pub id: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_instance_weight")]
    pub weight: u32,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
    #[serde(default = "default_failure_rate")]
    pub failure_rate_threshold: f64,
    #[serde(default = "default_minimum_requests")]
    pub minimum_requests: usize,
    #[serde(default = "default_slow_call_ms")]
    pub slow_call_threshold_ms: u64,
    #[serde(default = "default_slow_rate")]
    pub slow_call_rate_threshold: f64,
    #[serde(default = "default_failure_window")]
    pub failure_window_secs: u64,
    #[serde(default = "default_half_open_calls")]
    pub half_open_max_calls: usize,
    #[serde(default = "default_open_duration")]
    pub open_state_duration_secs: u64,
    #[serde(default = "default_true")]
    pub enable_adaptive_threshold: bool,
    #[serde(default = "default_min_failure_threshold")]
    pub min_failure_threshold: u32,
    #[serde(default = "default_max_failure_threshold")]
    pub max_failure_threshold: u32,
    #[serde(default)]
    pub enable_distributed_state: bool,
    #[serde(default = "default_sync_interval")]
    pub state_sync_interval_secs: u64,
    #[serde(default = "default_state_ttl")]
    pub distributed_state_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub enable_bulkhead: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_calls: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
            failure_rate_threshold: default_failure_rate(),
            minimum_requests: default_minimum_requests(),
            slow_call_threshold_ms: default_slow_call_ms(),
            slow_call_rate_threshold: default_slow_rate(),
            failure_window_secs: default_failure_window(),
            half_open_max_calls: default_half_open_calls(),
            open_state_duration_secs: default_open_duration(),
            enable_adaptive_threshold: true,
            min_failure_threshold: default_min_failure_threshold(),
            max_failure_threshold: default_max_failure_threshold(),
            enable_distributed_state: false,
            state_sync_interval_secs: default_sync_interval(),
            distributed_state_ttl_secs: default_state_ttl(),
            enable_bulkhead: true,
            max_concurrent_calls: default_max_concurrent(),
            queue_capacity: default_queue_capacity(),
            queue_timeout_ms: default_queue_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Deflate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsModeKind {
    #[default]
    Insecure,
    ServerTls,
    Mtls,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub mode: TlsModeKind,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Override for the TLS server-name check, when the instance host is an
    /// IP address.
    #[serde(default)]
    pub domain_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_keepalive_time")]
    pub keepalive_time_secs: u64,
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,
    #[serde(default = "default_max_idle")]
    pub max_connection_idle_secs: u64,
    #[serde(default = "default_max_age")]
    pub max_connection_age_secs: u64,
    #[serde(default = "default_max_streams")]
    pub max_concurrent_streams: u32,
    #[serde(default = "default_max_message")]
    pub max_message_bytes: usize,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default = "default_channels_per_instance")]
    pub max_channels_per_instance: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            keepalive_time_secs: default_keepalive_time(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            max_connection_idle_secs: default_max_idle(),
            max_connection_age_secs: default_max_age(),
            max_concurrent_streams: default_max_streams(),
            max_message_bytes: default_max_message(),
            compression: Compression::Gzip,
            tls: TlsConfig::default(),
            max_channels_per_instance: default_channels_per_instance(),
        }
    }
}

/// One REST → gRPC mapping. Renames apply in declaration order; the
/// reverse map is applied to responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub http_method: String,
    pub path_template: String,
    pub grpc_service: String,
    pub grpc_method: String,
    #[serde(default)]
    pub streaming: StreamingKind,
    #[serde(default)]
    pub renames: Vec<RenameRule>,
    /// Where `{id}`-style placeholders land in the request message.
    /// Defaults to the placeholder name (`{id}` -> `resource_id` for the
    /// conventional `{id}`).
    #[serde(default)]
    pub id_field: Option<String>,
    #[serde(default)]
    pub idempotent: Option<bool>,
}

impl RouteConfig {
    /// Idempotency defaults from the HTTP verb when not declared.
    pub fn is_idempotent(&self) -> bool {
        self.idempotent.unwrap_or_else(|| {
            matches!(
                self.http_method.to_ascii_uppercase().as_str(),
                "GET" | "HEAD" | "PUT" | "DELETE"
            )
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameRule {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchemaConfig {
    /// Serialized FileDescriptorSet files loaded at startup, keyed by file
    /// stem as the version id unless `version_ids` overrides it.
    #[serde(default)]
    pub descriptor_files: Vec<PathBuf>,
    #[serde(default)]
    pub current_version: Option<String>,
    /// Reject unknown request fields instead of dropping them.
    #[serde(default)]
    pub validate_schemas: bool,
    /// Include default-valued fields in JSON replies.
    #[serde(default)]
    pub emit_default_fields: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// Guards schema mutation endpoints when set. Dispatch-path
    /// authentication stays a pluggable hook.
    #[serde(default)]
    pub admin_api_key: Option<String>,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_max_inflight() -> usize {
    10_000
}
fn default_grace_period() -> u64 {
    10
}
fn default_max_services() -> usize {
    100_000
}
fn default_registry_endpoints() -> Vec<String> {
    vec!["localhost:2379".to_string()]
}
fn default_registry_ttl() -> u64 {
    30
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_probe_timeout() -> u64 {
    5
}
fn default_connection_timeout() -> u64 {
    30_000
}
fn default_request_timeout() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    100
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_backoff() -> u64 {
    5_000
}
fn default_re_cooldown() -> u64 {
    500
}
fn default_max_stream_items() -> usize {
    1_000
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_cache_entries() -> usize {
    10_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_threshold() -> u32 {
    3
}
fn default_failure_rate() -> f64 {
    0.5
}
fn default_minimum_requests() -> usize {
    10
}
fn default_slow_call_ms() -> u64 {
    5_000
}
fn default_slow_rate() -> f64 {
    0.8
}
fn default_failure_window() -> u64 {
    60
}
fn default_half_open_calls() -> usize {
    10
}
fn default_open_duration() -> u64 {
    60
}
fn default_min_failure_threshold() -> u32 {
    3
}
fn default_max_failure_threshold() -> u32 {
    20
}
fn default_sync_interval() -> u64 {
    5
}
fn default_state_ttl() -> u64 {
    30
}
fn default_max_concurrent() -> usize {
    100
}
fn default_queue_capacity() -> usize {
    200
}
fn default_queue_timeout() -> u64 {
    1_000
}
fn default_keepalive_time() -> u64 {
    300
}
fn default_keepalive_timeout() -> u64 {
    20
}
fn default_max_idle() -> u64 {
    300
}
fn default_max_age() -> u64 {
    3_600
}
fn default_max_streams() -> u32 {
    1_000
}
fn default_max_message() -> usize {
    16 * 1024 * 1024
}
fn default_channels_per_instance() -> usize {
    2
}
fn default_instance_weight() -> u32 {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "frontend",
    "mcp",
    "clusters",
    "schemas",
    "observability",
    "security",
    "strict_config",
];

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("failed to read config: {e}")))?;
        let is_json = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let mut config = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let value: toml::Value = toml::from_str(content)
            .map_err(|e| Error::ConfigInvalid(format!("failed to parse config: {e}")))?;
        let config: Config = value
            .clone()
            .try_into()
            .map_err(|e| Error::ConfigInvalid(format!("failed to parse config: {e}")))?;
        if config.strict_config {
            if let Some(table) = value.as_table() {
                reject_unknown_keys(table.keys().map(|k| k.as_str()))?;
            }
        }
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| Error::ConfigInvalid(format!("failed to parse config: {e}")))?;
        let config: Config = serde_json::from_value(value.clone())
            .map_err(|e| Error::ConfigInvalid(format!("failed to parse config: {e}")))?;
        if config.strict_config {
            if let Some(map) = value.as_object() {
                reject_unknown_keys(map.keys().map(|k| k.as_str()))?;
            }
        }
        Ok(config)
    }

    /// Environment variables override file settings.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("BRIDGE_HOST") {
            if !host.is_empty() {
                self.frontend.host = host;
            }
        }
        if let Ok(port) = std::env::var("BRIDGE_PORT") {
            if let Ok(port) = port.parse() {
                self.frontend.port = port;
            }
        }
        if let Ok(level) = std::env::var("BRIDGE_LOG_LEVEL") {
            if !level.is_empty() {
                self.observability.log_level = level;
            }
        }
        if let Ok(backend) = std::env::var("BRIDGE_REGISTRY_BACKEND") {
            match backend.as_str() {
                "memory" => self.mcp.registry_backend = RegistryBackendKind::Memory,
                "etcd" => self.mcp.registry_backend = RegistryBackendKind::Etcd,
                _ => {}
            }
        }
        if let Ok(endpoints) = std::env::var("BRIDGE_REGISTRY_ENDPOINTS") {
            let eps: Vec<String> = endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !eps.is_empty() {
                self.mcp.registry_endpoints = eps;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.frontend.port == 0 {
            return Err(Error::ConfigInvalid("frontend.port must be non-zero".into()));
        }
        if self.mcp.max_services == 0 {
            return Err(Error::ConfigInvalid("mcp.max_services must be positive".into()));
        }
        if self.mcp.backoff_multiplier < 1.0 {
            return Err(Error::ConfigInvalid(
                "mcp.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        let mut seen = BTreeSet::new();
        for cluster in &self.clusters {
            if !validate_cluster_name(&cluster.name) {
                return Err(Error::ConfigInvalid(format!(
                    "invalid cluster name '{}'",
                    cluster.name
                )));
            }
            if !seen.insert(cluster.name.as_str()) {
                return Err(Error::ConfigInvalid(format!(
                    "duplicate cluster '{}'",
                    cluster.name
                )));
            }
            cluster.validate()?;
        }
        Ok(())
    }

    /// Render the default configuration as commented-free TOML, for
    /// `bridge config generate`.
    pub fn generate_default() -> String {
        let mut config = Config::default();
        config.clusters.push(ClusterConfig {
            name: "example-service".to_string(),
            load_balancing: LoadBalancingPolicy::RoundRobin,
            circuit_breaker: CircuitBreakerConfig::default(),
            channel: ChannelConfig::default(),
            routes: vec![RouteConfig {
                http_method: "GET".to_string(),
                path_template: "/items/{id}".to_string(),
                grpc_service: "example.v1.ExampleService".to_string(),
                grpc_method: "GetItem".to_string(),
                streaming: StreamingKind::Unary,
                renames: Vec::new(),
                id_field: None,
                idempotent: None,
            }],
            instances: vec![StaticInstanceConfig {
                id: Some("example-1".to_string()),
                host: "127.0.0.1".to_string(),
                port: 50051,
                protocol: Protocol::Grpc,
                weight: 1,
                tags: BTreeSet::new(),
            }],
            default_timeout_ms: None,
            max_retry_attempts: None,
        });
        toml::to_string_pretty(&config).expect("default config serializes")
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        let cb = &self.circuit_breaker;
        if cb.min_failure_threshold > cb.max_failure_threshold {
            return Err(Error::ConfigInvalid(format!(
                "cluster '{}': min_failure_threshold > max_failure_threshold",
                self.name
            )));
        }
        if !(0.0..=1.0).contains(&cb.failure_rate_threshold)
            || !(0.0..=1.0).contains(&cb.slow_call_rate_threshold)
        {
            return Err(Error::ConfigInvalid(format!(
                "cluster '{}': rate thresholds must be within [0, 1]",
                self.name
            )));
        }
        if cb.enable_bulkhead && cb.max_concurrent_calls == 0 {
            return Err(Error::ConfigInvalid(format!(
                "cluster '{}': max_concurrent_calls must be positive",
                self.name
            )));
        }
        if self.channel.max_channels_per_instance == 0 {
            return Err(Error::ConfigInvalid(format!(
                "cluster '{}': max_channels_per_instance must be positive",
                self.name
            )));
        }
        for inst in &self.instances {
            if inst.host.is_empty() || inst.port == 0 {
                return Err(Error::ConfigInvalid(format!(
                    "cluster '{}': instance endpoint must be host:port",
                    self.name
                )));
            }
        }
        for route in &self.routes {
            if route.grpc_service.is_empty() || route.grpc_method.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "cluster '{}': route {} {} must name a gRPC service and method",
                    self.name, route.http_method, route.path_template
                )));
            }
            if !route.path_template.starts_with('/') {
                return Err(Error::ConfigInvalid(format!(
                    "cluster '{}': path template '{}' must start with '/'",
                    self.name, route.path_template
                )));
            }
        }
        Ok(())
    }

    pub fn timeout_ms(&self, mcp: &McpConfig) -> u64 {
        self.default_timeout_ms.unwrap_or(mcp.default_timeout_ms)
    }

    pub fn retries(&self, mcp: &McpConfig) -> u32 {
        self.max_retry_attempts.unwrap_or(mcp.max_retry_attempts)
    }
}

fn reject_unknown_keys<'a>(keys: impl Iterator<Item = &'a str>) -> Result<()> {
    for key in keys {
        if !KNOWN_TOP_LEVEL_KEYS.contains(&key) {
            return Err(Error::ConfigInvalid(format!(
                "unknown top-level config key '{key}'"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml_str = r#"
[frontend]
host = "127.0.0.1"
port = 9000

[observability]
log_level = "debug"
log_format = "text"
"#;
        let config = Config::from_toml_str(toml_str).unwrap();
        assert_eq!(config.frontend.host, "127.0.0.1");
        assert_eq!(config.frontend.port, 9000);
        assert_eq!(config.mcp.registry_backend, RegistryBackendKind::Memory);
        assert_eq!(config.mcp.max_services, 100_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_cluster_config() {
        let toml_str = r#"
[mcp]
registry_backend = "etcd"
registry_endpoints = ["etcd-a:2379", "etcd-b:2379"]
allow_memory_fallback = true

[[clusters]]
name = "user-service"
load_balancing = "p2c_ewma"

[clusters.circuit_breaker]
failure_threshold = 5
minimum_requests = 5
open_state_duration_secs = 1

[clusters.channel]
compression = "gzip"
max_channels_per_instance = 4

[clusters.channel.tls]
mode = "server_tls"
ca_file = "/etc/bridge/ca.pem"

[[clusters.routes]]
http_method = "GET"
path_template = "/users/{id}"
grpc_service = "user.v1.UserService"
grpc_method = "GetUser"

[[clusters.routes.renames]]
from = "customer"
to = "customer_info"

[[clusters.instances]]
id = "u1"
host = "10.0.0.5"
port = 50051
weight = 2
"#;
        let config = Config::from_toml_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mcp.registry_backend, RegistryBackendKind::Etcd);
        assert_eq!(config.mcp.registry_endpoints.len(), 2);
        let cluster = &config.clusters[0];
        assert_eq!(cluster.load_balancing, LoadBalancingPolicy::P2cEwma);
        assert_eq!(cluster.circuit_breaker.minimum_requests, 5);
        assert_eq!(cluster.channel.tls.mode, TlsModeKind::ServerTls);
        assert_eq!(cluster.routes[0].renames[0].to, "customer_info");
        assert_eq!(cluster.instances[0].weight, 2);
        assert!(cluster.routes[0].is_idempotent());
    }

    #[test]
    fn test_strict_config_rejects_unknown_keys() {
        let toml_str = r#"
strict_config = true
not_a_section = 1
"#;
        let err = Config::from_toml_str(toml_str).unwrap_err();
        assert_eq!(err.kind(), "config.invalid");

        // Without strict_config the same key is tolerated.
        let lax = "not_a_section = 1";
        assert!(Config::from_toml_str(lax).is_ok());
    }

    #[test]
    fn test_invalid_cluster_name_fails_validation() {
        let toml_str = r#"
[[clusters]]
name = "Bad Name"
"#;
        let config = Config::from_toml_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_cluster_fails_validation() {
        let toml_str = r#"
[[clusters]]
name = "svc-a"

[[clusters]]
name = "svc-a"
"#;
        let config = Config::from_toml_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_config() {
        let json = r#"{"frontend": {"port": 8443}, "clusters": []}"#;
        let config = Config::from_json_str(json).unwrap();
        assert_eq!(config.frontend.port, 8443);
    }

    #[test]
    fn test_generated_default_parses_and_validates() {
        let rendered = Config::generate_default();
        let config = Config::from_toml_str(&rendered).unwrap();
        config.validate().unwrap();
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].name, "example-service");
    }

    #[test]
    fn test_verb_default_idempotency() {
        let mut route = RouteConfig {
            http_method: "POST".to_string(),
            path_template: "/orders".to_string(),
            grpc_service: "s".to_string(),
            grpc_method: "CreateOrder".to_string(),
            streaming: StreamingKind::Unary,
            renames: Vec::new(),
            id_field: None,
            idempotent: None,
        };
        assert!(!route.is_idempotent());
        route.http_method = "DELETE".to_string();
        assert!(route.is_idempotent());
        route.idempotent = Some(true);
        route.http_method = "POST".to_string();
        assert!(route.is_idempotent());
    }
}
