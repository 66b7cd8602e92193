use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Transport protocol an instance speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Grpc,
    #[serde(rename = "grpc+tls")]
    GrpcTls,
}

/// Health status of a backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
    Stopping,
    #[default]
    Unknown,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Healthy => "healthy",
            InstanceStatus::Degraded => "degraded",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl InstanceStatus {
    /// Degraded instances still take traffic; unhealthy and transitional
    /// states do not.
    pub fn routable(&self) -> bool {
        matches!(self, InstanceStatus::Healthy | InstanceStatus::Degraded)
    }
}

/// Probe kind the health monitor runs against an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// grpc.health.v1.Health/Check unary RPC.
    #[default]
    Grpc,
    /// Plain TCP connect.
    Tcp,
    /// HTTP GET against the given path, 2xx counts as success.
    Http { path: String },
}

/// One reachable backend process, as stored in the registry.
///
/// Serialized to UTF-8 JSON when written to a registry backend, so field
/// names here are part of the registry wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub cluster_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub probe: ProbeKind,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub metrics: InstanceMetrics,
    /// Bumped on every registry write; lets watchers discard stale echoes.
    #[serde(default)]
    pub revision: u64,
}

fn default_weight() -> u32 {
    1
}

/// Rolling counters kept per instance, merged in on every heartbeat and
/// updated by the dispatcher after each call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceMetrics {
    pub in_flight: u64,
    pub req_total: u64,
    pub err_total: u64,
    pub ewma_latency_ms: f64,
}

impl ServiceInstance {
    pub fn new(cluster: &str, id: &str, host: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            cluster_name: cluster.to_string(),
            host: host.to_string(),
            port,
            protocol: Protocol::Grpc,
            version: None,
            tags: BTreeSet::new(),
            region: None,
            zone: None,
            datacenter: None,
            weight: 1,
            status: InstanceStatus::Starting,
            probe: ProbeKind::Grpc,
            last_heartbeat: Utc::now(),
            metrics: InstanceMetrics::default(),
            revision: 0,
        }
    }

    /// `http://host:port` style endpoint URI used to build gRPC channels.
    pub fn endpoint_uri(&self) -> String {
        let scheme = match self.protocol {
            Protocol::Grpc => "http",
            Protocol::GrpcTls => "https",
        };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    pub fn has_tags(&self, wanted: &BTreeSet<String>) -> bool {
        wanted.iter().all(|t| self.tags.contains(t))
    }
}

/// Registry change notification, delivered to per-cluster watchers in the
/// backend's revision order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    Added { instance: Box<ServiceInstance> },
    Removed { cluster: String, id: String },
    StatusChanged {
        cluster: String,
        id: String,
        status: InstanceStatus,
    },
}

/// Load-balancing policy for a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    Random,
    LeastConnections,
    P2cEwma,
    ConsistentHash,
}

/// How a gRPC method streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamingKind {
    #[default]
    Unary,
    ServerStream,
    ClientStream,
    Bidi,
}

/// Validate a cluster name: DNS-label syntax, 2-63 chars,
/// `[a-z0-9][a-z0-9-_]*[a-z0-9]`.
pub fn validate_cluster_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() < 2 || bytes.len() > 63 {
        return false;
    }
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let inner_ok = |b: u8| edge_ok(b) || b == b'-' || b == b'_';
    edge_ok(bytes[0])
        && edge_ok(bytes[bytes.len() - 1])
        && bytes[1..bytes.len() - 1].iter().all(|&b| inner_ok(b))
}
