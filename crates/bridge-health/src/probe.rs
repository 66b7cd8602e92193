use bridge_core::types::{ProbeKind, ServiceInstance};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Result of a single probe execution.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub success: bool,
    pub latency: Duration,
    pub detail: String,
}

/// Hand-declared grpc.health.v1 messages; the probe has no generated stubs.
mod healthpb {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct HealthCheckRequest {
        #[prost(string, tag = "1")]
        pub service: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct HealthCheckResponse {
        /// grpc.health.v1.HealthCheckResponse.ServingStatus; 1 = SERVING.
        #[prost(int32, tag = "1")]
        pub status: i32,
    }

    pub const SERVING: i32 = 1;
}

/// Execute a health probe against an instance.
pub async fn run_probe(instance: &ServiceInstance, timeout: Duration) -> ProbeResult {
    let start = std::time::Instant::now();

    let result = match &instance.probe {
        ProbeKind::Grpc => grpc_probe(instance, timeout).await,
        ProbeKind::Tcp => tcp_probe(&instance.host, instance.port, timeout).await,
        ProbeKind::Http { path } => http_probe(&instance.host, instance.port, path, timeout).await,
    };

    let latency = start.elapsed();
    match result {
        Ok(detail) => {
            debug!(
                instance = %instance.id,
                probe = ?instance.probe,
                ?latency,
                "probe ok: {detail}"
            );
            ProbeResult { success: true, latency, detail }
        }
        Err(e) => {
            warn!(
                instance = %instance.id,
                probe = ?instance.probe,
                ?latency,
                "probe failed: {e}"
            );
            ProbeResult { success: false, latency, detail: e }
        }
    }
}

/// grpc.health.v1.Health/Check unary call. Falls back to reporting the
/// transport error when the backend does not serve the health protocol.
async fn grpc_probe(instance: &ServiceInstance, timeout: Duration) -> Result<String, String> {
    use tonic::transport::Endpoint;

    let endpoint = Endpoint::from_shared(instance.endpoint_uri())
        .map_err(|e| format!("bad endpoint: {e}"))?
        .connect_timeout(timeout)
        .timeout(timeout);

    let channel = tokio::time::timeout(timeout, endpoint.connect())
        .await
        .map_err(|_| "connect timeout".to_string())?
        .map_err(|e| format!("connect: {e}"))?;

    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready().await.map_err(|e| format!("channel not ready: {e}"))?;

    let codec: tonic::codec::ProstCodec<healthpb::HealthCheckRequest, healthpb::HealthCheckResponse> =
        tonic::codec::ProstCodec::default();
    let path = http::uri::PathAndQuery::from_static("/grpc.health.v1.Health/Check");
    let request = tonic::Request::new(healthpb::HealthCheckRequest { service: String::new() });

    match tokio::time::timeout(timeout, grpc.unary(request, path, codec)).await {
        Ok(Ok(response)) => {
            let status = response.into_inner().status;
            if status == healthpb::SERVING {
                Ok("SERVING".to_string())
            } else {
                Err(format!("serving status {status}"))
            }
        }
        Ok(Err(status)) if status.code() == tonic::Code::Unimplemented => {
            // Backend reachable but no health service; the connect itself
            // is the signal.
            Ok("reachable (health unimplemented)".to_string())
        }
        Ok(Err(status)) => Err(format!("rpc: {status}")),
        Err(_) => Err("rpc timeout".to_string()),
    }
}

/// Plain TCP connect probe.
async fn tcp_probe(host: &str, port: u16, timeout: Duration) -> Result<String, String> {
    let addr = format!("{host}:{port}");
    let target: SocketAddr = tokio::net::lookup_host(&addr)
        .await
        .map_err(|e| format!("resolve {addr}: {e}"))?
        .next()
        .ok_or_else(|| format!("no address for {addr}"))?;
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_)) => Ok(format!("tcp/{port} connected")),
        Ok(Err(e)) => Err(format!("tcp/{port}: {e}")),
        Err(_) => Err(format!("tcp/{port}: timeout")),
    }
}

/// HTTP GET probe; any 2xx counts as success.
async fn http_probe(
    host: &str,
    port: u16,
    path: &str,
    timeout: Duration,
) -> Result<String, String> {
    let path = if path.starts_with('/') { path } else { "/" };
    let url = format!("http://{host}:{port}{path}");
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| e.to_string())?;
    let resp = client.get(&url).send().await.map_err(|e| e.to_string())?;
    let status = resp.status();
    if status.is_success() {
        Ok(format!("HTTP {status}"))
    } else {
        Err(format!("HTTP {status}"))
    }
}
