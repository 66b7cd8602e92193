use crate::obs::status_class;
use crate::AppState;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bridge_core::Error;
use bridge_mcp::DispatchResult;
use bridge_schema::translate::success_envelope;
use bridge_schema::{ContentKind, RestEnvelope};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

/// Headers forwarded to backends as x-bridge-hdr-* metadata.
const FORWARDED_HEADERS: &[&str] = &["authorization", "user-agent", "x-forwarded-for"];

// ---- middleware ----

/// One structured line per request: method, path, status, duration.
pub async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(req).await;
    info!(
        method = %method,
        path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}

/// Guard for schema mutation endpoints when an admin key is configured.
fn check_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    if let Some(expected) = &state.admin_api_key {
        let presented = headers.get("x-api-key").and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": {"kind": "unauthorized", "message": "missing or invalid API key"}})),
            )
                .into_response());
        }
    }
    Ok(())
}

// ---- fixed endpoints ----

pub async fn health(State(state): State<AppState>) -> Response {
    let ready = state.ready.load(Ordering::Acquire);
    let stats = state.registry.stats();
    let (code, status) = if !ready {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    } else if stats.degraded {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    };

    let body = json!({
        "status": status,
        "uptime_s": state.started_at.elapsed().as_secs(),
        "components": {
            "registry": {
                "backend": stats.backend,
                "degraded": stats.degraded,
                "instances": stats.total_instances,
            },
            "clusters": state.dispatcher.clusters().len(),
            "schemas": state.catalog.list().len(),
        }
    });
    (code, Json(body)).into_response()
}

pub async fn metrics_text(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

pub async fn list_services(State(state): State<AppState>) -> Json<Value> {
    let mut clusters = Vec::new();
    for name in state.dispatcher.clusters().names() {
        let runtime = match state.dispatcher.clusters().get(&name) {
            Some(runtime) => runtime,
            None => continue,
        };
        let all = state.registry.discover(&name, &Default::default(), false);
        let healthy = all.iter().filter(|i| i.status.routable()).count();
        clusters.push(json!({
            "name": name,
            "instance_count": all.len(),
            "healthy_count": healthy,
            "policy": runtime.config().load_balancing,
        }));
    }
    Json(json!({ "clusters": clusters }))
}

pub async fn list_schemas(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "versions": state.catalog.list(),
        "current": state.catalog.current_version(),
    }))
}

pub async fn get_schema(State(state): State<AppState>, Path(version): Path<String>) -> Response {
    match state.catalog.get(&version) {
        Some(meta) => Json(json!(meta)).into_response(),
        None => error_response(&Error::SchemaNotRegistered(version), "-"),
    }
}

pub async fn schema_compatibility(
    State(state): State<AppState>,
    Path((old, new)): Path<(String, String)>,
) -> Response {
    match state.catalog.compatibility(&old, &new) {
        Ok(report) => Json(json!(report)).into_response(),
        Err(e) => error_response(&e, "-"),
    }
}

pub async fn register_schema(
    State(state): State<AppState>,
    Path(version): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(denied) = check_admin(&state, &headers) {
        return denied;
    }
    match state.catalog.register_schema(&version, &body) {
        Ok(meta) => (StatusCode::CREATED, Json(json!(meta))).into_response(),
        Err(e) => error_response(&e, "-"),
    }
}

pub async fn set_current_schema(
    State(state): State<AppState>,
    Path(version): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = check_admin(&state, &headers) {
        return denied;
    }
    match state.catalog.set_current(&version) {
        Ok(()) => Json(json!({"current": version})).into_response(),
        Err(e) => error_response(&e, "-"),
    }
}

// ---- universal dispatch ----

pub async fn dispatch_root(
    state: State<AppState>,
    Path(cluster): Path<String>,
    query: Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_inner(state, cluster, String::new(), query.0, method, headers, body).await
}

pub async fn dispatch(
    state: State<AppState>,
    Path((cluster, path)): Path<(String, String)>,
    query: Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_inner(state, cluster, path, query.0, method, headers, body).await
}

struct InflightGuard {
    state: AppState,
    cluster: String,
    /// Admission was over the gateway bound; the request must shed.
    over: bool,
}

impl InflightGuard {
    fn enter(state: &AppState, cluster: &str) -> Self {
        let current = state.inflight.fetch_add(1, Ordering::AcqRel);
        metrics::gauge!("bridge_inflight", "cluster" => cluster.to_string()).increment(1.0);
        Self {
            state: state.clone(),
            cluster: cluster.to_string(),
            over: current >= state.max_inflight,
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.state.inflight.fetch_sub(1, Ordering::AcqRel);
        metrics::gauge!("bridge_inflight", "cluster" => self.cluster.clone()).decrement(1.0);
    }
}

async fn dispatch_inner(
    State(state): State<AppState>,
    cluster: String,
    path: String,
    query: HashMap<String, String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let start = Instant::now();

    let guard = InflightGuard::enter(&state, &cluster);
    if guard.over {
        let response = error_response(
            &Error::BulkheadFull {
                cluster: cluster.clone(),
            },
            &request_id,
        );
        record_request(&cluster, response.status(), start);
        return response;
    }

    let envelope = build_envelope(&path, &query, &method, &headers, body, request_id.clone());

    let result = state.dispatcher.dispatch(&cluster, envelope).await;
    let response = match result {
        Ok(DispatchResult::Unary {
            data,
            instance_id,
            execution_time_ms,
        }) => {
            let payload = success_envelope(data, &request_id, execution_time_ms, &instance_id);
            let mut response = Json(payload).into_response();
            reply_headers(&mut response, &request_id, &instance_id, execution_time_ms);
            response
        }
        Ok(DispatchResult::Stream { items, instance_id }) => {
            let lines = ReceiverStream::new(items).map(|item| {
                let line = match item {
                    Ok(value) => value.to_string(),
                    Err(e) => json!({"error": {"kind": e.kind(), "message": e.to_string()}})
                        .to_string(),
                };
                Ok::<Bytes, std::convert::Infallible>(Bytes::from(line + "\n"))
            });
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/x-ndjson")
                .body(Body::from_stream(lines))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            reply_headers(&mut response, &request_id, &instance_id, 0);
            response
        }
        Err(e) => error_response(&e, &request_id),
    };

    record_request(&cluster, response.status(), start);
    drop(guard);
    response
}

fn build_envelope(
    path: &str,
    query: &HashMap<String, String>,
    method: &Method,
    headers: &HeaderMap,
    body: Bytes,
    request_id: String,
) -> RestEnvelope {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let mut headers_subset = Vec::new();
    for name in FORWARDED_HEADERS {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
            headers_subset.push((name.to_string(), value.to_string()));
        }
    }

    let mut query: Vec<(String, String)> =
        query.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    query.sort();

    RestEnvelope {
        method: method.as_str().to_string(),
        path: format!("/{}", path.trim_start_matches('/')),
        query,
        content_type: if content_type.contains("proto") {
            ContentKind::Proto
        } else {
            ContentKind::Json
        },
        body,
        headers_subset,
        request_id,
        deadline_ms: headers
            .get("x-deadline-ms")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()),
        accept_ndjson: accept.contains("application/x-ndjson"),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string()),
    }
}

fn reply_headers(response: &mut Response, request_id: &str, instance_id: &str, execution_ms: u64) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(instance_id) {
        headers.insert("x-instance", value);
    }
    if let Ok(value) = HeaderValue::from_str(&execution_ms.to_string()) {
        headers.insert("x-execution-time-ms", value);
    }
}

fn record_request(cluster: &str, status: StatusCode, start: Instant) {
    metrics::counter!(
        "bridge_requests_total",
        "cluster" => cluster.to_string(),
        "status" => status_class(status.as_u16()),
    )
    .increment(1);
    metrics::histogram!(
        "bridge_request_latency_seconds",
        "cluster" => cluster.to_string(),
    )
    .record(start.elapsed().as_secs_f64());
}

/// Error payload: stable kind, human message, request id. No stack traces
/// or internal hostnames reach the wire.
fn error_response(e: &Error, request_id: &str) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let kind = e.kind();

    if status.is_server_error() {
        error!(kind, request_id, "dispatch failed: {e}");
    } else {
        warn!(kind, request_id, "dispatch rejected: {e}");
    }

    let hint = match e {
        Error::CircuitOpen { .. } => Some("backend is failing, retry after the indicated delay"),
        Error::BulkheadFull { .. } | Error::BulkheadTimeout { .. } => {
            Some("cluster is saturated, reduce request rate")
        }
        Error::SchemaRouteNotFound { .. } => Some("no routing rule matches this method and path"),
        _ => None,
    };

    let mut body = json!({
        "error": {
            "kind": kind,
            "message": e.to_string(),
            "request_id": request_id,
        }
    });
    if let Some(hint) = hint {
        body["error"]["hint"] = json!(hint);
    }

    let mut response = (status, Json(body)).into_response();
    if let Error::CircuitOpen {
        retry_after_ms: Some(ms),
        ..
    } = e
    {
        let secs = ms.div_ceil(1000).max(1);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{build_router, GatewayServer};
    use bridge_core::config::{ClusterConfig, FrontendConfig, McpConfig, RouteConfig};
    use bridge_core::types::{InstanceStatus, ServiceInstance, StreamingKind};
    use bridge_mcp::{ChannelPool, ClusterMap, Dispatcher};
    use bridge_registry::{MemoryStore, RegistrySettings, ServiceRegistry};
    use bridge_schema::{SchemaCatalog, TranslateOptions};
    use http_body_util::BodyExt;
    use prost::Message as _;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn descriptor_bytes() -> Vec<u8> {
        use prost_types::field_descriptor_proto::{Label, Type};
        use prost_types::*;
        let file = FileDescriptorProto {
            name: Some("user.proto".to_string()),
            package: Some("user.v1".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![
                DescriptorProto {
                    name: Some("GetUserRequest".to_string()),
                    field: vec![FieldDescriptorProto {
                        name: Some("resource_id".to_string()),
                        number: Some(1),
                        label: Some(Label::Optional as i32),
                        r#type: Some(Type::String as i32),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                DescriptorProto {
                    name: Some("User".to_string()),
                    field: vec![FieldDescriptorProto {
                        name: Some("user_id".to_string()),
                        number: Some(1),
                        label: Some(Label::Optional as i32),
                        r#type: Some(Type::String as i32),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            ],
            service: vec![ServiceDescriptorProto {
                name: Some("UserService".to_string()),
                method: vec![MethodDescriptorProto {
                    name: Some("GetUser".to_string()),
                    input_type: Some(".user.v1.GetUserRequest".to_string()),
                    output_type: Some(".user.v1.User".to_string()),
                    client_streaming: Some(false),
                    server_streaming: Some(false),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        FileDescriptorSet { file: vec![file] }.encode_to_vec()
    }

    async fn test_server(instances: Vec<ServiceInstance>) -> (GatewayServer, FrontendConfig) {
        let registry = Arc::new(ServiceRegistry::new(
            Arc::new(MemoryStore::new()),
            RegistrySettings::default(),
        ));
        for instance in instances {
            registry.register(instance).await.unwrap();
        }
        let clusters = Arc::new(ClusterMap::new());
        clusters.upsert(ClusterConfig {
            name: "user-service".to_string(),
            load_balancing: Default::default(),
            circuit_breaker: Default::default(),
            channel: Default::default(),
            routes: vec![RouteConfig {
                http_method: "GET".to_string(),
                path_template: "/users/{id}".to_string(),
                grpc_service: "user.v1.UserService".to_string(),
                grpc_method: "GetUser".to_string(),
                streaming: StreamingKind::Unary,
                renames: Vec::new(),
                id_field: None,
                idempotent: None,
            }],
            instances: Vec::new(),
            default_timeout_ms: Some(500),
            max_retry_attempts: Some(0),
        });
        let catalog = Arc::new(SchemaCatalog::new());
        catalog.register_schema("v1", &descriptor_bytes()).unwrap();
        catalog
            .register_schema(
                "v2",
                &{
                    let mut set = prost_types::FileDescriptorSet::decode(
                        descriptor_bytes().as_slice(),
                    )
                    .unwrap();
                    set.file[0].package = Some("user.v2".to_string());
                    set.encode_to_vec()
                },
            )
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            clusters,
            Arc::new(ChannelPool::new(Duration::from_millis(200))),
            catalog,
            McpConfig::default(),
            TranslateOptions::default(),
        ));
        let config = FrontendConfig::default();
        (GatewayServer::new(config.clone(), dispatcher), config)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_starting_then_healthy() {
        let (server, config) = test_server(vec![]).await;
        let ready = server.ready_flag();
        let app = build_router(server.build_state(), &config);

        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "starting");

        ready.store(true, Ordering::Release);
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["components"]["registry"]["backend"], "memory");
    }

    #[tokio::test]
    async fn test_list_services_shape() {
        let mut instance = ServiceInstance::new("user-service", "u1", "127.0.0.1", 1);
        instance.status = InstanceStatus::Healthy;
        let (server, config) = test_server(vec![instance]).await;
        let app = build_router(server.build_state(), &config);

        let body = body_json(app.oneshot(get("/api/services")).await.unwrap()).await;
        let clusters = body["clusters"].as_array().unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0]["name"], "user-service");
        assert_eq!(clusters[0]["instance_count"], 1);
        assert_eq!(clusters[0]["healthy_count"], 1);
        assert_eq!(clusters[0]["policy"], "round_robin");
    }

    #[tokio::test]
    async fn test_schema_endpoints() {
        let (server, config) = test_server(vec![]).await;
        let app = build_router(server.build_state(), &config);

        let body = body_json(app.clone().oneshot(get("/schema/list")).await.unwrap()).await;
        assert_eq!(body["versions"].as_array().unwrap().len(), 2);
        assert_eq!(body["current"], "v1");

        let body = body_json(app.clone().oneshot(get("/schema/v1")).await.unwrap()).await;
        assert_eq!(body["version_id"], "v1");

        let response = app
            .clone()
            .oneshot(get("/schema/ghost"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = body_json(
            app.oneshot(get("/schema/v1/compatibility/v2")).await.unwrap(),
        )
        .await;
        assert_eq!(body["is_backwards_compatible"], false);
        assert_eq!(body["removed_services"][0], "user.v1.UserService");
        assert_eq!(body["added_services"][0], "user.v2.UserService");
    }

    #[tokio::test]
    async fn test_dispatch_unknown_cluster_404() {
        let (server, config) = test_server(vec![]).await;
        let app = build_router(server.build_state(), &config);
        let response = app.oneshot(get("/api/ghost/users/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "not_found");
        assert!(body["error"]["request_id"].is_string());
    }

    #[tokio::test]
    async fn test_dispatch_no_instances_503() {
        let (server, config) = test_server(vec![]).await;
        let app = build_router(server.build_state(), &config);
        let response = app
            .oneshot(get("/api/user-service/users/1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "service.unavailable");
    }

    #[tokio::test]
    async fn test_request_id_echoed() {
        let (server, config) = test_server(vec![]).await;
        let app = build_router(server.build_state(), &config);
        let request = Request::builder()
            .method("GET")
            .uri("/api/user-service/users/1")
            .header("x-request-id", "req-custom-7")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get("x-request-id").unwrap(),
            "req-custom-7"
        );
        let body = body_json(response).await;
        assert_eq!(body["error"]["request_id"], "req-custom-7");
    }

    #[tokio::test]
    async fn test_shortcut_route() {
        let (server, config) = test_server(vec![]).await;
        let app = build_router(server.build_state(), &config);
        let response = app.oneshot(get("/user-service/users/1")).await.unwrap();
        // Resolves the cluster (503 no instances), not a router 404.
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_schema_admin_requires_key() {
        let (server, config) = test_server(vec![]).await;
        let server = server.with_admin_api_key(Some("sesame".to_string()));
        let app = build_router(server.build_state(), &config);

        let request = Request::builder()
            .method("PUT")
            .uri("/schema/current/v2")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("PUT")
            .uri("/schema/current/v2")
            .header("x-api-key", "sesame")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_body_limit_413() {
        let (server, mut config) = test_server(vec![]).await;
        config.max_body_bytes = 8;
        let app = build_router(server.build_state(), &config);
        let request = Request::builder()
            .method("POST")
            .uri("/api/user-service/users")
            .header("content-type", "application/json")
            .body(Body::from(vec![b'x'; 64]))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_inflight_shedding_429() {
        let (server, mut config) = test_server(vec![]).await;
        config.max_inflight_requests = 0;
        let mut state = server.build_state();
        state.max_inflight = 0;
        let app = build_router(state, &config);
        let response = app.oneshot(get("/api/user-service/users/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
