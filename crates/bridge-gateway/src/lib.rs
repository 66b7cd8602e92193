pub mod handlers;
pub mod obs;

use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get, put};
use axum::Router;
use bridge_core::config::FrontendConfig;
use bridge_mcp::Dispatcher;
use bridge_registry::ServiceRegistry;
use bridge_schema::SchemaCatalog;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::info;

/// REST front door: the universal dispatch route plus the fixed health,
/// metrics, services, and schema endpoints.
pub struct GatewayServer {
    config: FrontendConfig,
    dispatcher: Arc<Dispatcher>,
    prometheus: Option<PrometheusHandle>,
    admin_api_key: Option<String>,
    ready: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<ServiceRegistry>,
    pub catalog: Arc<SchemaCatalog>,
    pub prometheus: Option<PrometheusHandle>,
    pub admin_api_key: Option<Arc<String>>,
    pub ready: Arc<AtomicBool>,
    pub started_at: Instant,
    pub inflight: Arc<AtomicUsize>,
    pub max_inflight: usize,
}

impl GatewayServer {
    pub fn new(config: FrontendConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            prometheus: None,
            admin_api_key: None,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub fn with_admin_api_key(mut self, key: Option<String>) -> Self {
        self.admin_api_key = key;
        self
    }

    /// Readiness flag flipped by the startup pipeline once every component
    /// is up.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    pub fn build_state(&self) -> AppState {
        AppState {
            registry: self.dispatcher.registry().clone(),
            catalog: self.dispatcher.catalog().clone(),
            dispatcher: self.dispatcher.clone(),
            prometheus: self.prometheus.clone(),
            admin_api_key: self.admin_api_key.clone().map(Arc::new),
            ready: self.ready.clone(),
            started_at: Instant::now(),
            inflight: Arc::new(AtomicUsize::new(0)),
            max_inflight: self.config.max_inflight_requests,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.build_state(), &self.config)
    }

    /// Serve until the shutdown signal flips, then drain. The caller bounds
    /// the drain with its grace period.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port).parse()?;
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("gateway listening on {addr}");

        let mut shutdown = shutdown;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
                info!("gateway draining in-flight requests");
            })
            .await?;

        info!("gateway stopped");
        Ok(())
    }
}

pub fn build_router(state: AppState, config: &FrontendConfig) -> Router {
    let mut app = Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics_text))
        .route("/api/services", get(handlers::list_services))
        .route("/schema/list", get(handlers::list_schemas))
        .route(
            "/schema/{v}",
            get(handlers::get_schema).post(handlers::register_schema),
        )
        .route("/schema/current/{v}", put(handlers::set_current_schema))
        .route(
            "/schema/{old}/compatibility/{new}",
            get(handlers::schema_compatibility),
        )
        .route("/api/{cluster}", any(handlers::dispatch_root))
        .route("/api/{cluster}/{*path}", any(handlers::dispatch));

    if config.shortcut_routes {
        app = app.route("/{cluster}/{*path}", any(handlers::dispatch));
    }

    let mut app = app
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(tower_http::cors::CorsLayer::permissive());
    if config.enable_gzip {
        app = app.layer(tower_http::compression::CompressionLayer::new());
    }
    app.layer(axum::middleware::from_fn(handlers::log_requests))
        .with_state(state)
}
