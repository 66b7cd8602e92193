use bridge_core::config::{Config, RegistryBackendKind};
use bridge_core::types::ServiceInstance;
use bridge_core::Error;
use bridge_gateway::{obs, GatewayServer};
use bridge_health::HealthMonitor;
use bridge_mcp::{clusters, ChannelPool, ClusterMap, Dispatcher};
use bridge_registry::{etcd::EtcdStore, MemoryStore, RegistrySettings, RegistryStore, ServiceRegistry};
use bridge_schema::{SchemaCatalog, TranslateOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// One process-wide owner of every component. Startup is a six-step
/// deterministic pipeline with per-step timing; a failure at any step
/// tears the completed steps down in reverse order.
pub struct Bridge {
    config: Config,
}

pub struct RunningBridge {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    pool: Arc<ChannelPool>,
    ready: Arc<AtomicBool>,
    grace: Duration,
}

impl Bridge {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Programmatic cluster registration before `start`.
    pub fn add_cluster(&mut self, cluster: bridge_core::config::ClusterConfig) {
        self.config.clusters.push(cluster);
    }

    pub fn set_policy(
        &mut self,
        cluster: &str,
        policy: bridge_core::types::LoadBalancingPolicy,
    ) -> bool {
        for c in &mut self.config.clusters {
            if c.name == cluster {
                c.load_balancing = policy;
                return true;
            }
        }
        false
    }

    pub async fn start(self) -> anyhow::Result<RunningBridge> {
        let started = Instant::now();
        let config = self.config;

        // Step 1: validate.
        let step = Instant::now();
        config
            .validate()
            .map_err(|e| startup_error("validate", e))?;
        info!(step = "validate", elapsed_ms = step.elapsed().as_millis() as u64, "startup step done");

        // Step 2: init components.
        let step = Instant::now();
        let store = build_store(&config).await?;
        let registry = Arc::new(ServiceRegistry::new(
            store.clone(),
            RegistrySettings {
                max_services: config.mcp.max_services,
                ttl: Duration::from_secs(config.mcp.registry_ttl_secs),
                node_id: uuid::Uuid::new_v4().to_string(),
            },
        ));
        let cluster_map = Arc::new(ClusterMap::new());
        let pool = Arc::new(ChannelPool::new(Duration::from_millis(
            config.mcp.connection_timeout_ms,
        )));
        let catalog = Arc::new(SchemaCatalog::new());
        load_descriptors(&config, &catalog).map_err(|e| startup_error("init", e))?;
        let translate = TranslateOptions {
            validate_schemas: config.schemas.validate_schemas,
            emit_default_fields: config.schemas.emit_default_fields,
        };
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            cluster_map.clone(),
            pool.clone(),
            catalog.clone(),
            config.mcp.clone(),
            translate,
        ));
        let prometheus = config
            .observability
            .metrics_enabled
            .then(obs::install_metrics)
            .flatten();
        let mut gateway = GatewayServer::new(config.frontend.clone(), dispatcher.clone())
            .with_admin_api_key(config.security.admin_api_key.clone());
        if let Some(handle) = prometheus {
            gateway = gateway.with_prometheus(handle);
        }
        let ready = gateway.ready_flag();
        info!(step = "init", elapsed_ms = step.elapsed().as_millis() as u64, "startup step done");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        // Step 3: start the registry plane.
        let step = Instant::now();
        {
            let registry = registry.clone();
            let monitor_registry = registry.clone();
            let rx = shutdown_rx.clone();
            tasks.push((
                "registry",
                tokio::spawn(async move {
                    if let Err(e) = registry.run(rx).await {
                        error!("registry task error: {e}");
                    }
                }),
            ));

            let monitor = HealthMonitor::new(
                monitor_registry,
                Duration::from_secs(config.mcp.heartbeat_interval_secs),
                Duration::from_secs(config.mcp.probe_timeout_secs),
            );
            let rx = shutdown_rx.clone();
            tasks.push((
                "health-monitor",
                tokio::spawn(async move {
                    if let Err(e) = monitor.run(rx).await {
                        error!("health monitor error: {e}");
                    }
                }),
            ));

            let pool_task = pool.clone();
            let rx = shutdown_rx.clone();
            tasks.push((
                "pool-reaper",
                tokio::spawn(async move {
                    if let Err(e) = pool_task.run(rx).await {
                        error!("channel pool reaper error: {e}");
                    }
                }),
            ));

            let sync_clusters = cluster_map.clone();
            let sync_store = store.clone();
            let rx = shutdown_rx.clone();
            tasks.push((
                "breaker-sync",
                tokio::spawn(async move {
                    if let Err(e) = clusters::run_breaker_sync(sync_clusters, sync_store, rx).await
                    {
                        error!("breaker sync error: {e}");
                    }
                }),
            ));
        }
        info!(step = "registry", elapsed_ms = step.elapsed().as_millis() as u64, "startup step done");

        // Step 4: register configured clusters and static instances.
        let step = Instant::now();
        for cluster in &config.clusters {
            cluster_map.upsert(cluster.clone());
            for (i, endpoint) in cluster.instances.iter().enumerate() {
                let id = endpoint
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("{}-{i}", cluster.name));
                let mut instance = ServiceInstance::new(&cluster.name, &id, &endpoint.host, endpoint.port);
                instance.protocol = endpoint.protocol;
                instance.weight = endpoint.weight;
                instance.tags = endpoint.tags.clone();
                if let Err(e) = registry.register(instance).await {
                    let e = startup_error("register-clusters", e);
                    teardown(&shutdown_tx, tasks, &pool, Duration::from_secs(1)).await;
                    return Err(e);
                }
            }
        }
        info!(
            step = "register-clusters",
            clusters = config.clusters.len(),
            elapsed_ms = step.elapsed().as_millis() as u64,
            "startup step done"
        );

        // Step 5: start the gateway.
        let step = Instant::now();
        {
            let rx = shutdown_rx.clone();
            tasks.push((
                "gateway",
                tokio::spawn(async move {
                    if let Err(e) = gateway.run(rx).await {
                        error!("gateway error: {e}");
                    }
                }),
            ));
        }
        info!(step = "gateway", elapsed_ms = step.elapsed().as_millis() as u64, "startup step done");

        // Step 6: mark ready.
        ready.store(true, Ordering::Release);
        info!(
            step = "ready",
            total_ms = started.elapsed().as_millis() as u64,
            "bridge started"
        );

        Ok(RunningBridge {
            shutdown_tx,
            tasks,
            pool,
            ready,
            grace: Duration::from_secs(config.frontend.grace_period_secs),
        })
    }
}

impl RunningBridge {
    /// Graceful, idempotent shutdown: stop accepting, drain in-flight work
    /// within the grace period, close channels, stop the registry.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.ready.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        for (name, task) in self.tasks {
            if tokio::time::timeout(self.grace, task).await.is_err() {
                warn!(task = name, "task did not stop within the grace period");
            }
        }
        self.pool.close(self.grace).await;
        info!("bridge stopped");
    }
}

async fn teardown(
    shutdown_tx: &watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    pool: &ChannelPool,
    grace: Duration,
) {
    let _ = shutdown_tx.send(true);
    // Reverse of startup order.
    for (name, task) in tasks.into_iter().rev() {
        if tokio::time::timeout(grace, task).await.is_err() {
            warn!(task = name, "task did not stop during teardown");
        }
    }
    pool.close(grace).await;
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn RegistryStore>> {
    match config.mcp.registry_backend {
        RegistryBackendKind::Memory => Ok(Arc::new(MemoryStore::new())),
        RegistryBackendKind::Etcd => {
            match EtcdStore::connect(
                &config.mcp.registry_endpoints,
                config.mcp.registry_username.as_deref(),
                config.mcp.registry_password.as_deref(),
            )
            .await
            {
                Ok(store) => Ok(Arc::new(store)),
                Err(e) if config.mcp.allow_memory_fallback => {
                    warn!("registry backend unreachable, falling back to memory: {e}");
                    Ok(Arc::new(MemoryStore::new()))
                }
                Err(e) => Err(startup_error(
                    "init",
                    Error::ConfigInvalid(format!(
                        "registry backend unreachable and memory fallback disabled: {e}"
                    )),
                )),
            }
        }
    }
}

fn load_descriptors(config: &Config, catalog: &SchemaCatalog) -> bridge_core::Result<()> {
    for path in &config.schemas.descriptor_files {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::ConfigInvalid(format!("read descriptor file {}: {e}", path.display()))
        })?;
        let version_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("default")
            .to_string();
        catalog.register_schema(&version_id, &bytes)?;
        info!(version = version_id, file = %path.display(), "descriptor catalog loaded");
    }
    if let Some(current) = &config.schemas.current_version {
        catalog.set_current(current)?;
    }
    Ok(())
}

fn startup_error(step: &str, e: Error) -> anyhow::Error {
    error!(step, "startup failed: {e}");
    anyhow::Error::new(e).context(format!("startup step '{step}' failed"))
}

/// Whether a startup failure should exit with the config-invalid code.
pub fn is_config_error(e: &anyhow::Error) -> bool {
    e.downcast_ref::<Error>()
        .map(|e| matches!(e, Error::ConfigInvalid(_)))
        .unwrap_or(false)
}
