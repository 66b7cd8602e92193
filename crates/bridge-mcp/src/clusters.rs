use crate::balancer::LoadBalancer;
use crate::breaker::{BreakerState, CircuitBreaker};
use bridge_core::config::ClusterConfig;
use bridge_registry::RegistryStore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use bridge_schema::RouteTable;

const BREAKERS_PREFIX: &str = "breakers/";

/// Live counterpart of a `ClusterConfig`: the declarative config plus the
/// mutable runtime state (balancer counters, breaker, compiled routes).
pub struct ClusterRuntime {
    config: ClusterConfig,
    routes: RouteTable,
    balancer: LoadBalancer,
    breaker: Arc<CircuitBreaker>,
}

impl ClusterRuntime {
    pub fn new(config: ClusterConfig) -> Self {
        let routes = RouteTable::new(&config.routes);
        let balancer = LoadBalancer::new(config.load_balancing);
        let breaker = Arc::new(CircuitBreaker::new(&config.name, config.circuit_breaker.clone()));
        Self {
            config,
            routes,
            balancer,
            breaker,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

/// Registry of live clusters, keyed by name.
#[derive(Default)]
pub struct ClusterMap {
    clusters: DashMap<String, Arc<ClusterRuntime>>,
}

impl ClusterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClusterRuntime>> {
        self.clusters.get(name).map(|e| e.value().clone())
    }

    /// Insert or replace a cluster. Replacement rebuilds runtime state,
    /// which intentionally resets balancer counters and breaker history.
    pub fn upsert(&self, config: ClusterConfig) {
        let name = config.name.clone();
        info!(cluster = %name, policy = ?config.load_balancing, "cluster configured");
        self.clusters
            .insert(name, Arc::new(ClusterRuntime::new(config)));
    }

    pub fn remove(&self, name: &str) -> bool {
        self.clusters.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn for_each(&self, mut f: impl FnMut(&str, &Arc<ClusterRuntime>)) {
        for entry in self.clusters.iter() {
            f(entry.key(), entry.value());
        }
    }
}

/// Distributed breaker coordination: poll the shared store, adopt remote
/// states that are more restrictive than ours, then publish our own state
/// with a TTL. The reverse direction (remote less restrictive) is never
/// adopted, so a single recovered node cannot re-close everyone's circuit
/// and cause a reopen storm.
pub async fn run_breaker_sync(
    clusters: Arc<ClusterMap>,
    store: Arc<dyn RegistryStore>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(sync_interval(&clusters)));
    info!("distributed breaker sync started");
    loop {
        tokio::select! {
            _ = interval.tick() => sync_once(&clusters, store.as_ref()).await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn sync_interval(clusters: &ClusterMap) -> u64 {
    let mut interval = u64::MAX;
    clusters.for_each(|_, cluster| {
        let config = &cluster.config().circuit_breaker;
        if config.enable_distributed_state {
            interval = interval.min(config.state_sync_interval_secs);
        }
    });
    if interval == u64::MAX {
        5
    } else {
        interval.max(1)
    }
}

async fn sync_once(clusters: &ClusterMap, store: &dyn RegistryStore) {
    let mut work = Vec::new();
    clusters.for_each(|name, cluster| {
        if cluster.config().circuit_breaker.enable_distributed_state {
            work.push((name.to_string(), cluster.clone()));
        }
    });

    for (name, cluster) in work {
        let key = format!("{BREAKERS_PREFIX}{name}");
        let breaker = cluster.breaker();

        match store.get(&key).await {
            Ok(Some(value)) => {
                if let Ok(remote) = value.parse::<BreakerState>() {
                    breaker.adopt_remote(remote);
                } else {
                    warn!(cluster = %name, value, "unparseable distributed breaker state");
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(cluster = %name, "breaker state poll failed: {e}");
                continue;
            }
        }

        let ttl = Duration::from_secs(cluster.config().circuit_breaker.distributed_state_ttl_secs);
        let state = breaker.state().as_str().to_string();
        if let Err(e) = store.put(&key, state, Some(ttl)).await {
            debug!(cluster = %name, "breaker state push failed: {e}");
        }
    }
}
