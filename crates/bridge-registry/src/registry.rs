use crate::store::{RegistryStore, StoreEvent};
use bridge_core::types::{InstanceMetrics, InstanceStatus, RegistryEvent, ServiceInstance};
use bridge_core::types::validate_cluster_name;
use bridge_core::{Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const SERVICES_PREFIX: &str = "services/";
const LEADER_KEY: &str = "bridge/leader";

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Hard cap on registered instances across all clusters.
    pub max_services: usize,
    /// Lease TTL; an instance that stops heartbeating is gone within
    /// `2 x ttl`.
    pub ttl: Duration,
    /// This process's identity in leader election.
    pub node_id: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_services: 100_000,
            ttl: Duration::from_secs(30),
            node_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Per-cluster summary for the services listing and health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClusterStats {
    pub name: String,
    pub instance_count: usize,
    pub healthy_count: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    pub backend: &'static str,
    pub degraded: bool,
    pub total_instances: usize,
    pub clusters: Vec<ClusterStats>,
}

/// Distributed directory of backend instances.
///
/// The store is the source of truth; this struct keeps a copy-on-write
/// per-cluster snapshot that readers hit without blocking writers. Watch
/// events are fanned out to per-cluster subscribers in store revision
/// order. When the store becomes unreachable the registry keeps serving
/// the last snapshot and reports itself degraded; on reconnect the
/// snapshot is rebuilt from the store (backend wins).
pub struct ServiceRegistry {
    store: Arc<dyn RegistryStore>,
    settings: RegistrySettings,
    snapshot: DashMap<String, Arc<Vec<ServiceInstance>>>,
    watchers: DashMap<String, broadcast::Sender<RegistryEvent>>,
    degraded: AtomicBool,
    leader: AtomicBool,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn RegistryStore>, settings: RegistrySettings) -> Self {
        Self {
            store,
            settings,
            snapshot: DashMap::new(),
            watchers: DashMap::new(),
            degraded: AtomicBool::new(false),
            leader: AtomicBool::new(false),
        }
    }

    fn key(cluster: &str, id: &str) -> String {
        format!("{SERVICES_PREFIX}{cluster}/{id}")
    }

    fn parse_key(key: &str) -> Option<(&str, &str)> {
        let rest = key.strip_prefix(SERVICES_PREFIX)?;
        rest.split_once('/')
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// Register an instance. Re-registering an identical payload is
    /// idempotent; a conflicting payload for the same `(cluster, id)` is a
    /// duplicate.
    pub async fn register(&self, mut instance: ServiceInstance) -> Result<()> {
        if !validate_cluster_name(&instance.cluster_name) {
            return Err(Error::RegistryInvalid(format!(
                "invalid cluster name '{}'",
                instance.cluster_name
            )));
        }
        if instance.id.is_empty() || instance.host.is_empty() || instance.port == 0 {
            return Err(Error::RegistryInvalid(
                "instance requires id and host:port".into(),
            ));
        }

        if let Some(existing) = self.lookup(&instance.cluster_name, &instance.id) {
            if !same_registration(&existing, &instance) {
                return Err(Error::RegistryDuplicate {
                    cluster: instance.cluster_name,
                    id: instance.id,
                });
            }
            // Identical payload: refresh the lease, keep one record.
        } else if self.total_instances() >= self.settings.max_services {
            return Err(Error::RegistryCapacity {
                limit: self.settings.max_services,
            });
        }

        instance.last_heartbeat = Utc::now();
        let added = self.write_record(&instance).await;
        if added {
            let cluster_name = instance.cluster_name.clone();
            self.fan_out(
                &cluster_name,
                RegistryEvent::Added {
                    instance: Box::new(instance),
                },
            );
        }
        Ok(())
    }

    pub async fn unregister(&self, cluster: &str, id: &str) -> Result<()> {
        let key = Self::key(cluster, id);
        let in_snapshot = self.lookup(cluster, id).is_some();
        let deleted = match self.store.delete(&key).await {
            Ok(deleted) => deleted,
            Err(e) => {
                self.enter_degraded(&e);
                false
            }
        };
        if !deleted && !in_snapshot {
            return Err(Error::NotFound(format!("{cluster}/{id}")));
        }
        if self.remove_from_snapshot(cluster, id) {
            self.fan_out(
                cluster,
                RegistryEvent::Removed {
                    cluster: cluster.to_string(),
                    id: id.to_string(),
                },
            );
        }
        Ok(())
    }

    /// Instances of a cluster, ordered by id so downstream selection is
    /// reproducible for the same inputs.
    pub fn discover(
        &self,
        cluster: &str,
        tags: &BTreeSet<String>,
        healthy_only: bool,
    ) -> Vec<ServiceInstance> {
        let Some(list) = self.snapshot.get(cluster) else {
            return Vec::new();
        };
        list.iter()
            .filter(|i| !healthy_only || i.status.routable())
            .filter(|i| tags.is_empty() || i.has_tags(tags))
            .cloned()
            .collect()
    }

    /// Refresh an instance's lease and merge its rolling counters.
    pub async fn heartbeat(
        &self,
        cluster: &str,
        id: &str,
        metrics: InstanceMetrics,
    ) -> Result<()> {
        let mut instance = self
            .lookup(cluster, id)
            .ok_or_else(|| Error::NotFound(format!("{cluster}/{id}")))?;
        instance.last_heartbeat = Utc::now();
        instance.metrics = metrics;
        if instance.status == InstanceStatus::Unknown || instance.status == InstanceStatus::Starting
        {
            instance.status = InstanceStatus::Healthy;
        }
        self.write_record(&instance).await;
        Ok(())
    }

    /// Authoritative status update from the health monitor.
    pub async fn update_status(&self, cluster: &str, id: &str, status: InstanceStatus) -> Result<()> {
        let mut instance = self
            .lookup(cluster, id)
            .ok_or_else(|| Error::NotFound(format!("{cluster}/{id}")))?;
        if instance.status == status {
            return Ok(());
        }
        instance.status = status;
        self.write_record(&instance).await;
        self.fan_out(
            cluster,
            RegistryEvent::StatusChanged {
                cluster: cluster.to_string(),
                id: id.to_string(),
                status,
            },
        );
        Ok(())
    }

    /// Fold one dispatch outcome into an instance's rolling counters.
    /// Snapshot-only: called per request, so it never touches the store;
    /// the counters reach the backend with the next heartbeat write.
    pub fn record_call(&self, cluster: &str, id: &str, ok: bool, duration_ms: u64) {
        let Some(mut instance) = self.lookup(cluster, id) else {
            return;
        };
        instance.metrics.req_total += 1;
        if !ok {
            instance.metrics.err_total += 1;
        }
        let alpha = 0.3;
        let ewma = instance.metrics.ewma_latency_ms;
        instance.metrics.ewma_latency_ms = if instance.metrics.req_total <= 1 {
            duration_ms as f64
        } else {
            ewma * (1.0 - alpha) + duration_ms as f64 * alpha
        };
        self.insert_into_snapshot(instance);
    }

    /// Subscribe to a cluster's registry events.
    pub fn watch(&self, cluster: &str) -> broadcast::Receiver<RegistryEvent> {
        self.watchers
            .entry(cluster.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut clusters: Vec<ClusterStats> = self
            .snapshot
            .iter()
            .map(|entry| ClusterStats {
                name: entry.key().clone(),
                instance_count: entry.value().len(),
                healthy_count: entry.value().iter().filter(|i| i.status.routable()).count(),
            })
            .collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        RegistryStats {
            backend: self.store.backend_name(),
            degraded: self.is_degraded(),
            total_instances: clusters.iter().map(|c| c.instance_count).sum(),
            clusters,
        }
    }

    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Background loop: consumes the store watch, runs leader-gated expiry
    /// sweeps, and reconciles the snapshot after a backend outage.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut cleanup = tokio::time::interval(self.settings.ttl.max(Duration::from_secs(3)) / 3);
        let mut events = self.store.watch_prefix(SERVICES_PREFIX).await.ok();
        if events.is_none() {
            self.degraded.store(true, Ordering::Release);
            warn!("registry store watch unavailable at start, running degraded");
        }
        info!(backend = self.store.backend_name(), "service registry started");

        loop {
            tokio::select! {
                event = recv_or_pending(&mut events) => {
                    match event {
                        Some(event) => self.apply_store_event(event),
                        None => {
                            // Watch channel closed: backend trouble.
                            self.degraded.store(true, Ordering::Release);
                            events = None;
                            warn!("registry store watch lost, serving last snapshot");
                        }
                    }
                }
                _ = cleanup.tick() => {
                    self.cleanup_cycle(&mut events).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("service registry shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn cleanup_cycle(&self, events: &mut Option<tokio::sync::mpsc::Receiver<StoreEvent>>) {
        // Re-establish the watch and reconcile after an outage.
        if events.is_none() && self.store.healthy().await {
            match self.store.watch_prefix(SERVICES_PREFIX).await {
                Ok(rx) => {
                    *events = Some(rx);
                    self.reconcile().await;
                    self.degraded.store(false, Ordering::Release);
                    info!("registry store reconnected, snapshot reconciled");
                }
                Err(e) => debug!("registry store still unreachable: {e}"),
            }
        } else if !self.store.healthy().await {
            self.degraded.store(true, Ordering::Release);
        }

        let leading = self
            .store
            .try_lock(LEADER_KEY, &self.settings.node_id, self.settings.ttl)
            .await
            .unwrap_or(false);
        self.leader.store(leading, Ordering::Release);
        if leading {
            if let Err(e) = self.store.sweep().await {
                warn!("registry sweep failed: {e}");
            }
        }

        // Local expiry guard for records the store never deletes (degraded
        // mode, or backends without server-side leases).
        self.expire_stale().await;
    }

    /// Rebuild the snapshot from the store, emitting the diff. Backend
    /// state wins over anything recorded locally during an outage.
    async fn reconcile(&self) {
        let entries = match self.store.get_prefix(SERVICES_PREFIX).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("registry reconcile failed: {e}");
                return;
            }
        };
        let mut fresh: DashMap<String, Vec<ServiceInstance>> = DashMap::new();
        for (key, value) in entries {
            let Some((cluster, _)) = Self::parse_key(&key) else { continue };
            match serde_json::from_str::<ServiceInstance>(&value) {
                Ok(instance) => fresh.entry(cluster.to_string()).or_default().push(instance),
                Err(e) => warn!(key, "skipping unparseable registry record: {e}"),
            }
        }

        // Emit removals for anything the backend no longer has.
        for entry in self.snapshot.iter() {
            let cluster = entry.key();
            for old in entry.value().iter() {
                let still_there = fresh
                    .get(cluster)
                    .map(|v| v.iter().any(|i| i.id == old.id))
                    .unwrap_or(false);
                if !still_there {
                    self.fan_out(
                        cluster,
                        RegistryEvent::Removed {
                            cluster: cluster.clone(),
                            id: old.id.clone(),
                        },
                    );
                }
            }
        }

        // Emit additions and status changes relative to the old snapshot.
        for entry in fresh.iter() {
            let cluster = entry.key();
            for instance in entry.value().iter() {
                match self.lookup(cluster, &instance.id) {
                    None => self.fan_out(
                        cluster,
                        RegistryEvent::Added {
                            instance: Box::new(instance.clone()),
                        },
                    ),
                    Some(prev) if prev.status != instance.status => self.fan_out(
                        cluster,
                        RegistryEvent::StatusChanged {
                            cluster: cluster.clone(),
                            id: instance.id.clone(),
                            status: instance.status,
                        },
                    ),
                    Some(_) => {}
                }
            }
        }

        self.snapshot.clear();
        for (cluster, mut list) in fresh.into_iter() {
            list.sort_by(|a, b| a.id.cmp(&b.id));
            self.snapshot.insert(cluster, Arc::new(list));
        }
    }

    fn apply_store_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::Put { key, value } => {
                let Some((cluster, id)) = Self::parse_key(&key) else { return };
                let instance: ServiceInstance = match serde_json::from_str(&value) {
                    Ok(i) => i,
                    Err(e) => {
                        warn!(key, "ignoring unparseable registry record: {e}");
                        return;
                    }
                };
                let previous = self.lookup(cluster, id);
                if let Some(prev) = &previous {
                    // Echo of an older local write; the snapshot is ahead.
                    if instance.revision <= prev.revision {
                        return;
                    }
                }
                self.insert_into_snapshot(instance.clone());
                match previous {
                    None => self.fan_out(
                        cluster,
                        RegistryEvent::Added {
                            instance: Box::new(instance),
                        },
                    ),
                    Some(prev) if prev.status != instance.status => self.fan_out(
                        cluster,
                        RegistryEvent::StatusChanged {
                            cluster: cluster.to_string(),
                            id: id.to_string(),
                            status: instance.status,
                        },
                    ),
                    Some(_) => {} // heartbeat refresh, no event
                }
            }
            StoreEvent::Delete { key } => {
                let Some((cluster, id)) = Self::parse_key(&key) else { return };
                if self.remove_from_snapshot(cluster, id) {
                    self.fan_out(
                        cluster,
                        RegistryEvent::Removed {
                            cluster: cluster.to_string(),
                            id: id.to_string(),
                        },
                    );
                }
            }
        }
    }

    async fn expire_stale(&self) {
        let deadline = Utc::now()
            - chrono::Duration::from_std(self.settings.ttl * 2).unwrap_or(chrono::Duration::seconds(60));
        let mut stale: Vec<(String, String)> = Vec::new();
        for entry in self.snapshot.iter() {
            for instance in entry.value().iter() {
                if instance.last_heartbeat < deadline {
                    stale.push((entry.key().clone(), instance.id.clone()));
                }
            }
        }
        for (cluster, id) in stale {
            warn!(cluster, id, "expiring instance with stale heartbeat");
            let _ = self.store.delete(&Self::key(&cluster, &id)).await;
            if self.remove_from_snapshot(&cluster, &id) {
                self.fan_out(
                    &cluster,
                    RegistryEvent::Removed { cluster: cluster.clone(), id },
                );
            }
        }
    }

    /// Apply a record to the snapshot and push it to the store. Returns
    /// whether this created a new record. A store failure flips degraded
    /// mode but the local write still holds.
    async fn write_record(&self, instance: &ServiceInstance) -> bool {
        let previous = self.lookup(&instance.cluster_name, &instance.id);
        let was_present = previous.is_some();
        let mut record = instance.clone();
        record.revision = previous.map(|p| p.revision + 1).unwrap_or(1);
        self.insert_into_snapshot(record.clone());
        let key = Self::key(&record.cluster_name, &record.id);
        match serde_json::to_string(&record) {
            Ok(value) => {
                if let Err(e) = self.store.put(&key, value, Some(self.settings.ttl)).await {
                    self.enter_degraded(&e);
                }
            }
            Err(e) => warn!("failed to serialize instance record: {e}"),
        }
        !was_present
    }

    fn enter_degraded(&self, e: &Error) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!("registry store unavailable, entering degraded mode: {e}");
        }
    }

    fn lookup(&self, cluster: &str, id: &str) -> Option<ServiceInstance> {
        self.snapshot
            .get(cluster)?
            .iter()
            .find(|i| i.id == id)
            .cloned()
    }

    fn insert_into_snapshot(&self, instance: ServiceInstance) {
        let mut entry = self
            .snapshot
            .entry(instance.cluster_name.clone())
            .or_insert_with(|| Arc::new(Vec::new()));
        let mut list: Vec<ServiceInstance> = entry.value().as_ref().clone();
        match list.binary_search_by(|i| i.id.cmp(&instance.id)) {
            Ok(pos) => list[pos] = instance,
            Err(pos) => list.insert(pos, instance),
        }
        *entry.value_mut() = Arc::new(list);
    }

    fn remove_from_snapshot(&self, cluster: &str, id: &str) -> bool {
        let Some(mut entry) = self.snapshot.get_mut(cluster) else {
            return false;
        };
        let mut list: Vec<ServiceInstance> = entry.value().as_ref().clone();
        let before = list.len();
        list.retain(|i| i.id != id);
        let removed = list.len() != before;
        *entry.value_mut() = Arc::new(list);
        removed
    }

    fn fan_out(&self, cluster: &str, event: RegistryEvent) {
        if let Some(sender) = self.watchers.get(cluster) {
            let _ = sender.send(event);
        }
    }

    fn total_instances(&self) -> usize {
        self.snapshot.iter().map(|e| e.value().len()).sum()
    }
}

/// Two registrations are the same record when everything an operator
/// declares matches; dynamic fields (status, heartbeat, metrics) are not
/// identity.
fn same_registration(a: &ServiceInstance, b: &ServiceInstance) -> bool {
    a.id == b.id
        && a.cluster_name == b.cluster_name
        && a.host == b.host
        && a.port == b.port
        && a.protocol == b.protocol
        && a.version == b.version
        && a.tags == b.tags
        && a.region == b.region
        && a.zone == b.zone
        && a.datacenter == b.datacenter
        && a.weight == b.weight
}

async fn recv_or_pending(
    events: &mut Option<tokio::sync::mpsc::Receiver<StoreEvent>>,
) -> Option<StoreEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
