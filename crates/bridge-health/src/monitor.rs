use crate::probe::run_probe;
use crate::state::HealthTracker;
use bridge_registry::ServiceRegistry;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

/// Active prober. Scans every registered instance on a fixed cadence and
/// publishes status transitions back to the registry, which is the
/// authority other components read from.
pub struct HealthMonitor {
    registry: Arc<ServiceRegistry>,
    tracker: Arc<Mutex<HealthTracker>>,
    probe_interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        probe_interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            tracker: Arc::new(Mutex::new(HealthTracker::new())),
            probe_interval,
            probe_timeout,
        }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            interval = ?self.probe_interval,
            timeout = ?self.probe_timeout,
            "health monitor started"
        );

        let mut shutdown = shutdown;
        let mut interval = tokio::time::interval(self.probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_check_cycle().await {
                        error!("health check cycle error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health monitor shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Probe every instance of every cluster once.
    async fn run_check_cycle(&self) -> anyhow::Result<()> {
        let no_tags = BTreeSet::new();
        let mut live: HashSet<(String, String)> = HashSet::new();

        for cluster in self.registry.cluster_names() {
            let instances = self.registry.discover(&cluster, &no_tags, false);
            for instance in instances {
                live.insert((cluster.clone(), instance.id.clone()));

                let result = run_probe(&instance, self.probe_timeout).await;

                let changed = {
                    let mut tracker = self.tracker.lock().await;
                    tracker.observe(&cluster, &instance.id, instance.status, result.success)
                };

                if let Some(status) = changed {
                    info!(
                        cluster = %cluster,
                        instance = %instance.id,
                        %status,
                        "instance health changed"
                    );
                    if let Err(e) = self
                        .registry
                        .update_status(&cluster, &instance.id, status)
                        .await
                    {
                        error!(
                            cluster = %cluster,
                            instance = %instance.id,
                            "failed to publish status: {e}"
                        );
                    }
                }
            }
        }

        // Forget instances that left the registry.
        self.tracker.lock().await.retain_instances(&live);
        Ok(())
    }

    pub fn tracker(&self) -> &Arc<Mutex<HealthTracker>> {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::types::{InstanceStatus, ProbeKind, ServiceInstance};
    use bridge_registry::{MemoryStore, RegistrySettings, ServiceRegistry};

    async fn registry_with(instance: ServiceInstance) -> Arc<ServiceRegistry> {
        let registry = Arc::new(ServiceRegistry::new(
            Arc::new(MemoryStore::new()),
            RegistrySettings::default(),
        ));
        registry.register(instance).await.unwrap();
        registry
    }

    #[tokio::test]
    async fn test_unreachable_instance_marked_unhealthy_after_two_cycles() {
        let mut instance = ServiceInstance::new("svc", "dead", "127.0.0.1", 19997);
        instance.status = InstanceStatus::Healthy;
        instance.probe = ProbeKind::Tcp;
        let registry = registry_with(instance).await;

        let monitor = HealthMonitor::new(
            registry.clone(),
            Duration::from_secs(10),
            Duration::from_millis(200),
        );

        monitor.run_check_cycle().await.unwrap();
        // One failure: hysteresis holds the healthy status.
        let found = registry.discover("svc", &BTreeSet::new(), false);
        assert_eq!(found[0].status, InstanceStatus::Healthy);

        monitor.run_check_cycle().await.unwrap();
        let found = registry.discover("svc", &BTreeSet::new(), false);
        assert_eq!(found[0].status, InstanceStatus::Unhealthy);
        // And it no longer shows up for routing.
        assert!(registry.discover("svc", &BTreeSet::new(), true).is_empty());
    }

    #[tokio::test]
    async fn test_reachable_instance_recovers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let mut instance = ServiceInstance::new("svc", "live", "127.0.0.1", port);
        instance.status = InstanceStatus::Unhealthy;
        instance.probe = ProbeKind::Tcp;
        let registry = registry_with(instance).await;

        let monitor = HealthMonitor::new(
            registry.clone(),
            Duration::from_secs(10),
            Duration::from_millis(500),
        );

        monitor.run_check_cycle().await.unwrap();
        let found = registry.discover("svc", &BTreeSet::new(), false);
        assert_eq!(found[0].status, InstanceStatus::Degraded);

        monitor.run_check_cycle().await.unwrap();
        let found = registry.discover("svc", &BTreeSet::new(), false);
        assert_eq!(found[0].status, InstanceStatus::Healthy);
    }
}
