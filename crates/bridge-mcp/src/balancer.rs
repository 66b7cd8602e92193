use bridge_core::types::{LoadBalancingPolicy, ServiceInstance};
use dashmap::DashMap;
use rand::Rng;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;

const VIRTUAL_NODES: usize = 160;
const EWMA_ALPHA: f64 = 0.3;

/// Live counters for one instance, updated by `on_start`/`on_end` and read
/// by the connection-aware policies.
#[derive(Debug, Default)]
pub struct InstanceStats {
    in_flight: AtomicU64,
    /// f64 bits; EWMA of call latency in milliseconds.
    ewma_latency_ms: AtomicU64,
}

impl InstanceStats {
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn ewma_latency_ms(&self) -> f64 {
        f64::from_bits(self.ewma_latency_ms.load(Ordering::Acquire))
    }
}

/// Per-cluster instance selection. `pick` is a pure function of the
/// supplied healthy snapshot plus this balancer's counters, so it can
/// never return an instance outside the snapshot.
pub struct LoadBalancer {
    policy: LoadBalancingPolicy,
    rr_counter: AtomicUsize,
    stats: DashMap<String, Arc<InstanceStats>>,
    ring: RwLock<HashRing>,
}

#[derive(Default)]
struct HashRing {
    /// Sorted virtual-node ring: point -> instance id.
    points: BTreeMap<u64, String>,
    /// Membership signature the ring was built from.
    members: Vec<String>,
}

impl LoadBalancer {
    pub fn new(policy: LoadBalancingPolicy) -> Self {
        Self {
            policy,
            rr_counter: AtomicUsize::new(0),
            stats: DashMap::new(),
            ring: RwLock::new(HashRing::default()),
        }
    }

    pub fn policy(&self) -> LoadBalancingPolicy {
        self.policy
    }

    /// Select an instance from a healthy snapshot. `request_key` feeds the
    /// consistent-hash policy; other policies ignore it.
    pub fn pick(
        &self,
        instances: &[ServiceInstance],
        request_key: Option<&str>,
    ) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        if instances.len() == 1 {
            return Some(instances[0].clone());
        }

        let chosen = match self.policy {
            LoadBalancingPolicy::RoundRobin => self.round_robin(instances),
            LoadBalancingPolicy::WeightedRoundRobin => self.weighted_round_robin(instances),
            LoadBalancingPolicy::Random => {
                let idx = rand::rng().random_range(0..instances.len());
                instances[idx].clone()
            }
            LoadBalancingPolicy::LeastConnections => self.least_connections(instances),
            LoadBalancingPolicy::P2cEwma => self.p2c_ewma(instances),
            LoadBalancingPolicy::ConsistentHash => self.consistent_hash(instances, request_key),
        };
        Some(chosen)
    }

    /// A request was routed to this instance.
    pub fn on_start(&self, instance_id: &str) {
        self.stats_for(instance_id)
            .in_flight
            .fetch_add(1, Ordering::AcqRel);
    }

    /// A routed request finished.
    pub fn on_end(&self, instance_id: &str, _ok: bool, duration_ms: u64) {
        let stats = self.stats_for(instance_id);
        // Saturating: a stray on_end must not wrap.
        stats
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)))
            .ok();
        let mut current = stats.ewma_latency_ms.load(Ordering::Acquire);
        loop {
            let prev = f64::from_bits(current);
            let next = if prev == 0.0 {
                duration_ms as f64
            } else {
                prev * (1.0 - EWMA_ALPHA) + duration_ms as f64 * EWMA_ALPHA
            };
            match stats.ewma_latency_ms.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn stats_for(&self, instance_id: &str) -> Arc<InstanceStats> {
        self.stats
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(InstanceStats::default()))
            .clone()
    }

    /// Drop counters for instances that left the cluster.
    pub fn retain_instances(&self, live: &[ServiceInstance]) {
        self.stats
            .retain(|id, _| live.iter().any(|i| &i.id == id));
    }

    fn round_robin(&self, instances: &[ServiceInstance]) -> ServiceInstance {
        let idx = self.rr_counter.fetch_add(1, Ordering::AcqRel) % instances.len();
        instances[idx].clone()
    }

    fn weighted_round_robin(&self, instances: &[ServiceInstance]) -> ServiceInstance {
        let total: u64 = instances.iter().map(|i| i.weight as u64).sum();
        if total == 0 {
            // Every weight is zero; uniform selection keeps traffic moving.
            warn!("all instance weights are zero, falling back to uniform round robin");
            return self.round_robin(instances);
        }
        let mut slot = (self.rr_counter.fetch_add(1, Ordering::AcqRel) as u64) % total;
        for instance in instances {
            let weight = instance.weight as u64;
            if slot < weight {
                return instance.clone();
            }
            slot -= weight;
        }
        // Unreachable with total > 0; the last weighted instance closes the range.
        instances[instances.len() - 1].clone()
    }

    fn least_connections(&self, instances: &[ServiceInstance]) -> ServiceInstance {
        // Instances arrive sorted by id, so the first minimum wins ties.
        instances
            .iter()
            .min_by_key(|i| self.stats_for(&i.id).in_flight())
            .expect("non-empty")
            .clone()
    }

    fn p2c_ewma(&self, instances: &[ServiceInstance]) -> ServiceInstance {
        let mut rng = rand::rng();
        let a = rng.random_range(0..instances.len());
        let mut b = rng.random_range(0..instances.len() - 1);
        if b >= a {
            b += 1;
        }
        let score = |inst: &ServiceInstance| {
            let stats = self.stats_for(&inst.id);
            let latency = stats.ewma_latency_ms().max(f64::EPSILON);
            latency * (1.0 + stats.in_flight() as f64)
        };
        let (sa, sb) = (score(&instances[a]), score(&instances[b]));
        let winner = if sa < sb || (sa == sb && instances[a].id < instances[b].id) {
            a
        } else {
            b
        };
        instances[winner].clone()
    }

    fn consistent_hash(
        &self,
        instances: &[ServiceInstance],
        request_key: Option<&str>,
    ) -> ServiceInstance {
        let Some(key) = request_key else {
            // Keyless requests on a hashing cluster degrade to round robin.
            return self.round_robin(instances);
        };

        self.rebuild_ring_if_needed(instances);
        let ring = self.ring.read().expect("ring lock");
        let point = hash64(key.as_bytes());
        let id = ring
            .points
            .range(point..)
            .next()
            .or_else(|| ring.points.iter().next())
            .map(|(_, id)| id.clone());

        match id.and_then(|id| instances.iter().find(|i| i.id == id)) {
            Some(instance) => instance.clone(),
            // Ring out of sync with the snapshot; fall back rather than miss.
            None => self.round_robin(instances),
        }
    }

    fn rebuild_ring_if_needed(&self, instances: &[ServiceInstance]) {
        let members: Vec<String> = instances.iter().map(|i| i.id.clone()).collect();
        {
            let ring = self.ring.read().expect("ring lock");
            if ring.members == members {
                return;
            }
        }
        let mut points = BTreeMap::new();
        for instance in instances {
            for vnode in 0..VIRTUAL_NODES {
                let point = hash64(format!("{}#{vnode}", instance.id).as_bytes());
                // Colliding points resolve to the smaller id.
                points
                    .entry(point)
                    .and_modify(|existing: &mut String| {
                        if instance.id < *existing {
                            *existing = instance.id.clone();
                        }
                    })
                    .or_insert_with(|| instance.id.clone());
            }
        }
        let mut ring = self.ring.write().expect("ring lock");
        ring.points = points;
        ring.members = members;
    }
}

/// SHA-1 truncated to its first 8 bytes, big-endian.
fn hash64(data: &[u8]) -> u64 {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("sha1 is 20 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::types::InstanceStatus;
    use std::collections::HashMap;

    fn instances(n: usize) -> Vec<ServiceInstance> {
        (0..n)
            .map(|i| {
                let mut inst =
                    ServiceInstance::new("svc", &format!("i{i}"), "10.0.0.1", 50051 + i as u16);
                inst.status = InstanceStatus::Healthy;
                inst
            })
            .collect()
    }

    #[test]
    fn test_round_robin_fairness() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::RoundRobin);
        let pool = instances(3);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..300 {
            let picked = lb.pick(&pool, None).unwrap();
            *counts.entry(picked.id).or_default() += 1;
        }
        for count in counts.values() {
            assert_eq!(*count, 100);
        }
    }

    #[test]
    fn test_pick_only_from_supplied_set() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::Random);
        let pool = instances(4);
        for _ in 0..200 {
            let picked = lb.pick(&pool, None).unwrap();
            assert!(pool.iter().any(|i| i.id == picked.id));
        }
        assert!(lb.pick(&[], None).is_none());
    }

    #[test]
    fn test_single_instance_shortcut() {
        for policy in [
            LoadBalancingPolicy::RoundRobin,
            LoadBalancingPolicy::P2cEwma,
            LoadBalancingPolicy::ConsistentHash,
        ] {
            let lb = LoadBalancer::new(policy);
            let pool = instances(1);
            assert_eq!(lb.pick(&pool, Some("key")).unwrap().id, "i0");
        }
    }

    #[test]
    fn test_weighted_round_robin_respects_weights() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::WeightedRoundRobin);
        let mut pool = instances(2);
        pool[0].weight = 3;
        pool[1].weight = 1;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..400 {
            *counts.entry(lb.pick(&pool, None).unwrap().id).or_default() += 1;
        }
        assert_eq!(counts["i0"], 300);
        assert_eq!(counts["i1"], 100);
    }

    #[test]
    fn test_weighted_round_robin_skips_zero_weight() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::WeightedRoundRobin);
        let mut pool = instances(2);
        pool[0].weight = 0;
        pool[1].weight = 2;
        for _ in 0..50 {
            assert_eq!(lb.pick(&pool, None).unwrap().id, "i1");
        }
    }

    #[test]
    fn test_weighted_round_robin_all_zero_falls_back_uniform() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::WeightedRoundRobin);
        let mut pool = instances(2);
        pool[0].weight = 0;
        pool[1].weight = 0;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..100 {
            *counts.entry(lb.pick(&pool, None).unwrap().id).or_default() += 1;
        }
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn test_least_connections_prefers_idle() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::LeastConnections);
        let pool = instances(3);
        lb.on_start("i0");
        lb.on_start("i0");
        lb.on_start("i1");
        assert_eq!(lb.pick(&pool, None).unwrap().id, "i2");
        lb.on_end("i0", true, 10);
        lb.on_end("i0", true, 10);
        // i0 and i2 now tie at zero; the smaller id wins.
        lb.on_start("i2");
        assert_eq!(lb.pick(&pool, None).unwrap().id, "i0");
    }

    #[test]
    fn test_p2c_avoids_loaded_instance() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::P2cEwma);
        let pool = instances(2);
        // i0 is slow and busy; i1 is idle and fast.
        lb.on_end("i0", true, 500);
        lb.on_start("i0");
        lb.on_start("i0");
        lb.on_end("i1", true, 5);
        for _ in 0..20 {
            assert_eq!(lb.pick(&pool, None).unwrap().id, "i1");
        }
    }

    #[test]
    fn test_consistent_hash_is_sticky() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::ConsistentHash);
        let pool = instances(5);
        let first = lb.pick(&pool, Some("tenant-42")).unwrap();
        for _ in 0..50 {
            assert_eq!(lb.pick(&pool, Some("tenant-42")).unwrap().id, first.id);
        }
    }

    #[test]
    fn test_consistent_hash_minimal_disruption_on_member_loss() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::ConsistentHash);
        let pool = instances(5);
        let keys: Vec<String> = (0..200).map(|i| format!("key-{i}")).collect();
        let before: HashMap<&String, String> = keys
            .iter()
            .map(|k| (k, lb.pick(&pool, Some(k)).unwrap().id))
            .collect();

        // Remove one instance; keys not owned by it must keep their home.
        let survivor_pool: Vec<ServiceInstance> =
            pool.iter().filter(|i| i.id != "i2").cloned().collect();
        let mut moved = 0;
        for key in &keys {
            let after = lb.pick(&survivor_pool, Some(key)).unwrap().id;
            if before[key] != "i2" {
                assert_eq!(after, before[key], "stable key {key} moved");
            } else {
                moved += 1;
            }
        }
        // The departed instance owned roughly a fifth of the keyspace.
        assert!(moved > 0);
    }

    #[test]
    fn test_ewma_updates() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::P2cEwma);
        lb.on_end("i0", true, 100);
        let first = lb.stats_for("i0").ewma_latency_ms();
        assert!((first - 100.0).abs() < 1e-9);
        lb.on_end("i0", true, 200);
        let second = lb.stats_for("i0").ewma_latency_ms();
        assert!((second - 130.0).abs() < 1e-9);
    }

    #[test]
    fn test_retain_instances() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::LeastConnections);
        lb.on_start("gone");
        lb.on_start("kept");
        let mut keep = instances(1);
        keep[0].id = "kept".to_string();
        lb.retain_instances(&keep);
        assert_eq!(lb.stats_for("gone").in_flight(), 0);
        assert_eq!(lb.stats_for("kept").in_flight(), 1);
    }
}
