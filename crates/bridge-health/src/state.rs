use bridge_core::types::InstanceStatus;
use std::collections::HashMap;

/// Consecutive-probe hysteresis for one instance. Two failures mark it
/// unhealthy; a first success out of unhealthy only reaches degraded, and a
/// second consecutive success restores healthy. This keeps a flapping
/// backend from oscillating in and out of rotation every probe.
#[derive(Debug, Clone)]
pub struct InstanceHealth {
    pub status: InstanceStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

const UNHEALTHY_AFTER: u32 = 2;
const HEALTHY_AFTER: u32 = 2;

impl InstanceHealth {
    pub fn new(initial: InstanceStatus) -> Self {
        Self {
            status: initial,
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }

    /// Record a probe result. Returns the new status when it changed.
    pub fn observe(&mut self, success: bool) -> Option<InstanceStatus> {
        if success {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
        }

        let next = if self.consecutive_failures >= UNHEALTHY_AFTER {
            InstanceStatus::Unhealthy
        } else if self.consecutive_successes >= HEALTHY_AFTER {
            InstanceStatus::Healthy
        } else if success && !self.status.routable() {
            InstanceStatus::Degraded
        } else {
            self.status
        };

        if next != self.status {
            self.status = next;
            Some(next)
        } else {
            None
        }
    }
}

/// Health bookkeeping for every probed instance, keyed by `(cluster, id)`.
#[derive(Debug, Default)]
pub struct HealthTracker {
    instances: HashMap<(String, String), InstanceHealth>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(
        &mut self,
        cluster: &str,
        id: &str,
        initial: InstanceStatus,
        success: bool,
    ) -> Option<InstanceStatus> {
        self.instances
            .entry((cluster.to_string(), id.to_string()))
            .or_insert_with(|| InstanceHealth::new(initial))
            .observe(success)
    }

    pub fn status(&self, cluster: &str, id: &str) -> Option<InstanceStatus> {
        self.instances
            .get(&(cluster.to_string(), id.to_string()))
            .map(|h| h.status)
    }

    pub fn forget(&mut self, cluster: &str, id: &str) {
        self.instances.remove(&(cluster.to_string(), id.to_string()));
    }

    /// Drop state for instances no longer present, so the map does not grow
    /// with churn.
    pub fn retain_instances(&mut self, live: &std::collections::HashSet<(String, String)>) {
        self.instances.retain(|key, _| live.contains(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_failures_mark_unhealthy() {
        let mut health = InstanceHealth::new(InstanceStatus::Healthy);
        assert_eq!(health.observe(false), None);
        assert_eq!(health.observe(false), Some(InstanceStatus::Unhealthy));
        // Further failures do not re-announce.
        assert_eq!(health.observe(false), None);
    }

    #[test]
    fn test_recovery_goes_through_degraded() {
        let mut health = InstanceHealth::new(InstanceStatus::Healthy);
        health.observe(false);
        health.observe(false);
        assert_eq!(health.status, InstanceStatus::Unhealthy);

        // One success: degraded, not yet healthy.
        assert_eq!(health.observe(true), Some(InstanceStatus::Degraded));
        // Second consecutive success: healthy.
        assert_eq!(health.observe(true), Some(InstanceStatus::Healthy));
    }

    #[test]
    fn test_single_failure_does_not_flap() {
        let mut health = InstanceHealth::new(InstanceStatus::Healthy);
        assert_eq!(health.observe(false), None);
        assert_eq!(health.status, InstanceStatus::Healthy);
        // Success resets the failure streak.
        health.observe(true);
        assert_eq!(health.observe(false), None);
        assert_eq!(health.status, InstanceStatus::Healthy);
    }

    #[test]
    fn test_interrupted_recovery_falls_back() {
        let mut health = InstanceHealth::new(InstanceStatus::Healthy);
        health.observe(false);
        health.observe(false);
        health.observe(true); // degraded
        assert_eq!(health.observe(false), None); // one failure: still degraded
        assert_eq!(health.observe(false), Some(InstanceStatus::Unhealthy));
    }

    #[test]
    fn test_starting_instance_promotes_to_healthy() {
        let mut health = InstanceHealth::new(InstanceStatus::Starting);
        assert_eq!(health.observe(true), Some(InstanceStatus::Degraded));
        assert_eq!(health.observe(true), Some(InstanceStatus::Healthy));
    }

    #[test]
    fn test_tracker_retain() {
        let mut tracker = HealthTracker::new();
        tracker.observe("a", "1", InstanceStatus::Healthy, true);
        tracker.observe("a", "2", InstanceStatus::Healthy, true);
        let mut live = std::collections::HashSet::new();
        live.insert(("a".to_string(), "1".to_string()));
        tracker.retain_instances(&live);
        assert!(tracker.status("a", "1").is_some());
        assert!(tracker.status("a", "2").is_none());
    }
}
