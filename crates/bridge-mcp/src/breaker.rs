use crate::bulkhead::{Bulkhead, BulkheadPermit};
use bridge_core::config::CircuitBreakerConfig;
use bridge_core::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// How many trailing samples feed the adaptive threshold adjustment.
const ADAPTIVE_SAMPLE_COUNT: usize = 10;

/// Clock abstraction so breaker timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

#[derive(Debug)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn restrictiveness(&self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }

    /// Gauge encoding: 0=closed, 1=half_open, 2=open.
    pub fn as_metric(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl std::str::FromStr for BreakerState {
    type Err = ();
    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "closed" => Ok(BreakerState::Closed),
            "open" => Ok(BreakerState::Open),
            "half_open" => Ok(BreakerState::HalfOpen),
            _ => Err(()),
        }
    }
}

/// Outcome of a permitted call, reported back through `Permit::release`.
#[derive(Debug, Clone, Copy)]
pub enum CallOutcome {
    Success { duration_ms: u64 },
    Failure { duration_ms: u64 },
    /// Cancelled or shed before reaching the backend; never counted.
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
struct CallSample {
    success: bool,
    duration_ms: u64,
    at_ms: u64,
}

/// Per-cluster circuit breaker with an embedded bulkhead.
///
/// States move closed -> open (rate, slow-call or consecutive-failure
/// threshold), open -> half_open (after the open-state duration), and
/// half_open -> closed (enough probe successes) or back to open (any probe
/// failure). Transitions are CAS-driven; the rolling window sits behind a
/// short mutex touched only when recording outcomes.
pub struct CircuitBreaker {
    cluster: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    opened_at_ms: AtomicU64,
    half_open_calls: AtomicUsize,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    adaptive_threshold: AtomicU32,
    window: Mutex<VecDeque<CallSample>>,
    bulkhead: Option<Bulkhead>,
    clock: Arc<dyn Clock>,
}

/// Admission token. Callers must hand it back through `release`; dropping
/// it without releasing records a cancellation, which frees the bulkhead
/// slot and half-open budget without counting toward failure rates.
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    _bulkhead: Option<BulkheadPermit>,
    half_open: bool,
    released: bool,
}

impl Permit {
    pub fn release(mut self, outcome: CallOutcome) {
        self.released = true;
        self.breaker.record(outcome, self.half_open);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.released {
            self.breaker.record(CallOutcome::Cancelled, self.half_open);
        }
    }
}

impl CircuitBreaker {
    pub fn new(cluster: &str, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(cluster, config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(cluster: &str, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let bulkhead = config.enable_bulkhead.then(|| {
            Bulkhead::new(
                cluster,
                config.max_concurrent_calls,
                config.queue_capacity,
                Duration::from_millis(config.queue_timeout_ms),
            )
        });
        let initial_threshold = config
            .failure_threshold
            .clamp(config.min_failure_threshold, config.max_failure_threshold);
        let breaker = Self {
            cluster: cluster.to_string(),
            config,
            state: AtomicU8::new(STATE_CLOSED),
            opened_at_ms: AtomicU64::new(0),
            half_open_calls: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            adaptive_threshold: AtomicU32::new(initial_threshold),
            window: Mutex::new(VecDeque::new()),
            bulkhead,
            clock,
        };
        breaker.publish_state_metric(BreakerState::Closed);
        breaker
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// Remaining time before an open breaker half-opens.
    pub fn retry_after_ms(&self) -> Option<u64> {
        if self.state() != BreakerState::Open {
            return None;
        }
        let opened = self.opened_at_ms.load(Ordering::Acquire);
        let elapsed = self.clock.now_millis().saturating_sub(opened);
        Some(
            (self.config.open_state_duration_secs * 1000).saturating_sub(elapsed),
        )
    }

    /// Ask to make one call. Checks the state machine first, then the
    /// bulkhead, so load shedding and an open circuit stay distinguishable.
    pub async fn admit(self: &Arc<Self>) -> Result<Permit> {
        let half_open = self.admit_state_machine()?;

        let bulkhead_permit = match &self.bulkhead {
            Some(bulkhead) => match bulkhead.acquire().await {
                Ok(permit) => Some(permit),
                Err(e) => {
                    // The permit never existed; undo the half-open slot.
                    if half_open {
                        self.half_open_calls.fetch_sub(1, Ordering::AcqRel);
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        Ok(Permit {
            breaker: self.clone(),
            _bulkhead: bulkhead_permit,
            half_open,
            released: false,
        })
    }

    /// Returns whether the admitted call is a half-open probe.
    fn admit_state_machine(&self) -> Result<bool> {
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened = self.opened_at_ms.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened);
                    let open_for = self.config.open_state_duration_secs * 1000;
                    if elapsed < open_for {
                        return Err(Error::CircuitOpen {
                            cluster: self.cluster.clone(),
                            retry_after_ms: Some(open_for - elapsed),
                        });
                    }
                    match self.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // We won the transition and are the first probe.
                            self.half_open_calls.store(1, Ordering::Release);
                            self.consecutive_successes.store(0, Ordering::Release);
                            self.publish_state_metric(BreakerState::HalfOpen);
                            tracing::info!(cluster = %self.cluster, "circuit breaker half-open");
                            return Ok(true);
                        }
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    let current = self.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.half_open_calls.fetch_sub(1, Ordering::AcqRel);
                        return Err(Error::CircuitOpen {
                            cluster: self.cluster.clone(),
                            retry_after_ms: None,
                        });
                    }
                    return Ok(true);
                }
                _ => return Ok(false),
            }
        }
    }

    fn record(&self, outcome: CallOutcome, half_open_probe: bool) {
        if half_open_probe {
            self.half_open_calls.fetch_sub(1, Ordering::AcqRel);
        }
        match outcome {
            CallOutcome::Cancelled => {}
            CallOutcome::Success { duration_ms } => self.on_success(duration_ms),
            CallOutcome::Failure { duration_ms } => self.on_failure(duration_ms),
        }
    }

    fn on_success(&self, duration_ms: u64) {
        self.push_sample(true, duration_ms);
        self.consecutive_failures.store(0, Ordering::Release);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;

        if self.state.load(Ordering::Acquire) == STATE_HALF_OPEN
            && successes >= self.config.recovery_threshold
            && self
                .state
                .compare_exchange(
                    STATE_HALF_OPEN,
                    STATE_CLOSED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            self.opened_at_ms.store(0, Ordering::Release);
            self.consecutive_successes.store(0, Ordering::Release);
            self.publish_state_metric(BreakerState::Closed);
            tracing::info!(cluster = %self.cluster, "circuit breaker closed");
        }
    }

    fn on_failure(&self, duration_ms: u64) {
        self.push_sample(false, duration_ms);
        self.consecutive_successes.store(0, Ordering::Release);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                // Any probe failure reopens.
                self.transition_to_open(STATE_HALF_OPEN, failures);
            }
            STATE_CLOSED => {
                if self.should_open(failures) {
                    self.transition_to_open(STATE_CLOSED, failures);
                }
            }
            _ => {}
        }
    }

    /// Open-circuit conditions: failure rate, slow-call rate (both gated on
    /// a minimum window population), or a consecutive-failure streak at the
    /// (possibly adaptive) threshold.
    fn should_open(&self, consecutive_failures: u32) -> bool {
        let now = self.clock.now_millis();
        let window_ms = self.config.failure_window_secs * 1000;
        let threshold = self.effective_threshold();

        let mut window = self.window.lock().expect("breaker window");
        while let Some(front) = window.front() {
            if now.saturating_sub(front.at_ms) > window_ms {
                window.pop_front();
            } else {
                break;
            }
        }

        let total = window.len();
        if total >= self.config.minimum_requests {
            let failures = window.iter().filter(|s| !s.success).count();
            let slow = window
                .iter()
                .filter(|s| s.duration_ms >= self.config.slow_call_threshold_ms)
                .count();
            let failure_rate = failures as f64 / total as f64;
            let slow_rate = slow as f64 / total as f64;
            if failure_rate >= self.config.failure_rate_threshold
                || slow_rate >= self.config.slow_call_rate_threshold
            {
                return true;
            }
        }

        consecutive_failures >= threshold
    }

    /// Adaptive threshold: recent fast calls tighten it by one, recent slow
    /// calls loosen it by one, clamped to the configured band.
    fn effective_threshold(&self) -> u32 {
        if !self.config.enable_adaptive_threshold {
            return self.config.failure_threshold;
        }
        let recent_avg = {
            let window = self.window.lock().expect("breaker window");
            if window.len() < ADAPTIVE_SAMPLE_COUNT {
                return self.adaptive_threshold.load(Ordering::Acquire);
            }
            let tail = window
                .iter()
                .rev()
                .take(ADAPTIVE_SAMPLE_COUNT)
                .map(|s| s.duration_ms as f64)
                .sum::<f64>();
            tail / ADAPTIVE_SAMPLE_COUNT as f64
        };

        let slow = self.config.slow_call_threshold_ms as f64;
        let adjustment: i64 = if recent_avg < slow * 0.5 {
            -1
        } else if recent_avg > slow {
            1
        } else {
            0
        };

        let current = self.adaptive_threshold.load(Ordering::Acquire) as i64;
        let next = (current + adjustment).clamp(
            self.config.min_failure_threshold as i64,
            self.config.max_failure_threshold as i64,
        ) as u32;
        self.adaptive_threshold.store(next, Ordering::Release);
        next
    }

    fn transition_to_open(&self, from: u8, failures: u32) {
        if self
            .state
            .compare_exchange(from, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.opened_at_ms.store(self.clock.now_millis(), Ordering::Release);
            self.publish_state_metric(BreakerState::Open);
            tracing::warn!(cluster = %self.cluster, failures, "circuit breaker open");
        }
    }

    fn push_sample(&self, success: bool, duration_ms: u64) {
        let mut window = self.window.lock().expect("breaker window");
        window.push_back(CallSample {
            success,
            duration_ms,
            at_ms: self.clock.now_millis(),
        });
        // Bound memory under bursts; time-based pruning happens on read.
        let cap = (self.config.minimum_requests * 100).max(1_000);
        while window.len() > cap {
            window.pop_front();
        }
    }

    /// Adopt a remote state when it is more restrictive than ours. The
    /// reverse never happens, so one recovered node cannot mask a
    /// cluster-wide outage, and a flapping node cannot force everyone
    /// closed.
    pub fn adopt_remote(&self, remote: BreakerState) {
        let local = self.state();
        if remote.restrictiveness() <= local.restrictiveness() {
            return;
        }
        match remote {
            BreakerState::Open => {
                let from = self.state.swap(STATE_OPEN, Ordering::AcqRel);
                if from != STATE_OPEN {
                    self.opened_at_ms.store(self.clock.now_millis(), Ordering::Release);
                    self.publish_state_metric(BreakerState::Open);
                    tracing::warn!(cluster = %self.cluster, "circuit breaker opened from distributed state");
                }
            }
            BreakerState::HalfOpen => {
                if self
                    .state
                    .compare_exchange(
                        STATE_CLOSED,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.half_open_calls.store(0, Ordering::Release);
                    self.publish_state_metric(BreakerState::HalfOpen);
                }
            }
            BreakerState::Closed => {}
        }
    }

    /// Operator-initiated reset to closed.
    pub fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.opened_at_ms.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);
        self.window.lock().expect("breaker window").clear();
        self.publish_state_metric(BreakerState::Closed);
        tracing::info!(cluster = %self.cluster, "circuit breaker reset");
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_ref()
    }

    fn publish_state_metric(&self, state: BreakerState) {
        metrics::gauge!("bridge_circuit_state", "cluster" => self.cluster.clone())
            .set(state.as_metric());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as TestAtomicU64;

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<TestAtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(TestAtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_threshold: 2,
            minimum_requests: 5,
            open_state_duration_secs: 1,
            half_open_max_calls: 1,
            enable_adaptive_threshold: false,
            enable_bulkhead: false,
            ..CircuitBreakerConfig::default()
        }
    }

    fn breaker_with(clock: &ManualClock, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::with_clock("svc", config, Arc::new(clock.clone())))
    }

    async fn fail_once(breaker: &Arc<CircuitBreaker>) {
        let permit = breaker.admit().await.unwrap();
        permit.release(CallOutcome::Failure { duration_ms: 10 });
    }

    async fn succeed_once(breaker: &Arc<CircuitBreaker>) {
        let permit = breaker.admit().await.unwrap();
        permit.release(CallOutcome::Success { duration_ms: 10 });
    }

    #[tokio::test]
    async fn test_starts_closed_and_allows() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock, config());
        assert_eq!(breaker.state(), BreakerState::Closed);
        succeed_once(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock, config());
        for _ in 0..3 {
            fail_once(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let err = breaker.admit().await.unwrap_err();
        assert_eq!(err.kind(), "circuit.open");
        if let Error::CircuitOpen { retry_after_ms, .. } = err {
            assert!(retry_after_ms.unwrap() <= 1_000);
        }
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock, config());
        fail_once(&breaker).await;
        fail_once(&breaker).await;
        succeed_once(&breaker).await;
        fail_once(&breaker).await;
        fail_once(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_failure_rate_opens_after_minimum_requests() {
        let clock = ManualClock::new();
        let mut cfg = config();
        cfg.failure_threshold = 100; // streaks out of the picture
        cfg.minimum_requests = 5;
        cfg.failure_rate_threshold = 0.5;
        let breaker = breaker_with(&clock, cfg);

        // Alternate: 3 successes, 2 failures (rate 0.4) stays closed.
        for _ in 0..3 {
            succeed_once(&breaker).await;
        }
        fail_once(&breaker).await;
        fail_once(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);

        // One more failure pushes the rate to 0.5.
        fail_once(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_slow_call_rate_opens() {
        let clock = ManualClock::new();
        let mut cfg = config();
        cfg.failure_threshold = 100;
        cfg.minimum_requests = 5;
        cfg.slow_call_threshold_ms = 100;
        cfg.slow_call_rate_threshold = 0.8;
        let breaker = breaker_with(&clock, cfg);

        for _ in 0..4 {
            let permit = breaker.admit().await.unwrap();
            permit.release(CallOutcome::Success { duration_ms: 500 });
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        // Fifth slow call reaches the minimum window; all five are slow.
        let permit = breaker.admit().await.unwrap();
        permit.release(CallOutcome::Failure { duration_ms: 500 });
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_half_open_then_closes_on_recovery() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock, config());
        for _ in 0..3 {
            fail_once(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        clock.advance(1_100);
        // First probe succeeds; recovery_threshold=2 so still half-open.
        succeed_once(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        succeed_once(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock, config());
        for _ in 0..3 {
            fail_once(&breaker).await;
        }
        clock.advance(1_100);
        fail_once(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
        // And the clock restarted: still rejecting.
        assert!(breaker.admit().await.is_err());
    }

    #[tokio::test]
    async fn test_half_open_concurrency_cap() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock, config()); // half_open_max_calls = 1
        for _ in 0..3 {
            fail_once(&breaker).await;
        }
        clock.advance(1_100);

        let probe = breaker.admit().await.unwrap();
        // Second concurrent probe is rejected.
        let err = breaker.admit().await.unwrap_err();
        assert_eq!(err.kind(), "circuit.open");
        probe.release(CallOutcome::Success { duration_ms: 5 });
        // Slot freed; next probe admitted.
        let probe = breaker.admit().await.unwrap();
        probe.release(CallOutcome::Success { duration_ms: 5 });
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_and_dropped_permits_do_not_count() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock, config());
        for _ in 0..10 {
            let permit = breaker.admit().await.unwrap();
            drop(permit); // cancelled path
        }
        for _ in 0..10 {
            let permit = breaker.admit().await.unwrap();
            permit.release(CallOutcome::Cancelled);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_bulkhead_exhaustion_is_distinct_and_not_a_failure() {
        let clock = ManualClock::new();
        let mut cfg = config();
        cfg.enable_bulkhead = true;
        cfg.max_concurrent_calls = 1;
        cfg.queue_capacity = 0;
        cfg.queue_timeout_ms = 50;
        let breaker = breaker_with(&clock, cfg);

        let held = breaker.admit().await.unwrap();
        let err = breaker.admit().await.unwrap_err();
        assert_eq!(err.kind(), "bulkhead_full");
        assert_eq!(breaker.state(), BreakerState::Closed);
        held.release(CallOutcome::Success { duration_ms: 5 });
        // Slot is free again.
        let next = breaker.admit().await.unwrap();
        next.release(CallOutcome::Success { duration_ms: 5 });
    }

    #[tokio::test]
    async fn test_permit_drop_frees_bulkhead_slot() {
        let clock = ManualClock::new();
        let mut cfg = config();
        cfg.enable_bulkhead = true;
        cfg.max_concurrent_calls = 1;
        cfg.queue_capacity = 0;
        cfg.queue_timeout_ms = 50;
        let breaker = breaker_with(&clock, cfg);

        let held = breaker.admit().await.unwrap();
        drop(held);
        assert!(breaker.admit().await.is_ok());
    }

    #[tokio::test]
    async fn test_window_expiry_forgets_old_failures() {
        let clock = ManualClock::new();
        let mut cfg = config();
        cfg.failure_threshold = 100;
        cfg.minimum_requests = 5;
        cfg.failure_window_secs = 10;
        let breaker = breaker_with(&clock, cfg);

        for _ in 0..4 {
            fail_once(&breaker).await;
        }
        // Window rolls past the old failures.
        clock.advance(11_000);
        for _ in 0..4 {
            succeed_once(&breaker).await;
        }
        fail_once(&breaker).await;
        // 5 in-window samples, 1 failure: rate 0.2 < 0.5.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_adaptive_threshold_tightens_on_fast_traffic() {
        let clock = ManualClock::new();
        let mut cfg = config();
        cfg.enable_adaptive_threshold = true;
        cfg.failure_threshold = 5;
        cfg.min_failure_threshold = 3;
        cfg.max_failure_threshold = 20;
        cfg.minimum_requests = 100; // keep rate checks out
        cfg.slow_call_threshold_ms = 1_000;
        let breaker = breaker_with(&clock, cfg);

        // Ten fast samples pull the threshold toward the minimum.
        for _ in 0..10 {
            succeed_once(&breaker).await;
        }
        for _ in 0..2 {
            fail_once(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        // Threshold has adapted down to 3; the third failure trips it even
        // though the static threshold is 5.
        fail_once(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_adopt_remote_only_more_restrictive() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock, config());

        breaker.adopt_remote(BreakerState::Closed);
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.adopt_remote(BreakerState::Open);
        assert_eq!(breaker.state(), BreakerState::Open);

        // Remote closing never closes us.
        breaker.adopt_remote(BreakerState::Closed);
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.adopt_remote(BreakerState::HalfOpen);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_reset_closes() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock, config());
        for _ in 0..3 {
            fail_once(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.admit().await.is_ok());
    }
}
