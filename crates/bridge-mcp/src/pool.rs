use bridge_core::config::{ChannelConfig, TlsModeKind};
use bridge_core::types::ServiceInstance;
use bridge_core::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info, warn};

/// Multiplexed gRPC channels keyed by instance.
///
/// Channels are opened lazily and shared: an instance gets at most
/// `max_channels_per_instance` of them, each carrying up to
/// `max_concurrent_streams` streams. A per-instance stream-slot semaphore
/// makes a burst block (bounded by the connect timeout) instead of opening
/// unbounded connections. A reaper closes channels past their age or idle
/// limits once they have no streams in flight.
pub struct ChannelPool {
    instances: DashMap<String, Arc<InstanceChannels>>,
    connect_timeout: Duration,
    /// All idle timestamps are milliseconds since this instant.
    epoch: Instant,
    closed: AtomicBool,
}

struct InstanceChannels {
    instance_id: String,
    uri: String,
    config: ChannelConfig,
    epoch: Instant,
    /// One permit per stream slot across every channel of this instance.
    slots: Arc<Semaphore>,
    /// Creation is serialized behind this lock to avoid connect stampedes.
    channels: Mutex<Vec<Arc<ChannelEntry>>>,
}

struct ChannelEntry {
    channel: Channel,
    created_at: Instant,
    last_used: AtomicU64,
    in_flight: AtomicU64,
}

fn millis_since(epoch: Instant) -> u64 {
    epoch.elapsed().as_millis() as u64
}

/// A borrowed stream slot on a pooled channel. Dropping it returns the
/// slot; the underlying channel stays pooled.
pub struct ChannelHandle {
    entry: Arc<ChannelEntry>,
    epoch: Instant,
    _slot: OwnedSemaphorePermit,
}

impl ChannelHandle {
    pub fn channel(&self) -> Channel {
        self.entry.channel.clone()
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.entry.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.entry
            .last_used
            .store(millis_since(self.epoch), Ordering::Release);
    }
}

impl ChannelPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            instances: DashMap::new(),
            connect_timeout,
            epoch: Instant::now(),
            closed: AtomicBool::new(false),
        }
    }

    /// Borrow a stream slot to `instance`, creating a channel if the
    /// instance has spare channel budget. Blocks up to the connect timeout
    /// when every slot is busy.
    pub async fn acquire(
        &self,
        instance: &ServiceInstance,
        config: &ChannelConfig,
    ) -> Result<ChannelHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed {
                instance: instance.id.clone(),
            });
        }

        let entry = self
            .instances
            .entry(instance.id.clone())
            .or_insert_with(|| {
                let capacity = config.max_channels_per_instance
                    * config.max_concurrent_streams.max(1) as usize;
                Arc::new(InstanceChannels {
                    instance_id: instance.id.clone(),
                    uri: instance.endpoint_uri(),
                    config: config.clone(),
                    epoch: self.epoch,
                    slots: Arc::new(Semaphore::new(capacity)),
                    channels: Mutex::new(Vec::new()),
                })
            })
            .clone();

        let slot = tokio::time::timeout(self.connect_timeout, entry.slots.clone().acquire_owned())
            .await
            .map_err(|_| Error::ChannelConnectFailed {
                instance: instance.id.clone(),
                detail: "channel pool exhausted".to_string(),
            })?
            .map_err(|_| Error::ChannelClosed {
                instance: instance.id.clone(),
            })?;

        let epoch = self.epoch;
        let channel_entry = entry.pick_or_create().await?;
        channel_entry.in_flight.fetch_add(1, Ordering::AcqRel);
        channel_entry
            .last_used
            .store(millis_since(epoch), Ordering::Release);

        Ok(ChannelHandle {
            entry: channel_entry,
            epoch,
            _slot: slot,
        })
    }

    /// Drop every channel of an instance, e.g. after transport errors. In
    /// flight streams finish on their existing handles; new acquires build
    /// fresh channels.
    pub fn discard(&self, instance_id: &str) {
        if self.instances.remove(instance_id).is_some() {
            debug!(instance = instance_id, "discarded pooled channels");
            metrics::gauge!("bridge_channel_count", "instance" => instance_id.to_string()).set(0.0);
        }
    }

    /// Recycle channels past their age or idle budget. Only entries with no
    /// in-flight streams are closed, so draining happens naturally.
    pub async fn reap(&self) {
        for item in self.instances.iter() {
            let instance = item.value().clone();
            let max_age = Duration::from_secs(instance.config.max_connection_age_secs);
            let max_idle = Duration::from_secs(instance.config.max_connection_idle_secs);
            let now_ms = millis_since(instance.epoch);

            let mut channels = instance.channels.lock().await;
            let before = channels.len();
            channels.retain(|entry| {
                if entry.in_flight.load(Ordering::Acquire) > 0 {
                    return true;
                }
                let age = entry.created_at.elapsed();
                let idle_ms = now_ms.saturating_sub(entry.last_used.load(Ordering::Acquire));
                age <= max_age && Duration::from_millis(idle_ms) <= max_idle
            });
            if channels.len() != before {
                debug!(
                    instance = %instance.instance_id,
                    closed = before - channels.len(),
                    "recycled idle channels"
                );
            }
            metrics::gauge!("bridge_channel_count", "instance" => instance.instance_id.clone())
                .set(channels.len() as f64);
        }
    }

    /// Periodic reaper loop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        info!("channel pool reaper started");
        loop {
            tokio::select! {
                _ = interval.tick() => self.reap().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Drain and shut down. After this returns no new channel is handed
    /// out; waits up to `grace` for in-flight streams to finish.
    pub async fn close(&self, grace: Duration) {
        self.closed.store(true, Ordering::Release);
        let deadline = Instant::now() + grace;
        loop {
            let mut in_flight = 0u64;
            for item in self.instances.iter() {
                let channels = item.value().channels.lock().await;
                in_flight += channels
                    .iter()
                    .map(|e| e.in_flight.load(Ordering::Acquire))
                    .sum::<u64>();
            }
            if in_flight == 0 || Instant::now() >= deadline {
                if in_flight > 0 {
                    warn!(in_flight, "closing channel pool with streams still active");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.instances.clear();
        info!("channel pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Open channels for one instance (observability only).
    pub async fn channel_count(&self, instance_id: &str) -> usize {
        match self.instances.get(instance_id) {
            Some(entry) => entry.channels.lock().await.len(),
            None => 0,
        }
    }
}

impl InstanceChannels {
    /// Choose the least-loaded channel with spare streams, or open a new
    /// one while under the per-instance cap. Holding a stream slot
    /// guarantees some channel has capacity once the cap is reached.
    async fn pick_or_create(&self) -> Result<Arc<ChannelEntry>> {
        let mut channels = self.channels.lock().await;

        let max_streams = self.config.max_concurrent_streams.max(1) as u64;
        let available = channels
            .iter()
            .filter(|e| e.in_flight.load(Ordering::Acquire) < max_streams)
            .min_by_key(|e| e.in_flight.load(Ordering::Acquire))
            .cloned();

        if let Some(entry) = available {
            // Prefer a fresh channel when the best candidate is already
            // carrying streams and the budget allows another connection.
            if entry.in_flight.load(Ordering::Acquire) > 0
                && channels.len() < self.config.max_channels_per_instance
            {
                let fresh = self.open_channel()?;
                channels.push(fresh.clone());
                return Ok(fresh);
            }
            return Ok(entry);
        }

        if channels.len() < self.config.max_channels_per_instance {
            let fresh = self.open_channel()?;
            channels.push(fresh.clone());
            metrics::gauge!("bridge_channel_count", "instance" => self.instance_id.clone())
                .set(channels.len() as f64);
            return Ok(fresh);
        }

        // Slot accounting should make this unreachable.
        Err(Error::ChannelConnectFailed {
            instance: self.instance_id.clone(),
            detail: "no channel with spare streams".to_string(),
        })
    }

    fn open_channel(&self) -> Result<Arc<ChannelEntry>> {
        let endpoint = build_endpoint(&self.uri, &self.config).map_err(|detail| {
            Error::ChannelConnectFailed {
                instance: self.instance_id.clone(),
                detail,
            }
        })?;
        // Lazy connect: the TCP+TLS+h2 handshake happens on first use, and
        // failures surface as grpc.unavailable where the retry policy can
        // see them.
        let channel = endpoint.connect_lazy();
        debug!(instance = %self.instance_id, uri = %self.uri, "opened channel");
        Ok(Arc::new(ChannelEntry {
            channel,
            created_at: Instant::now(),
            last_used: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
        }))
    }
}

fn build_endpoint(uri: &str, config: &ChannelConfig) -> std::result::Result<Endpoint, String> {
    let mut endpoint = Endpoint::from_shared(uri.to_string())
        .map_err(|e| format!("bad endpoint uri: {e}"))?
        .tcp_nodelay(true)
        .http2_keep_alive_interval(Duration::from_secs(config.keepalive_time_secs))
        .keep_alive_timeout(Duration::from_secs(config.keepalive_timeout_secs))
        .keep_alive_while_idle(true);

    match config.tls.mode {
        TlsModeKind::Insecure => {}
        TlsModeKind::ServerTls | TlsModeKind::Mtls => {
            let mut tls = ClientTlsConfig::new();
            if let Some(ca_file) = &config.tls.ca_file {
                let pem = std::fs::read(ca_file)
                    .map_err(|e| format!("read ca file {}: {e}", ca_file.display()))?;
                tls = tls.ca_certificate(Certificate::from_pem(pem));
            }
            if let Some(domain) = &config.tls.domain_name {
                tls = tls.domain_name(domain.clone());
            }
            if config.tls.mode == TlsModeKind::Mtls {
                let (Some(cert_file), Some(key_file)) =
                    (&config.tls.cert_file, &config.tls.key_file)
                else {
                    return Err("mtls requires cert_file and key_file".to_string());
                };
                let cert = std::fs::read(cert_file)
                    .map_err(|e| format!("read cert file {}: {e}", cert_file.display()))?;
                let key = std::fs::read(key_file)
                    .map_err(|e| format!("read key file {}: {e}", key_file.display()))?;
                tls = tls.identity(Identity::from_pem(cert, key));
            }
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|e| format!("tls config: {e}"))?;
        }
    }

    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::types::InstanceStatus;

    fn instance() -> ServiceInstance {
        let mut inst = ServiceInstance::new("svc", "i1", "127.0.0.1", 50051);
        inst.status = InstanceStatus::Healthy;
        inst
    }

    fn small_config() -> ChannelConfig {
        ChannelConfig {
            max_channels_per_instance: 2,
            max_concurrent_streams: 1,
            ..ChannelConfig::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_reuses_channel_when_idle() {
        let pool = ChannelPool::new(Duration::from_millis(200));
        let config = ChannelConfig::default();
        let inst = instance();

        let first = pool.acquire(&inst, &config).await.unwrap();
        drop(first);
        let _second = pool.acquire(&inst, &config).await.unwrap();
        assert_eq!(pool.channel_count("i1").await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_streams_spread_over_channels_up_to_cap() {
        let pool = ChannelPool::new(Duration::from_millis(100));
        let config = small_config();
        let inst = instance();

        let _a = pool.acquire(&inst, &config).await.unwrap();
        let _b = pool.acquire(&inst, &config).await.unwrap();
        assert_eq!(pool.channel_count("i1").await, 2);

        // Both channels are at their stream cap; a third acquire blocks
        // and then times out as pool exhaustion.
        let err = pool.acquire(&inst, &config).await.unwrap_err();
        assert_eq!(err.kind(), "channel.connect_failed");
    }

    #[tokio::test]
    async fn test_released_slot_unblocks_waiter() {
        let pool = Arc::new(ChannelPool::new(Duration::from_millis(500)));
        let config = small_config();
        let inst = instance();

        let a = pool.acquire(&inst, &config).await.unwrap();
        let _b = pool.acquire(&inst, &config).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let inst = inst.clone();
            let config = config.clone();
            tokio::spawn(async move { pool.acquire(&inst, &config).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(a);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pool = ChannelPool::new(Duration::from_millis(100));
        pool.close(Duration::from_millis(10)).await;
        let err = pool
            .acquire(&instance(), &ChannelConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "channel.closed");
    }

    #[tokio::test]
    async fn test_reap_removes_idle_channels() {
        let pool = ChannelPool::new(Duration::from_millis(100));
        let mut config = ChannelConfig::default();
        config.max_connection_idle_secs = 0;
        let inst = instance();

        let handle = pool.acquire(&inst, &config).await.unwrap();
        // In-flight channels are never reaped.
        pool.reap().await;
        assert_eq!(pool.channel_count("i1").await, 1);

        drop(handle);
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.reap().await;
        assert_eq!(pool.channel_count("i1").await, 0);
    }

    #[tokio::test]
    async fn test_discard_drops_instance_channels() {
        let pool = ChannelPool::new(Duration::from_millis(100));
        let inst = instance();
        let handle = pool.acquire(&inst, &ChannelConfig::default()).await.unwrap();
        drop(handle);
        pool.discard("i1");
        assert_eq!(pool.channel_count("i1").await, 0);
    }
}
