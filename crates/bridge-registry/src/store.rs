use async_trait::async_trait;
use bridge_core::{Error, Result};
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

/// Change notification from a registry backend, in the backend's revision
/// order.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

impl StoreEvent {
    pub fn key(&self) -> &str {
        match self {
            StoreEvent::Put { key, .. } | StoreEvent::Delete { key } => key,
        }
    }
}

/// Abstract KV + lease + watch surface the registry runs on. Values are
/// UTF-8 JSON serializations of registry records.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Write a key. A `ttl` attaches a lease; the key expires unless
    /// refreshed through `keep_alive` or re-put.
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// All live keys under a prefix, sorted by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Refresh the lease on a key without rewriting its value.
    async fn keep_alive(&self, key: &str) -> Result<()>;

    /// Subscribe to changes under a prefix. Events arrive in backend
    /// revision order; the channel closes when the backend goes away.
    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<StoreEvent>>;

    /// Take or refresh an exclusive lock. Returns true when this node holds
    /// the lock after the call.
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Drop expired leases now. Backends with server-side leases (etcd) do
    /// nothing here.
    async fn sweep(&self) -> Result<()> {
        Ok(())
    }

    /// Cheap reachability check for health reporting.
    async fn healthy(&self) -> bool;

    fn backend_name(&self) -> &'static str;
}

struct MemoryEntry {
    value: String,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

/// In-process backend. Lease expiry is enforced by `sweep`, which the
/// registry's cleanup loop drives, and lazily on reads.
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            entries: DashMap::new(),
            events,
        }
    }

    fn expired(entry: &MemoryEntry) -> bool {
        entry
            .expires_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(false)
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine; nobody is watching yet.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.clone(),
                ttl,
                expires_at,
            },
        );
        self.emit(StoreEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entries.get(key) {
            Some(entry) if !Self::expired(&entry) => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut out: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !Self::expired(e.value()))
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.entries.remove(key).is_some();
        if existed {
            self.emit(StoreEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(existed)
    }

    async fn keep_alive(&self, key: &str) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("no lease for key '{key}'")))?;
        if let Some(ttl) = entry.ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<StoreEvent>> {
        let (tx, rx) = mpsc::channel(256);
        let mut sub = self.events.subscribe();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                match sub.recv().await {
                    Ok(event) => {
                        if event.key().starts_with(&prefix) && tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "memory store watcher lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        // Refresh if we already hold it, take it if free or expired.
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !Self::expired(&entry) && entry.value != owner {
                return Ok(false);
            }
            entry.value = owner.to_string();
            entry.ttl = Some(ttl);
            entry.expires_at = Some(Instant::now() + ttl);
            return Ok(true);
        }
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: owner.to_string(),
                ttl: Some(ttl),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn sweep(&self) -> Result<()> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| Self::expired(e.value()))
            .map(|e| e.key().clone())
            .collect();
        for key in expired {
            if self.entries.remove(&key).is_some() {
                self.emit(StoreEvent::Delete { key });
            }
        }
        Ok(())
    }

    async fn healthy(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
