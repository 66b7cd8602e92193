use crate::store::{RegistryStore, StoreEvent};
use async_trait::async_trait;
use bridge_core::{Error, Result};
use dashmap::DashMap;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use std::time::Duration;
use tokio::sync::mpsc;

/// etcd-backed registry store. Keys carry server-side leases equal to the
/// registry TTL, so a crashed instance disappears without any sweep here.
pub struct EtcdStore {
    client: Client,
    /// Lease attached to each leased key, so `keep_alive` can refresh it.
    leases: DashMap<String, i64>,
}

impl EtcdStore {
    pub async fn connect(
        endpoints: &[String],
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self> {
        let options = match (username, password) {
            (Some(user), Some(pass)) => Some(ConnectOptions::new().with_user(user, pass)),
            _ => None,
        };
        let client = Client::connect(endpoints, options)
            .await
            .map_err(|e| Error::Internal(format!("etcd connect failed: {e}")))?;
        Ok(Self {
            client,
            leases: DashMap::new(),
        })
    }

    fn map_err(context: &str, e: etcd_client::Error) -> Error {
        Error::Internal(format!("etcd {context} failed: {e}"))
    }
}

#[async_trait]
impl RegistryStore for EtcdStore {
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut client = self.client.clone();
        let options = match ttl {
            Some(ttl) => {
                let lease = client
                    .lease_grant(ttl.as_secs().max(1) as i64, None)
                    .await
                    .map_err(|e| Self::map_err("lease grant", e))?;
                self.leases.insert(key.to_string(), lease.id());
                Some(PutOptions::new().with_lease(lease.id()))
            }
            None => None,
        };
        client
            .put(key, value, options)
            .await
            .map_err(|e| Self::map_err("put", e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut client = self.client.clone();
        let resp = client
            .get(key, None)
            .await
            .map_err(|e| Self::map_err("get", e))?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(
                kv.value_str()
                    .map_err(|e| Self::map_err("decode", e))?
                    .to_string(),
            )),
            None => Ok(None),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| Self::map_err("range", e))?;
        let mut out = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            out.push((
                kv.key_str().map_err(|e| Self::map_err("decode", e))?.to_string(),
                kv.value_str().map_err(|e| Self::map_err("decode", e))?.to_string(),
            ));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut client = self.client.clone();
        let resp = client
            .delete(key, None)
            .await
            .map_err(|e| Self::map_err("delete", e))?;
        self.leases.remove(key);
        Ok(resp.deleted() > 0)
    }

    async fn keep_alive(&self, key: &str) -> Result<()> {
        let lease_id = self
            .leases
            .get(key)
            .map(|e| *e.value())
            .ok_or_else(|| Error::NotFound(format!("no lease for key '{key}'")))?;
        let mut client = self.client.clone();
        let (mut keeper, _responses) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(|e| Self::map_err("keep-alive", e))?;
        keeper
            .keep_alive()
            .await
            .map_err(|e| Self::map_err("keep-alive", e))?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<StoreEvent>> {
        let mut client = self.client.clone();
        let (_watcher, mut stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| Self::map_err("watch", e))?;
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            // Watcher is moved in so the server-side watch stays open.
            let _watcher = _watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let Ok(key) = kv.key_str() else { continue };
                            let mapped = match event.event_type() {
                                EventType::Put => kv.value_str().ok().map(|v| StoreEvent::Put {
                                    key: key.to_string(),
                                    value: v.to_string(),
                                }),
                                EventType::Delete => Some(StoreEvent::Delete {
                                    key: key.to_string(),
                                }),
                            };
                            if let Some(event) = mapped {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("etcd watch stream error: {e}");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(ttl.as_secs().max(1) as i64, None)
            .await
            .map_err(|e| Self::map_err("lease grant", e))?;
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                owner,
                Some(PutOptions::new().with_lease(lease.id())),
            )])
            .or_else(vec![TxnOp::get(key, None)]);
        let resp = client
            .txn(txn)
            .await
            .map_err(|e| Self::map_err("txn", e))?;
        if resp.succeeded() {
            self.leases.insert(key.to_string(), lease.id());
            return Ok(true);
        }
        // Lock is taken; if by us, refresh our existing lease.
        if self.get(key).await?.as_deref() == Some(owner) {
            let _ = self.keep_alive(key).await;
            return Ok(true);
        }
        Ok(false)
    }

    async fn healthy(&self) -> bool {
        let mut client = self.client.clone();
        client.status().await.is_ok()
    }

    fn backend_name(&self) -> &'static str {
        "etcd"
    }
}
