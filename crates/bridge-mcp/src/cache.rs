use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

/// TTL response cache for idempotent unary calls. Keys fold in the
/// Authorization header, so entries are per-identity and one caller can
/// never observe another's responses.
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
}

struct CacheEntry {
    data: Value,
    instance_id: String,
    expires_at: Instant,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// `sha256(cluster | method | canonical(request) | authorization)`.
    pub fn key(
        cluster: &str,
        grpc_path: &str,
        request_doc: &Value,
        authorization: Option<&str>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(cluster.as_bytes());
        hasher.update(b"|");
        hasher.update(grpc_path.as_bytes());
        hasher.update(b"|");
        hasher.update(canonical_json(request_doc).as_bytes());
        hasher.update(b"|");
        hasher.update(authorization.unwrap_or("").as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<(Value, String)> {
        let entry = self.entries.get(key)?;
        if Instant::now() >= entry.expires_at {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some((entry.data.clone(), entry.instance_id.clone()))
    }

    pub fn put(&self, key: String, data: Value, instance_id: &str) {
        if self.entries.len() >= self.max_entries {
            self.prune_expired();
            if self.entries.len() >= self.max_entries {
                // Still full: skip rather than evict live entries.
                return;
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                data,
                instance_id: instance_id.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }
}

/// JSON with object keys sorted recursively, so logically-equal requests
/// produce the same cache key regardless of field order.
fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).expect("string"));
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_is_field_order_independent() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(
            ResponseCache::key("c", "/S/M", &a, None),
            ResponseCache::key("c", "/S/M", &b, None)
        );
    }

    #[test]
    fn test_key_varies_by_identity() {
        let doc = json!({"id": 1});
        let anon = ResponseCache::key("c", "/S/M", &doc, None);
        let alice = ResponseCache::key("c", "/S/M", &doc, Some("Bearer alice"));
        let bob = ResponseCache::key("c", "/S/M", &doc, Some("Bearer bob"));
        assert_ne!(anon, alice);
        assert_ne!(alice, bob);
    }

    #[test]
    fn test_get_put_and_expiry() {
        let cache = ResponseCache::new(Duration::from_millis(30), 100);
        cache.put("k".to_string(), json!({"v": 1}), "i1");
        let (data, instance) = cache.get("k").unwrap();
        assert_eq!(data, json!({"v": 1}));
        assert_eq!(instance, "i1");

        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_capacity_skips_inserts_when_full() {
        let cache = ResponseCache::new(Duration::from_secs(60), 2);
        cache.put("a".to_string(), json!(1), "i");
        cache.put("b".to_string(), json!(2), "i");
        cache.put("c".to_string(), json!(3), "i");
        assert_eq!(cache.len(), 2);
        assert!(cache.get("c").is_none());
    }
}
