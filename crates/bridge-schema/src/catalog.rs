use bridge_core::{Error, Result};
use chrono::{DateTime, Utc};
use prost_reflect::{DescriptorPool, MethodDescriptor};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use tracing::info;

/// A registered catalog of protobuf descriptors.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaVersion {
    pub version_id: String,
    /// sha256 of the serialized FileDescriptorSet.
    pub file_hash: String,
    pub services: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompatibilityReport {
    pub added_services: Vec<String>,
    pub removed_services: Vec<String>,
    pub common_services: Vec<String>,
    pub is_backwards_compatible: bool,
}

struct SchemaEntry {
    meta: SchemaVersion,
    pool: DescriptorPool,
}

/// Versioned descriptor catalog. One version is pinned as current; the
/// translator marshals against it. Compatibility checks are advisory, the
/// bridge never rejects a deployment on its own.
#[derive(Default)]
pub struct SchemaCatalog {
    versions: RwLock<HashMap<String, SchemaEntry>>,
    current: RwLock<Option<String>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a serialized FileDescriptorSet under a caller-chosen
    /// version id. Registering identical bytes twice is idempotent; the
    /// same id with different bytes is a conflict.
    pub fn register_schema(&self, version_id: &str, descriptor_bytes: &[u8]) -> Result<SchemaVersion> {
        let file_hash = hex_digest(descriptor_bytes);

        {
            let versions = self.versions.read().expect("catalog lock");
            if let Some(existing) = versions.get(version_id) {
                if existing.meta.file_hash == file_hash {
                    return Ok(existing.meta.clone());
                }
                return Err(Error::SchemaVersionConflict(version_id.to_string()));
            }
        }

        let pool = DescriptorPool::decode(descriptor_bytes)
            .map_err(|e| Error::SchemaParse(format!("descriptor set: {e}")))?;
        let services: BTreeSet<String> =
            pool.services().map(|s| s.full_name().to_string()).collect();

        let meta = SchemaVersion {
            version_id: version_id.to_string(),
            file_hash,
            services,
            registered_at: Utc::now(),
        };

        let mut versions = self.versions.write().expect("catalog lock");
        versions.insert(
            version_id.to_string(),
            SchemaEntry { meta: meta.clone(), pool },
        );

        // First registration becomes current automatically.
        let mut current = self.current.write().expect("catalog lock");
        if current.is_none() {
            *current = Some(version_id.to_string());
        }

        info!(
            version = version_id,
            services = meta.services.len(),
            "schema version registered"
        );
        Ok(meta)
    }

    pub fn set_current(&self, version_id: &str) -> Result<()> {
        let versions = self.versions.read().expect("catalog lock");
        if !versions.contains_key(version_id) {
            return Err(Error::SchemaNotRegistered(version_id.to_string()));
        }
        *self.current.write().expect("catalog lock") = Some(version_id.to_string());
        info!(version = version_id, "current schema version pinned");
        Ok(())
    }

    pub fn current_version(&self) -> Option<String> {
        self.current.read().expect("catalog lock").clone()
    }

    pub fn get(&self, version_id: &str) -> Option<SchemaVersion> {
        self.versions
            .read()
            .expect("catalog lock")
            .get(version_id)
            .map(|e| e.meta.clone())
    }

    pub fn list(&self) -> Vec<SchemaVersion> {
        let versions = self.versions.read().expect("catalog lock");
        let mut out: Vec<SchemaVersion> = versions.values().map(|e| e.meta.clone()).collect();
        out.sort_by(|a, b| a.version_id.cmp(&b.version_id));
        out
    }

    /// Service-set diff between two versions. Backwards compatible iff
    /// nothing was removed.
    pub fn compatibility(&self, old: &str, new: &str) -> Result<CompatibilityReport> {
        let versions = self.versions.read().expect("catalog lock");
        let old_services = &versions
            .get(old)
            .ok_or_else(|| Error::SchemaNotRegistered(old.to_string()))?
            .meta
            .services;
        let new_services = &versions
            .get(new)
            .ok_or_else(|| Error::SchemaNotRegistered(new.to_string()))?
            .meta
            .services;

        let added: Vec<String> = new_services.difference(old_services).cloned().collect();
        let removed: Vec<String> = old_services.difference(new_services).cloned().collect();
        let common: Vec<String> = old_services.intersection(new_services).cloned().collect();

        Ok(CompatibilityReport {
            is_backwards_compatible: removed.is_empty(),
            added_services: added,
            removed_services: removed,
            common_services: common,
        })
    }

    /// Descriptor for `(service, method)` in the current version.
    pub fn method_descriptor(&self, service: &str, method: &str) -> Result<MethodDescriptor> {
        let current = self
            .current_version()
            .ok_or_else(|| Error::SchemaNotRegistered("no current schema version".to_string()))?;
        let versions = self.versions.read().expect("catalog lock");
        let entry = versions
            .get(&current)
            .ok_or_else(|| Error::SchemaNotRegistered(current.clone()))?;
        let service_desc = entry
            .pool
            .get_service_by_name(service)
            .ok_or_else(|| Error::SchemaNotRegistered(service.to_string()))?;
        let method_desc = service_desc
            .methods()
            .find(|m| m.name() == method)
            .ok_or_else(|| Error::SchemaNotRegistered(format!("{service}/{method}")))?;
        Ok(method_desc)
    }

    /// The lone service of the current version, used for verb-default
    /// routing. None when zero or several services are registered.
    pub fn single_service(&self) -> Option<String> {
        let current = self.current_version()?;
        let versions = self.versions.read().expect("catalog lock");
        let services = &versions.get(&current)?.meta.services;
        if services.len() == 1 {
            services.iter().next().cloned()
        } else {
            None
        }
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
