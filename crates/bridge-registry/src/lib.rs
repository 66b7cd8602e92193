pub mod etcd;
pub mod registry;
pub mod store;

pub use registry::{RegistrySettings, RegistryStats, ServiceRegistry};
pub use store::{MemoryStore, RegistryStore, StoreEvent};
