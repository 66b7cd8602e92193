pub mod backoff;
pub mod balancer;
pub mod breaker;
pub mod bulkhead;
pub mod cache;
pub mod clusters;
pub mod codec;
pub mod dispatcher;
pub mod pool;

pub use balancer::LoadBalancer;
pub use breaker::{BreakerState, CallOutcome, CircuitBreaker, Permit};
pub use bulkhead::Bulkhead;
pub use cache::ResponseCache;
pub use clusters::{ClusterMap, ClusterRuntime};
pub use dispatcher::{DispatchResult, Dispatcher};
pub use pool::{ChannelHandle, ChannelPool};
