pub mod monitor;
pub mod probe;
pub mod state;

pub use monitor::HealthMonitor;
pub use probe::{run_probe, ProbeResult};
pub use state::{HealthTracker, InstanceHealth};
