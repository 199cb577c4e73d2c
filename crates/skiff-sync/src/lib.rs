pub mod error;
pub mod metrics;
pub mod monitor;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod sync;
pub mod wakeup;

pub use error::SyncError;
pub use metrics::{MetricsSampler, SystemMetrics};
pub use monitor::ConnectionMonitor;
pub use sync::{CloudSync, PollOutcome, ReportOutcome, SyncConfig};
pub use wakeup::Wakeup;
