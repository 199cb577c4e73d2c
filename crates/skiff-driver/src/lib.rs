pub mod driver;
pub mod error;
pub mod memory;
pub mod types;

pub use driver::ContainerDriver;
pub use error::DriverError;
pub use memory::{DriverOp, MemoryDriver};
pub use types::{
    config_fingerprint, container_name, managed_filter, ContainerDetail, ContainerState,
    ContainerSummary, CreateSpec, LABEL_APP_ID, LABEL_CONFIG_HASH, LABEL_MANAGED_BY,
    LABEL_SERVICE_ID, MANAGED_BY_AGENT,
};
