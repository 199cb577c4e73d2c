pub mod error;
pub mod health;
#[cfg(feature = "modbus")]
pub mod modbus;
pub mod output;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod sim;
pub mod supervisor;

pub use error::AdapterError;
pub use health::{AdapterHealth, CommunicationQuality, ConnectionState};
pub use output::{format_record, OutputHandle, OutputWriter};
pub use registry::AdapterRegistry;
pub use runtime::{AdapterRuntime, RuntimeOptions};
pub use session::{ProtocolAdapter, ProtocolSession};
pub use supervisor::AdapterSupervisor;
