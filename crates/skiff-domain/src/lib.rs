pub mod error;
pub mod identity;
pub mod sensor;
pub mod target;


pub use error::DomainError;
pub use identity::{Identity, MqttConfig, MqttProtocol, Secret, TlsConfig};
pub use sensor::{
    AcquisitionMode, AnomalyRecord, DataPoint, Quality, Sample, SensorConfig, SensorOutput,
    WireFormat,
};
pub use target::{
    App, AppId, AppReport, ConnectionHealth, CurrentState, DesiredState, Service, ServiceConfig,
    ServiceId, ServiceReport, ServiceStatus, TargetState,
};
