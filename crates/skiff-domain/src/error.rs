use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("app key {key} does not match app_id {field}")]
    AppIdMismatch { key: u32, field: u32 },

    #[error("app {app_id}: invalid service id '{service_id}'")]
    InvalidServiceId { app_id: u32, service_id: String },

    #[error("app {app_id}: duplicate service id '{service_id}'")]
    DuplicateServiceId { app_id: u32, service_id: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
