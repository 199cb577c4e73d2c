pub mod client;
pub mod error;

pub use client::{CloudClient, CloudClientConfig, HttpResponse, Payload};
pub use error::HttpError;
