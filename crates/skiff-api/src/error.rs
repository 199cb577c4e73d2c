use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::CONFLICT, message: msg.into() }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::SERVICE_UNAVAILABLE, message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, message: msg.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<skiff_store::StoreError> for ApiError {
    fn from(e: skiff_store::StoreError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<skiff_reconciler::ReconcileError> for ApiError {
    fn from(e: skiff_reconciler::ReconcileError) -> Self {
        match e {
            skiff_reconciler::ReconcileError::Config(_) => ApiError::bad_request(e.to_string()),
            skiff_reconciler::ReconcileError::RuntimeDown(_) => {
                ApiError::unavailable(e.to_string())
            }
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<skiff_driver::DriverError> for ApiError {
    fn from(e: skiff_driver::DriverError) -> Self {
        match e {
            skiff_driver::DriverError::NotFound(_) => ApiError::not_found(e.to_string()),
            skiff_driver::DriverError::Conflict(_) => ApiError::conflict(e.to_string()),
            skiff_driver::DriverError::RuntimeDown(_) => ApiError::unavailable(e.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<skiff_provision::ProvisionError> for ApiError {
    fn from(e: skiff_provision::ProvisionError) -> Self {
        match e {
            skiff_provision::ProvisionError::Denied { .. } => {
                ApiError { status: StatusCode::FORBIDDEN, message: e.to_string() }
            }
            skiff_provision::ProvisionError::TransientNetwork(_) => {
                ApiError::unavailable(e.to_string())
            }
            _ => ApiError::internal(e.to_string()),
        }
    }
}
