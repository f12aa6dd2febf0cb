//! Error responses for the Kinship API
//!
//! Every failure renders as `{"error": {"code": ..., "message": ...}}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kinship_core::CoreError;
use serde_json::json;
use tracing::{error, warn};

use crate::error::ServerError;

/// API error wrapping anything a handler can fail with
#[derive(Debug)]
pub struct ApiError(pub ServerError);

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        ApiError(err)
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(ServerError::Core(err))
    }
}

/// Result type for handlers
pub type ApiResult<T> = Result<T, ApiError>;

fn core_status(err: &CoreError) -> (StatusCode, &'static str) {
    match err {
        CoreError::CycleDetected { .. } => (StatusCode::CONFLICT, "ERR_FAMILY_LOOP"),
        CoreError::AlreadyReserved(_) => (StatusCode::CONFLICT, "ERR_PROPOSAL_PENDING"),
        CoreError::ProposalNotFound(_) => (StatusCode::NOT_FOUND, "ERR_PROPOSAL_NOT_FOUND"),
        CoreError::ValidationError(_) => (StatusCode::BAD_REQUEST, "ERR_VALIDATION_ERROR"),
        CoreError::StateStoreError(_) => (StatusCode::SERVICE_UNAVAILABLE, "ERR_STATE_STORE_UNAVAILABLE"),
        CoreError::DurableWriteConflict(_) => (StatusCode::SERVICE_UNAVAILABLE, "ERR_DURABLE_WRITE_CONFLICT"),
        CoreError::ReplicationError(_) => (StatusCode::SERVICE_UNAVAILABLE, "ERR_REPLICATION_UNAVAILABLE"),
        CoreError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "ERR_TIMEOUT"),
        CoreError::SerializationError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ERR_SERIALIZATION_ERROR"),
        CoreError::ConfigurationError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ERR_CONFIG_ERROR"),
        CoreError::Other(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ERR_INTERNAL_SERVER_ERROR"),
    }
}

/// Status and machine-readable code for an error
pub fn classify(err: &ServerError) -> (StatusCode, &'static str) {
    match err {
        ServerError::NotFound(_) => (StatusCode::NOT_FOUND, "ERR_NOT_FOUND"),
        ServerError::ValidationError(_) => (StatusCode::BAD_REQUEST, "ERR_VALIDATION_ERROR"),
        ServerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "ERR_UNAUTHORIZED"),
        ServerError::Core(core) => core_status(core),
        ServerError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ERR_CONFIG_ERROR"),
        ServerError::Io(_) | ServerError::InternalError(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "ERR_INTERNAL_SERVER_ERROR")
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = classify(&self.0);
        let message = self.0.to_string();

        if status.is_server_error() {
            error!(code, error = %message, "Request failed");
        } else {
            warn!(code, error = %message, "Request rejected");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));
        (status, body).into_response()
    }
}
