// ABOUTME: API error type mapped to HTTP statuses and machine-readable codes
// ABOUTME: Internal failures are logged with a request id and sanitized before leaving the server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hatchery_core::StoreError;
use hatchery_provisioner::ProvisionError;
use hatchery_sandbox::{FactoryError, ManagerError, ProviderError};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized access")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("A compute target named '{0}' already exists")]
    DuplicateTarget(String),

    #[error("Version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("{0}")]
    AlreadyResolved(String),

    #[error("{0}")]
    InUse(String),

    #[error("Inspection failed: {0}")]
    InspectFailed(String),

    #[error("Compute target unavailable: {0}")]
    TargetUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: ErrorDetail,
    request_id: String,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::DuplicateTarget(_) => (StatusCode::CONFLICT, "DUPLICATE_TARGET"),
            ApiError::VersionConflict { .. } => (StatusCode::CONFLICT, "VERSION_CONFLICT"),
            ApiError::AlreadyResolved(_) => (StatusCode::CONFLICT, "ALREADY_RESOLVED"),
            ApiError::InUse(_) => (StatusCode::CONFLICT, "VOLUME_IN_USE"),
            ApiError::InspectFailed(_) => (StatusCode::BAD_GATEWAY, "INSPECT_FAILED"),
            ApiError::TargetUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "TARGET_UNAVAILABLE")
            }
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    fn user_message(&self) -> String {
        match self {
            ApiError::Unauthorized => "Authentication required".to_string(),
            ApiError::Internal(_) => "An internal server error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let (status, code) = self.status_and_code();

        if status.is_server_error() {
            error!(request_id = %request_id, code, error = %self, "Request failed");
        } else {
            warn!(request_id = %request_id, code, error = %self, "Request rejected");
        }

        let body = ErrorResponse {
            success: false,
            error: ErrorDetail {
                code,
                message: self.user_message(),
            },
            request_id,
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::Duplicate { key, .. } => ApiError::DuplicateTarget(key),
            StoreError::VersionConflict { expected, actual } => {
                ApiError::VersionConflict { expected, actual }
            }
            StoreError::InUse { .. } => ApiError::InUse(err.to_string()),
            StoreError::AlreadyResolved(_) => ApiError::AlreadyResolved(err.to_string()),
            StoreError::Backend(message) => ApiError::Internal(message),
        }
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::Storage(e) => e.into(),
            ManagerError::Provider(ProviderError::VolumeInUse(volume)) => {
                ApiError::InUse(format!("Volume {} is in use by a running container", volume))
            }
            ManagerError::Provider(e) => ApiError::TargetUnavailable(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<FactoryError> for ApiError {
    fn from(err: FactoryError) -> Self {
        ApiError::TargetUnavailable(err.to_string())
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::InvalidConfig(message) => ApiError::Validation(message),
            ProvisionError::UnknownAgent(agent) => {
                ApiError::Validation(format!("Unknown agent: {}", agent))
            }
            ProvisionError::Storage(e) => e.into(),
            ProvisionError::Sandbox(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_of(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_conflict_codes() {
        let (status, body) = body_of(StoreError::VersionConflict { expected: 2, actual: 3 }.into()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "VERSION_CONFLICT");
        assert!(body["request_id"].is_string());
    }

    #[tokio::test]
    async fn test_internal_errors_are_sanitized() {
        let (status, body) = body_of(ApiError::Internal("disk /dev/sda1 full".to_string())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["message"], "An internal server error occurred");
    }
}
