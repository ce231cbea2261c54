use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fleetfw_domain::{ErrorKind, UpdateError};
use serde_json::json;

pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn unprocessable(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::UNPROCESSABLE_ENTITY, message: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::NOT_FOUND, message: msg.into() }
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

impl From<fleetfw_store::StoreError> for ApiError {
    fn from(e: fleetfw_store::StoreError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<UpdateError> for ApiError {
    fn from(e: UpdateError) -> Self {
        match e.kind {
            ErrorKind::Validation => ApiError::unprocessable(e.to_string()),
            ErrorKind::Auth => ApiError { status: StatusCode::BAD_GATEWAY, message: e.to_string() },
            _ => ApiError::internal(e.to_string()),
        }
    }
}
