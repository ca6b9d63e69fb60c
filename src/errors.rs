use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failures of the HTTP surface itself. Backend failures never reach this type; the failover
/// controller turns them into advisory replies.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(message) => {
                make_error_response(StatusCode::BAD_REQUEST, "invalid_request_error", message)
            }
            AppError::Internal(message) => {
                make_error_response(StatusCode::INTERNAL_SERVER_ERROR, "server_error", message)
            }
        }
    }
}

fn make_error_response(status: StatusCode, error_type: &str, message: String) -> Response {
    let payload = ErrorEnvelope {
        error: ErrorBody {
            message,
            error_type: error_type.to_owned(),
        },
    };

    (status, Json(payload)).into_response()
}
