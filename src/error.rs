use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::extract::ExtractionError;
use crate::relay::StreamError;

/// Rejected request input. Always a 400.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid request body: {0}")]
    Body(String),
    #[error("Missing url")]
    MissingUrl,
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Domain not allowed")]
    DomainNotAllowed,
    #[error("Missing format_id")]
    MissingFormatId,
    #[error("Unknown format_id {0:?} for this URL")]
    UnknownFormat(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Extraction(e) => match e {
                ExtractionError::Unsupported(_) | ExtractionError::Unavailable(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                ExtractionError::Timeout(_)
                | ExtractionError::Launch(_)
                | ExtractionError::ToolFailed(_)
                | ExtractionError::InvalidOutput(_) => StatusCode::BAD_GATEWAY,
            },
            ApiError::Stream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({"detail": self.to_string()}))).into_response()
    }
}
