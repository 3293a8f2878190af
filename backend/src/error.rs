use std::path::PathBuf;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

pub const DOWNLOAD_ERROR_MESSAGE: &str = "Invalid URL or download error";

/// Failures reported by an [`AudioExtractor`](crate::extractor::AudioExtractor).
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The tool ran and rejected the URL or failed to fetch it.
    #[error("{0}")]
    Download(String),
    #[error("{0}")]
    ToolMissing(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("File at path {} does not exist.", .0.display())]
    MissingOutput(PathBuf),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<ExtractionError> for ApiError {
    fn from(error: ExtractionError) -> Self {
        match error {
            ExtractionError::Download(detail) => {
                warn!("Download error: {detail}");
                ApiError::bad_request(DOWNLOAD_ERROR_MESSAGE)
            }
            other => {
                error!("Error during audio extraction: {other}");
                ApiError::internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });

        (self.status, body).into_response()
    }
}
