//! Error types for the HTTP layer

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::io;
use thiserror::Error;

use crate::configuration::ConfigurationError;
use crate::pdf::PdfError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl From<PdfError> for AppError {
    fn from(err: PdfError) -> Self {
        AppError::Store(StoreError::Pdf(err))
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("background task failed: {}", err))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

const INTERNAL: (StatusCode, &str) = (StatusCode::INTERNAL_SERVER_ERROR, "internal_error");

fn pdf_parts(err: &PdfError) -> (StatusCode, &'static str) {
    match err {
        PdfError::IncorrectPassword => (StatusCode::BAD_REQUEST, "incorrect_password"),
        PdfError::PasswordProtected => (StatusCode::BAD_REQUEST, "password_protected"),
        PdfError::Corrupted(_) => (StatusCode::BAD_REQUEST, "corrupted_document"),
        PdfError::PageOutOfRange { .. } => (StatusCode::NOT_FOUND, "not_found"),
        PdfError::LastPage | PdfError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        PdfError::Image(_) => (StatusCode::BAD_REQUEST, "invalid_image"),
        PdfError::Io(e) if e.kind() == io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "not_found")
        }
        PdfError::Io(_)
        | PdfError::Unlock(_)
        | PdfError::Render(_)
        | PdfError::Lopdf(_) => INTERNAL,
    }
}

impl AppError {
    /// Status and machine readable error code.
    pub fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Internal(_) | AppError::Configuration(_) => INTERNAL,
            AppError::Store(e) => match e {
                StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                StoreError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
                StoreError::Validation(_) => (StatusCode::BAD_REQUEST, "bad_request"),
                StoreError::Io(e) if e.kind() == io::ErrorKind::NotFound => {
                    (StatusCode::NOT_FOUND, "not_found")
                }
                StoreError::Pdf(e) => pdf_parts(e),
                StoreError::Io(_) | StoreError::Journal(_) => INTERNAL,
            },
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.classify().0
    }

    /// Message safe to hand to clients. Server side failures get a generic one.
    pub fn public_message(&self) -> String {
        if self.status_code() == StatusCode::INTERNAL_SERVER_ERROR {
            return "An internal error occurred".to_string();
        }
        match self {
            AppError::NotFound(msg) | AppError::BadRequest(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.classify();

        let details = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("{}", self);
            cfg!(debug_assertions).then(|| self.to_string())
        } else {
            tracing::debug!("request failed with {}: {}", status, self);
            None
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.public_message(),
            details,
        };

        (status, Json(body)).into_response()
    }
}
