use axum::{http::StatusCode, response::{IntoResponse, Response}};
use std::error::Error;

/// Why an inbound request body was refused.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("request body is empty")]
    EmptyBody,
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("request body has no non-empty token")]
    MissingToken,
}

/// Every way a request to the CV endpoint can fail.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    InvalidInput(#[from] InputError),
    #[error("{0} is not configured")]
    Misconfigured(&'static str),
    #[error("verification service unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("verification service sent an unreadable reply: {0}")]
    UpstreamMalformed(#[source] serde_json::Error),
    #[error("token rejected by verification service (error codes: {0:?})")]
    Rejected(Vec<String>),
    #[error("blob {blob} not found in container {container}")]
    NotFound { container: String, blob: String },
    #[error("{0}")]
    Internal(Box<dyn Error + Send + Sync>),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::Misconfigured(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::UpstreamUnavailable(_) | AppError::UpstreamMalformed(_) => StatusCode::BAD_GATEWAY,
            AppError::Rejected(_) => StatusCode::FORBIDDEN,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text sent to the caller. Details stay in the server log.
    pub fn public_message(&self) -> &'static str {
        match self {
            AppError::InvalidInput(InputError::EmptyBody) => "Request body is required.",
            AppError::InvalidInput(InputError::InvalidJson(_)) => "Request body must be valid JSON.",
            AppError::InvalidInput(InputError::MissingToken) => "A non-empty token is required.",
            AppError::Misconfigured(_) => "Server is not configured correctly.",
            AppError::UpstreamUnavailable(_) => "Verification service is unavailable.",
            AppError::UpstreamMalformed(_) => "Verification service returned an invalid response.",
            AppError::Rejected(_) => "Verification failed.",
            AppError::NotFound { .. } => "Document not found.",
            AppError::Internal(_) => INTERNAL_ERROR_MESSAGE,
        }
    }
}

pub const INTERNAL_ERROR_MESSAGE: &str = "Something went wrong.";

// Tell axum how to convert `AppError` into a response.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        } else {
            tracing::warn!("{}", self);
        }
        (status, self.public_message()).into_response()
    }
}

impl From<azure_core::Error> for AppError {
    fn from(err: azure_core::Error) -> Self {
        Self::Internal(Box::new(err))
    }
}
