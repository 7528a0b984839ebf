use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::entitlements::{RankingError, StoreError, WebhookError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("webhook rejected: {0}")]
    Webhook(#[from] WebhookError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(account_id) => AppError::NotFound(account_id),
            StoreError::Conflict(account_id) => AppError::Conflict(account_id),
            other => AppError::Store(other),
        }
    }
}

impl From<RankingError> for AppError {
    fn from(err: RankingError) -> Self {
        match err {
            RankingError::UnknownAccount(account_id) => AppError::NotFound(account_id),
            RankingError::Store(err) => err.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Webhook(WebhookError::InvalidSignature) => StatusCode::UNAUTHORIZED,
            AppError::Webhook(
                WebhookError::MalformedPayload(_)
                | WebhookError::UnrecognizedAmount { .. }
                | WebhookError::MissingAccount,
            ) => StatusCode::BAD_REQUEST,
            AppError::Webhook(WebhookError::PersistenceFailure(_)) | AppError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        tracing::error!(?self);
        let body = match &self {
            // Signature failures and storage faults carry no detail to the caller.
            AppError::Webhook(WebhookError::InvalidSignature) => "invalid signature".to_string(),
            AppError::Webhook(WebhookError::PersistenceFailure(_)) | AppError::Store(_) => {
                "temporarily unavailable".to_string()
            }
            other => other.to_string(),
        };
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
