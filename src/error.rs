use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failure talking to the backing list store.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker operation timed out after {0} ms")]
    Timeout(u64),
    #[error("broker command failed: {0}")]
    Command(String),
}

impl BrokerError {
    pub fn is_connection_error(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_) | BrokerError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("connection error: {0}")]
    Connection(BrokerError),
    /// The broker was reachable but rejected the command.
    #[error("{0}")]
    Broker(BrokerError),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("processing error: {0}")]
    Processing(String),
    #[error("recovery stopped after {attempts} consecutive failed cycles: {last_error}")]
    RecoveryExhausted { attempts: u32, last_error: String },
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error("unknown queue category: {0}")]
    UnknownCategory(String),
    #[error("spillover store error: {0}")]
    Spillover(String),
    #[error("pipeline is shutting down")]
    Shutdown,
}

impl From<BrokerError> for PipelineError {
    fn from(err: BrokerError) -> Self {
        if err.is_connection_error() {
            PipelineError::Connection(err)
        } else {
            PipelineError::Broker(err)
        }
    }
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Connection(_) | PipelineError::Processing(_))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match &err {
            PipelineError::Validation(_) | PipelineError::UnknownCategory(_) => {
                AppError::bad_request(err.to_string())
            }
            _ => {
                tracing::error!(error = %err, "pipeline error");
                AppError::unavailable(err.to_string())
            }
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
