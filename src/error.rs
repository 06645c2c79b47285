//! Error taxonomy for ingestion and question answering.
//!
//! | Variant | Raised when | Effect |
//! |---------|-------------|--------|
//! | [`Validation`](RagError::Validation) | malformed request or source config | rejected before any work |
//! | [`UnknownDataSource`](RagError::UnknownDataSource) | id does not exist | rejected before any work |
//! | [`Connection`](RagError::Connection) | connector cannot reach its source | sync ends in `error` |
//! | [`Conflict`](RagError::Conflict) | sync already running for the source | rejected at job start |
//! | [`ModelService`](RagError::ModelService) | embedding or LLM backend failed | sync aborts; retrieval degrades |
//! | [`Generation`](RagError::Generation) | answer stream failed mid-way | terminal `error` event |
//! | [`Internal`](RagError::Internal) | storage or other unexpected failure | 500 |

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("data source {0} not found")]
    UnknownDataSource(i64),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("model service error: {0}")]
    ModelService(String),

    #[error("generation error: {0}")]
    Generation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type RagResult<T> = Result<T, RagError>;

impl RagError {
    pub fn validation(msg: impl Into<String>) -> Self {
        RagError::Validation(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        RagError::Connection(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        RagError::ModelService(msg.into())
    }

    /// Short machine-readable code, used in HTTP error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "bad_request",
            RagError::UnknownDataSource(_) => "not_found",
            RagError::Connection(_) => "connection_error",
            RagError::Conflict(_) => "conflict",
            RagError::ModelService(_) => "model_service_error",
            RagError::Generation(_) => "generation_error",
            RagError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for RagError {
    fn from(e: sqlx::Error) -> Self {
        RagError::Internal(e.into())
    }
}
