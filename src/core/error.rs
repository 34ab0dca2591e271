use crate::core::model::{ErrorCategory, ErrorDetail};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Server(String),
}

impl OrchestratorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(id: &str) -> Self {
        Self::NotFound(format!("download {} not found", id))
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Server(_) => "SERVER_ERROR",
        }
    }

    /// Record-side view of an OS-level failure.
    pub fn server_detail(message: impl Into<String>, source: &str) -> ErrorDetail {
        ErrorDetail {
            original_message: message.into(),
            parsed_type: ErrorCategory::ServerError,
            source: source.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
