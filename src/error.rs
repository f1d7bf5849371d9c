use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Precondition failures reported before a run is created.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Evaluation '{0}' not found")]
    EvaluationNotFound(String),

    #[error("Evaluation has no target model assigned")]
    MissingModel,

    #[error("Evaluation has no test cases")]
    NoTestCases,

    #[error("Evaluation has unsaved draft edits; submit a new version first")]
    DirtyDraft,

    #[error("Test case '{0}' not found in evaluation")]
    TestCaseNotFound(String),
}

/// Failures of the model client or attachment resolver.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Transport(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkbenchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] anyhow::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl IntoResponse for WorkbenchError {
    fn into_response(self) -> Response {
        let status = match &self {
            WorkbenchError::Validation(ValidationError::DirtyDraft) => StatusCode::CONFLICT,
            WorkbenchError::Validation(ValidationError::EvaluationNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            WorkbenchError::Validation(ValidationError::TestCaseNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            WorkbenchError::Validation(_) => StatusCode::BAD_REQUEST,
            WorkbenchError::Provider(_) => StatusCode::BAD_GATEWAY,
            WorkbenchError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            WorkbenchError::NotFound(_) => StatusCode::NOT_FOUND,
            WorkbenchError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
