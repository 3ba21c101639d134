use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use nickel_contracts::{ErrorBody, ErrorResponse};
use thiserror::Error;

use crate::confirmation::StoreError;
use crate::dispatch::ToolError;
use crate::pipeline::PipelineError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("message is required")]
    MissingMessage,
    #[error("action_id is required")]
    MissingActionId,
    #[error("request body rejected: {0}")]
    InvalidRequest(String),
    #[error("tool {0} is not supported")]
    UnsupportedTool(String),
    #[error("audit log unavailable: {0}")]
    Audit(String),
    #[error("request task failed: {0}")]
    Interrupted(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingMessage
            | ApiError::MissingActionId
            | ApiError::InvalidRequest(_)
            | ApiError::UnsupportedTool(_) => StatusCode::BAD_REQUEST,
            ApiError::Audit(_) | ApiError::Interrupted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Pipeline(PipelineError::Configuration(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Pipeline(_) => StatusCode::BAD_GATEWAY,
            ApiError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::ConfirmationRequired) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Tool(ToolError::NotImplemented(_)) => StatusCode::NOT_IMPLEMENTED,
            ApiError::Tool(ToolError::ConfirmationRequired(_)) => StatusCode::BAD_REQUEST,
            ApiError::Tool(ToolError::Handler { status, .. }) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    pub fn code(&self) -> String {
        match self {
            ApiError::MissingMessage => "missing_message".to_string(),
            ApiError::MissingActionId => "missing_action_id".to_string(),
            ApiError::InvalidRequest(_) => "invalid_request".to_string(),
            ApiError::UnsupportedTool(_) => "unsupported_tool".to_string(),
            ApiError::Audit(_) => "audit_unavailable".to_string(),
            ApiError::Interrupted(_) => "internal_error".to_string(),
            ApiError::Pipeline(PipelineError::Configuration(_)) => "llm_not_configured".to_string(),
            ApiError::Pipeline(PipelineError::Upstream(_)) => "llm_request_failed".to_string(),
            ApiError::Pipeline(PipelineError::Decode(_)) => "llm_bad_response".to_string(),
            ApiError::Store(StoreError::NotFound) => "pending_action_not_found".to_string(),
            ApiError::Store(StoreError::ConfirmationRequired) => "confirmation_required".to_string(),
            ApiError::Store(_) => "pending_store_error".to_string(),
            ApiError::Tool(err) => err.code(),
        }
    }

    /// Client-facing text. Upstream and storage details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ApiError::MissingMessage => "message is required.".to_string(),
            ApiError::MissingActionId => "action_id is required.".to_string(),
            ApiError::InvalidRequest(_) => "Request body must be a JSON object.".to_string(),
            ApiError::UnsupportedTool(tool) => format!("Tool {tool} is not supported."),
            ApiError::Audit(_) => "Audit log is unavailable.".to_string(),
            ApiError::Interrupted(_) => "Request could not be completed.".to_string(),
            ApiError::Pipeline(PipelineError::Configuration(field)) => {
                format!("LLM {field} is not configured.")
            }
            ApiError::Pipeline(PipelineError::Upstream(_)) => "Failed to call LLM.".to_string(),
            ApiError::Pipeline(PipelineError::Decode(_)) => {
                "LLM response could not be understood.".to_string()
            }
            ApiError::Store(StoreError::NotFound) => "Pending action not found.".to_string(),
            ApiError::Store(StoreError::ConfirmationRequired) => {
                "Explicit confirmation is required.".to_string()
            }
            ApiError::Store(_) => "Pending action store is unavailable.".to_string(),
            ApiError::Tool(err) => err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = %self.code(), "request failed: {self}");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message: self.public_message(),
            },
        };
        (status, Json(body)).into_response()
    }
}
