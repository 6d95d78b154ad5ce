use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::types::ChatStatus;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error("duplicate event ignored")]
    Duplicate,

    #[error("cannot {action} conversation {id} while it is {from}")]
    InvalidTransition {
        id: String,
        from: ChatStatus,
        action: &'static str,
    },

    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl ChatError {
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation",
            ChatError::NotFound(_) => "not_found",
            ChatError::Duplicate => "duplicate",
            ChatError::InvalidTransition { .. } => "invalid_transition",
            ChatError::Delivery(_) => "delivery",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Duplicate => StatusCode::OK,
            ChatError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ChatError::Delivery(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(json!({ "error": self.to_string(), "kind": self.kind() })),
        )
            .into_response()
    }
}
