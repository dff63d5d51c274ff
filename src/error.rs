use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("GPIO chip not initialized")]
    ChipNotInitialized,
    #[error("Error opening GPIO chip: {0}")]
    ChipOpen(String),
    #[error("GPIO initialization cancelled")]
    Cancelled,
    #[error("Invalid direction {0:?}, use 'in' or 'out'")]
    InvalidDirection(String),
    #[error("Invalid active state {0:?}, use 'low' or 'high'")]
    InvalidActiveState(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Error requesting line for pin {pin}: {reason}")]
    LineRequest { pin: u32, reason: String },
    #[error("Error reading pin {pin} value: {reason}")]
    ReadBack { pin: u32, reason: String },
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Tool not found: {0}")]
    ToolNotFound(String),
    #[error("Error executing {tool}: {reason}")]
    Execution { tool: String, reason: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Error encoding response: {0}")]
    Encode(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
}

impl AppError {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AppError::InvalidDirection(_) | AppError::InvalidActiveState(_) | AppError::InvalidValue(_)
        )
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        if self.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
