use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Model not loaded. Please check model path.")]
    ModelUnavailable,
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Weights do not fit the model architecture: {0}")]
    ShapeMismatch(String),
    #[error("Missing parameter `{0}` in weights file")]
    MissingParameter(String),
    #[error("Failed to read checkpoint: {0}")]
    Checkpoint(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Failed to load labels: {0}")]
    Labels(String),
}

impl ClassifierError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClassifierError::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ClassifierError::Decode(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<candle_core::Error> for ClassifierError {
    fn from(err: candle_core::Error) -> Self {
        ClassifierError::Inference(err.to_string())
    }
}

impl From<ort::Error> for ClassifierError {
    fn from(err: ort::Error) -> Self {
        ClassifierError::Inference(err.to_string())
    }
}

impl IntoResponse for ClassifierError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::warn!("Rejected request: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type ClassifierResult<T> = Result<T, ClassifierError>;
