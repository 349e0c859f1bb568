use crate::{error::ClassifierError, response::PredictionResult, state::SharedState};
use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::instrument;

/// Form fields accepted for the uploaded image.
const IMAGE_FIELDS: [&str; 2] = ["image", "file"];

#[derive(Error, Debug)]
pub enum PredictCropError {
    #[error("Invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Missing image file field, expected `image` or `file`")]
    MissingImage,
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error("Prediction task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl IntoResponse for PredictCropError {
    fn into_response(self) -> Response {
        match self {
            PredictCropError::Classifier(err) => err.into_response(),
            PredictCropError::Multipart(ref err) => {
                tracing::warn!("Rejected upload: {}", self);
                // Oversized bodies surface here as 413.
                (err.status(), Json(json!({ "error": self.to_string() }))).into_response()
            }
            PredictCropError::MissingImage => {
                tracing::warn!("Rejected upload: {}", self);
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": self.to_string() })),
                )
                    .into_response()
            }
            PredictCropError::Task(_) => {
                tracing::error!("{}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": self.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

async fn read_image(multipart: &mut Multipart) -> Result<Bytes, PredictCropError> {
    while let Some(field) = multipart.next_field().await? {
        if field
            .name()
            .is_some_and(|name| IMAGE_FIELDS.contains(&name))
        {
            return Ok(field.bytes().await?);
        }
    }
    Err(PredictCropError::MissingImage)
}

#[instrument(skip(state, multipart))]
pub async fn predict_crop(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Response, PredictCropError> {
    if !state.model_loaded() {
        return Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(state.model_not_loaded()),
        )
            .into_response());
    }

    let image_data = read_image(&mut multipart).await?;
    tracing::debug!("Received image of {} bytes", image_data.len());

    let worker_state = state.clone();
    let prediction: PredictionResult =
        tokio::task::spawn_blocking(move || worker_state.classify(&image_data)).await??;

    tracing::info!(
        "Predicted {} with confidence {:.3} (unknown: {})",
        prediction.predicted_class,
        prediction.confidence,
        prediction.is_unknown
    );

    Ok(Json(prediction).into_response())
}
