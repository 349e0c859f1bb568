mod health;
mod labels;
mod predict;

use crate::state::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub use health::healthcheck;
pub use labels::class_labels;
pub use predict::predict_crop;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/labels", get(class_labels))
        .route("/predict-crop", post(predict_crop))
}
