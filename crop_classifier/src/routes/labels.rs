use crate::state::SharedState;
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct ClassLabels {
    labels: Vec<String>,
}

pub async fn class_labels(State(state): State<SharedState>) -> impl IntoResponse {
    Json(ClassLabels {
        labels: state.labels().to_vec(),
    })
}
