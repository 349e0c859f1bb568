use crate::state::SharedState;
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Health {
    status: String,
    device: String,
    model_loaded: bool,
    model_path: String,
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    Json(Health {
        status: "ok".into(),
        device: state.device().to_string(),
        model_loaded: state.model_loaded(),
        model_path: state.model_path().display().to_string(),
    })
}
