use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    response::IntoResponse,
};
use pigment_core::{GenerationError, GenerationRequest, ModelContext, ModelVariant};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::response::{ApiError, GenerationResponse};

// Application state: the model context, fully loaded (or failed) before serving.
#[derive(Clone)]
pub struct AppState(pub Arc<ModelContext>);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub device: String,
    pub model_id: String,
    pub model_type: Option<ModelVariant>,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let ctx = &state.0;
    Json(HealthResponse {
        status: "ok".to_string(),
        device: ctx.device().to_string(),
        model_id: ctx.model_id().to_string(),
        model_type: ctx.variant(),
        state: ctx.state().name().to_string(),
        error: ctx.failure().map(str::to_string),
    })
}

pub async fn generate_image_handler(
    State(state): State<AppState>,
    body: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let Json(req) = body?;
    info!(
        "Received generation request (prompt: {} chars, init image: {})",
        req.prompt.len(),
        req.init_image_b64.is_some()
    );

    // Inference blocks; keep it off the async workers.
    let ctx = state.0.clone();
    let image = tokio::task::spawn_blocking(move || pigment_core::generate(&ctx, req))
        .await
        .map_err(|e| {
            error!("Generation task did not complete: {e}");
            GenerationError::GenerationFailed(format!("generation task did not complete: {e}"))
        })??;

    Ok(Json(GenerationResponse::from_image(&image)?))
}
