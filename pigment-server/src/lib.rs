pub mod config;
pub mod handlers;
pub mod response;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use pigment_core::ModelContext;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use handlers::AppState;

/// Request body cap; leaves room for a full-resolution base64 init image.
pub const MAX_REQUEST_BYTES: usize = 32 * 1024 * 1024;

/// Build the axum router around an already loaded (or failed) model context.
pub fn router(context: Arc<ModelContext>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/generate", post(handlers::generate_image_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState(context))
}
