use std::error::Error as _;

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pigment_core::{codec, image::DynamicImage, GenerationError};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GenerationResponse {
    /// Base64 encoded PNG.
    pub image: String,
}

impl GenerationResponse {
    pub fn from_image(image: &DynamicImage) -> Result<Self, ApiError> {
        let image = codec::encode(image).map_err(|e| {
            GenerationError::GenerationFailed(format!("could not encode result image: {e}"))
        })?;
        Ok(Self { image })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub detail: String,
}

/// An error on its way out to the client.
#[derive(Debug)]
pub enum ApiError {
    Generation(GenerationError),
    /// The body could not be read as a [`pigment_core::GenerationRequest`].
    Body(JsonRejection),
}

impl From<GenerationError> for ApiError {
    fn from(e: GenerationError) -> Self {
        ApiError::Generation(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::Body(e)
    }
}

pub fn status_for(error: &GenerationError) -> StatusCode {
    match error {
        GenerationError::InvalidImageEncoding(_)
        | GenerationError::MissingRequiredImage { .. }
        | GenerationError::InvalidParameter { .. } => StatusCode::BAD_REQUEST,
        GenerationError::ModelNotReady => StatusCode::SERVICE_UNAVAILABLE,
        GenerationError::UnsupportedOutputModality { .. } => StatusCode::NOT_IMPLEMENTED,
        GenerationError::GenerationFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            ApiError::Generation(e) => {
                let status = status_for(e);
                if status.is_client_error() {
                    warn!("Rejected generation request: {}", error_chain(e));
                }
                (status, e.to_string())
            }
            ApiError::Body(rejection) => {
                warn!("Rejected request body: {rejection}");
                (rejection.status(), rejection.body_text())
            }
        };
        (status, Json(ErrorResponse { detail })).into_response()
    }
}

fn error_chain(error: &GenerationError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
