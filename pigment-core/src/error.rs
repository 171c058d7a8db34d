use thiserror::Error;

use crate::ModelVariant;

/// Failure classes a generation request can end in.
///
/// Each kind maps to exactly one HTTP status at the transport boundary.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Invalid base64 image format.")]
    InvalidImageEncoding(#[from] InvalidImageEncoding),

    #[error("{variant} model requires an initial image (init_image_b64).")]
    MissingRequiredImage { variant: ModelVariant },

    #[error("Invalid parameter `{field}`: {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    #[error("Model not loaded or invalid model type.")]
    ModelNotReady,

    #[error("Image generation for {variant} not implemented, only text response.")]
    UnsupportedOutputModality { variant: ModelVariant },

    #[error("Generation failed: {0}")]
    GenerationFailed(String),
}

/// A transport string that is not a base64-encoded raster image.
#[derive(Debug, Error)]
pub enum InvalidImageEncoding {
    #[error("not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("not a readable image: {0}")]
    Image(#[from] image::ImageError),
}

/// Failure returned by the model-invocation boundary.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("{pipeline} pipeline cannot run a {payload} payload")]
    UnsupportedPayload {
        pipeline: &'static str,
        payload: &'static str,
    },
    #[error("model panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl From<candle_core::Error> for ModelError {
    fn from(e: candle_core::Error) -> Self {
        ModelError::Runtime(e.into())
    }
}
