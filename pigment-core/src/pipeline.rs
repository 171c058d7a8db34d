use image::DynamicImage;

use crate::{params::Payload, ModelError};

/// What a model call produced.
#[derive(Debug, Clone)]
pub enum ModelOutput {
    Images(Vec<DynamicImage>),
    Text(String),
}

/// The model-invocation boundary: a loaded model that turns one payload into one output.
///
/// Calls take `&mut self`; callers serialize access (candle models carry KV caches
/// and other per-call state).
pub trait Pipeline: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn run(&mut self, payload: Payload) -> Result<ModelOutput, ModelError>;

    /// Whether a memory-efficient attention implementation can be switched on.
    fn supports_memory_efficient_attention(&self) -> bool {
        false
    }

    fn enable_memory_efficient_attention(&mut self) -> Result<(), ModelError> {
        Err(ModelError::Runtime(anyhow::anyhow!(
            "{} does not support memory-efficient attention",
            self.name()
        )))
    }
}

impl ModelError {
    pub(crate) fn unsupported(pipeline: &'static str, payload: &Payload) -> Self {
        ModelError::UnsupportedPayload {
            pipeline,
            payload: payload.kind(),
        }
    }
}
