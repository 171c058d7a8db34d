use image::DynamicImage;
use tracing::{debug, error, warn};

use crate::{
    context::{LoadedModel, ModelContext},
    params::{assemble, Payload},
    request::validate,
    GenerationError, GenerationRequest, ModelOutput, ModelVariant,
};

/// Validate, assemble and run one request against the served model.
///
/// Validation and image decoding happen before the model is touched.
pub fn generate(ctx: &ModelContext, req: GenerationRequest) -> Result<DynamicImage, GenerationError> {
    let model = ctx.loaded().ok_or(GenerationError::ModelNotReady)?;
    let validated = validate(req, model.variant())?;
    dispatch(model, assemble(validated))
}

/// Route an assembled payload to the model and normalize what comes back.
pub fn dispatch(model: &LoadedModel, payload: Payload) -> Result<DynamicImage, GenerationError> {
    let variant = payload.variant();
    let kind = payload.kind();
    debug!("Dispatching {kind} request");

    let output = model.invoke(payload).map_err(|e| {
        error!("An error occurred during {kind} generation: {e:#}");
        GenerationError::GenerationFailed(format!("{e:#}"))
    })?;

    match (variant, output) {
        (ModelVariant::CaptioningVL, output) => {
            if let ModelOutput::Text(text) = &output {
                debug!("Caption: {text}");
            }
            warn!("Captioning model generated a text response, not an image. This endpoint only returns images.");
            Err(GenerationError::UnsupportedOutputModality { variant })
        }
        (_, ModelOutput::Images(images)) => images.into_iter().next().ok_or_else(|| {
            GenerationError::GenerationFailed("Image could not be generated.".to_string())
        }),
        (_, ModelOutput::Text(_)) => Err(GenerationError::GenerationFailed(format!(
            "{kind} model returned text instead of an image"
        ))),
    }
}
