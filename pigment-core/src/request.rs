use image::DynamicImage;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{codec, GenerationError, ModelVariant};

pub const DEFAULT_HEIGHT: usize = 512;
pub const DEFAULT_WIDTH: usize = 512;
pub const DEFAULT_STEPS: usize = 20;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;
pub const DEFAULT_STRENGTH: f64 = 0.8;
/// Largest accepted height or width.
pub const MAX_DIMENSION: usize = 2048;

/// The wire request accepted by `POST /generate`, identical for every variant.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Base64 encoded image for img2img or visual models.
    #[serde(default, alias = "init_image")]
    pub init_image_b64: Option<String>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub height: Option<usize>,
    #[serde(default)]
    pub width: Option<usize>,
    #[serde(default)]
    pub num_inference_steps: Option<usize>,
    #[serde(default)]
    pub guidance_scale: Option<f64>,
    /// Only used by img2img.
    #[serde(default)]
    pub strength: Option<f64>,
    /// Negative seeds are accepted and reinterpreted as their two's complement bits.
    #[serde(default, deserialize_with = "signed_or_unsigned_seed")]
    pub seed: Option<u64>,
}

fn signed_or_unsigned_seed<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seed {
        Unsigned(u64),
        Signed(i64),
    }

    Ok(Option::<Seed>::deserialize(deserializer)?.map(|seed| match seed {
        Seed::Unsigned(seed) => seed,
        Seed::Signed(seed) => seed as u64,
    }))
}

/// A request whose fields satisfy the active variant, with defaults applied and
/// the init image (if the variant consumes one) already decoded.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub(crate) input: VariantInput,
    pub(crate) prompt: String,
    pub(crate) negative_prompt: Option<String>,
    pub(crate) height: usize,
    pub(crate) width: usize,
    pub(crate) steps: usize,
    pub(crate) guidance_scale: f64,
    pub(crate) seed: Option<u64>,
}

/// The variant-specific part of a validated request.
#[derive(Debug, Clone)]
pub(crate) enum VariantInput {
    TextToImage,
    ImageToImage { image: DynamicImage, strength: f64 },
    Captioning { image: DynamicImage },
}

impl ValidatedRequest {
    pub fn variant(&self) -> ModelVariant {
        match self.input {
            VariantInput::TextToImage => ModelVariant::TextToImage,
            VariantInput::ImageToImage { .. } => ModelVariant::ImageToImage,
            VariantInput::Captioning { .. } => ModelVariant::CaptioningVL,
        }
    }

    pub fn init_image(&self) -> Option<&DynamicImage> {
        match &self.input {
            VariantInput::TextToImage => None,
            VariantInput::ImageToImage { image, .. } | VariantInput::Captioning { image } => {
                Some(image)
            }
        }
    }
}

/// Check `req` against what `variant` needs. Runs before any model call, so a bad
/// request never costs an inference.
pub fn validate(
    req: GenerationRequest,
    variant: ModelVariant,
) -> Result<ValidatedRequest, GenerationError> {
    let init_image = if variant.requires_init_image() {
        let b64 = req
            .init_image_b64
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(GenerationError::MissingRequiredImage { variant })?;
        Some(codec::decode(b64)?)
    } else {
        None
    };

    let height = dimension("height", req.height.unwrap_or(DEFAULT_HEIGHT))?;
    let width = dimension("width", req.width.unwrap_or(DEFAULT_WIDTH))?;

    let steps = req.num_inference_steps.unwrap_or(DEFAULT_STEPS);
    if steps == 0 {
        return Err(invalid("num_inference_steps", "must be at least 1"));
    }

    let guidance_scale = req.guidance_scale.unwrap_or(DEFAULT_GUIDANCE_SCALE);
    if !guidance_scale.is_finite() || guidance_scale < 0.0 {
        return Err(invalid("guidance_scale", "must be a non-negative number"));
    }

    let input = match (variant, init_image) {
        (ModelVariant::ImageToImage, Some(image)) => {
            let strength = req.strength.unwrap_or(DEFAULT_STRENGTH);
            if !(0.0..=1.0).contains(&strength) {
                return Err(invalid("strength", "must be between 0 and 1"));
            }
            VariantInput::ImageToImage { image, strength }
        }
        (ModelVariant::CaptioningVL, Some(image)) => VariantInput::Captioning { image },
        _ => VariantInput::TextToImage,
    };

    Ok(ValidatedRequest {
        input,
        prompt: req.prompt,
        negative_prompt: req.negative_prompt,
        height,
        width,
        steps,
        guidance_scale,
        seed: req.seed,
    })
}

fn dimension(field: &'static str, value: usize) -> Result<usize, GenerationError> {
    if value == 0 || value % 8 != 0 {
        return Err(invalid(field, "must be a positive multiple of 8"));
    }
    if value > MAX_DIMENSION {
        return Err(GenerationError::InvalidParameter {
            field,
            reason: format!("must be at most {MAX_DIMENSION}"),
        });
    }
    Ok(value)
}

fn invalid(field: &'static str, reason: &str) -> GenerationError {
    GenerationError::InvalidParameter {
        field,
        reason: reason.to_string(),
    }
}
