//! Variant-specific call parameters built from a validated request.

use candle_core::{Device, Shape, Tensor};
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    request::{ValidatedRequest, VariantInput},
    ModelVariant,
};

/// Seed-derived source of the initial noise, fixing the sampling trajectory.
///
/// Backends draw every random tensor of a seeded request from here instead of the
/// device RNG, so the result does not depend on device seeding support.
#[derive(Debug, Clone)]
pub struct SeededGenerator {
    seed: u64,
    rng: StdRng,
}

impl SeededGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Standard-normal f32 tensor of the given shape (Box-Muller).
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, device: &Device) -> candle_core::Result<Tensor> {
        let shape = shape.into();
        let n = shape.elem_count();
        let mut data = Vec::with_capacity(n);
        while data.len() < n {
            // 1 - [0, 1) keeps u1 away from zero.
            let u1: f32 = 1.0 - self.rng.random::<f32>();
            let u2: f32 = self.rng.random::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            data.push(r * theta.cos());
            if data.len() < n {
                data.push(r * theta.sin());
            }
        }
        Tensor::from_vec(data, shape, device)
    }
}

/// Draw standard-normal noise, seeded when a generator is present.
pub fn sample_noise<S: Into<Shape>>(
    generator: Option<&mut SeededGenerator>,
    shape: S,
    device: &Device,
) -> candle_core::Result<Tensor> {
    match generator {
        Some(generator) => generator.randn(shape, device),
        None => Tensor::randn(0f32, 1f32, shape, device),
    }
}

#[derive(Debug, Clone)]
pub struct TextToImagePayload {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub height: usize,
    pub width: usize,
    pub steps: usize,
    pub guidance_scale: f64,
    pub generator: Option<SeededGenerator>,
}

/// Output resolution follows `image`; requested height/width do not apply.
#[derive(Debug, Clone)]
pub struct ImageToImagePayload {
    pub prompt: String,
    pub image: DynamicImage,
    pub strength: f64,
    pub steps: usize,
    pub guidance_scale: f64,
    pub negative_prompt: Option<String>,
    pub generator: Option<SeededGenerator>,
}

#[derive(Debug, Clone)]
pub struct CaptioningPayload {
    pub prompt: String,
    pub image: DynamicImage,
}

/// Fully disambiguated arguments for one model call.
#[derive(Debug, Clone)]
pub enum Payload {
    TextToImage(TextToImagePayload),
    ImageToImage(ImageToImagePayload),
    Captioning(CaptioningPayload),
}

impl Payload {
    pub fn variant(&self) -> ModelVariant {
        match self {
            Payload::TextToImage(_) => ModelVariant::TextToImage,
            Payload::ImageToImage(_) => ModelVariant::ImageToImage,
            Payload::Captioning(_) => ModelVariant::CaptioningVL,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::TextToImage(_) => "text-to-image",
            Payload::ImageToImage(_) => "image-to-image",
            Payload::Captioning(_) => "captioning",
        }
    }
}

/// Build the call parameters for the variant the request was validated against.
pub fn assemble(req: ValidatedRequest) -> Payload {
    let generator = req.seed.map(SeededGenerator::new);
    match req.input {
        VariantInput::TextToImage => Payload::TextToImage(TextToImagePayload {
            prompt: req.prompt,
            negative_prompt: req.negative_prompt,
            height: req.height,
            width: req.width,
            steps: req.steps,
            guidance_scale: req.guidance_scale,
            generator,
        }),
        VariantInput::ImageToImage { image, strength } => {
            Payload::ImageToImage(ImageToImagePayload {
                prompt: req.prompt,
                image,
                strength,
                steps: req.steps,
                guidance_scale: req.guidance_scale,
                negative_prompt: req.negative_prompt,
                generator,
            })
        }
        VariantInput::Captioning { image } => Payload::Captioning(CaptioningPayload {
            prompt: req.prompt,
            image,
        }),
    }
}
