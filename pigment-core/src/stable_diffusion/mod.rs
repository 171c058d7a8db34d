//! Stable Diffusion image-to-image backend (v1.5 and v2.1 style checkpoints).

use std::path::PathBuf;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, schedulers::Scheduler, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::{
    image_to_tensor,
    params::{sample_noise, ImageToImagePayload, Payload},
    request::MAX_DIMENSION,
    preferred_dtype, select_best_device, tensor_to_image, DeviceMap, Loader, ModelError,
    ModelOutput, Pipeline,
};

const VAE_SCALE: f64 = 0.18215;
/// Working resolutions are rounded down to a multiple of this.
const SIZE_MULTIPLE: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDiffusionVersion {
    V1_5,
    V2_1,
}

impl StableDiffusionVersion {
    pub fn from_name(model_name: &str) -> Self {
        let name_lower = model_name.to_lowercase();
        if name_lower.contains("2-1") || name_lower.contains("2.1") {
            StableDiffusionVersion::V2_1
        } else {
            StableDiffusionVersion::V1_5
        }
    }

    fn config(self) -> StableDiffusionConfig {
        match self {
            StableDiffusionVersion::V1_5 => StableDiffusionConfig::v1_5(None, None, None),
            StableDiffusionVersion::V2_1 => StableDiffusionConfig::v2_1(None, None, None),
        }
    }
}

/// Largest size not above `(width, height)` that the UNet accepts. Images with a
/// side over [`MAX_DIMENSION`] are scaled down first, keeping the aspect ratio.
pub fn working_resolution(width: u32, height: u32) -> Result<(u32, u32)> {
    let longest = u64::from(width.max(height));
    let limit = MAX_DIMENSION as u64;
    let (fit_w, fit_h) = if longest > limit {
        (
            (u64::from(width) * limit / longest) as u32,
            (u64::from(height) * limit / longest) as u32,
        )
    } else {
        (width, height)
    };
    let (w, h) = (fit_w - fit_w % SIZE_MULTIPLE, fit_h - fit_h % SIZE_MULTIPLE);
    if w == 0 || h == 0 {
        anyhow::bail!(
            "init image is {width}x{height}; it must be at least {SIZE_MULTIPLE}x{SIZE_MULTIPLE}"
        );
    }
    Ok((w, h))
}

/// Only accelerator RNGs can be seeded in candle.
fn can_seed_device(device: &Device) -> bool {
    !device.is_cpu()
}

/// First denoising step for a given strength; always leaves at least one step to run.
pub fn start_step(steps: usize, strength: f64) -> usize {
    let skipped = steps - (steps as f64 * strength) as usize;
    skipped.min(steps.saturating_sub(1))
}

pub struct StableDiffusionModel {
    device: Device,
    dtype: DType,
    config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    text_model: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
    unet_weights: PathBuf,
    flash_attn: bool,
}

impl StableDiffusionModel {
    fn embed(&self, text: &str) -> Result<Tensor> {
        let max_len = self.config.clip.max_position_embeddings;
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(max_len);
        tokens.resize(max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }

    fn image_to_image(&mut self, request: ImageToImagePayload) -> Result<DynamicImage> {
        let ImageToImagePayload {
            prompt,
            image,
            strength,
            steps,
            guidance_scale,
            negative_prompt,
            mut generator,
        } = request;

        let use_guidance = guidance_scale > 1.0;
        let text_embeddings = {
            let cond = self.embed(&prompt)?;
            if use_guidance {
                let uncond = self.embed(negative_prompt.as_deref().unwrap_or(""))?;
                Tensor::cat(&[uncond, cond], 0)?
            } else {
                cond
            }
        }
        .to_dtype(self.dtype)?;

        // --- Encode the init image into latents ---
        let (width, height) = working_resolution(image.width(), image.height())?;
        let init = image_to_tensor(&image, width, height)?
            .to_dtype(DType::F32)?
            .affine(2. / 255., -1.)?
            .unsqueeze(0)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;
        if let Some(generator) = &generator {
            // The posterior sample below draws from the device RNG.
            if can_seed_device(&self.device) {
                self.device.set_seed(generator.seed())?;
            } else {
                warn!(
                    "Seed {} only fixes the diffusion noise on CPU; the VAE posterior sample stays random, so img2img output is not reproducible",
                    generator.seed()
                );
            }
        }
        let init_latents = (self.vae.encode(&init)?.sample()? * VAE_SCALE)?;

        // --- Noise the latents up to the starting step ---
        let mut scheduler = self.config.build_scheduler(steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let t_start = start_step(timesteps.len(), strength);
        let noise = sample_noise(generator.as_mut(), init_latents.dims4()?, &self.device)?
            .to_dtype(self.dtype)?;
        let mut latents = scheduler.add_noise(&init_latents, noise, timesteps[t_start])?;
        debug!(
            "img2img at {width}x{height}: {} of {} steps",
            timesteps.len() - t_start,
            timesteps.len()
        );

        for &timestep in &timesteps[t_start..] {
            let latent_model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&noise_pred[0], &noise_pred[1]);
                (uncond + ((text - uncond)? * guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        // --- Decode ---
        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let decoded = ((decoded / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let img = (decoded.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }
}

impl Pipeline for StableDiffusionModel {
    fn name(&self) -> &'static str {
        "stable-diffusion"
    }

    fn run(&mut self, payload: Payload) -> Result<ModelOutput, ModelError> {
        match payload {
            Payload::ImageToImage(request) => {
                Ok(ModelOutput::Images(vec![self.image_to_image(request)?]))
            }
            other => Err(ModelError::unsupported(self.name(), &other)),
        }
    }

    fn supports_memory_efficient_attention(&self) -> bool {
        cfg!(feature = "flash-attn") && self.device.is_cuda() && !self.flash_attn
    }

    /// Rebuilds the UNet with flash attention kernels.
    fn enable_memory_efficient_attention(&mut self) -> Result<(), ModelError> {
        self.unet = self
            .config
            .build_unet(&self.unet_weights, &self.device, 4, true, self.dtype)?;
        self.flash_attn = true;
        Ok(())
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusionModel;

    async fn load(model_id: String, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let version = StableDiffusionVersion::from_name(&model_id);
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = preferred_dtype(&device);
        let config = version.config();
        info!("Loading Stable Diffusion {version:?} from {model_id} ({dtype:?})");

        let suffix = if dtype == DType::F16 {
            ".fp16.safetensors"
        } else {
            ".safetensors"
        };
        let repo = api.model(model_id.clone());

        // --- Text encoder and tokenizer ---
        let clip_weights = repo
            .get(&format!("text_encoder/model{suffix}"))
            .await
            .context("failed to get text encoder weights")?;
        let text_model =
            stable_diffusion::build_clip_transformer(&config.clip, clip_weights, &device, DType::F32)
                .context("failed to load text encoder")?;
        let tokenizer_file = api
            .model("openai/clip-vit-base-patch32".to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = tokenizer
            .get_vocab(true)
            .get(pad_token)
            .copied()
            .with_context(|| format!("tokenizer has no pad token {pad_token}"))?;

        // --- VAE ---
        let vae_weights = repo
            .get(&format!("vae/diffusion_pytorch_model{suffix}"))
            .await
            .context("failed to get VAE weights")?;
        let vae = config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to load VAE")?;

        // --- UNet ---
        let unet_weights = repo
            .get(&format!("unet/diffusion_pytorch_model{suffix}"))
            .await
            .context("failed to get UNet weights")?;
        let unet = config
            .build_unet(&unet_weights, &device, 4, false, dtype)
            .context("failed to load UNet")?;

        Ok(StableDiffusionModel {
            device,
            dtype,
            config,
            tokenizer,
            pad_id,
            text_model,
            vae,
            unet,
            unet_weights,
            flash_attn: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_resolution_rounds_down() {
        assert_eq!(working_resolution(512, 512).unwrap(), (512, 512));
        assert_eq!(working_resolution(700, 333).unwrap(), (672, 320));
        assert!(working_resolution(31, 600).is_err());
    }

    #[test]
    fn oversized_images_are_scaled_to_fit() {
        assert_eq!(working_resolution(4000, 3000).unwrap(), (2048, 1536));
        assert_eq!(working_resolution(1000, 9000).unwrap(), (224, 2048));
        assert_eq!(working_resolution(2048, 2048).unwrap(), (2048, 2048));
    }

    #[test]
    fn cpu_device_cannot_be_seeded() {
        assert!(!can_seed_device(&Device::Cpu));
    }

    #[test]
    fn strength_selects_start_step() {
        assert_eq!(start_step(20, 0.8), 4);
        assert_eq!(start_step(20, 1.0), 0);
        // Zero strength still runs the final step.
        assert_eq!(start_step(20, 0.0), 19);
    }

    #[test]
    fn version_from_name() {
        assert_eq!(
            StableDiffusionVersion::from_name("stabilityai/stable-diffusion-2-1"),
            StableDiffusionVersion::V2_1
        );
        assert_eq!(
            StableDiffusionVersion::from_name("runwayml/stable-diffusion-v1-5"),
            StableDiffusionVersion::V1_5
        );
    }
}
