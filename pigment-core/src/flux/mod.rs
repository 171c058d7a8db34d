//! FLUX text-to-image backend.

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    flux::{self, autoencoder::AutoEncoder, model::Flux},
    t5::{self, T5EncoderModel},
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    params::{sample_noise, Payload, TextToImagePayload},
    select_best_device, tensor_to_image, DeviceMap, Loader, ModelError, ModelOutput, Pipeline,
};

const T5_MAX_TOKENS: usize = 256;
const AUTOENCODER_FILE: &str = "ae.safetensors";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    /// Defaults to Schnell if no specific variant is found.
    pub fn from_name(model_name: &str) -> Self {
        let name_upper = model_name.to_uppercase();
        if name_upper.contains("DEV") {
            FluxVariant::Dev
        } else {
            FluxVariant::Schnell
        }
    }

    fn weights_file(self) -> &'static str {
        match self {
            FluxVariant::Schnell => "flux1-schnell.safetensors",
            FluxVariant::Dev => "flux1-dev.safetensors",
        }
    }
}

pub struct FluxModel {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    flux_model: Flux,
}

impl FluxModel {
    fn text_to_image(&mut self, request: TextToImagePayload) -> Result<DynamicImage> {
        let TextToImagePayload {
            prompt,
            negative_prompt,
            height,
            width,
            steps,
            guidance_scale,
            mut generator,
        } = request;
        if negative_prompt.is_some() {
            debug!("FLUX does not use negative prompts; ignoring");
        }

        // --- Generate noise image ---
        let noise_shape = (1, 16, height.div_ceil(16) * 2, width.div_ceil(16) * 2);
        let noise_img =
            sample_noise(generator.as_mut(), noise_shape, &self.device)?.to_dtype(self.dtype)?;

        // --- Compute T5 embedding ---
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(T5_MAX_TOKENS, 0);
        let input_token_ids = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.forward(&input_token_ids)?;

        // --- Compute CLIP embedding ---
        let clip_tokens = self
            .clip_tokenizer
            .encode(prompt.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let input_token_ids_clip = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&input_token_ids_clip)?;

        let sampling_state = flux::sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let (timesteps, guidance) = match self.variant {
            FluxVariant::Schnell => (flux::sampling::get_schedule(steps, None), 0.0),
            FluxVariant::Dev => {
                let image_seq_len = sampling_state.img.dim(1)?;
                (
                    flux::sampling::get_schedule(steps, Some((image_seq_len, 0.5, 1.15))),
                    guidance_scale,
                )
            }
        };

        let latent_img = flux::sampling::denoise(
            &self.flux_model,
            &sampling_state.img,
            &sampling_state.img_ids,
            &sampling_state.txt,
            &sampling_state.txt_ids,
            &sampling_state.vec,
            &timesteps,
            guidance,
        )?;
        let unpacked = flux::sampling::unpack(&latent_img, height, width)?;
        debug!("Generated latent image");

        let decoded = self.autoencoder.decode(&unpacked)?;
        debug!("Decoded image");

        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        Ok(crop_to_request(tensor_to_image(&img.i(0)?)?, width, height))
    }
}

/// Fail unless the repository ships FLUX weights in the original single-file layout.
fn check_checkpoint_layout<'a>(
    model_id: &str,
    variant: FluxVariant,
    files: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let files: Vec<&str> = files.into_iter().collect();
    let missing: Vec<&str> = [AUTOENCODER_FILE, variant.weights_file()]
        .into_iter()
        .filter(|wanted| !files.contains(wanted))
        .collect();
    if !missing.is_empty() {
        anyhow::bail!(
            "unsupported checkpoint layout: {model_id} has no {}; expected FLUX {variant:?} weights ({AUTOENCODER_FILE}, {})",
            missing.join(", "),
            variant.weights_file()
        );
    }
    Ok(())
}

/// Latents cover whole 16-pixel patches; trim the decoded image back to the request.
fn crop_to_request(image: DynamicImage, width: usize, height: usize) -> DynamicImage {
    let (width, height) = (width as u32, height as u32);
    if image.width() == width && image.height() == height {
        return image;
    }
    image.crop_imm(0, 0, width.min(image.width()), height.min(image.height()))
}

impl Pipeline for FluxModel {
    fn name(&self) -> &'static str {
        "flux"
    }

    fn run(&mut self, payload: Payload) -> Result<ModelOutput, ModelError> {
        match payload {
            Payload::TextToImage(request) => {
                Ok(ModelOutput::Images(vec![self.text_to_image(request)?]))
            }
            other => Err(ModelError::unsupported(self.name(), &other)),
        }
    }
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Model = FluxModel;

    async fn load(model_id: String, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let variant = FluxVariant::from_name(&model_id);
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();
        info!("Loading FLUX {variant:?} from {model_id}");

        // Check the repository layout before pulling the multi-GB text encoders.
        let model_repo = api.model(model_id.clone());
        let repo_info = model_repo
            .info()
            .await
            .with_context(|| format!("failed to list files of {model_id}"))?;
        check_checkpoint_layout(
            &model_id,
            variant,
            repo_info.siblings.iter().map(|s| s.rfilename.as_str()),
        )?;

        // --- Load T5 Model and Tokenizer ---
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model_file = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to load T5 model file")?;
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[t5_model_file], dtype, &device)
                .context("failed to build T5 var builder")?
        };
        let config_filename = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer_filename = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .await
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;
        debug!("T5 encoder loaded");

        // --- Load CLIP Model and Tokenizer ---
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model_file = clip_repo
            .get("model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[clip_model_file], dtype, &device)
                .context("failed to build CLIP var builder")?
        };
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer_filename = clip_repo
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        debug!("CLIP text encoder loaded");

        // --- Load Autoencoder ---
        let autoencoder_model_file = model_repo
            .get(AUTOENCODER_FILE)
            .await
            .context("failed to get autoencoder model file")?;
        let autoencoder_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[autoencoder_model_file],
                dtype,
                &device,
            )
            .context("failed to build autoencoder var builder")?
        };
        let autoencoder_config = match variant {
            FluxVariant::Schnell => flux::autoencoder::Config::schnell(),
            FluxVariant::Dev => flux::autoencoder::Config::dev(),
        };
        let autoencoder = AutoEncoder::new(&autoencoder_config, autoencoder_vb)
            .context("failed to load autoencoder")?;

        // --- Load Flux Model (non-quantized) ---
        let flux_model_file = model_repo
            .get(variant.weights_file())
            .await
            .context("failed to get flux model file")?;
        let flux_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[flux_model_file], dtype, &device)
                .context("failed to build flux var builder")?
        };
        let flux_config = match variant {
            FluxVariant::Schnell => flux::model::Config::schnell(),
            FluxVariant::Dev => flux::model::Config::dev(),
        };
        let flux_model = Flux::new(&flux_config, flux_vb).context("failed to load flux model")?;

        Ok(FluxModel {
            variant,
            device,
            dtype,
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            flux_model,
        })
    }
}
